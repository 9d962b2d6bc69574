use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use sqlx::{postgres::PgListener, PgPool, Row};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    announcement::{AnnouncementFeed, FeedEvent},
    error::PortalError,
    models::{Announcement, Role, UserProfile},
    profile::ProfileStore,
    subscription::Subscription,
};

const SYSTEM_CHANNEL: &str = "portal_system";
const ANNOUNCEMENTS_DOC: &str = "announcements";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let users = vec![
        (
            "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2",
            "avery.lee@groupscholar.com",
            Role::Student,
            "Avery Lee",
            Some("7B"),
        ),
        (
            "0c22f1f1-9184-4fd4-9b21-28c68a6a89dc",
            "jules.moreno@groupscholar.com",
            Role::Teacher,
            "Jules Moreno",
            None,
        ),
        (
            "d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2",
            "kiara.patel@groupscholar.com",
            Role::Moderator,
            "Kiara Patel",
            None,
        ),
    ];

    for (uid, email, role, name, school_class) in users {
        upsert_user(pool, uid, email, role, name, school_class).await?;
    }

    sqlx::query(
        "UPDATE portal.users SET subjects = $2, classes = $3 WHERE uid = $1",
    )
    .bind("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")
    .bind(vec!["math".to_string(), "physics".to_string()])
    .bind(vec!["7B".to_string(), "8A".to_string()])
    .execute(pool)
    .await?;

    publish_announcement(pool, "Welcome back! Spring quizzes open on Monday.").await?;

    Ok(())
}

async fn upsert_user(
    pool: &PgPool,
    uid: &str,
    email: &str,
    role: Role,
    name: &str,
    school_class: Option<&str>,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO portal.users (uid, email, role, name, school_class)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (uid) DO UPDATE
        SET email = EXCLUDED.email, role = EXCLUDED.role,
            name = EXCLUDED.name, school_class = EXCLUDED.school_class
        "#,
    )
    .bind(uid)
    .bind(email)
    .bind(role.to_string())
    .bind(name)
    .bind(school_class)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Loads profile rows from a CSV with headers
/// `uid,email,role,name,school_class`; a blank uid gets a fresh one.
pub async fn import_users(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        uid: Option<String>,
        email: String,
        role: String,
        name: String,
        school_class: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("unable to open {}", csv_path.display()))?;
    let mut imported = 0usize;

    for (n, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("bad CSV record {}", n + 1))?;
        let role: Role = row
            .role
            .trim()
            .parse()
            .map_err(|e: String| anyhow::anyhow!("CSV record {}: {}", n + 1, e))?;
        let uid = row
            .uid
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let affected = upsert_user(
            pool,
            &uid,
            &row.email,
            role,
            &row.name,
            row.school_class.as_deref().filter(|s| !s.trim().is_empty()),
        )
        .await?;

        if affected > 0 {
            imported += 1;
        }
    }

    tracing::info!(imported, path = %csv_path.display(), "Imported users");
    Ok(imported)
}

/// Writes the announcement document with a fresh timestamp id.
pub async fn publish_announcement(pool: &PgPool, message: &str) -> anyhow::Result<Announcement> {
    let announcement = Announcement {
        message: message.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };

    sqlx::query(
        r#"
        INSERT INTO portal.system_documents (id, message, timestamp)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE
        SET message = EXCLUDED.message, timestamp = EXCLUDED.timestamp, updated_at = now()
        "#,
    )
    .bind(ANNOUNCEMENTS_DOC)
    .bind(&announcement.message)
    .bind(&announcement.timestamp)
    .execute(pool)
    .await?;

    tracing::info!(id = %announcement.timestamp, "Announcement published");
    Ok(announcement)
}

pub async fn clear_announcement(pool: &PgPool) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM portal.system_documents WHERE id = $1")
        .bind(ANNOUNCEMENTS_DOC)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn load_announcement(pool: &PgPool) -> Result<Option<Announcement>, PortalError> {
    let row = sqlx::query("SELECT message, timestamp FROM portal.system_documents WHERE id = $1")
        .bind(ANNOUNCEMENTS_DOC)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| Announcement {
        message: row.get("message"),
        timestamp: row.get("timestamp"),
    }))
}

fn role_from_column(raw: &str, uid: &str) -> Role {
    raw.parse().unwrap_or_else(|e| {
        tracing::warn!(uid, error = %e, "Unknown stored role; reading as viewer");
        Role::Viewer
    })
}

#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ProfileStore for PgProfileStore {
    async fn fetch_profile(&self, uid: &str) -> Result<Option<UserProfile>, PortalError> {
        let row = sqlx::query(
            "SELECT uid, email, role, name, subjects, classes, school_class, is_locked \
             FROM portal.users WHERE uid = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let uid: String = row.get("uid");
            let role: String = row.get("role");
            UserProfile {
                role: role_from_column(&role, &uid),
                uid,
                email: row.get("email"),
                name: row.get("name"),
                subjects: row.get("subjects"),
                classes: row.get("classes"),
                school_class: row.get("school_class"),
                is_locked: row.get("is_locked"),
            }
        }))
    }
}

/// Announcement document fed by `LISTEN portal_system`.
#[derive(Clone)]
pub struct PgAnnouncementFeed {
    pool: PgPool,
}

impl PgAnnouncementFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AnnouncementFeed for PgAnnouncementFeed {
    fn subscribe(&self) -> Subscription<FeedEvent> {
        let pool = self.pool.clone();
        Subscription::spawn(move |tx| async move {
            if let Err(e) = follow_announcements(&pool, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        })
    }
}

async fn follow_announcements(
    pool: &PgPool,
    tx: &mpsc::Sender<FeedEvent>,
) -> Result<(), PortalError> {
    let subscription_error = |e: sqlx::Error| PortalError::Subscription(e.to_string());

    // Listen before the first read so no change slips in between.
    let mut listener = PgListener::connect_with(pool)
        .await
        .map_err(subscription_error)?;
    listener
        .listen(SYSTEM_CHANNEL)
        .await
        .map_err(subscription_error)?;

    if tx.send(Ok(load_announcement(pool).await?)).await.is_err() {
        return Ok(());
    }

    loop {
        // `None` means the connection dropped; the next call reconnects, but
        // anything notified in between is gone, so re-read regardless.
        let notification = listener.try_recv().await.map_err(subscription_error)?;
        if notification.is_none() {
            tracing::warn!("Announcement listener reconnecting");
        }
        if !should_reload(notification.as_ref().map(|n| n.payload())) {
            continue;
        }
        if tx.send(Ok(load_announcement(pool).await?)).await.is_err() {
            return Ok(());
        }
    }
}

fn should_reload(payload: Option<&str>) -> bool {
    payload.map_or(true, |doc| doc == ANNOUNCEMENTS_DOC)
}

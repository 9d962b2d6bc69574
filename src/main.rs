use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::oneshot,
};

mod announcement;
mod auth;
mod config;
mod db;
mod error;
mod local_store;
mod logger;
mod models;
mod profile;
mod quiz;
mod subscription;

use crate::{
    announcement::AnnouncementWatcher,
    auth::LocalAuth,
    config::Config,
    db::{PgAnnouncementFeed, PgProfileStore},
    local_store::{FileStore, LocalStore, MemoryStore},
    models::{Identity, Quiz},
    profile::{AdminOverride, ProfileResolver, ProfileSession},
    quiz::{HttpCatalog, QuizResolver},
};

const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "study-portal")]
#[command(about = "Profile, announcement and quiz sync for the Group Scholar study portal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import user profiles from a CSV file
    ImportUsers {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Resolve the profile for one identity
    Profile {
        #[arg(long)]
        uid: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Follow auth changes typed on stdin (login <uid> [email], logout, refresh, whoami, quit)
    Session,
    /// Look up one quiz, static catalog first
    Quiz {
        #[arg(long)]
        id: String,
    },
    /// List every quiz from both catalogs
    Quizzes,
    /// Save a quiz (JSON file) into the local catalog
    QuizSave {
        #[arg(long)]
        file: PathBuf,
    },
    /// Remove a quiz from the local catalog
    QuizRemove {
        #[arg(long)]
        id: String,
    },
    /// Publish the system announcement
    Announce {
        #[arg(long)]
        message: String,
    },
    /// Delete the system announcement
    AnnounceClear,
    /// Show announcements as they arrive
    Watch {
        /// Dismiss each announcement right after showing it
        #[arg(long)]
        dismiss: bool,
        /// Keep dismissals in memory for this run only
        #[arg(long)]
        forget: bool,
    },
}

async fn connect(cfg: &Config) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(cfg.database_url()?)
        .await
        .context("failed to connect to Postgres")
}

fn quiz_resolver(
    cfg: &Config,
    store: Arc<FileStore>,
) -> anyhow::Result<QuizResolver<HttpCatalog, Arc<FileStore>>> {
    let http = reqwest::Client::builder()
        .timeout(CATALOG_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    Ok(QuizResolver::new(
        HttpCatalog::with_client(http, cfg.catalog_url.clone()),
        store,
    ))
}

fn print_quiz(quiz: &Quiz) {
    println!(
        "- {} [{}] {} ({} questions, {}s)",
        quiz.id, quiz.kind, quiz.title, quiz.question_count, quiz.timer
    );
}

async fn watch_announcements<L: LocalStore>(
    feed: &PgAnnouncementFeed,
    store: L,
    dismiss: bool,
) -> anyhow::Result<()> {
    let mut watcher = AnnouncementWatcher::start(feed, store);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            banner = watcher.next_banner() => match banner {
                Some(announcement) => {
                    println!("[{}] {}", announcement.timestamp, announcement.message);
                    if dismiss {
                        watcher.dismiss();
                        tracing::info!(visible = watcher.gate().is_visible(), "Dismissed");
                    }
                }
                None => {
                    tracing::warn!("Announcement feed ended");
                    break;
                }
            },
        }
    }

    watcher.stop();
    Ok(())
}

async fn run_session(cfg: &Config) -> anyhow::Result<()> {
    let pool = connect(cfg).await?;
    let auth = Arc::new(LocalAuth::new());
    let resolver = ProfileResolver::new(
        PgProfileStore::new(pool),
        AdminOverride::new(cfg.privileged_email.clone()),
    );
    let session = Arc::new(ProfileSession::new(Arc::clone(&auth), resolver));

    let mut profile = session.profile();
    let printer = tokio::spawn(async move {
        while profile.changed().await.is_ok() {
            match &*profile.borrow_and_update() {
                Some(p) => println!("profile: {} <{}> as {}", p.name, p.email, p.role),
                None => println!("profile: none"),
            }
        }
    });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            session
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("login") => match parts.next() {
                Some(uid) => auth.sign_in(Identity::new(uid, parts.next())),
                None => println!("usage: login <uid> [email]"),
            },
            Some("logout") => session.sign_out().await?,
            Some("refresh") => auth.refresh(),
            Some("whoami") => match (auth.current(), session.current()) {
                (Some(identity), Some(p)) => println!("{} is {} ({})", identity.uid, p.name, p.role),
                (Some(identity), None) => println!("{} has no profile", identity.uid),
                (None, _) => println!("signed out"),
            },
            Some("quit") => break,
            Some(other) => println!("unknown command {other:?}"),
            None => {}
        }
    }

    let _ = stop_tx.send(());
    runner.await?;
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cfg = Config::from_env();
    logger::init_logging(&cfg.log_filter);
    cfg.log_summary();

    let store = Arc::new(
        FileStore::open(&cfg.store_path)
            .with_context(|| format!("unable to open local store {}", cfg.store_path.display()))?,
    );

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&cfg).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect(&cfg).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportUsers { csv } => {
            let pool = connect(&cfg).await?;
            let imported = db::import_users(&pool, &csv).await?;
            println!("Imported {imported} users from {}.", csv.display());
        }
        Commands::Profile { uid, email } => {
            let pool = connect(&cfg).await?;
            let resolver = ProfileResolver::new(
                PgProfileStore::new(pool),
                AdminOverride::new(cfg.privileged_email.clone()),
            );
            let identity = Identity::new(uid, email.as_deref());
            match resolver.resolve(Some(&identity)).await? {
                Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
                None => println!("No profile for {}.", identity.uid),
            }
        }
        Commands::Session => run_session(&cfg).await?,
        Commands::Quiz { id } => {
            let resolver = quiz_resolver(&cfg, store)?;
            match resolver.get_by_id(&id).await {
                Some(quiz) => println!("{}", serde_json::to_string_pretty(&quiz)?),
                None => println!("No quiz found with id {id}."),
            }
        }
        Commands::Quizzes => {
            let resolver = quiz_resolver(&cfg, store)?;
            let quizzes = resolver.all().await;
            if quizzes.is_empty() {
                println!("No quizzes available.");
                return Ok(());
            }
            println!("Available quizzes:");
            for quiz in quizzes.iter() {
                print_quiz(quiz);
            }
        }
        Commands::QuizSave { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("unable to read {}", file.display()))?;
            let quiz: Quiz = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid quiz", file.display()))?;
            let resolver = quiz_resolver(&cfg, store)?;
            let id = quiz.id.clone();
            resolver.local().save(quiz)?;
            println!("Saved quiz {id} to the local catalog.");
        }
        Commands::QuizRemove { id } => {
            let resolver = quiz_resolver(&cfg, store)?;
            if resolver.local().remove(&id)? {
                println!("Removed quiz {id}.");
            } else {
                println!("No local quiz with id {id}.");
            }
        }
        Commands::Announce { message } => {
            let pool = connect(&cfg).await?;
            let announcement = db::publish_announcement(&pool, &message).await?;
            println!("Announcement {} published.", announcement.timestamp);
        }
        Commands::AnnounceClear => {
            let pool = connect(&cfg).await?;
            if db::clear_announcement(&pool).await? {
                println!("Announcement cleared.");
            } else {
                println!("No announcement to clear.");
            }
        }
        Commands::Watch { dismiss, forget } => {
            let pool = connect(&cfg).await?;
            let feed = PgAnnouncementFeed::new(pool);
            if forget {
                watch_announcements(&feed, MemoryStore::new(), dismiss).await?;
            } else {
                watch_announcements(&feed, store, dismiss).await?;
            }
        }
    }

    Ok(())
}

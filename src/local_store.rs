use std::{collections::BTreeMap, path::Path, sync::Mutex, time::Duration};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::PortalError;

pub const DISMISSED_ANNOUNCEMENT_KEY: &str = "dismissedAnnouncementId";
pub const LOCAL_QUIZZES_KEY: &str = "quizzes";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable client-side string slots, keyed by name.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), PortalError>;
    fn remove(&self, key: &str) -> Result<(), PortalError>;
}

impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PortalError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), PortalError> {
        (**self).remove(key)
    }
}

/// Slots kept in a SQLite file, one row per key. Separate processes on the
/// same path see each other's writes.
pub struct FileStore {
    conn: Mutex<Connection>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PortalError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS slots (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let value = self
            .conn()
            .query_row("SELECT value FROM slots WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional();

        value.unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "Unable to read local store slot");
            None
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PortalError> {
        self.conn().execute(
            "INSERT INTO slots (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PortalError> {
        self.conn()
            .execute("DELETE FROM slots WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PortalError> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PortalError> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.remove(key);
        Ok(())
    }
}

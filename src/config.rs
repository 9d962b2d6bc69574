use std::{env, path::PathBuf};

use anyhow::Context;

use crate::profile::{is_privileged_email, DEFAULT_PRIVILEGED_EMAIL};

const DEFAULT_CATALOG_URL: &str = "http://localhost:8080/data/quizzes.json";
const DEFAULT_STORE_PATH: &str = "./portal-store.db";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub catalog_url: String,
    pub store_path: PathBuf,
    pub privileged_email: String,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").ok(),
            catalog_url: load_or("QUIZ_CATALOG_URL", DEFAULT_CATALOG_URL),
            store_path: PathBuf::from(load_or("LOCAL_STORE_PATH", DEFAULT_STORE_PATH)),
            privileged_email: load_or("PRIVILEGED_EMAIL", DEFAULT_PRIVILEGED_EMAIL),
            log_filter: log_filter(env::var("RUST_LOG").ok(), env::var("LOG_LEVEL").ok()),
        }
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }

    pub fn uses_custom_privileged_email(&self) -> bool {
        !is_privileged_email(&self.privileged_email)
    }

    /// Logs the loaded values; call once logging is up.
    pub fn log_summary(&self) {
        tracing::debug!(config = ?self, "Configuration loaded");
        if self.uses_custom_privileged_email() {
            tracing::info!(email = %self.privileged_email, "Using custom privileged address");
        }
    }
}

fn load_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// `RUST_LOG` wins over `LOG_LEVEL`.
fn log_filter(rust_log: Option<String>, level: Option<String>) -> String {
    match (rust_log, level) {
        (Some(directives), _) => directives,
        (None, Some(level)) => level.to_lowercase(),
        (None, None) => DEFAULT_LOG_LEVEL.to_string(),
    }
}

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber; `filter` uses `EnvFilter` directive syntax.
pub fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

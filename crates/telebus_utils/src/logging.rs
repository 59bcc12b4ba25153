/// Environment variable that overrides the configured log level.
pub const LOG_ENV: &str = "TELEBUS_LOG";

/// Initialize tracing/logging for the application.
///
/// `TELEBUS_LOG` wins over `default_level` when it is set.
pub fn init(default_level: &str) {
    let requested = std::env::var(LOG_ENV).unwrap_or_else(|_| default_level.to_string());
    let lvl = parse_level(&requested);

    // try_init so tests and embedding binaries can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}

/// Map a textual level to a `tracing::Level`, falling back to INFO.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

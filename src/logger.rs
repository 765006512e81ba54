//! Centralized logging configuration for ba-covariance binaries and tests
//!
//! This module provides a consistent logging setup with a default INFO level
//! across all executables.

use tracing::Level;

/// Initialize the tracing subscriber with the library's standard configuration
///
/// Default log level: INFO (overrideable via RUST_LOG environment variable)
///
/// # Example
/// ```no_run
/// use ba_covariance::init_logger;
///
/// fn main() {
///     init_logger();
///     tracing::info!("Application started");
/// }
/// ```
///
/// # Environment Variables
/// Override the default log level using `RUST_LOG`:
/// ```bash
/// RUST_LOG=debug cargo run --bin covariance_demo
/// RUST_LOG=ba_covariance=trace cargo run
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
///
/// # Example
/// ```no_run
/// use ba_covariance::init_logger_with_level;
/// use tracing::Level;
///
/// fn main() {
///     init_logger_with_level(Level::DEBUG);
///     tracing::debug!("Debug logging enabled");
/// }
/// ```
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();
}

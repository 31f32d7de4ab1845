//! Logging configuration using tracing
//!
//! Structured logging to stderr with support for the RUST_LOG environment variable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber
///
/// - Filtering via RUST_LOG (defaults to "warn", or `dealersync=debug` when verbose)
/// - Formatted output to stderr with targets and line numbers
///
/// # Example RUST_LOG values
/// - `RUST_LOG=info` - Show info and above
/// - `RUST_LOG=dealersync::remote=debug` - Every outbound attempt
/// - `RUST_LOG=dealersync=debug,reqwest=info` - Different levels per crate
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init(verbose: bool) -> crate::Result<()> {
    let default_filter = if verbose { "warn,dealersync=debug" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| crate::SyncError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_helper() {
        init_test();
        init_test();
    }

    #[test]
    fn test_second_init_is_an_error() {
        init_test();
        assert!(init(false).is_err());
    }
}

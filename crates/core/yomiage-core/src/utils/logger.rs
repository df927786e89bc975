//! Logging utilities

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted when `RUST_LOG` is unset
pub const LOG_LEVEL_ENV: &str = "YOMIAGE_LOG_LEVEL";

const DEFAULT_LEVEL: &str = "info";

/// Build the filter: `RUST_LOG` wins, then `level`, then `YOMIAGE_LOG_LEVEL`, then `info`
fn build_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level
            .map(str::to_string)
            .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_LEVEL.to_string());
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    })
}

/// Initialize the global logging system
pub fn init_logging() {
    init_logging_with_level(None);
}

/// Initialize the global logging system with an explicit default level
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging_with_level(level: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let filter = build_filter(Some("yomiage=loud"));
        assert_eq!(filter.to_string(), DEFAULT_LEVEL);
    }

    #[test]
    fn test_explicit_level_used() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let filter = build_filter(Some("debug"));
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging();
        init_logging_with_level(Some("warn"));
    }
}

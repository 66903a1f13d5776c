//! Structured logging setup.
//!
//! `RUST_LOG` wins when set. Otherwise the level comes from `[logging]` in
//! the configuration and can be swapped at runtime through the reload
//! handle, e.g. after the config file is read.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

/// Transport crates that are chatty at debug level.
const QUIET_TARGETS: &[&str] = &["tungstenite", "tokio_tungstenite", "redis", "hyper"];

/// Filter directives for a base level: the level itself, with transport
/// crates capped at `info`.
pub fn filter_directives(level: &str) -> String {
    let level = level.trim();
    let mut directives = vec![level.to_string()];
    if !matches!(level.to_ascii_lowercase().as_str(), "error" | "warn" | "info") {
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=info")));
    }
    directives.join(",")
}

fn build_filter(level: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_new(filter_directives(level))
}

/// Install the global subscriber at `info`.
pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| build_filter(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (filter_layer, handle) = reload::Layer::new(filter);
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switch the active level. Ignored while `RUST_LOG` is set. Returns whether
/// a new filter was installed.
pub fn apply_logging_level(level: &str) -> bool {
    if std::env::var_os("RUST_LOG").is_some() {
        return false;
    }
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };

    match build_filter(level) {
        Ok(filter) => match handle.modify(|current| *current = filter) {
            Ok(()) => {
                tracing::info!(level = %level, "log level applied");
                true
            }
            Err(e) => {
                tracing::warn!(level = %level, error = %e, "failed to swap log filter");
                false
            }
        },
        Err(e) => {
            tracing::warn!(level = %level, error = %e, "invalid log level, keeping current filter");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_levels_have_no_overrides() {
        assert_eq!(filter_directives("info"), "info");
        assert_eq!(filter_directives(" WARN "), "WARN");
    }

    #[test]
    fn test_verbose_levels_cap_transport_crates() {
        let directives = filter_directives("debug");
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("tungstenite=info"));
        assert!(directives.contains("redis=info"));
        assert!(build_filter("trace").is_ok());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(build_filter("groupcast_server=loudest").is_err());
    }
}

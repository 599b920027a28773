//! Log subscriber setup.
//!
//! The library itself only emits `tracing` events; every event about a
//! remote node carries a `host` field. Binaries and test harnesses call
//! [`init`] once to get them printed.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::env::{DEFAULT_PREFIX, vars};

/// Filter used when neither `REMOTE_EXEC_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "info";

/// Build the filter from `REMOTE_EXEC_LOG`, then `RUST_LOG`, then `fallback`.
#[must_use]
pub fn env_filter(fallback: &str) -> EnvFilter {
    let own = format!("{DEFAULT_PREFIX}_{}", vars::LOG);
    std::env::var(own)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

/// Install a formatted subscriber on stderr.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    init_with_filter(env_filter(DEFAULT_FILTER))
}

/// Install a formatted subscriber with an explicit filter.
pub fn init_with_filter(filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_existing_subscriber() {
        let _ = init_with_filter(EnvFilter::new("debug"));
        assert!(!init_with_filter(EnvFilter::new("debug")));
    }
}

//! Tracing initialisation for Apex binaries.
//!
//! Call [`init_tracing`] once at program start. Subsequent calls are
//! silently ignored, since the global subscriber can only be installed
//! once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `json` switches to newline-delimited JSON log lines for aggregation
/// pipelines. `level` is the default verbosity; `RUST_LOG` overrides it
/// with fine-grained per-target filters.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false).compact())
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_noop() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}

//! Tracing subscriber setup shared by the hub binary and tests.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive used when `RUST_LOG` is unset: `level` for the pushsub
/// crates, warnings for everything else.
pub fn default_filter(level: &str) -> String {
    format!("warn,pushsub_core={level},pushsub_hub={level}")
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Events go to stderr, one JSON
/// object per line with `log_json`, human-readable otherwise.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if log_json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

//! Log subscriber setup for promote binaries.
//!
//! Filtering comes from `PROMOTE_LOG`, then `RUST_LOG`, then the level the
//! caller passes. The fallback only raises verbosity for the promote crates;
//! dependencies such as tokio stay at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "PROMOTE_LOG";

const PROMOTE_TARGETS: [&str; 3] = ["promote_core", "promote_store", "promote"];

/// Filter used when neither `PROMOTE_LOG` nor `RUST_LOG` is set.
pub fn default_filter(level: Level) -> EnvFilter {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(PROMOTE_TARGETS.iter().map(|t| format!("{t}={level}")));
    EnvFilter::new(directives.join(","))
}

/// Build a filter from an explicit directive string, falling back to
/// [`default_filter`] when it is absent or does not parse.
pub fn filter_from(directives: Option<&str>, level: Level) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| default_filter(level))
}

/// Install the global subscriber, writing to stderr so stdout stays free for
/// command output. Only the first call in a process has any effect.
pub fn init_tracing(json: bool, level: Level) {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let filter = filter_from(directives.as_deref(), level);

    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .ok();
}

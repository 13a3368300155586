//! Tracing bootstrap for the smoke binary.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,backend_sync=debug,backend_smoke=debug";
const FALLBACK_VARS: [&str; 2] = ["PIKACHAT_SYNC_LOG", "PIKACHAT_LOG"];

/// Initialize the global subscriber.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `PIKACHAT_SYNC_LOG`
/// 3) `PIKACHAT_LOG`
/// 4) internal default filter
pub fn init() {
    let env_filter = filter_from(|key| std::env::var(key).ok());
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from(mut lookup: impl FnMut(&str) -> Option<String>) -> EnvFilter {
    if let Some(filter) = directive(&mut lookup, EnvFilter::DEFAULT_ENV) {
        return filter;
    }
    for key in FALLBACK_VARS {
        if let Some(filter) = directive(&mut lookup, key) {
            return filter;
        }
    }
    EnvFilter::new(DEFAULT_FILTER)
}

fn directive(lookup: &mut impl FnMut(&str) -> Option<String>, key: &str) -> Option<EnvFilter> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
}

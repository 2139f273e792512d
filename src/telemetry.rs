// src/telemetry.rs
//! Tracing setup and log-safe helpers.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_JSON: &str = "CHIME_LOG_JSON";
const DEFAULT_FILTER: &str = "chime=info,warn";

/// Install the global subscriber. `RUST_LOG` wins over the default filter;
/// `CHIME_LOG_JSON=1` switches to JSON lines. Safe to call twice (the second
/// call is a no-op, e.g. when the hosting runtime already installed one).
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(ENV_LOG_JSON).ok().as_deref() == Some("1");

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Short stable fingerprint of message text. Raw chat content is never logged.
pub fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_hash_is_short_and_stable() {
        let a = anon_hash("we are stuck on the migration");
        assert_eq!(a.len(), 12);
        assert_eq!(a, anon_hash("we are stuck on the migration"));
        assert_ne!(a, anon_hash("something else"));
    }
}

//! Observability utilities.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Substrings that mark an environment key as sensitive.
const SECRET_KEY_MARKERS: &[&str] = &[
    "token",
    "secret",
    "password",
    "authorization",
    "api_key",
    "apikey",
    "bearer",
];

/// Initialize tracing subscriber once for the process.
///
/// Log format defaults to plain text and can be switched to JSON via
/// `HUB_LOG_FORMAT=json`. Filter defaults to `info` if `RUST_LOG` is unset.
/// Output goes to stderr; stdout carries protocol frames in stdio mode.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("HUB_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_MARKERS.iter().any(|marker| key.contains(marker))
}

/// Copy of an environment overlay safe to log.
pub fn redact_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let shown = if is_secret_key(key) {
                "[redacted]".to_string()
            } else {
                value.clone()
            };
            (key.clone(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn redacts_sensitive_keys_only() {
        let env = BTreeMap::from([
            ("GITHUB_TOKEN".to_string(), "ghp_abc".to_string()),
            ("Api_Key".to_string(), "k".to_string()),
            ("DB_PASSWORD".to_string(), "pw".to_string()),
            ("LOG_LEVEL".to_string(), "debug".to_string()),
        ]);
        let shown = redact_env(&env);
        assert_eq!(shown["GITHUB_TOKEN"], "[redacted]");
        assert_eq!(shown["Api_Key"], "[redacted]");
        assert_eq!(shown["DB_PASSWORD"], "[redacted]");
        assert_eq!(shown["LOG_LEVEL"], "debug");
    }
}

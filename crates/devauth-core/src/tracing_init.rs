//! Tracing/logging initialization.
//!
//! The server binary builds its subscriber from the `log` section of the
//! resolved [`Config`](crate::config::Config).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Crates whose events are enabled at the configured level by default.
const LOG_TARGETS: &[&str] = &["devauth_server", "devauth_core"];

/// Build the default `RUST_LOG`-style directive for the given level,
/// e.g. `"devauth_server=info,devauth_core=info"`.
pub fn default_directive(level: &str) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. With `json` enabled
/// every event is emitted as one structured JSON line.
pub fn init_tracing(log: &LogConfig) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive(&log.level)),
    );
    if log.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_covers_all_targets() {
        assert_eq!(
            default_directive("debug"),
            "devauth_server=debug,devauth_core=debug"
        );
    }
}

//! Tracing setup for the `circlenet` binary and embedding hosts.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used for each line of detection script output
pub const SCRIPT_TARGET: &str = "circlenet::script";

/// Default directives when `RUST_LOG` is unset.
///
/// HTTP internals stay at warn even when the crate itself is verbose.
pub fn default_directives(level: Level) -> String {
    format!("{},hyper=warn,reqwest=warn,rustls=warn", level.as_str().to_lowercase())
}

/// Install the global subscriber.
///
/// `json` switches to newline-delimited JSON. `RUST_LOG` overrides `level`.
/// Only the first call in a process has any effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if json {
        registry
            .with(fmt::layer().with_target(true).json())
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "debug,hyper=warn,reqwest=warn,rustls=warn"
        );
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}

//! Per-environment tracing setup.

use serde::Deserialize;
use std::fmt;
use tracing_subscriber::{fmt as subscriber_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Deployment environment, as given by the `ENV` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Environment {
    Live,
    Staging,
    Testing,
    Development,
}

impl From<String> for Environment {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "live" => Environment::Live,
            "staging" => Environment::Staging,
            "testing" => Environment::Testing,
            _ => Environment::Development,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Live => write!(f, "live"),
            Environment::Staging => write!(f, "staging"),
            Environment::Testing => write!(f, "testing"),
            Environment::Development => write!(f, "development"),
        }
    }
}

impl Environment {
    /// Filter used when `RUST_LOG` is not set.
    pub fn default_filter(&self) -> &'static str {
        match self {
            Environment::Live => "info",
            Environment::Staging => "debug",
            Environment::Testing => "off",
            Environment::Development => "debug",
        }
    }

    /// Production-like environments log JSON for aggregation.
    pub fn json_output(&self) -> bool {
        matches!(self, Environment::Live | Environment::Staging)
    }
}

/// Install the global tracing subscriber for `env`.
///
/// Returns `false` when a subscriber was already installed; the first
/// installation wins for the lifetime of the process.
pub fn init_logging(env: Environment) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env.default_filter()));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if env.json_output() {
        registry
            .with(subscriber_fmt::layer().json().with_target(false))
            .try_init()
    } else {
        registry.with(subscriber_fmt::layer()).try_init()
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::from("live".to_string()), Environment::Live);
        assert_eq!(Environment::from("STAGING".to_string()), Environment::Staging);
        assert_eq!(Environment::from("testing".to_string()), Environment::Testing);
        assert_eq!(Environment::from("local".to_string()), Environment::Development);
    }

    #[test]
    fn test_environment_levels() {
        assert_eq!(Environment::Live.default_filter(), "info");
        assert_eq!(Environment::Staging.default_filter(), "debug");
        assert_eq!(Environment::Testing.default_filter(), "off");
        assert!(Environment::Live.json_output());
        assert!(!Environment::Development.json_output());
    }

    #[test]
    fn test_init_logging_is_init_once() {
        init_logging(Environment::Testing);
        assert!(!init_logging(Environment::Testing));
    }
}

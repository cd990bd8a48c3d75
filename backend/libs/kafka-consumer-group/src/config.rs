//! Environment-driven configuration for the consumer group and its HTTP
//! service.

use rdkafka::config::ClientConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{ConsumerError, ConsumerResult};
use crate::logging::Environment;

/// Consumer group configuration, read from environment variables.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_sasl_credentials"))]
pub struct Config {
    /// Deployment environment (`live`, `staging`, `testing`, anything else is
    /// development)
    #[serde(rename = "env")]
    pub env: Environment,

    /// Bootstrap brokers
    #[validate(length(min = 1))]
    #[serde(rename = "kafka_dsn")]
    pub addresses: Vec<String>,

    /// Topics consumed by the group
    #[validate(length(min = 1))]
    #[serde(rename = "kafka_consumer_topics")]
    pub topics: Vec<String>,

    #[validate(length(min = 1, max = 255))]
    #[serde(rename = "kafka_consumer_group_id")]
    pub group_id: String,

    #[validate(length(min = 1, max = 255))]
    #[serde(rename = "kafka_client_id")]
    pub client_id: String,

    /// Where to start when the group has no committed offset
    #[serde(rename = "kafka_consumer_auto_offset_reset", default)]
    pub offset_reset: OffsetReset,

    #[serde(rename = "kafka_username", default)]
    pub user_name: Option<String>,

    #[serde(rename = "kafka_password", default)]
    pub password: Option<SecretString>,

    #[serde(rename = "kafka_sasl_enable", default)]
    pub sasl_enable: bool,

    #[serde(rename = "kafka_security_protocol", default = "default_security_protocol")]
    pub security_protocol: SecurityProtocol,

    #[serde(rename = "kafka_sasl_mechanism", default = "default_sasl_mechanism")]
    pub sasl_mechanism: SaslMechanism,

    /// PEM encoded CA certificate used to verify the brokers
    #[serde(rename = "kafka_ca_cert", default)]
    pub ca_cert: Option<String>,

    /// Disable broker certificate verification
    #[serde(rename = "kafka_tls_skip_verify", default)]
    pub tls_skip_verify: bool,

    #[validate(range(min = 1000, max = 3600000))]
    #[serde(rename = "kafka_session_timeout_ms", default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Messages buffered per partition claim
    #[validate(range(min = 1, max = 100000))]
    #[serde(rename = "kafka_channel_buffer_size", default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    #[validate(length(min = 1))]
    #[serde(rename = "deployment_name")]
    pub deployment_name: String,

    #[serde(rename = "healthcheck_timeout_ms", default = "default_healthcheck_timeout_ms")]
    pub healthcheck_timeout_ms: u64,

    #[serde(rename = "server_port", default = "default_server_port")]
    pub server_port: u16,

    /// Prefix for exported metrics; defaults to the deployment name
    #[serde(rename = "metrics_namespace", default)]
    pub metrics_namespace: Option<String>,
}

fn default_security_protocol() -> SecurityProtocol {
    SecurityProtocol::SaslSsl
}

fn default_sasl_mechanism() -> SaslMechanism {
    SaslMechanism::ScramSha256
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_channel_buffer_size() -> usize {
    256
}

fn default_healthcheck_timeout_ms() -> u64 {
    2000
}

fn default_server_port() -> u16 {
    8080
}

fn validate_sasl_credentials(cfg: &Config) -> Result<(), ValidationError> {
    if !cfg.sasl_enable {
        return Ok(());
    }
    let has_user = cfg.user_name.as_deref().is_some_and(|u| !u.is_empty());
    let has_password = cfg
        .password
        .as_ref()
        .is_some_and(|p| !p.expose_secret().is_empty());
    if has_user && has_password {
        Ok(())
    } else {
        Err(ValidationError::new("sasl_credentials_required"))
    }
}

impl Config {
    /// Read and validate configuration from the process environment.
    pub fn from_env() -> ConsumerResult<Self> {
        Self::from_iter(std::env::vars())
    }

    /// Read and validate configuration from explicit key/value pairs.
    pub fn from_iter<I>(vars: I) -> ConsumerResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let cfg: Config = envy::from_iter(vars)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Comma-separated bootstrap servers
    pub fn bootstrap_servers(&self) -> String {
        self.addresses.join(",")
    }

    pub fn healthcheck_timeout(&self) -> Duration {
        Duration::from_millis(self.healthcheck_timeout_ms)
    }

    pub fn metrics_namespace(&self) -> &str {
        self.metrics_namespace
            .as_deref()
            .unwrap_or(&self.deployment_name)
    }

    /// Assemble the librdkafka client configuration.
    ///
    /// Offsets are stored and committed by the consumer group itself, so both
    /// auto-commit and automatic offset storage are disabled.
    pub fn kafka_client_config(&self) -> ConsumerResult<ClientConfig> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("group.id", &self.group_id)
            .set("client.id", &self.client_id)
            .set("auto.offset.reset", self.offset_reset.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string());

        if self.sasl_enable {
            let user = self
                .user_name
                .as_deref()
                .ok_or_else(|| ConsumerError::Config("KAFKA_USERNAME is required".to_string()))?;
            let password = self
                .password
                .as_ref()
                .ok_or_else(|| ConsumerError::Config("KAFKA_PASSWORD is required".to_string()))?;

            client
                .set("security.protocol", self.security_protocol.as_str())
                .set("sasl.mechanism", self.sasl_mechanism.as_str())
                .set("sasl.username", user)
                .set("sasl.password", password.expose_secret());

            if let Some(ca) = self.ca_cert.as_deref().filter(|ca| !ca.trim().is_empty()) {
                client.set("ssl.ca.pem", ca);
            }
            if self.tls_skip_verify {
                client.set("enable.ssl.certificate.verification", "false");
            }
        }

        Ok(client)
    }
}

/// Offset reset strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Start from the oldest retained offset
    Earliest,
    /// Start from the next produced offset
    #[default]
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Security protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }
}

/// SASL mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SaslMechanism {
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = [
            ("ENV", "testing"),
            ("KAFKA_DSN", "broker-1:9092,broker-2:9092"),
            ("KAFKA_CONSUMER_TOPICS", "orders,payments"),
            ("KAFKA_CONSUMER_GROUP_ID", "orders-consumer"),
            ("KAFKA_CLIENT_ID", "orders-consumer-1"),
            ("DEPLOYMENT_NAME", "orders-consumer"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            vars.retain(|(key, _)| key != k);
            vars.push((k.to_string(), v.to_string()));
        }
        vars
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_iter(vars(&[])).unwrap();

        assert_eq!(cfg.env, Environment::Testing);
        assert_eq!(cfg.addresses, vec!["broker-1:9092", "broker-2:9092"]);
        assert_eq!(cfg.topics, vec!["orders", "payments"]);
        assert_eq!(cfg.offset_reset, OffsetReset::Latest);
        assert_eq!(cfg.security_protocol, SecurityProtocol::SaslSsl);
        assert_eq!(cfg.sasl_mechanism, SaslMechanism::ScramSha256);
        assert!(!cfg.sasl_enable);
        assert_eq!(cfg.server_port, 8080);
        assert_eq!(cfg.healthcheck_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.channel_buffer_size, 256);
        assert_eq!(cfg.metrics_namespace(), "orders-consumer");
    }

    #[test]
    fn test_missing_required_variable() {
        let mut env = vars(&[]);
        env.retain(|(k, _)| k != "KAFKA_CONSUMER_GROUP_ID");
        assert!(matches!(Config::from_iter(env), Err(ConsumerError::Env(_))));
    }

    #[test]
    fn test_unknown_offset_reset_rejected() {
        let env = vars(&[("KAFKA_CONSUMER_AUTO_OFFSET_RESET", "newest")]);
        assert!(Config::from_iter(env).is_err());
    }

    #[test]
    fn test_sasl_requires_credentials() {
        let env = vars(&[("KAFKA_SASL_ENABLE", "true"), ("KAFKA_USERNAME", "svc")]);
        assert!(matches!(
            Config::from_iter(env),
            Err(ConsumerError::Validation(_))
        ));
    }

    #[test]
    fn test_client_config_plaintext() {
        let cfg = Config::from_iter(vars(&[("KAFKA_CONSUMER_AUTO_OFFSET_RESET", "earliest")]))
            .unwrap();
        let client = cfg.kafka_client_config().unwrap();

        assert_eq!(
            client.get("bootstrap.servers"),
            Some("broker-1:9092,broker-2:9092")
        );
        assert_eq!(client.get("group.id"), Some("orders-consumer"));
        assert_eq!(client.get("client.id"), Some("orders-consumer-1"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("security.protocol"), None);
    }

    #[test]
    fn test_client_config_sasl() {
        let cfg = Config::from_iter(vars(&[
            ("KAFKA_SASL_ENABLE", "true"),
            ("KAFKA_USERNAME", "svc"),
            ("KAFKA_PASSWORD", "s3cret"),
            ("KAFKA_SASL_MECHANISM", "SCRAM-SHA-512"),
            ("KAFKA_CA_CERT", "-----BEGIN CERTIFICATE-----"),
        ]))
        .unwrap();
        let client = cfg.kafka_client_config().unwrap();

        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(client.get("sasl.username"), Some("svc"));
        assert_eq!(client.get("sasl.password"), Some("s3cret"));
        assert_eq!(client.get("ssl.ca.pem"), Some("-----BEGIN CERTIFICATE-----"));
        assert_eq!(client.get("enable.ssl.certificate.verification"), None);
    }

    #[test]
    fn test_password_not_in_debug_output() {
        let cfg = Config::from_iter(vars(&[
            ("KAFKA_SASL_ENABLE", "true"),
            ("KAFKA_USERNAME", "svc"),
            ("KAFKA_PASSWORD", "s3cret"),
        ]))
        .unwrap();
        assert!(!format!("{cfg:?}").contains("s3cret"));
    }
}

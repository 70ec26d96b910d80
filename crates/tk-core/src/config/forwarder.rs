//! Forwarder configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::{ConfigError, ErrorClass, TransportError};
use crate::types::{TunnelDirection, TunnelRegistry, TunnelSpec};

/// Configuration for the forwarding agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// SSH server to keep the session open to (`host:port`)
    pub remote_server: String,

    /// Username for SSH authentication
    pub user: String,

    /// Private key used for authentication.
    ///
    /// Relative paths are resolved inside `~/.ssh`.
    pub keyfile: PathBuf,

    /// known_hosts file used to verify the server identity
    pub known_hosts: Option<PathBuf>,

    /// Refuse servers whose key is not in `known_hosts`
    pub strict_host_key_checking: bool,

    /// Tunnels to keep open, e.g. `L 8080:127.0.0.1:80`
    pub tunnels: Vec<TunnelSpec>,

    /// Delay between connect and listen attempts
    pub retry: BackoffConfig,

    /// Which listen failures stop retrying
    pub listen_errors: ListenErrorPolicy,

    /// Timeout for one connect + authenticate attempt
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Interval between SSH keepalive requests
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Unanswered keepalives before the session is considered dead
    pub keepalive_max: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            remote_server: String::new(),
            user: whoami::username(),
            keyfile: PathBuf::from("id_rsa"),
            known_hosts: Some(super::ssh_dir().join("known_hosts")),
            strict_host_key_checking: true,
            tunnels: vec![],
            retry: BackoffConfig::default(),
            listen_errors: ListenErrorPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            keepalive_max: 3,
        }
    }
}

impl ForwarderConfig {
    /// Path of the private key, resolving relative names inside `~/.ssh`
    pub fn key_path(&self) -> PathBuf {
        if self.keyfile.is_absolute() {
            self.keyfile.clone()
        } else {
            super::ssh_dir().join(&self.keyfile)
        }
    }

    /// The immutable tunnel set built from this configuration
    pub fn registry(&self) -> TunnelRegistry {
        TunnelRegistry::new(self.tunnels.clone())
    }

    /// Check the fields required before the agent can start
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_server.trim().is_empty() {
            return Err(ConfigError::MissingField("remote_server".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::MissingField("user".to_string()));
        }
        if self.tunnels.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one tunnel must be configured".to_string(),
            ));
        }
        self.retry.validate()?;
        self.validate_remote_binds()
    }

    /// Remote forwards are routed back by bind port, so each needs its own
    /// explicit port
    fn validate_remote_binds(&self) -> Result<(), ConfigError> {
        let mut ports = HashSet::new();
        for spec in &self.tunnels {
            if spec.direction != TunnelDirection::Remote {
                continue;
            }
            if spec.bind.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tunnel '{}': remote bind port must not be 0",
                    spec
                )));
            }
            if !ports.insert(spec.bind.port) {
                return Err(ConfigError::Invalid(format!(
                    "tunnel '{}': remote bind port {} is used by another remote tunnel",
                    spec, spec.bind.port
                )));
            }
        }
        Ok(())
    }
}

/// Backoff configuration for connect and listen retries
///
/// The defaults give a fixed five second interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(5),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    /// Reject delays and factors the retry loop cannot use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial.is_zero() {
            return Err(ConfigError::Invalid(
                "retry.initial must be at least one second".to_string(),
            ));
        }
        if self.max < self.initial {
            return Err(ConfigError::Invalid(
                "retry.max must not be below retry.initial".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// Decides which listen failures end a tunnel's retry loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenErrorPolicy {
    /// Session end and local socket failures are fatal
    #[default]
    Strict,
    /// Only session end is fatal; everything else is retried
    Lenient,
}

impl ListenErrorPolicy {
    /// Classify a listen failure
    pub fn classify(&self, err: &TransportError) -> ErrorClass {
        if err.is_session_end() {
            return ErrorClass::Fatal;
        }
        match self {
            ListenErrorPolicy::Strict if err.is_network_operation() => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_in_use() -> TransportError {
        TransportError::io(
            "127.0.0.1:8080",
            std::io::Error::from(std::io::ErrorKind::AddrInUse),
        )
    }

    #[test]
    fn test_default_retry_is_fixed_five_seconds() {
        let retry = BackoffConfig::default();
        assert_eq!(retry.initial, Duration::from_secs(5));
        assert_eq!(retry.max, Duration::from_secs(5));
        assert_eq!(retry.multiplier, 1.0);
        assert_eq!(retry.jitter, 0.0);
    }

    #[test]
    fn test_strict_policy() {
        let policy = ListenErrorPolicy::Strict;
        assert_eq!(policy.classify(&TransportError::SessionClosed), ErrorClass::Fatal);
        assert_eq!(policy.classify(&addr_in_use()), ErrorClass::Fatal);
        assert_eq!(
            policy.classify(&TransportError::Rejected("tcpip-forward".into())),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_lenient_policy() {
        let policy = ListenErrorPolicy::Lenient;
        assert_eq!(policy.classify(&TransportError::SessionClosed), ErrorClass::Fatal);
        assert_eq!(policy.classify(&addr_in_use()), ErrorClass::Transient);
        assert_eq!(
            policy.classify(&TransportError::Protocol("oops".into())),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_key_path_resolution() {
        let mut config = ForwarderConfig::default();
        config.keyfile = PathBuf::from("id_ed25519");
        assert!(config.key_path().ends_with(".ssh/id_ed25519"));

        config.keyfile = PathBuf::from("/etc/keys/deploy");
        assert_eq!(config.key_path(), PathBuf::from("/etc/keys/deploy"));
    }

    #[test]
    fn test_validate() {
        let mut config = ForwarderConfig::default();
        config.user = "ops".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(field)) if field == "remote_server"
        ));

        config.remote_server = "gateway:22".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.tunnels = vec!["L 8080:127.0.0.1:80".parse().unwrap()];
        assert!(config.validate().is_ok());
        assert_eq!(config.registry().len(), 1);
    }

    fn valid_config() -> ForwarderConfig {
        ForwarderConfig {
            remote_server: "gateway:22".to_string(),
            user: "ops".to_string(),
            tunnels: vec!["L 8080:127.0.0.1:80".parse().unwrap()],
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_unusable_retry_factors() {
        let config: ForwarderConfig = toml::from_str(
            r#"
remote_server = "gateway:22"
user = "ops"
tunnels = ["L 8080:127.0.0.1:80"]

[retry]
initial = 5
max = 60
multiplier = 1e20
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let unusable = [(f64::NAN, 0.0), (f64::INFINITY, 0.0), (0.5, 0.0), (1.0, 1.5)];
        for (multiplier, jitter) in unusable {
            let mut config = valid_config();
            config.retry.multiplier = multiplier;
            config.retry.jitter = jitter;
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "multiplier {} jitter {} accepted",
                multiplier,
                jitter
            );
        }

        let mut config = valid_config();
        config.retry.jitter = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = valid_config();
        config.retry.max = Duration::from_secs(1);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_remote_port_zero() {
        let mut config = valid_config();
        config.tunnels = vec!["R 0:127.0.0.1:80".parse().unwrap()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("must not be 0")
        ));

        // Local tunnels may still let the OS pick a port
        config.tunnels = vec!["L 0:127.0.0.1:80".parse().unwrap()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_remote_ports() {
        let mut config = valid_config();
        config.tunnels = vec![
            "R 127.0.0.1:9090:127.0.0.1:80".parse().unwrap(),
            "R 0.0.0.0:9090:127.0.0.1:81".parse().unwrap(),
        ];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.tunnels = vec![
            "R 9090:127.0.0.1:80".parse().unwrap(),
            "L 9090:127.0.0.1:81".parse().unwrap(),
            "R 9091:127.0.0.1:82".parse().unwrap(),
        ];
        assert!(config.validate().is_ok());
    }
}

//! C3 — validates [`ConnectionConfig`] and produces unconnected
//! [`SshClient`]s bound to a [`Tracer`].
//!
//! Auth resolution happens here, once, rather than inline in
//! [`SshClient::connect`]: for `Auth::Key` the PEM is checked for basic
//! well-formedness up front so a malformed key fails fast with
//! `ErrInvalidConfig` instead of surfacing as a confusing connect-time
//! `ErrAuth`.

use crate::error::{Error, ErrorKind, Result};
use crate::ssh::{Auth, ConnectionConfig, SshClient};
use crate::tracer::Tracer;

pub struct ConnectionFactory {
    tracer: Tracer,
}

impl ConnectionFactory {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            tracer: tracer.scoped("factory"),
        }
    }

    pub fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        if config.host.trim().is_empty() {
            return Err(Error::new(ErrorKind::InvalidConfig, "host must not be empty"));
        }
        if config.port == 0 {
            return Err(Error::new(ErrorKind::InvalidConfig, "port must not be 0"));
        }
        if config.timeout.is_zero() {
            return Err(Error::new(ErrorKind::InvalidConfig, "timeout must be greater than 0"));
        }
        if config.username.trim().is_empty()
            || !config
                .username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::new(
                ErrorKind::InvalidConfig,
                format!("invalid username: {:?}", config.username),
            ));
        }
        match &config.auth {
            Auth::Key { private_key, .. } => {
                if private_key.trim().is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidConfig,
                        "auth kind 'key' requires private_key to be set",
                    ));
                }
                if !private_key.contains("PRIVATE KEY") {
                    return Err(Error::new(
                        ErrorKind::InvalidConfig,
                        "private_key does not look like a PEM-encoded private key (missing 'PRIVATE KEY' marker)",
                    ));
                }
            }
            Auth::Password { password } => {
                if password.is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidConfig,
                        "auth kind 'password' requires a non-empty password",
                    ));
                }
            }
            Auth::Agent => {}
        }
        Ok(())
    }

    /// Validate and produce an unconnected client. The pool calls
    /// `client.connect()` itself so it controls when the TCP/SSH handshake
    /// actually happens.
    pub fn create(&self, config: ConnectionConfig) -> Result<SshClient> {
        self.validate(&config)?;
        Ok(SshClient::unconnected(config, self.tracer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracer() -> Tracer {
        Tracer::always()
    }

    #[test]
    fn rejects_empty_host() {
        let f = ConnectionFactory::new(tracer());
        let mut cfg = ConnectionConfig::new("", "deploy", Auth::Agent);
        cfg.timeout = Duration::from_secs(5);
        assert_eq!(f.validate(&cfg).unwrap_err().kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn rejects_zero_port() {
        let f = ConnectionFactory::new(tracer());
        let mut cfg = ConnectionConfig::new("h", "deploy", Auth::Agent);
        cfg.port = 0;
        assert_eq!(f.validate(&cfg).unwrap_err().kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn rejects_key_auth_without_private_key() {
        let f = ConnectionFactory::new(tracer());
        let cfg = ConnectionConfig::new(
            "h",
            "deploy",
            Auth::Key {
                private_key: "".to_string(),
                passphrase: None,
            },
        );
        assert_eq!(f.validate(&cfg).unwrap_err().kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn rejects_key_auth_with_malformed_pem() {
        let f = ConnectionFactory::new(tracer());
        let cfg = ConnectionConfig::new(
            "h",
            "deploy",
            Auth::Key {
                private_key: "not a key".to_string(),
                passphrase: None,
            },
        );
        assert_eq!(f.validate(&cfg).unwrap_err().kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn accepts_well_formed_config() {
        let f = ConnectionFactory::new(tracer());
        let cfg = ConnectionConfig::new("h", "deploy", Auth::Agent);
        assert!(f.validate(&cfg).is_ok());
    }
}

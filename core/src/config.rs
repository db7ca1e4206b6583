//! Secrets read from the environment
//!
//! | Variable              | Used by                      |
//! |-----------------------|------------------------------|
//! | `TANDEM_RELAY_SECRET` | relay and clients (signing)  |
//! | `TANDEM_TOKEN_SECRET` | identity service and relay   |
//! | `TANDEM_TLS_CERT`     | relay (PEM certificate path) |
//! | `TANDEM_TLS_KEY`      | relay (PEM PKCS#8 key path)  |

use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

pub const RELAY_SECRET_VAR: &str = "TANDEM_RELAY_SECRET";
pub const TOKEN_SECRET_VAR: &str = "TANDEM_TOKEN_SECRET";
pub const TLS_CERT_VAR: &str = "TANDEM_TLS_CERT";
pub const TLS_KEY_VAR: &str = "TANDEM_TLS_KEY";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
}

/// Secrets and TLS material locations; every field is optional until a
/// component asks for it with one of the `require_*` accessors.
#[derive(Default)]
pub struct Secrets {
    relay_secret: Option<Zeroizing<String>>,
    token_secret: Option<Zeroizing<String>>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; empty values count as missing
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            relay_secret: get(RELAY_SECRET_VAR).map(Zeroizing::new),
            token_secret: get(TOKEN_SECRET_VAR).map(Zeroizing::new),
            tls_cert: get(TLS_CERT_VAR).map(PathBuf::from),
            tls_key: get(TLS_KEY_VAR).map(PathBuf::from),
        }
    }

    pub fn relay_secret(&self) -> Option<&str> {
        self.relay_secret.as_ref().map(|s| s.as_str())
    }

    pub fn require_relay_secret(&self) -> Result<&str, ConfigError> {
        self.relay_secret()
            .ok_or(ConfigError::Missing(RELAY_SECRET_VAR))
    }

    pub fn require_token_secret(&self) -> Result<&str, ConfigError> {
        self.token_secret
            .as_ref()
            .map(|s| s.as_str())
            .ok_or(ConfigError::Missing(TOKEN_SECRET_VAR))
    }

    /// Certificate and key paths, both required
    pub fn require_tls(&self) -> Result<(&PathBuf, &PathBuf), ConfigError> {
        let cert = self.tls_cert.as_ref().ok_or(ConfigError::Missing(TLS_CERT_VAR))?;
        let key = self.tls_key.as_ref().ok_or(ConfigError::Missing(TLS_KEY_VAR))?;
        Ok((cert, key))
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("relay_secret", &self.relay_secret.as_ref().map(|_| "<set>"))
            .field("token_secret", &self.token_secret.as_ref().map(|_| "<set>"))
            .field("tls_cert", &self.tls_cert)
            .field("tls_key", &self.tls_key)
            .finish()
    }
}

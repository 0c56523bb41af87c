//! Environment contract and argument parsing
//!
//! The relay and the broker locate each other through two environment
//! variables provided by the namespace-management tooling:
//!
//! - `XDG_RUNTIME_DIR` — runtime directory root
//! - `USERNS_NAME` — name of the active user namespace
//!
//! The broker listens on `$XDG_RUNTIME_DIR/userns/$USERNS_NAME/socketd`.
//! All validation happens before any socket is opened.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Environment variable naming the runtime directory root
pub const ENV_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";

/// Environment variable naming the active user namespace
pub const ENV_NAMESPACE: &str = "USERNS_NAME";

/// Protocol selected on the relay command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(ConfigError::UnknownProtocol {
                value: other.into(),
            }),
        }
    }
}

/// Parse a port argument, rejecting anything that is not a 16-bit number.
pub fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::BadPort {
        value: value.into(),
    })
}

/// Resolved environment for one relay or broker process
#[derive(Debug, Clone)]
pub struct RelayEnv {
    /// Runtime directory root (`XDG_RUNTIME_DIR`)
    pub runtime_dir: PathBuf,
    /// Active namespace name (`USERNS_NAME`, or a `--name` override)
    pub namespace: String,
}

impl RelayEnv {
    /// Resolve the environment contract from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EnvMissing` if either variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), None)
    }

    /// Resolve the environment with an explicit namespace override.
    ///
    /// Used by the broker daemon's `--name` option; `USERNS_NAME` is not
    /// required when an override is given.
    pub fn from_env_with_namespace(namespace: Option<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), namespace)
    }

    /// Resolve from an injectable lookup function. Exists so tests can run
    /// without mutating process-global environment state.
    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        namespace_override: Option<String>,
    ) -> Result<Self, ConfigError> {
        let runtime_dir = lookup(ENV_RUNTIME_DIR).ok_or(ConfigError::EnvMissing {
            name: ENV_RUNTIME_DIR,
        })?;

        let namespace = match namespace_override {
            Some(name) => name,
            None => lookup(ENV_NAMESPACE).ok_or(ConfigError::EnvMissing {
                name: ENV_NAMESPACE,
            })?,
        };

        Ok(Self {
            runtime_dir: PathBuf::from(runtime_dir),
            namespace,
        })
    }

    /// Well-known Unix-domain-socket path of the broker for this namespace.
    #[must_use]
    pub fn broker_socket_path(&self) -> PathBuf {
        broker_socket_path(&self.runtime_dir, &self.namespace)
    }
}

/// Derive the broker socket path from a runtime directory and namespace name.
#[must_use]
pub fn broker_socket_path(runtime_dir: &Path, namespace: &str) -> PathBuf {
    runtime_dir.join("userns").join(namespace).join("socketd")
}

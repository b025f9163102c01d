//! Server configuration, read from the environment

use std::net::SocketAddr;

use thiserror::Error;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_EXCHANGE: &str = "logs";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime settings of the `fanq` binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address of the HTTP API (`FANQ_LISTEN_ADDR`)
    pub listen_addr: SocketAddr,
    /// Host name the in-process broker is registered under (`FANQ_HOST`)
    pub host: String,
    /// Fanout exchange the log consumer listens on (`FANQ_EXCHANGE`)
    pub exchange: String,
    /// Whether to run the log consumer (`FANQ_CONSUMER`)
    pub run_consumer: bool,
}

impl ServerConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("FANQ_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into());
        let listen_addr: SocketAddr = listen_addr.parse().map_err(|_| ConfigError::Invalid {
            key: "FANQ_LISTEN_ADDR",
            value: listen_addr.clone(),
        })?;

        let exchange = lookup("FANQ_EXCHANGE").unwrap_or_else(|| DEFAULT_EXCHANGE.into());
        if exchange.is_empty() {
            return Err(ConfigError::Invalid {
                key: "FANQ_EXCHANGE",
                value: exchange,
            });
        }

        let run_consumer = match lookup("FANQ_CONSUMER").as_deref() {
            None | Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "FANQ_CONSUMER",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            listen_addr,
            host: lookup("FANQ_HOST").unwrap_or_else(|| DEFAULT_HOST.into()),
            exchange,
            run_consumer,
        })
    }
}

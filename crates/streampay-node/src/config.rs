use config::{Config as ConfigSource, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

fn default_ilp_bind() -> SocketAddr {
    ([127, 0, 0, 1], 3002).into()
}

fn default_api_bind() -> SocketAddr {
    ([127, 0, 0, 1], 3001).into()
}

fn default_quote_lifespan_ms() -> u64 {
    5 * 60 * 1000
}

fn default_slippage() -> f64 {
    0.01
}

fn default_withdrawal_throttle_delay_ms() -> u64 {
    60 * 1000
}

fn default_exchange_rates_lifetime_ms() -> u64 {
    15 * 1000
}

fn default_worker_interval_ms() -> u64 {
    1000
}

/// Node configuration, loadable from a config file with `STREAMPAY_*`
/// environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// The ILP prefix local accounts are addressable under, e.g. `test.mynode`
    pub ilp_address: String,
    /// Origin serving wallet addresses, connections and SPSP queries
    pub open_payments_url: String,
    /// 32-byte STREAM server secret, hex encoded
    pub stream_secret: String,
    /// Where webhook events are POSTed
    pub webhook_url: String,
    /// HMAC key for webhook signatures, hex encoded
    #[serde(default)]
    pub webhook_secret: Option<String>,
    pub exchange_rates_url: String,
    #[serde(default = "default_exchange_rates_lifetime_ms")]
    pub exchange_rates_lifetime_ms: u64,
    #[serde(default = "default_quote_lifespan_ms")]
    pub quote_lifespan_ms: u64,
    #[serde(default = "default_slippage")]
    pub slippage: f64,
    #[serde(default = "default_withdrawal_throttle_delay_ms")]
    pub withdrawal_throttle_delay_ms: u64,
    #[serde(default = "default_worker_interval_ms")]
    pub worker_interval_ms: u64,
    /// Bind address of the ILP-over-HTTP transport
    #[serde(default = "default_ilp_bind")]
    pub ilp_bind: SocketAddr,
    /// Bind address of the SPSP / connections / admin surface
    #[serde(default = "default_api_bind")]
    pub api_bind: SocketAddr,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut source = ConfigSource::new();
        if let Some(path) = path {
            source.merge(File::from(path))?;
        }
        source.merge(Environment::with_prefix("STREAMPAY"))?;
        source.try_into()
    }

    pub fn stream_secret_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(&self.stream_secret)
            .map_err(|err| ConfigError::Message(format!("stream_secret is not hex: {}", err)))?;
        if bytes.len() != 32 {
            return Err(ConfigError::Message(format!(
                "stream_secret must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&bytes);
        Ok(secret)
    }

    pub fn webhook_secret_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.webhook_secret
            .as_ref()
            .map(|secret| {
                hex::decode(secret).map_err(|err| {
                    ConfigError::Message(format!("webhook_secret is not hex: {}", err))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_the_stream_secret() {
        let mut config = Config {
            ilp_address: "test.node".to_string(),
            open_payments_url: "https://wallet.example".to_string(),
            stream_secret: hex::encode([7u8; 32]),
            webhook_url: "https://hooks.example/streampay".to_string(),
            webhook_secret: None,
            exchange_rates_url: "https://rates.example".to_string(),
            exchange_rates_lifetime_ms: default_exchange_rates_lifetime_ms(),
            quote_lifespan_ms: default_quote_lifespan_ms(),
            slippage: 0.01,
            withdrawal_throttle_delay_ms: default_withdrawal_throttle_delay_ms(),
            worker_interval_ms: default_worker_interval_ms(),
            ilp_bind: default_ilp_bind(),
            api_bind: default_api_bind(),
        };
        assert_eq!(config.stream_secret_bytes().unwrap(), [7u8; 32]);

        config.stream_secret = "abcd".to_string();
        assert!(config.stream_secret_bytes().is_err());
    }
}

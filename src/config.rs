//! Environment-based Configuration
//!
//! All configuration comes from environment variables. Sensitive values
//! (the master wallet key, bank credentials) MUST come from the
//! environment, never from hardcoded values, and are redacted from every
//! Debug rendering of the config.
//!
//! # Required Environment Variables
//!
//! - `FIATRAMP_MASTER_KEY` - Base58 extended private key (xprv/tprv) of
//!   the wallet master
//! - `FIATRAMP_TICKER_URL` - Upstream exchange ticker endpoint
//! - `FIATRAMP_BANK_URL` - Bank integration API base URL
//! - `FIATRAMP_BANK_USERNAME` / `FIATRAMP_BANK_PASSWORD` - Bank API
//!   credentials
//!
//! # Optional Settings
//!
//! - `FIATRAMP_NETWORK` - "mainnet", "testnet", "signet", "regtest"
//!   (default: "testnet")
//! - `FIATRAMP_ESPLORA_URL` - Esplora API endpoint (default per network)
//! - `FIATRAMP_DATABASE` - SQLite database path (default: "fiatramp.db")
//! - `FIATRAMP_PAIR` - Ticker pair for order execution (default: "btcisk")
//! - `FIATRAMP_MIN_ORDER` - Minimum fiat order amount (default: "100")
//! - `FIATRAMP_MIN_CONFIRMATIONS` - Confirmations before a hot-wallet
//!   coin is spendable (default: "2")
//! - `FIATRAMP_RECONCILE_INTERVAL_SECS` - Bank statement poll interval
//!   (default: "60")
//! - `FIATRAMP_TICKER_REFRESH_SECS` - Ticker refresh interval
//!   (default: "30")
//! - `FIATRAMP_HTTP_TIMEOUT_SECS` - Timeout for upstream HTTP calls
//!   (default: "10")
//! - `FIATRAMP_LOG_LEVEL` - Logging level (default: "info")
//! - `FIATRAMP_LOG_JSON` - Set to "1" for JSON log output

use bitcoin::bip32::Xpriv;
use bitcoin::{Network, NetworkKind};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("network mismatch: master key is for {key}, configured network is {configured}")]
    NetworkMismatch { key: String, configured: String },
}

/// Main configuration struct
#[derive(Clone)]
pub struct Config {
    /// Bitcoin network
    pub network: Network,
    /// Base58 master extended private key. Secret.
    pub master_key: String,
    /// Esplora API endpoint
    pub esplora_url: String,
    /// SQLite database path
    pub database: String,
    /// Upstream ticker endpoint
    pub ticker_url: String,
    /// Ticker pair orders execute against
    pub pair: String,
    /// Bank integration API base URL
    pub bank_url: String,
    /// Bank API username
    pub bank_username: String,
    /// Bank API password. Secret.
    pub bank_password: String,
    /// Minimum fiat order amount
    pub min_order: Decimal,
    /// Confirmations before a hot-wallet coin is spendable
    pub min_confirmations: u32,
    /// Bank statement poll interval
    pub reconcile_interval: Duration,
    /// Ticker refresh interval
    pub ticker_refresh: Duration,
    /// Timeout for upstream HTTP calls
    pub http_timeout: Duration,
    /// Log level
    pub log_level: String,
    /// JSON log output
    pub log_json: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets intentionally omitted.
        f.debug_struct("Config")
            .field("network", &self.network)
            .field("esplora_url", &self.esplora_url)
            .field("database", &self.database)
            .field("ticker_url", &self.ticker_url)
            .field("pair", &self.pair)
            .field("bank_url", &self.bank_url)
            .field("bank_username", &self.bank_username)
            .field("min_order", &self.min_order)
            .field("min_confirmations", &self.min_confirmations)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("ticker_refresh", &self.ticker_refresh)
            .field("http_timeout", &self.http_timeout)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network = parse_network(
            &env::var("FIATRAMP_NETWORK").unwrap_or_else(|_| "testnet".to_string()),
        )?;

        let master_key = required("FIATRAMP_MASTER_KEY")?;

        let esplora_url = env::var("FIATRAMP_ESPLORA_URL")
            .unwrap_or_else(|_| default_esplora_url(network).to_string());

        let database =
            env::var("FIATRAMP_DATABASE").unwrap_or_else(|_| "fiatramp.db".to_string());

        let ticker_url = required("FIATRAMP_TICKER_URL")?;
        let pair = env::var("FIATRAMP_PAIR").unwrap_or_else(|_| "btcisk".to_string());

        let bank_url = required("FIATRAMP_BANK_URL")?;
        let bank_username = required("FIATRAMP_BANK_USERNAME")?;
        let bank_password = required("FIATRAMP_BANK_PASSWORD")?;

        let min_order = parse_decimal("FIATRAMP_MIN_ORDER", "100")?;
        let min_confirmations = parse_u64("FIATRAMP_MIN_CONFIRMATIONS", "2")? as u32;

        let reconcile_interval =
            Duration::from_secs(parse_u64("FIATRAMP_RECONCILE_INTERVAL_SECS", "60")?);
        let ticker_refresh =
            Duration::from_secs(parse_u64("FIATRAMP_TICKER_REFRESH_SECS", "30")?);
        let http_timeout = Duration::from_secs(parse_u64("FIATRAMP_HTTP_TIMEOUT_SECS", "10")?);

        let log_level = env::var("FIATRAMP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("FIATRAMP_LOG_JSON").map(|v| v == "1").unwrap_or(false);

        Ok(Self {
            network,
            master_key,
            esplora_url,
            database,
            ticker_url,
            pair,
            bank_url,
            bank_username,
            bank_password,
            min_order,
            min_confirmations,
            reconcile_interval,
            ticker_refresh,
            http_timeout,
            log_level,
            log_json,
        })
    }

    /// Parse the master key, checking it belongs to the configured network.
    pub fn master_xpriv(&self) -> Result<Xpriv, ConfigError> {
        let xpriv = Xpriv::from_str(&self.master_key).map_err(|e| {
            ConfigError::InvalidValue("FIATRAMP_MASTER_KEY".to_string(), e.to_string())
        })?;

        let expected = NetworkKind::from(self.network);
        if xpriv.network != expected {
            return Err(ConfigError::NetworkMismatch {
                key: format!("{:?}", xpriv.network),
                configured: self.network.to_string(),
            });
        }
        Ok(xpriv)
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn parse_network(value: &str) -> Result<Network, ConfigError> {
    match value.to_lowercase().as_str() {
        "mainnet" | "main" | "bitcoin" => Ok(Network::Bitcoin),
        "testnet" | "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(ConfigError::InvalidValue(
            "FIATRAMP_NETWORK".to_string(),
            format!("unknown network: {}", other),
        )),
    }
}

fn default_esplora_url(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "https://blockstream.info/api",
        _ => "https://blockstream.info/testnet/api",
    }
}

fn parse_decimal(name: &str, default: &str) -> Result<Decimal, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(&raw)
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn parse_u64(name: &str, default: &str) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string(), format!("not a number: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Config {
        Config {
            network: Network::Testnet,
            master_key: "tprv-secret-material".to_string(),
            esplora_url: "https://blockstream.info/testnet/api".to_string(),
            database: "fiatramp.db".to_string(),
            ticker_url: "https://ticker.example/pairs".to_string(),
            pair: "btcisk".to_string(),
            bank_url: "https://bank.example/api".to_string(),
            bank_username: "fiatramp".to_string(),
            bank_password: "hunter2".to_string(),
            min_order: dec!(100),
            min_confirmations: 2,
            reconcile_interval: Duration::from_secs(60),
            ticker_refresh: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
            log_json: false,
        }
    }

    #[test]
    fn test_network_parsing() {
        assert_eq!(parse_network("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("Testnet").unwrap(), Network::Testnet);
        assert_eq!(parse_network("regtest").unwrap(), Network::Regtest);
        assert!(parse_network("moonnet").is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", sample());
        assert!(!rendered.contains("tprv-secret-material"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("btcisk"));
    }

    #[test]
    fn test_invalid_master_key_is_rejected() {
        let config = sample();
        assert!(matches!(
            config.master_xpriv(),
            Err(ConfigError::InvalidValue(_, _))
        ));
    }
}

//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` into strongly-typed sections. Every section has
//! defaults, so a partial file (or an empty one) is valid. Secrets such as
//! the RPC URL and the CoinGecko key are referenced by env-var name and
//! resolved at startup.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;

use crate::engine::pipeline::PriceQuote;
use crate::engine::submitter::SubmitterConfig;
use crate::engine::validator::ValidatorConfig;
use crate::ledger::gas::GasOracleConfig;
use crate::ledger::NATIVE_DECIMALS;
use crate::models::ensemble::EnsembleConfig;
use crate::models::policy::PolicyConfig;
use crate::models::sequence::SequenceModelConfig;
use crate::types::{RiskLevel, Strategy};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub ledger: LedgerConfig,
    pub gas: GasOracleConfig,
    pub submitter: SubmitterConfig,
    pub sequence_model: SequenceModelConfig,
    pub policy_agent: PolicyConfig,
    pub ensemble: EnsembleConfig,
    pub validator: ValidatorConfig,
    pub collector: CollectorConfig,
    pub strategy: StrategyConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub tick_interval_secs: u64,
    /// Account that pays for trades; empty means the signer's address.
    pub user_address: String,
    pub history_file: Option<String>,
    /// Retrain period in hours; 0 disables periodic retraining.
    pub retrain_interval_hours: u64,
    /// Begin auto-trading right after startup.
    pub auto_start: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "SENTINEL-001".to_string(),
            tick_interval_secs: 30,
            user_address: String::new(),
            history_file: None,
            retrain_interval_hours: 24,
            auto_start: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    /// Env var holding the JSON-RPC URL (often with an embedded key).
    pub rpc_url_env: String,
    /// Env var holding the hex private key that signs trades.
    pub signer_key_env: String,
    pub chain_id: Option<u64>,
    pub contract_address: String,
    pub wrapped_native: String,
    pub trade_token: String,
    /// Orientation of the collected prices relative to the pair.
    pub price_quote: PriceQuote,
    pub token_decimals: u32,
    pub poll_interval_secs: u64,
    /// Tolerated shortfall on swap output, in percent.
    pub slippage_pct: Decimal,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url_env: "SENTINEL_RPC_URL".to_string(),
            signer_key_env: "SENTINEL_PRIVATE_KEY".to_string(),
            chain_id: None,
            contract_address: String::new(),
            wrapped_native: String::new(),
            trade_token: String::new(),
            price_quote: PriceQuote::TokenPerNative,
            token_decimals: 18,
            poll_interval_secs: 3,
            slippage_pct: dec!(1),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CollectorProvider {
    Coingecko,
    /// Replay a JSON file of `PricePoint`s.
    File,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConfig {
    pub provider: CollectorProvider,
    pub vs_currency: String,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub replay_file: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            provider: CollectorProvider::Coingecko,
            vs_currency: "usd".to_string(),
            api_key_env: None,
            base_url: None,
            replay_file: None,
        }
    }
}

/// A named preset with optional per-field overrides.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrategyConfig {
    pub preset: String,
    pub risk_level: Option<RiskLevel>,
    pub max_trades_per_hour: Option<u32>,
    pub min_minutes_between_trades: Option<u32>,
    pub ai_confidence_threshold: Option<f64>,
    pub max_portfolio_exposure: Option<Decimal>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            preset: "moderate".to_string(),
            risk_level: None,
            max_trades_per_hour: None,
            min_minutes_between_trades: None,
            ai_confidence_threshold: None,
            max_portfolio_exposure: None,
        }
    }
}

impl StrategyConfig {
    /// Resolve the preset and apply overrides.
    pub fn resolve(&self) -> Result<Strategy> {
        let mut strategy = Strategy::preset(&self.preset)
            .with_context(|| format!("Unknown strategy preset: {}", self.preset))?;
        if let Some(risk) = self.risk_level {
            strategy.risk_level = risk;
        }
        if let Some(n) = self.max_trades_per_hour {
            strategy.max_trades_per_hour = n;
        }
        if let Some(mins) = self.min_minutes_between_trades {
            strategy.min_minutes_between_trades = mins;
        }
        if let Some(threshold) = self.ai_confidence_threshold {
            anyhow::ensure!(
                (0.0..=1.0).contains(&threshold),
                "ai_confidence_threshold must be within [0, 1], got {threshold}"
            );
            strategy.ai_confidence_threshold = threshold;
        }
        if let Some(pct) = self.max_portfolio_exposure {
            anyhow::ensure!(
                pct > Decimal::ZERO && pct <= dec!(100),
                "max_portfolio_exposure must be within (0, 100], got {pct}"
            );
            strategy.max_portfolio_exposure = pct;
        }
        Ok(strategy)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(contents)?;
        anyhow::ensure!(
            cfg.ledger.token_decimals <= NATIVE_DECIMALS,
            "ledger.token_decimals must be at most {NATIVE_DECIMALS}, got {}",
            cfg.ledger.token_decimals
        );
        Ok(cfg)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Resolve an env var into a secret, for values that must never be logged.
    pub fn resolve_secret(env_name: &str) -> Result<SecretString> {
        Self::resolve_env(env_name).map(SecretString::new)
    }
}

/// Parse a 0x-prefixed address, naming the field on failure.
pub fn parse_address(field: &str, value: &str) -> Result<Address> {
    value
        .trim()
        .parse::<Address>()
        .with_context(|| format!("Invalid address for {field}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.agent.tick_interval_secs, 30);
        assert_eq!(cfg.ledger.rpc_url_env, "SENTINEL_RPC_URL");
        assert_eq!(cfg.submitter.max_attempts, 3);
        assert_eq!(cfg.gas.cache_ttl_secs, 60);
        assert_eq!(cfg.sequence_model.sequence_length, 60);
        assert_eq!(cfg.collector.provider, CollectorProvider::Coingecko);
        assert_eq!(cfg.ledger.price_quote, PriceQuote::TokenPerNative);
        assert_eq!(cfg.ledger.token_decimals, 18);
        assert_eq!(cfg.strategy.resolve().unwrap(), Strategy::moderate());
    }

    #[test]
    fn test_pair_convention_and_decimals() {
        let cfg = AppConfig::parse(
            r#"
            [ledger]
            price_quote = "native-per-token"
            token_decimals = 6
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ledger.price_quote, PriceQuote::NativePerToken);
        assert_eq!(cfg.ledger.token_decimals, 6);

        assert!(AppConfig::parse("[ledger]\ntoken_decimals = 30\n").is_err());
        assert!(AppConfig::parse("[ledger]\nprice_quote = \"sideways\"\n").is_err());
    }

    #[test]
    fn test_partial_sections() {
        let cfg = AppConfig::parse(
            r#"
            [agent]
            tick_interval_secs = 60

            [submitter]
            dry_run = true

            [strategy]
            preset = "aggressive"
            min_minutes_between_trades = 10
            max_portfolio_exposure = 12.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent.tick_interval_secs, 60);
        assert_eq!(cfg.agent.name, "SENTINEL-001");
        assert!(cfg.submitter.dry_run);
        assert_eq!(cfg.submitter.max_attempts, 3);

        let strategy = cfg.strategy.resolve().unwrap();
        assert_eq!(strategy.name, "aggressive");
        assert_eq!(strategy.min_minutes_between_trades, 10);
        assert_eq!(strategy.max_trades_per_hour, 10);
        assert_eq!(strategy.max_portfolio_exposure, dec!(12.5));
    }

    #[test]
    fn test_bad_strategy_overrides() {
        let unknown = StrategyConfig {
            preset: "yolo".to_string(),
            ..StrategyConfig::default()
        };
        assert!(unknown.resolve().is_err());

        let threshold = StrategyConfig {
            ai_confidence_threshold: Some(1.5),
            ..StrategyConfig::default()
        };
        assert!(threshold.resolve().is_err());
    }

    #[test]
    fn test_parse_address() {
        let addr =
            parse_address("trade_token", " 0x0202020202020202020202020202020202020202 ").unwrap();
        assert_eq!(addr, Address::repeat_byte(0x02));
        let err = parse_address("trade_token", "0x12").unwrap_err();
        assert!(err.to_string().contains("trade_token"));
    }

    #[test]
    fn test_sample_config_parses() {
        // Only meaningful when run from the crate root.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert!(cfg.agent.tick_interval_secs > 0);
            assert!(cfg.strategy.resolve().is_ok());
            // ETH quoted in USD against a 6-decimal stablecoin.
            assert_eq!(cfg.collector.vs_currency, "usd");
            assert_eq!(cfg.ledger.price_quote, PriceQuote::TokenPerNative);
            assert_eq!(cfg.ledger.token_decimals, 6);
        }
    }
}

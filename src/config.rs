//! Configuration module for the position engine

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::triggers::{DcaConfig, StaleTradeConfig, StopLossConfig, TakeProfitConfig};
use crate::types::is_valid_address;

/// Per-agent automation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub wallet_address: String,
    /// Synthesize fills from quotes instead of executing on the venue
    #[serde(default = "default_true")]
    pub simulation: bool,
    #[serde(default)]
    pub stop_loss: StopLossConfig,
    #[serde(default)]
    pub take_profit: TakeProfitConfig,
    #[serde(default)]
    pub dca: DcaConfig,
    #[serde(default)]
    pub stale_trade: StaleTradeConfig,
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// A position row is only kept when some automation needs it
    pub fn tracks_positions(&self) -> bool {
        self.stop_loss.enabled || self.take_profit.enabled
    }

    /// Reject malformed settings before they can reach an executor
    pub fn validate(&self) -> EngineResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(EngineError::Validation("agent_id is empty".to_string()));
        }
        if !is_valid_address(&self.wallet_address) {
            return Err(EngineError::Validation(format!(
                "agent {} has invalid wallet address '{}'",
                self.agent_id, self.wallet_address
            )));
        }
        self.stop_loss.validate()?;
        self.take_profit.validate()?;
        self.dca.validate()?;
        self.stale_trade.validate()?;
        Ok(())
    }
}

/// Agent settings file layout (TOML or JSON)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsFile {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Load and validate agent settings with the `config` crate
pub fn load_agents(path: &str) -> Result<HashMap<String, AgentConfig>> {
    let file: AgentsFile = config::Config::builder()
        .add_source(config::File::with_name(path))
        .build()
        .with_context(|| format!("Failed to read agent config {}", path))?
        .try_deserialize()
        .context("Invalid agent config layout")?;

    let mut agents = HashMap::new();
    for agent in file.agents {
        agent
            .validate()
            .with_context(|| format!("Invalid settings for agent {}", agent.agent_id))?;
        agents.insert(agent.agent_id.clone(), agent);
    }
    Ok(agents)
}

/// Live agent settings, replaceable while positions are open
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentConfig>>>,
}

impl AgentRegistry {
    pub fn new(agents: HashMap<String, AgentConfig>) -> Self {
        Self {
            agents: RwLock::new(
                agents
                    .into_iter()
                    .map(|(id, agent)| (id, Arc::new(agent)))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentConfig>> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Insert or replace an agent after validating it
    pub fn upsert(&self, agent: AgentConfig) -> EngineResult<()> {
        agent.validate()?;
        self.agents
            .write()
            .insert(agent.agent_id.clone(), Arc::new(agent));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

/// Process-wide engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Poll loop
    pub poll_interval: Duration,
    pub price_cache_ttl: Duration,
    pub reconcile_probability: f64,
    pub liquidity_collapse_sol: Decimal,

    // Coordination
    pub lock_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub cache_ttl: Duration,
    pub dca_suspend_window: Duration,

    // Execution
    pub store_tx_timeout: Duration,
    pub quote_timeout: Duration,
    pub execute_timeout: Duration,
    pub metadata_timeout: Duration,
    pub max_price_impact_pct: Decimal,
    pub min_trade_sol: Decimal,
    pub simulated_network_fee_sol: Decimal,
    pub slippage_bps: u16,

    // Venues
    pub jupiter_api_url: String,
    pub dexscreener_api_url: String,
    pub solana_rpc_url: String,
    pub agents_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1_500),
            price_cache_ttl: Duration::from_millis(2_000),
            reconcile_probability: 0.2,
            liquidity_collapse_sol: dec!(0.01),
            lock_ttl: Duration::from_secs(60),
            idempotency_ttl: Duration::from_secs(120),
            cache_ttl: Duration::from_secs(300),
            dca_suspend_window: Duration::from_secs(300),
            store_tx_timeout: Duration::from_secs(15),
            quote_timeout: Duration::from_secs(10),
            execute_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(5),
            max_price_impact_pct: dec!(10),
            min_trade_sol: dec!(0.001),
            simulated_network_fee_sol: dec!(0.000005),
            slippage_bps: 500,
            jupiter_api_url: "https://lite-api.jup.ag".to_string(),
            dexscreener_api_url: "https://api.dexscreener.com".to_string(),
            solana_rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            agents_path: "agents.toml".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = EngineConfig {
            // Poll loop
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 1_500u64)?),
            price_cache_ttl: Duration::from_millis(env_or("PRICE_CACHE_TTL_MS", 2_000u64)?),
            reconcile_probability: env_or("RECONCILE_PROBABILITY", defaults.reconcile_probability)?,
            liquidity_collapse_sol: env_or("LIQUIDITY_COLLAPSE_SOL", defaults.liquidity_collapse_sol)?,

            // Coordination
            lock_ttl: Duration::from_secs(env_or("LOCK_TTL_SECS", 60u64)?),
            idempotency_ttl: Duration::from_secs(env_or("IDEMPOTENCY_TTL_SECS", 120u64)?),
            cache_ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", 300u64)?),
            dca_suspend_window: Duration::from_secs(env_or("DCA_SUSPEND_SECS", 300u64)?),

            // Execution
            store_tx_timeout: Duration::from_secs(env_or("STORE_TX_TIMEOUT_SECS", 15u64)?),
            quote_timeout: Duration::from_secs(env_or("QUOTE_TIMEOUT_SECS", 10u64)?),
            execute_timeout: Duration::from_secs(env_or("EXECUTE_TIMEOUT_SECS", 30u64)?),
            metadata_timeout: Duration::from_secs(env_or("METADATA_TIMEOUT_SECS", 5u64)?),
            max_price_impact_pct: env_or("MAX_PRICE_IMPACT_PCT", defaults.max_price_impact_pct)?,
            min_trade_sol: env_or("MIN_TRADE_SOL", defaults.min_trade_sol)?,
            simulated_network_fee_sol: env_or(
                "SIMULATED_NETWORK_FEE_SOL",
                defaults.simulated_network_fee_sol,
            )?,
            slippage_bps: env_or("SLIPPAGE_BPS", defaults.slippage_bps)?,

            // Venues
            jupiter_api_url: env_or("JUPITER_API_URL", defaults.jupiter_api_url)?,
            dexscreener_api_url: env_or("DEXSCREENER_API_URL", defaults.dexscreener_api_url)?,
            solana_rpc_url: env_or("SOLANA_RPC_URL", defaults.solana_rpc_url)?,
            agents_path: env_or("AGENTS_CONFIG_PATH", defaults.agents_path)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("POLL_INTERVAL_MS must be greater than zero");
        }
        if self.price_cache_ttl <= self.poll_interval {
            anyhow::bail!("PRICE_CACHE_TTL_MS must be longer than the poll interval");
        }
        if !(0.0..=1.0).contains(&self.reconcile_probability) {
            anyhow::bail!("RECONCILE_PROBABILITY must be within [0, 1]");
        }
        if self.lock_ttl <= self.quote_timeout + self.execute_timeout + self.store_tx_timeout {
            anyhow::bail!("LOCK_TTL_SECS must exceed quote + execute + store timeouts");
        }
        if self.max_price_impact_pct <= Decimal::ZERO {
            anyhow::bail!("MAX_PRICE_IMPACT_PCT must be positive");
        }
        Ok(())
    }
}

/// Read an env var, falling back to a default when unset.
/// A set-but-unparseable value is an error rather than a silent default.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{agent_config, wallet};

    #[test]
    fn test_default_engine_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_lock_ttl_must_cover_worst_case() {
        let config = EngineConfig {
            lock_ttl: Duration::from_secs(20),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_validation() {
        let agent = agent_config("agent-1");
        assert!(agent.validate().is_ok());

        let bad_wallet = AgentConfig {
            wallet_address: "xyz".to_string(),
            ..agent_config("agent-1")
        };
        assert!(bad_wallet.validate().is_err());
    }

    #[test]
    fn test_registry_rejects_invalid_upsert() {
        let registry = AgentRegistry::default();
        assert!(registry.is_empty());

        registry.upsert(agent_config("agent-1")).unwrap();
        let mut broken = agent_config("agent-1");
        broken.take_profit.levels.clear();
        assert!(registry.upsert(broken).is_err());

        // The valid settings stay in place
        assert_eq!(registry.len(), 1);
        assert!(registry.get("agent-1").unwrap().take_profit.enabled);
        assert!(registry.get("agent-2").is_none());
    }

    #[test]
    fn test_agents_file_from_json() {
        let json = format!(
            r#"{{
                "agents": [{{
                    "agent_id": "alpha",
                    "wallet_address": "{}",
                    "stop_loss": {{ "enabled": true, "initial_percentage": "-25" }},
                    "stale_trade": {{
                        "enabled": true,
                        "min_hold_time_minutes": 60,
                        "min_profit_percent": "1",
                        "max_profit_percent": "10"
                    }}
                }}]
            }}"#,
            wallet(1)
        );
        let file: AgentsFile = serde_json::from_str(&json).unwrap();
        let agent = &file.agents[0];

        assert!(agent.simulation);
        assert!(agent.stop_loss.enabled);
        assert_eq!(agent.stop_loss.initial_percentage, dec!(-25));
        assert!(!agent.take_profit.enabled);
        assert!(agent.tracks_positions());
        assert!(agent.validate().is_ok());
    }
}

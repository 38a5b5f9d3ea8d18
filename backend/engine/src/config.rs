//! Application configuration loaded from environment variables.
//!
//! Built once at startup and passed by reference into every component; no
//! module reads ambient state after this point.

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Stellar network passed to the CLI (e.g. testnet)
    pub network: String,
    /// Soroban RPC endpoint, reported via /status
    pub rpc_url: String,
    /// Deployed core contract address (campaigns, voting, escrow)
    pub core_contract_id: Option<String>,
    /// Deployed SBT contract address (reputation tokens)
    pub sbt_contract_id: Option<String>,
    /// CLI signing identity for contract invocations
    pub admin_key: String,
    /// Identity allowed to submit verification verdicts
    pub oracle_id: String,
    /// Binary used for contract invocations
    pub stellar_bin: String,
    /// Platform fee in basis points (250 = 2.5%)
    pub platform_fee_bps: i64,
    /// Minimum distinct voters before a milestone can be approved
    pub min_voters: i64,
    /// How long a milestone stays open for voting
    pub voting_window_secs: i64,
    /// Default funding window for new campaigns
    pub campaign_duration_secs: i64,
    /// Dispatch oracle evaluation automatically on proof submission
    pub auto_verify: bool,
    /// Upper bound on a single oracle evaluation
    pub oracle_timeout_secs: u64,
    /// Upper bound on a state-mutating contract invocation
    pub invoke_timeout_secs: u64,
    /// Upper bound on a read-only contract query
    pub query_timeout_secs: u64,
    /// Optional webhook receiving fire-and-forget notifications
    pub webhook_url: Option<String>,
    /// How often the background sweeper applies deadline policy
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./chainfund.db".to_string()),
            api_port: parse_var("API_PORT", "3002")?,
            network: env_var("STELLAR_NETWORK").unwrap_or_else(|_| "testnet".to_string()),
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "https://soroban-testnet.stellar.org".to_string()),
            core_contract_id: env_var("CORE_CONTRACT_ID").ok(),
            sbt_contract_id: env_var("SBT_CONTRACT_ID").ok(),
            admin_key: env_var("ADMIN_KEY").unwrap_or_else(|_| "admin".to_string()),
            oracle_id: env_var("ORACLE_ID").unwrap_or_else(|_| "oracle".to_string()),
            stellar_bin: env_var("STELLAR_BIN").unwrap_or_else(|_| "stellar".to_string()),
            platform_fee_bps: parse_var("PLATFORM_FEE_BPS", "250")?,
            min_voters: parse_var("MIN_VOTERS", "1")?,
            voting_window_secs: parse_var("VOTING_WINDOW_SECS", "604800")?,
            campaign_duration_secs: parse_var("CAMPAIGN_DURATION_SECS", "2592000")?,
            auto_verify: parse_var("AUTO_VERIFY", "true")?,
            oracle_timeout_secs: parse_var("ORACLE_TIMEOUT_SECS", "30")?,
            invoke_timeout_secs: parse_var("INVOKE_TIMEOUT_SECS", "60")?,
            query_timeout_secs: parse_var("QUERY_TIMEOUT_SECS", "30")?,
            webhook_url: env_var("WEBHOOK_URL").ok(),
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", "60")?,
        })
    }

    /// Deterministic configuration for unit tests: no auto verification, no
    /// webhook, quorum of one.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            network: "testnet".to_string(),
            rpc_url: "https://soroban-testnet.stellar.org".to_string(),
            core_contract_id: Some("CCORE".to_string()),
            sbt_contract_id: Some("CSBT".to_string()),
            admin_key: "admin".to_string(),
            oracle_id: "oracle".to_string(),
            stellar_bin: "stellar".to_string(),
            platform_fee_bps: 250,
            min_voters: 1,
            voting_window_secs: 604_800,
            campaign_duration_secs: 2_592_000,
            auto_verify: false,
            oracle_timeout_secs: 5,
            invoke_timeout_secs: 5,
            query_timeout_secs: 5,
            webhook_url: None,
            sweep_interval_secs: 60,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| EngineError::Config(format!("Invalid {key}")))
}

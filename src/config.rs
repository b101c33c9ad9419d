//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - Chain endpoint, contract addresses and timeouts
//! - Reward tiers and the contribution rule table
//! - Payout worker parameters
//! - Quest catalog
//!
//! Secrets (treasury key, admin token, database URL) only come from the
//! environment. Environment values take precedence over the file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub payout: PayoutConfig,
    #[serde(default)]
    pub quests: Vec<QuestConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration (DATABASE_URL selects PostgreSQL when set)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "broski.db".to_string(),
        }
    }
}

/// Chain endpoint and contract configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// FeatureGate contract address
    #[serde(default)]
    pub feature_gate_address: String,
    /// BROski$ token contract address
    #[serde(default)]
    pub token_address: String,
    #[serde(default = "default_decimals")]
    pub token_decimals: u8,
    /// Bound on every chain read and on transaction submission
    pub request_timeout_secs: u64,
    /// Bound on waiting for a transfer receipt
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub receipt_poll_interval_ms: u64,
    /// 0 disables the access cache
    #[serde(default)]
    pub access_cache_ttl_secs: u64,
}

fn default_decimals() -> u8 {
    18
}

fn default_poll_interval() -> u64 {
    1000
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn access_cache_ttl(&self) -> Option<Duration> {
        if self.access_cache_ttl_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.access_cache_ttl_secs))
        }
    }
}

/// Reward tiers and rule parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    pub testnet: u64,
    pub mainnet: u64,
    pub multi_chain: u64,
    pub first_deploy: u64,
    /// Chain names paid at the mainnet tier (case-insensitive)
    pub mainnet_chains: Vec<String>,
    /// Distinct chains needed for the multi-chain tier
    pub multi_chain_threshold: usize,
    pub multi_chain_window_days: i64,
    /// Count the chain being recorded toward the threshold
    #[serde(default = "default_true")]
    pub multi_chain_includes_current: bool,
    /// Feature checked before recording a mainnet deployment
    pub deploy_gate_feature: String,
    /// Contribution type -> reward amount
    #[serde(default)]
    pub contributions: BTreeMap<String, u64>,
}

fn default_true() -> bool {
    true
}

impl RewardsConfig {
    pub fn is_mainnet(&self, chain: &str) -> bool {
        let chain = chain.trim();
        self.mainnet_chains
            .iter()
            .any(|c| c.eq_ignore_ascii_case(chain))
    }
}

/// Payout worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Failed attempts before a record is flagged and left alone
    pub max_attempts: u32,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 25,
            max_attempts: 5,
        }
    }
}

/// What a quest counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestMetric {
    Deployments,
    Chains,
    Contributions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestConfig {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub emoji: String,
    pub reward: u64,
    pub metric: QuestMetric,
    pub required: u64,
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    pub fn host(&self) -> String {
        env_non_empty("BROSKI_HOST").unwrap_or_else(|| self.server.host.clone())
    }

    pub fn port(&self) -> u16 {
        env_non_empty("BROSKI_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.server.port)
    }

    /// PostgreSQL URL; `None` selects local SQLite storage
    pub fn database_url(&self) -> Option<String> {
        env_non_empty("DATABASE_URL")
    }

    pub fn rpc_url(&self) -> String {
        env_non_empty("RPC_URL").unwrap_or_else(|| self.chain.rpc_url.clone())
    }

    pub fn feature_gate_address(&self) -> Option<String> {
        env_non_empty("FEATURE_GATE_ADDRESS").or_else(|| non_empty(&self.chain.feature_gate_address))
    }

    pub fn token_address(&self) -> Option<String> {
        env_non_empty("BROSKI_TOKEN_ADDRESS").or_else(|| non_empty(&self.chain.token_address))
    }

    /// Treasury wallet key (environment only)
    pub fn treasury_private_key(&self) -> Option<String> {
        env_non_empty("REWARD_WALLET_PRIVATE_KEY")
    }

    /// Address recorded as approver of contributions
    pub fn admin_address(&self) -> Option<String> {
        env_non_empty("ADMIN_ADDRESS")
    }

    /// Bearer token for admin routes (environment only)
    pub fn admin_token(&self) -> Option<String> {
        env_non_empty("ADMIN_TOKEN")
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is validated at compile time,
        // so this should never fail. Using a fallback for robustness.
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            database: DatabaseConfig::default(),
            chain: ChainConfig {
                rpc_url: "http://127.0.0.1:8545".to_string(),
                feature_gate_address: String::new(),
                token_address: String::new(),
                token_decimals: 18,
                request_timeout_secs: 15,
                confirmation_timeout_secs: 120,
                receipt_poll_interval_ms: 1000,
                access_cache_ttl_secs: 0,
            },
            rewards: RewardsConfig {
                testnet: 10,
                mainnet: 50,
                multi_chain: 100,
                first_deploy: 500,
                mainnet_chains: vec!["mainnet".to_string(), "ethereum".to_string()],
                multi_chain_threshold: 3,
                multi_chain_window_days: 7,
                multi_chain_includes_current: true,
                deploy_gate_feature: "deploy-mainnet".to_string(),
                contributions: default_contribution_table(),
            },
            payout: PayoutConfig::default(),
            quests: Vec::new(),
        })
    }
}

/// Contribution rewards used when config.toml has no table
pub fn default_contribution_table() -> BTreeMap<String, u64> {
    [
        ("pr_merge", 100),
        ("code_review", 50),
        ("bug_bounty_critical", 1000),
        ("bug_bounty_medium", 500),
        ("bug_bounty_minor", 100),
        ("tutorial", 500),
        ("youtube_video", 1000),
        ("moderation", 100),
        ("translation", 300),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

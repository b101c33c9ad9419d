//! Reward rule table
//!
//! Deployment rewards are evaluated in a fixed order and later rules
//! override earlier ones (they do not add up):
//!
//! 1. Base tier: mainnet (50) or testnet (10)
//! 2. First-ever deployment: 500
//! 3. Multi-chain (3+ distinct chains in 7 days): 100, replacing 2 when both hold

use serde::{Deserialize, Serialize};

use crate::config::RewardsConfig;

/// Why a record earned its amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    /// Base testnet or mainnet tier
    Standard,
    FirstDeploy,
    MultiChain,
}

impl RewardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardType::Standard => "standard",
            RewardType::FirstDeploy => "first_deploy",
            RewardType::MultiChain => "multi_chain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(RewardType::Standard),
            "first_deploy" => Some(RewardType::FirstDeploy),
            "multi_chain" => Some(RewardType::MultiChain),
            _ => None,
        }
    }
}

impl std::fmt::Display for RewardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// History facts the deployment rules look at
#[derive(Debug, Clone, Copy)]
pub struct DeploymentHistory {
    /// Deployment records for the address before this one
    pub prior_deployments: u64,
    /// Distinct chains within the multi-chain window, counted according to
    /// `multi_chain_includes_current`
    pub recent_chains: usize,
}

/// Evaluate the deployment reward for `chain`
pub fn deployment_reward(
    rules: &RewardsConfig,
    chain: &str,
    history: DeploymentHistory,
) -> (u64, RewardType) {
    let mut amount = if rules.is_mainnet(chain) {
        rules.mainnet
    } else {
        rules.testnet
    };
    let mut reward_type = RewardType::Standard;

    if history.prior_deployments == 0 {
        amount = rules.first_deploy;
        reward_type = RewardType::FirstDeploy;
    }

    // Must run after the first-deploy rule: it silently replaces that bonus
    if history.recent_chains >= rules.multi_chain_threshold {
        amount = rules.multi_chain;
        reward_type = RewardType::MultiChain;
    }

    (amount, reward_type)
}

/// Resolve a contribution amount: a non-zero custom amount wins, otherwise
/// the rule table. `None` when neither gives a positive amount.
pub fn contribution_reward(
    rules: &RewardsConfig,
    contribution_type: &str,
    custom_amount: Option<u64>,
) -> Option<u64> {
    match custom_amount {
        Some(amount) if amount > 0 => Some(amount),
        _ => rules
            .contributions
            .get(contribution_type)
            .copied()
            .filter(|amount| *amount > 0),
    }
}

//! Reward ledger
//!
//! Evaluates the reward rules and appends deployment and contribution
//! records. Records are stored with `payout_status = pending`; paying them is
//! the payout worker's job.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::auth::canonical_address;
use crate::config::RewardsConfig;
use crate::error::{Error, Result};
use crate::rewards::{contribution_reward, deployment_reward, DeploymentHistory};
use crate::storage::{
    ContributionRecord, DeploymentRecord, NewContribution, NewDeployment, RewardStore,
    RewardTotals,
};

pub struct RewardLedger {
    store: Arc<dyn RewardStore>,
    rules: RewardsConfig,
    approved_by: Option<String>,
    /// Serializes count-then-insert in `record_deployment`
    deploy_lock: Mutex<()>,
}

impl RewardLedger {
    pub fn new(store: Arc<dyn RewardStore>, rules: RewardsConfig) -> Self {
        Self {
            store,
            rules,
            approved_by: None,
            deploy_lock: Mutex::new(()),
        }
    }

    /// Address recorded as approver of contributions
    pub fn with_approver(mut self, approved_by: Option<String>) -> Self {
        self.approved_by = approved_by;
        self
    }

    pub fn rules(&self) -> &RewardsConfig {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn RewardStore> {
        &self.store
    }

    /// Evaluate and persist the reward for one deployment.
    ///
    /// A `(chain, tx_hash)` pair is rewarded once; a repeat is
    /// [`Error::DuplicateDeployment`].
    pub async fn record_deployment(
        &self,
        user_address: &str,
        contract_address: &str,
        chain: &str,
        tx_hash: &str,
    ) -> Result<DeploymentRecord> {
        let (_, user) = canonical_address(user_address)?;
        let (_, contract) = canonical_address(contract_address)?;
        let chain = chain.trim().to_lowercase();
        let tx_hash = tx_hash.trim().to_lowercase();

        let _guard = self.deploy_lock.lock().await;

        if self.is_recorded(&chain, &tx_hash).await? {
            warn!("Deployment {} on {} already recorded", tx_hash, chain);
            return Err(Error::DuplicateDeployment { chain, tx_hash });
        }

        let prior_deployments = self
            .store
            .count_deployments(&user)
            .await
            .map_err(Error::storage)?;

        let since = Utc::now() - ChronoDuration::days(self.rules.multi_chain_window_days);
        let mut chains = self
            .store
            .distinct_chains_since(&user, since)
            .await
            .map_err(Error::storage)?;
        if self.rules.multi_chain_includes_current && !chains.contains(&chain) {
            chains.push(chain.clone());
        }

        let (reward_amount, reward_type) = deployment_reward(
            &self.rules,
            &chain,
            DeploymentHistory {
                prior_deployments,
                recent_chains: chains.len(),
            },
        );

        let new = NewDeployment {
            user_address: user,
            contract_address: contract,
            chain,
            tx_hash,
            reward_amount,
            reward_type,
            created_at: Utc::now(),
        };
        let record = match self.store.insert_deployment(&new).await {
            Ok(record) => record,
            Err(e) => {
                // Lost a race with another process on the unique index
                if self.is_recorded(&new.chain, &new.tx_hash).await? {
                    return Err(Error::DuplicateDeployment {
                        chain: new.chain,
                        tx_hash: new.tx_hash,
                    });
                }
                warn!("Failed to record deployment for {}: {:#}", user_address, e);
                return Err(Error::storage(e));
            }
        };

        info!(
            "Deployment #{} by {} on {}: {} BROski$ ({})",
            record.id, record.user_address, record.chain, record.reward_amount, record.reward_type
        );
        Ok(record)
    }

    /// Persist an approved contribution.
    ///
    /// A non-zero `custom_amount` overrides the rule table.
    pub async fn record_contribution(
        &self,
        user_address: &str,
        contribution_type: &str,
        reference: &str,
        custom_amount: Option<u64>,
    ) -> Result<ContributionRecord> {
        let (_, user) = canonical_address(user_address)?;

        let reward_amount = contribution_reward(&self.rules, contribution_type, custom_amount)
            .ok_or_else(|| Error::UnknownContributionType(contribution_type.to_string()))?;

        let record = self
            .store
            .insert_contribution(&NewContribution {
                user_address: user,
                contribution_type: contribution_type.to_string(),
                reference: reference.to_string(),
                reward_amount,
                approved_by: self.approved_by.clone(),
                created_at: Utc::now(),
            })
            .await
            .map_err(Error::storage)?;

        info!(
            "Contribution #{} by {} ({}): {} BROski$",
            record.id, record.user_address, record.contribution_type, record.reward_amount
        );
        Ok(record)
    }

    async fn is_recorded(&self, chain: &str, tx_hash: &str) -> Result<bool> {
        self.store
            .has_deployment_tx(chain, tx_hash)
            .await
            .map_err(Error::storage)
    }

    /// Sums over all stored records; zeros for an unknown address
    pub async fn get_user_totals(&self, user_address: &str) -> Result<RewardTotals> {
        let (_, user) = canonical_address(user_address)?;
        self.store.user_totals(&user).await.map_err(Error::storage)
    }
}

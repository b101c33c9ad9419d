//! Quest board
//!
//! Quests are configured goals over a user's ledger history. Claiming a
//! completed quest records a `quest` contribution whose reward is paid like
//! any other ledger record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::auth::canonical_address;
use crate::config::{QuestConfig, QuestMetric};
use crate::error::{Error, Result};
use crate::ledger::RewardLedger;
use crate::storage::ContributionRecord;

pub const QUEST_CONTRIBUTION_TYPE: &str = "quest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestStatus {
    pub id: String,
    pub title: String,
    pub description: String,
    pub emoji: String,
    pub reward: u64,
    pub metric: QuestMetric,
    pub required: u64,
    pub progress: u64,
    /// Already claimed
    pub completed: bool,
}

pub struct QuestBoard {
    quests: Vec<QuestConfig>,
    ledger: Arc<RewardLedger>,
    claim_lock: Mutex<()>,
}

fn quest_reference(id: &str) -> String {
    format!("quest:{}", id)
}

impl QuestBoard {
    pub fn new(quests: Vec<QuestConfig>, ledger: Arc<RewardLedger>) -> Self {
        Self {
            quests,
            ledger,
            claim_lock: Mutex::new(()),
        }
    }

    /// All quests, with progress when an address is given
    pub async fn list(&self, user_address: Option<&str>) -> Result<Vec<QuestStatus>> {
        let user = match user_address {
            Some(address) => Some(canonical_address(address)?.1),
            None => None,
        };

        let mut statuses = Vec::with_capacity(self.quests.len());
        for quest in &self.quests {
            let (progress, completed) = match &user {
                Some(user) => (
                    self.progress(quest.metric, user).await?,
                    self.is_claimed(&quest.id, user).await?,
                ),
                None => (0, false),
            };
            statuses.push(QuestStatus {
                id: quest.id.clone(),
                title: quest.title.clone(),
                description: quest.description.clone(),
                emoji: quest.emoji.clone(),
                reward: quest.reward,
                metric: quest.metric,
                required: quest.required,
                progress,
                completed,
            });
        }
        Ok(statuses)
    }

    /// Claim a completed quest's reward
    pub async fn claim(&self, quest_id: &str, user_address: &str) -> Result<ContributionRecord> {
        let quest = self
            .quests
            .iter()
            .find(|q| q.id == quest_id)
            .ok_or_else(|| Error::QuestNotFound(quest_id.to_string()))?;
        let (_, user) = canonical_address(user_address)?;

        let _guard = self.claim_lock.lock().await;

        if self.is_claimed(&quest.id, &user).await? {
            return Err(Error::QuestAlreadyClaimed(quest.id.clone()));
        }

        let progress = self.progress(quest.metric, &user).await?;
        if progress < quest.required {
            return Err(Error::QuestIncomplete {
                id: quest.id.clone(),
                progress,
                required: quest.required,
            });
        }

        let record = self
            .ledger
            .record_contribution(
                &user,
                QUEST_CONTRIBUTION_TYPE,
                &quest_reference(&quest.id),
                Some(quest.reward),
            )
            .await?;

        info!("{} claimed quest '{}' ({} BROski$)", user, quest.id, quest.reward);
        Ok(record)
    }

    async fn progress(&self, metric: QuestMetric, user: &str) -> Result<u64> {
        let store = self.ledger.store();
        let progress = match metric {
            QuestMetric::Deployments => store.count_deployments(user).await,
            QuestMetric::Chains => store
                .distinct_chains_since(user, DateTime::<Utc>::default())
                .await
                .map(|chains| chains.len() as u64),
            // Quest rewards are not contributions of their own
            QuestMetric::Contributions => {
                store
                    .count_contributions_except(user, QUEST_CONTRIBUTION_TYPE)
                    .await
            }
        };
        progress.map_err(Error::storage)
    }

    async fn is_claimed(&self, quest_id: &str, user: &str) -> Result<bool> {
        self.ledger
            .store()
            .has_contribution_reference(user, &quest_reference(quest_id))
            .await
            .map_err(Error::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStorage;

    const ALICE: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";
    const CONTRACT: &str = "0x00000000000000000000000000000000000000aa";

    fn board() -> (QuestBoard, Arc<RewardLedger>) {
        let config = Config::default();
        let store = Arc::new(SqliteStorage::in_memory().unwrap());
        let ledger = Arc::new(RewardLedger::new(store, config.rewards));
        (QuestBoard::new(config.quests, ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_list_without_address() {
        let (board, _) = board();
        let quests = board.list(None).await.unwrap();
        assert_eq!(quests.len(), 3);
        assert!(quests.iter().all(|q| q.progress == 0 && !q.completed));
    }

    #[tokio::test]
    async fn test_progress_tracks_ledger() {
        let (board, ledger) = board();
        for (chain, tx_hash) in [("sepolia", "0x1"), ("polygon", "0x2"), ("sepolia", "0x3")] {
            ledger
                .record_deployment(ALICE, CONTRACT, chain, tx_hash)
                .await
                .unwrap();
        }

        let quests = board.list(Some(ALICE)).await.unwrap();
        let ship_it = quests.iter().find(|q| q.id == "ship-it").unwrap();
        assert_eq!(ship_it.progress, 3);
        let hopper = quests.iter().find(|q| q.id == "chain-hopper").unwrap();
        assert_eq!(hopper.progress, 2);
    }

    #[tokio::test]
    async fn test_claim_rules() {
        let (board, ledger) = board();

        let err = board.claim("nope", ALICE).await.unwrap_err();
        assert!(matches!(err, Error::QuestNotFound(_)));

        let err = board.claim("chain-hopper", ALICE).await.unwrap_err();
        assert!(matches!(
            err,
            Error::QuestIncomplete {
                progress: 0,
                required: 3,
                ..
            }
        ));

        for chain in ["sepolia", "polygon", "arbitrum"] {
            ledger
                .record_deployment(ALICE, CONTRACT, chain, "0x1")
                .await
                .unwrap();
        }

        let record = board.claim("chain-hopper", ALICE).await.unwrap();
        assert_eq!(record.contribution_type, QUEST_CONTRIBUTION_TYPE);
        assert_eq!(record.reference, "quest:chain-hopper");
        assert_eq!(record.reward_amount, 200);

        let err = board.claim("chain-hopper", ALICE).await.unwrap_err();
        assert!(matches!(err, Error::QuestAlreadyClaimed(_)));

        let quests = board.list(Some(ALICE)).await.unwrap();
        assert!(quests.iter().find(|q| q.id == "chain-hopper").unwrap().completed);
    }

    #[tokio::test]
    async fn test_claimed_quests_do_not_count_as_contributions() {
        let (board, ledger) = board();
        for (n, chain) in ["sepolia", "polygon", "arbitrum", "sepolia", "polygon"]
            .into_iter()
            .enumerate()
        {
            ledger
                .record_deployment(ALICE, CONTRACT, chain, &format!("0x{:x}", n + 1))
                .await
                .unwrap();
        }
        board.claim("ship-it", ALICE).await.unwrap();
        board.claim("chain-hopper", ALICE).await.unwrap();

        let team_player = |quests: Vec<QuestStatus>| {
            quests
                .into_iter()
                .find(|q| q.metric == QuestMetric::Contributions)
                .unwrap()
        };
        assert_eq!(team_player(board.list(Some(ALICE)).await.unwrap()).progress, 0);

        ledger
            .record_contribution(ALICE, "pr_merge", "https://github.com/hypercode/ide/pull/9", None)
            .await
            .unwrap();
        assert_eq!(team_player(board.list(Some(ALICE)).await.unwrap()).progress, 1);
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let (board, _) = board();
        assert!(matches!(
            board.list(Some("bob")).await.unwrap_err(),
            Error::InvalidAddress(_)
        ));
    }
}

//! Deployment leaderboard over a trailing time window

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::RewardStore;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Week,
    Month,
}

impl Timeframe {
    /// Anything other than `week` is the month window
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("week") {
            Timeframe::Week
        } else {
            Timeframe::Month
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            Timeframe::Week => 7,
            Timeframe::Month => 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub address: String,
    pub deployments: u64,
    pub earned: u64,
    pub badge: String,
}

pub fn badge_for_rank(rank: u32) -> &'static str {
    match rank {
        1 => "🥇",
        2 => "🥈",
        3 => "🥉",
        _ => "📊",
    }
}

pub struct LeaderboardAggregator {
    store: Arc<dyn RewardStore>,
}

impl LeaderboardAggregator {
    pub fn new(store: Arc<dyn RewardStore>) -> Self {
        Self { store }
    }

    /// Top deployers by earnings in the window. `limit` is clamped to
    /// `1..=MAX_LIMIT`.
    pub async fn top_earners(
        &self,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<LeaderboardEntry>> {
        let limit = limit.clamp(1, MAX_LIMIT);
        let since = Utc::now() - ChronoDuration::days(timeframe.days());

        let rows = self
            .store
            .top_deployers_since(since, limit)
            .await
            .map_err(Error::storage)?;

        Ok(rows
            .into_iter()
            .zip(1u32..)
            .map(|(row, rank)| LeaderboardEntry {
                rank,
                address: row.user_address,
                deployments: row.deployments,
                earned: row.earned,
                badge: badge_for_rank(rank).to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewards::RewardType;
    use crate::storage::{NewDeployment, SqliteStorage};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_TX: AtomicU64 = AtomicU64::new(1);

    fn address(n: u8) -> String {
        format!("0x{}", format!("{:02x}", n).repeat(20))
    }

    async fn insert(store: &SqliteStorage, user: &str, amount: u64, at: DateTime<Utc>) {
        store
            .insert_deployment(&NewDeployment {
                user_address: user.to_string(),
                contract_address: address(0xaa),
                chain: "sepolia".to_string(),
                tx_hash: format!("0x{:064x}", NEXT_TX.fetch_add(1, Ordering::SeqCst)),
                reward_amount: amount,
                reward_type: RewardType::Standard,
                created_at: at,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_timeframe_parse_defaults_to_month() {
        assert_eq!(Timeframe::parse("week"), Timeframe::Week);
        assert_eq!(Timeframe::parse("WEEK"), Timeframe::Week);
        assert_eq!(Timeframe::parse("month"), Timeframe::Month);
        assert_eq!(Timeframe::parse("year"), Timeframe::Month);
        assert_eq!(Timeframe::parse(""), Timeframe::Month);
    }

    #[test]
    fn test_badges() {
        assert_eq!(badge_for_rank(1), "🥇");
        assert_eq!(badge_for_rank(2), "🥈");
        assert_eq!(badge_for_rank(3), "🥉");
        assert_eq!(badge_for_rank(4), "📊");
    }

    #[tokio::test]
    async fn test_top_earners_ranked_and_limited() {
        let store = Arc::new(SqliteStorage::in_memory().unwrap());
        let now = Utc::now();
        for n in 1..=7u8 {
            insert(&store, &address(n), n as u64 * 10, now).await;
        }
        insert(&store, &address(7), 500, now).await;

        let board = LeaderboardAggregator::new(store.clone());
        let entries = board.top_earners(Timeframe::Week, 5).await.unwrap();

        assert_eq!(entries.len(), 5);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.rank, i as u32 + 1);
        }
        assert!(entries.windows(2).all(|w| w[0].earned >= w[1].earned));
        assert_eq!(entries[0].address, address(7));
        assert_eq!(entries[0].deployments, 2);
        assert_eq!(entries[0].earned, 570);
        assert_eq!(entries[0].badge, "🥇");
        assert_eq!(entries[4].badge, "📊");
    }

    #[tokio::test]
    async fn test_window_and_ties() {
        let store = Arc::new(SqliteStorage::in_memory().unwrap());
        let now = Utc::now();
        insert(&store, &address(1), 1000, now - ChronoDuration::days(10)).await;
        insert(&store, &address(3), 50, now - ChronoDuration::hours(2)).await;
        insert(&store, &address(2), 50, now - ChronoDuration::hours(1)).await;

        let board = LeaderboardAggregator::new(store.clone());

        let week = board.top_earners(Timeframe::Week, 10).await.unwrap();
        let addresses: Vec<String> = week.into_iter().map(|e| e.address).collect();
        // Equal earnings: earlier deployment first
        assert_eq!(addresses, vec![address(3), address(2)]);

        let month = board.top_earners(Timeframe::Month, 10).await.unwrap();
        assert_eq!(month.len(), 3);
        assert_eq!(month[0].address, address(1));
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let store = Arc::new(SqliteStorage::in_memory().unwrap());
        insert(&store, &address(1), 10, Utc::now()).await;
        insert(&store, &address(2), 20, Utc::now()).await;

        let board = LeaderboardAggregator::new(store);
        assert_eq!(board.top_earners(Timeframe::Week, 0).await.unwrap().len(), 1);
        assert_eq!(
            board.top_earners(Timeframe::Week, 10_000).await.unwrap().len(),
            2
        );
    }
}

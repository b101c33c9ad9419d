//! BROski Rewards - feature gating and token rewards for the HyperCode Web3 IDE
//!
//! IDE features are unlocked by an on-chain FeatureGate contract, and users
//! earn BROski$ tokens for shipping contracts and contributing to the project.
//!
//! # How it works
//!
//! 1. The IDE asks the server whether an address may use a feature; the
//!    FeatureGate contract decides
//! 2. Deployments and approved contributions are appended to the reward
//!    ledger with a fixed reward rule table
//! 3. Every ledger record enters a payout outbox and is paid from the
//!    treasury wallet with an ERC-20 `transfer`
//! 4. The leaderboard ranks deployers by earnings over the last week or month
//!
//! # Deployment rewards
//!
//! - Testnet: 10 BROski$, mainnet: 50 BROski$
//! - First deployment ever: 500 BROski$
//! - Three or more chains within 7 days: 100 BROski$ (replaces the first-deploy bonus)

pub mod auth;
pub mod chain;
pub mod config;
pub mod disperser;
pub mod error;
pub mod gate;
pub mod leaderboard;
pub mod ledger;
pub mod payout;
pub mod pg_storage;
pub mod quests;
pub mod rewards;
pub mod server;
pub mod storage;

pub use auth::{canonical_address, is_valid_address, verify_admin_token};
pub use chain::{ChainClient, EvmFeatureGate, EvmToken, NetworkInfo};
pub use config::Config;
pub use disperser::{RewardDisperser, TokenTransfer, TransferReceipt};
pub use error::{Error, Result};
pub use gate::{AccessGate, AccessResult, FeatureAccessChecker};
pub use leaderboard::{LeaderboardAggregator, LeaderboardEntry, Timeframe};
pub use ledger::RewardLedger;
pub use payout::{PayoutRun, PayoutWorker};
pub use pg_storage::PgStorage;
pub use quests::{QuestBoard, QuestStatus};
pub use rewards::RewardType;
pub use storage::{
    ContributionRecord, DeploymentRecord, PayoutKey, PayoutStatus, RewardStore, RewardTotals,
    SqliteStorage,
};

//! Reward ledger storage
//!
//! [`RewardStore`] is the persistence seam used by the ledger, the payout
//! worker, the leaderboard and the quest board. Two back-ends exist:
//! [`SqliteStorage`] (local mode and tests) and
//! [`PgStorage`](crate::pg_storage::PgStorage) (server mode).
//!
//! Reward columns are written once at insert. Only the payout columns
//! (`payout_status`, `payout_tx_hash`, `payout_attempts`, `last_error`) are
//! updated afterwards, by the payout worker. Every payout update is a
//! conditional UPDATE on the status and hash the worker last saw, so two
//! workers sharing a database cannot both act on one record.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use postgres_types::{FromSql, ToSql};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::rewards::RewardType;

const SQLITE_BUSY_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Outbox state of a reward record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[serde(rename_all = "snake_case")]
#[postgres(name = "payout_status")]
pub enum PayoutStatus {
    /// Recorded, no transfer sent yet (or the last one reverted)
    #[postgres(name = "pending")]
    Pending,
    /// Claimed by a worker that is about to send. Never resent automatically.
    #[postgres(name = "submitting")]
    Submitting,
    /// Transfer sent, hash stored, confirmation outstanding
    #[postgres(name = "submitted")]
    Submitted,
    #[postgres(name = "paid")]
    Paid,
    /// Retry budget exhausted, needs manual review
    #[postgres(name = "failed")]
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Submitting => "submitting",
            PayoutStatus::Submitted => "submitted",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PayoutStatus::Pending),
            "submitting" => Some(PayoutStatus::Submitting),
            "submitted" => Some(PayoutStatus::Submitted),
            "paid" => Some(PayoutStatus::Paid),
            "failed" => Some(PayoutStatus::Failed),
            _ => None,
        }
    }
}

/// Which ledger table a payout belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Deployment,
    Contribution,
}

impl RewardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardKind::Deployment => "deployment",
            RewardKind::Contribution => "contribution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deployment" => Some(RewardKind::Deployment),
            "contribution" => Some(RewardKind::Contribution),
            _ => None,
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            RewardKind::Deployment => "deployments",
            RewardKind::Contribution => "contributions",
        }
    }
}

/// Idempotency key for a payout: one transfer per ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayoutKey {
    pub kind: RewardKind,
    pub id: i64,
}

impl PayoutKey {
    pub fn deployment(id: i64) -> Self {
        Self {
            kind: RewardKind::Deployment,
            id,
        }
    }

    pub fn contribution(id: i64) -> Self {
        Self {
            kind: RewardKind::Contribution,
            id,
        }
    }
}

impl std::fmt::Display for PayoutKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutState {
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: i64,
    pub user_address: String,
    pub contract_address: String,
    pub chain: String,
    pub tx_hash: String,
    pub reward_amount: u64,
    pub reward_type: RewardType,
    pub created_at: DateTime<Utc>,
    pub payout: PayoutState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub id: i64,
    pub user_address: String,
    pub contribution_type: String,
    pub reference: String,
    pub reward_amount: u64,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub payout: PayoutState,
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub user_address: String,
    pub contract_address: String,
    pub chain: String,
    pub tx_hash: String,
    pub reward_amount: u64,
    pub reward_type: RewardType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewContribution {
    pub user_address: String,
    pub contribution_type: String,
    pub reference: String,
    pub reward_amount: u64,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user sums, recomputed on every read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardTotals {
    pub deployments: u64,
    pub deployment_earnings: u64,
    pub contributions: u64,
    pub contribution_earnings: u64,
    pub total_earned: u64,
}

impl RewardTotals {
    pub fn new(
        deployments: u64,
        deployment_earnings: u64,
        contributions: u64,
        contribution_earnings: u64,
    ) -> Self {
        Self {
            deployments,
            deployment_earnings,
            contributions,
            contribution_earnings,
            total_earned: deployment_earnings + contribution_earnings,
        }
    }
}

/// Deployments grouped by user within a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployerAggregate {
    pub user_address: String,
    pub deployments: u64,
    pub earned: u64,
}

/// A reward still waiting for its transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayout {
    pub key: PayoutKey,
    pub user_address: String,
    pub amount: u64,
    pub state: PayoutState,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

#[async_trait]
pub trait RewardStore: Send + Sync {
    async fn count_deployments(&self, user_address: &str) -> Result<u64>;

    /// Whether a deployment with this transaction is already recorded
    async fn has_deployment_tx(&self, chain: &str, tx_hash: &str) -> Result<bool>;

    /// Distinct chains the user deployed to strictly after `since`
    async fn distinct_chains_since(
        &self,
        user_address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Insert with `payout_status = pending` in one statement
    async fn insert_deployment(&self, new: &NewDeployment) -> Result<DeploymentRecord>;

    async fn insert_contribution(&self, new: &NewContribution) -> Result<ContributionRecord>;

    async fn has_contribution_reference(&self, user_address: &str, reference: &str)
        -> Result<bool>;

    /// Contributions of every type except `excluded_type`
    async fn count_contributions_except(
        &self,
        user_address: &str,
        excluded_type: &str,
    ) -> Result<u64>;

    async fn user_totals(&self, user_address: &str) -> Result<RewardTotals>;

    /// Ordered by earned desc, then earliest first deployment in the window
    async fn top_deployers_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeployerAggregate>>;

    /// Pending and submitted payouts, oldest first
    async fn unpaid_payouts(&self, limit: usize) -> Result<Vec<PendingPayout>>;

    async fn get_payout(&self, key: PayoutKey) -> Result<Option<PendingPayout>>;

    /// Atomically move a `pending` record to `submitting`.
    ///
    /// Returns the claimed record, or `None` when it was not `pending`
    /// (another worker holds it, or it is already settled).
    async fn claim_payout(&self, key: PayoutKey) -> Result<Option<PendingPayout>>;

    /// `submitting` to `submitted` with the transfer hash.
    ///
    /// The transition methods below return `false` when the record was not
    /// in the expected state and nothing was written.
    async fn mark_payout_submitted(&self, key: PayoutKey, tx_hash: &str) -> Result<bool>;

    /// `submitting` or `submitted` to `paid`, only while the stored hash is
    /// still `tx_hash` (`None` when nothing had to be sent)
    async fn mark_payout_paid(&self, key: PayoutKey, tx_hash: Option<&str>) -> Result<bool>;

    /// Count a failed attempt and move from `submitting` or `submitted` to
    /// `next`, only while the stored hash is still `tx_hash`. Moving back to
    /// `pending` drops the stored hash.
    async fn record_payout_failure(
        &self,
        key: PayoutKey,
        tx_hash: Option<&str>,
        error: &str,
        next: PayoutStatus,
    ) -> Result<bool>;
}

// ============================================================================
// SQLITE STORAGE
// ============================================================================

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_address TEXT NOT NULL,
    contract_address TEXT NOT NULL,
    chain TEXT NOT NULL,
    tx_hash TEXT NOT NULL,
    reward_amount INTEGER NOT NULL CHECK (reward_amount >= 0),
    reward_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    payout_status TEXT NOT NULL DEFAULT 'pending',
    payout_tx_hash TEXT,
    payout_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_deployments_user ON deployments (user_address, created_at);
CREATE INDEX IF NOT EXISTS idx_deployments_created ON deployments (created_at);
CREATE INDEX IF NOT EXISTS idx_deployments_payout ON deployments (payout_status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_first_deploy
    ON deployments (user_address) WHERE reward_type = 'first_deploy';
CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_tx ON deployments (chain, tx_hash);

CREATE TABLE IF NOT EXISTS contributions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_address TEXT NOT NULL,
    contribution_type TEXT NOT NULL,
    reference TEXT NOT NULL,
    reward_amount INTEGER NOT NULL CHECK (reward_amount >= 0),
    approved_by TEXT,
    created_at TEXT NOT NULL,
    payout_status TEXT NOT NULL DEFAULT 'pending',
    payout_tx_hash TEXT,
    payout_attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_contributions_user ON contributions (user_address, reference);
CREATE INDEX IF NOT EXISTS idx_contributions_payout ON contributions (payout_status);
"#;

const DEPLOYMENT_COLUMNS: &str = "id, user_address, contract_address, chain, tx_hash, reward_amount, reward_type, created_at, payout_status, payout_tx_hash, payout_attempts, last_error";

const CONTRIBUTION_COLUMNS: &str = "id, user_address, contribution_type, reference, reward_amount, approved_by, created_at, payout_status, payout_tx_hash, payout_attempts, last_error";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(SQLITE_BUSY_TIMEOUT_SECS))?;
        conn.execute_batch(SQLITE_SCHEMA)
            .context("Failed to apply SQLite schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_deployment(conn: &Connection, id: i64) -> Result<DeploymentRecord> {
        let sql = format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS);
        let record = conn.query_row(&sql, params![id], deployment_from_row)?;
        Ok(record)
    }

    fn load_payout(conn: &Connection, key: PayoutKey) -> Result<Option<PendingPayout>> {
        let sql = format!(
            "SELECT '{}', id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error
             FROM {} WHERE id = ?1",
            key.kind.as_str(),
            key.kind.table()
        );
        let payout = conn
            .query_row(&sql, params![key.id], pending_from_row)
            .optional()?;
        Ok(payout)
    }

    fn load_contribution(conn: &Connection, id: i64) -> Result<ContributionRecord> {
        let sql = format!(
            "SELECT {} FROM contributions WHERE id = ?1",
            CONTRIBUTION_COLUMNS
        );
        let record = conn.query_row(&sql, params![id], contribution_from_row)?;
        Ok(record)
    }
}

fn sqlite_ts(dt: &DateTime<Utc>) -> String {
    // Fixed width so text comparison orders like time
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

#[derive(Debug, thiserror::Error)]
#[error("unexpected value '{0}'")]
struct UnexpectedValue(String);

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_amount(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|e| conversion_error(idx, e))
}

fn parse_payout(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<PayoutState> {
    let status: String = row.get(first)?;
    let status =
        PayoutStatus::parse(&status).ok_or_else(|| conversion_error(first, UnexpectedValue(status)))?;
    Ok(PayoutState {
        status,
        tx_hash: row.get(first + 1)?,
        attempts: row.get(first + 2)?,
        last_error: row.get(first + 3)?,
    })
}

fn deployment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    let reward_type: String = row.get(6)?;
    let reward_type = RewardType::parse(&reward_type)
        .ok_or_else(|| conversion_error(6, UnexpectedValue(reward_type)))?;
    Ok(DeploymentRecord {
        id: row.get(0)?,
        user_address: row.get(1)?,
        contract_address: row.get(2)?,
        chain: row.get(3)?,
        tx_hash: row.get(4)?,
        reward_amount: parse_amount(row, 5)?,
        reward_type,
        created_at: parse_ts(row, 7)?,
        payout: parse_payout(row, 8)?,
    })
}

fn contribution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContributionRecord> {
    Ok(ContributionRecord {
        id: row.get(0)?,
        user_address: row.get(1)?,
        contribution_type: row.get(2)?,
        reference: row.get(3)?,
        reward_amount: parse_amount(row, 4)?,
        approved_by: row.get(5)?,
        created_at: parse_ts(row, 6)?,
        payout: parse_payout(row, 7)?,
    })
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingPayout> {
    let kind: String = row.get(0)?;
    let kind = RewardKind::parse(&kind).ok_or_else(|| conversion_error(0, UnexpectedValue(kind)))?;
    Ok(PendingPayout {
        key: PayoutKey {
            kind,
            id: row.get(1)?,
        },
        user_address: row.get(2)?,
        amount: parse_amount(row, 3)?,
        state: parse_payout(row, 4)?,
    })
}

fn to_db_amount(amount: u64) -> Result<i64> {
    i64::try_from(amount).context("Reward amount out of range")
}

#[async_trait]
impl RewardStore for SqliteStorage {
    async fn count_deployments(&self, user_address: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM deployments WHERE user_address = ?1",
            params![user_address],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn has_deployment_tx(&self, chain: &str, tx_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM deployments WHERE chain = ?1 AND tx_hash = ?2 LIMIT 1",
                params![chain, tx_hash],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn distinct_chains_since(
        &self,
        user_address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT chain FROM deployments
             WHERE user_address = ?1 AND created_at > ?2
             ORDER BY chain",
        )?;
        let chains = stmt
            .query_map(params![user_address, sqlite_ts(&since)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(chains)
    }

    async fn insert_deployment(&self, new: &NewDeployment) -> Result<DeploymentRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO deployments (user_address, contract_address, chain, tx_hash, reward_amount, reward_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.user_address,
                new.contract_address,
                new.chain,
                new.tx_hash,
                to_db_amount(new.reward_amount)?,
                new.reward_type.as_str(),
                sqlite_ts(&new.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::load_deployment(&conn, id)
    }

    async fn insert_contribution(&self, new: &NewContribution) -> Result<ContributionRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO contributions (user_address, contribution_type, reference, reward_amount, approved_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.user_address,
                new.contribution_type,
                new.reference,
                to_db_amount(new.reward_amount)?,
                new.approved_by,
                sqlite_ts(&new.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::load_contribution(&conn, id)
    }

    async fn has_contribution_reference(
        &self,
        user_address: &str,
        reference: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM contributions WHERE user_address = ?1 AND reference = ?2 LIMIT 1",
                params![user_address, reference],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn count_contributions_except(
        &self,
        user_address: &str,
        excluded_type: &str,
    ) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM contributions WHERE user_address = ?1 AND contribution_type <> ?2",
            params![user_address, excluded_type],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn user_totals(&self, user_address: &str) -> Result<RewardTotals> {
        let conn = self.conn.lock();
        let (deployments, deployment_earnings): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(reward_amount), 0) FROM deployments WHERE user_address = ?1",
            params![user_address],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (contributions, contribution_earnings): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(reward_amount), 0) FROM contributions WHERE user_address = ?1",
            params![user_address],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(RewardTotals::new(
            deployments as u64,
            deployment_earnings as u64,
            contributions as u64,
            contribution_earnings as u64,
        ))
    }

    async fn top_deployers_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeployerAggregate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_address, COUNT(*) AS deployments, SUM(reward_amount) AS earned, MIN(id) AS first_id
             FROM deployments
             WHERE created_at > ?1
             GROUP BY user_address
             ORDER BY earned DESC, first_id ASC, user_address ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![sqlite_ts(&since), limit as i64], |row| {
                Ok(DeployerAggregate {
                    user_address: row.get(0)?,
                    deployments: row.get::<_, i64>(1)? as u64,
                    earned: parse_amount(row, 2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn unpaid_payouts(&self, limit: usize) -> Result<Vec<PendingPayout>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error
             FROM (
                 SELECT 'deployment' AS kind, id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error, created_at
                 FROM deployments WHERE payout_status IN ('pending', 'submitted')
                 UNION ALL
                 SELECT 'contribution' AS kind, id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error, created_at
                 FROM contributions WHERE payout_status IN ('pending', 'submitted')
             )
             ORDER BY created_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], pending_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn get_payout(&self, key: PayoutKey) -> Result<Option<PendingPayout>> {
        let conn = self.conn.lock();
        Self::load_payout(&conn, key)
    }

    async fn claim_payout(&self, key: PayoutKey) -> Result<Option<PendingPayout>> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE {} SET payout_status = 'submitting' WHERE id = ?1 AND payout_status = 'pending'",
            key.kind.table()
        );
        if conn.execute(&sql, params![key.id])? == 0 {
            return Ok(None);
        }
        Self::load_payout(&conn, key)
    }

    async fn mark_payout_submitted(&self, key: PayoutKey, tx_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE {} SET payout_status = 'submitted', payout_tx_hash = ?2
             WHERE id = ?1 AND payout_status = 'submitting'",
            key.kind.table()
        );
        Ok(conn.execute(&sql, params![key.id, tx_hash])? > 0)
    }

    async fn mark_payout_paid(&self, key: PayoutKey, tx_hash: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE {} SET payout_status = 'paid', last_error = NULL
             WHERE id = ?1 AND payout_status IN ('submitting', 'submitted') AND payout_tx_hash IS ?2",
            key.kind.table()
        );
        Ok(conn.execute(&sql, params![key.id, tx_hash])? > 0)
    }

    async fn record_payout_failure(
        &self,
        key: PayoutKey,
        tx_hash: Option<&str>,
        error: &str,
        next: PayoutStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE {} SET payout_status = ?3, payout_attempts = payout_attempts + 1, last_error = ?4,
                 payout_tx_hash = CASE WHEN ?3 = 'pending' THEN NULL ELSE payout_tx_hash END
             WHERE id = ?1 AND payout_status IN ('submitting', 'submitted') AND payout_tx_hash IS ?2",
            key.kind.table()
        );
        Ok(conn.execute(&sql, params![key.id, tx_hash, next.as_str(), error])? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU64, Ordering};

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    static NEXT_TX: AtomicU64 = AtomicU64::new(1);

    fn deployment(user: &str, chain: &str, amount: u64, at: DateTime<Utc>) -> NewDeployment {
        NewDeployment {
            user_address: user.to_string(),
            contract_address: "0x00000000000000000000000000000000000000aa".to_string(),
            chain: chain.to_string(),
            tx_hash: format!("0x{:064x}", NEXT_TX.fetch_add(1, Ordering::SeqCst)),
            reward_amount: amount,
            reward_type: RewardType::Standard,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_insert_deployment_starts_pending() {
        let storage = SqliteStorage::in_memory().unwrap();
        let record = storage
            .insert_deployment(&deployment(ALICE, "sepolia", 10, Utc::now()))
            .await
            .unwrap();

        assert_eq!(record.reward_amount, 10);
        assert_eq!(record.payout.status, PayoutStatus::Pending);
        assert_eq!(record.payout.tx_hash, None);
        assert_eq!(record.payout.attempts, 0);
        assert_eq!(storage.count_deployments(ALICE).await.unwrap(), 1);
        assert_eq!(storage.count_deployments(BOB).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_first_deploy_is_unique_per_user() {
        let storage = SqliteStorage::in_memory().unwrap();
        let mut first = deployment(ALICE, "sepolia", 500, Utc::now());
        first.reward_type = RewardType::FirstDeploy;
        let mut again = deployment(ALICE, "polygon", 500, Utc::now());
        again.reward_type = RewardType::FirstDeploy;

        storage.insert_deployment(&first).await.unwrap();
        assert!(storage.insert_deployment(&again).await.is_err());
    }

    #[tokio::test]
    async fn test_deployment_tx_is_unique_per_chain() {
        let storage = SqliteStorage::in_memory().unwrap();
        let first = deployment(ALICE, "sepolia", 10, Utc::now());
        storage.insert_deployment(&first).await.unwrap();

        assert!(storage.has_deployment_tx("sepolia", &first.tx_hash).await.unwrap());
        assert!(!storage.has_deployment_tx("polygon", &first.tx_hash).await.unwrap());

        // Same transaction again, even under another address
        let mut replay = first.clone();
        replay.user_address = BOB.to_string();
        assert!(storage.insert_deployment(&replay).await.is_err());

        let mut other_chain = first.clone();
        other_chain.chain = "polygon".to_string();
        storage.insert_deployment(&other_chain).await.unwrap();
    }

    #[tokio::test]
    async fn test_count_contributions_except() {
        let storage = SqliteStorage::in_memory().unwrap();
        for (kind, reference) in [("pr_merge", "pr/1"), ("quest", "quest:a"), ("bug_report", "bug/2")] {
            storage
                .insert_contribution(&NewContribution {
                    user_address: ALICE.to_string(),
                    contribution_type: kind.to_string(),
                    reference: reference.to_string(),
                    reward_amount: 10,
                    approved_by: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        assert_eq!(storage.count_contributions_except(ALICE, "quest").await.unwrap(), 2);
        assert_eq!(storage.count_contributions_except(BOB, "quest").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_distinct_chains_respects_window() {
        let storage = SqliteStorage::in_memory().unwrap();
        let now = Utc::now();
        storage
            .insert_deployment(&deployment(ALICE, "polygon", 10, now - ChronoDuration::days(10)))
            .await
            .unwrap();
        storage
            .insert_deployment(&deployment(ALICE, "sepolia", 10, now))
            .await
            .unwrap();
        storage
            .insert_deployment(&deployment(ALICE, "sepolia", 10, now))
            .await
            .unwrap();

        let chains = storage
            .distinct_chains_since(ALICE, now - ChronoDuration::days(7))
            .await
            .unwrap();
        assert_eq!(chains, vec!["sepolia".to_string()]);
    }

    #[tokio::test]
    async fn test_user_totals_zero_for_unknown() {
        let storage = SqliteStorage::in_memory().unwrap();
        assert_eq!(
            storage.user_totals(BOB).await.unwrap(),
            RewardTotals::default()
        );
    }

    #[tokio::test]
    async fn test_payout_transitions() {
        let storage = SqliteStorage::in_memory().unwrap();
        let record = storage
            .insert_deployment(&deployment(ALICE, "sepolia", 10, Utc::now()))
            .await
            .unwrap();
        let key = PayoutKey::deployment(record.id);

        // Only a claimed record can be marked submitted
        assert!(!storage.mark_payout_submitted(key, "0xabc").await.unwrap());

        let claimed = storage.claim_payout(key).await.unwrap().unwrap();
        assert_eq!(claimed.state.status, PayoutStatus::Submitting);
        assert!(storage.unpaid_payouts(10).await.unwrap().is_empty());

        assert!(storage.mark_payout_submitted(key, "0xabc").await.unwrap());
        let payout = storage.get_payout(key).await.unwrap().unwrap();
        assert_eq!(payout.state.status, PayoutStatus::Submitted);
        assert_eq!(payout.state.tx_hash.as_deref(), Some("0xabc"));

        // A stale hash does not move the record
        assert!(!storage
            .record_payout_failure(key, Some("0x999"), "reverted", PayoutStatus::Pending)
            .await
            .unwrap());
        assert!(storage
            .record_payout_failure(key, Some("0xabc"), "reverted", PayoutStatus::Pending)
            .await
            .unwrap());
        let payout = storage.get_payout(key).await.unwrap().unwrap();
        assert_eq!(payout.state.status, PayoutStatus::Pending);
        assert_eq!(payout.state.tx_hash, None);
        assert_eq!(payout.state.attempts, 1);

        storage.claim_payout(key).await.unwrap().unwrap();
        storage.mark_payout_submitted(key, "0xdef").await.unwrap();
        assert!(!storage.mark_payout_paid(key, Some("0xabc")).await.unwrap());
        assert!(storage.mark_payout_paid(key, Some("0xdef")).await.unwrap());
        assert!(storage.unpaid_payouts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let storage = SqliteStorage::in_memory().unwrap();
        let record = storage
            .insert_deployment(&deployment(ALICE, "sepolia", 10, Utc::now()))
            .await
            .unwrap();
        let key = PayoutKey::deployment(record.id);

        assert!(storage.claim_payout(key).await.unwrap().is_some());
        assert!(storage.claim_payout(key).await.unwrap().is_none());
        assert!(storage
            .claim_payout(PayoutKey::contribution(record.id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unpaid_payouts_span_both_tables() {
        let storage = SqliteStorage::in_memory().unwrap();
        let now = Utc::now();
        storage
            .insert_deployment(&deployment(ALICE, "sepolia", 10, now - ChronoDuration::minutes(5)))
            .await
            .unwrap();
        storage
            .insert_contribution(&NewContribution {
                user_address: BOB.to_string(),
                contribution_type: "pr_merge".to_string(),
                reference: "https://github.com/hypercode/ide/pull/1".to_string(),
                reward_amount: 100,
                approved_by: None,
                created_at: now,
            })
            .await
            .unwrap();

        let unpaid = storage.unpaid_payouts(10).await.unwrap();
        assert_eq!(unpaid.len(), 2);
        assert_eq!(unpaid[0].key.kind, RewardKind::Deployment);
        assert_eq!(unpaid[1].key.kind, RewardKind::Contribution);
        assert_eq!(unpaid[1].amount, 100);
    }
}

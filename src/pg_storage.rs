//! PostgreSQL Storage for BROski Rewards
//!
//! Server-mode back-end of [`RewardStore`]. Connects with DATABASE_URL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use crate::rewards::RewardType;
use crate::storage::{
    ContributionRecord, DeployerAggregate, DeploymentRecord, NewContribution, NewDeployment,
    PayoutKey, PayoutState, PayoutStatus, PendingPayout, RewardKind, RewardStore, RewardTotals,
};

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 20;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

/// Versioned migrations applied in order after the base schema
const MIGRATIONS: &[(i32, &str, &str)] = &[
    (
        1,
        "001_schema",
        include_str!("../migrations/001_schema.sql"),
    ),
    (
        2,
        "002_payout_claims",
        include_str!("../migrations/002_payout_claims.sql"),
    ),
];

const PAYOUT_COLUMNS: &str =
    "id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error";

const DEPLOYMENT_COLUMNS: &str = "id, user_address, contract_address, chain, tx_hash, reward_amount, reward_type, created_at, payout_status, payout_tx_hash, payout_attempts, last_error";

const CONTRIBUTION_COLUMNS: &str = "id, user_address, contribution_type, reference, reward_amount, approved_by, created_at, payout_status, payout_tx_hash, payout_attempts, last_error";

// ============================================================================
// PG STORAGE
// ============================================================================

#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    /// Create storage from DATABASE_URL
    pub async fn new(database_url: &str) -> Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await?;

        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        for (version, name, sql) in MIGRATIONS {
            let applied: bool = if exists {
                client
                    .query_one(
                        "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = $1)",
                        &[version],
                    )
                    .await?
                    .get(0)
            } else {
                false
            };

            if !applied {
                client
                    .batch_execute(sql)
                    .await
                    .with_context(|| format!("Failed to apply migration {}", name))?;
                info!("Applied migration {}", name);
            }
        }

        Ok(())
    }
}

fn to_db_amount(amount: u64) -> Result<i64> {
    i64::try_from(amount).context("Reward amount out of range")
}

fn from_db_amount(amount: i64) -> u64 {
    amount.max(0) as u64
}

fn payout_from_row(r: &Row, first: usize) -> PayoutState {
    PayoutState {
        status: r.get(first),
        tx_hash: r.get(first + 1),
        attempts: r.get::<_, i32>(first + 2).max(0) as u32,
        last_error: r.get(first + 3),
    }
}

fn deployment_from_row(r: &Row) -> Result<DeploymentRecord> {
    let reward_type: String = r.get(6);
    Ok(DeploymentRecord {
        id: r.get(0),
        user_address: r.get(1),
        contract_address: r.get(2),
        chain: r.get(3),
        tx_hash: r.get(4),
        reward_amount: from_db_amount(r.get(5)),
        reward_type: RewardType::parse(&reward_type)
            .with_context(|| format!("Unknown reward type '{}'", reward_type))?,
        created_at: r.get(7),
        payout: payout_from_row(r, 8),
    })
}

fn contribution_from_row(r: &Row) -> ContributionRecord {
    ContributionRecord {
        id: r.get(0),
        user_address: r.get(1),
        contribution_type: r.get(2),
        reference: r.get(3),
        reward_amount: from_db_amount(r.get(4)),
        approved_by: r.get(5),
        created_at: r.get(6),
        payout: payout_from_row(r, 7),
    }
}

fn pending_from_row(r: &Row) -> Result<PendingPayout> {
    let kind: String = r.get(0);
    Ok(PendingPayout {
        key: PayoutKey {
            kind: RewardKind::parse(&kind)
                .with_context(|| format!("Unknown reward kind '{}'", kind))?,
            id: r.get(1),
        },
        user_address: r.get(2),
        amount: from_db_amount(r.get(3)),
        state: payout_from_row(r, 4),
    })
}

#[async_trait]
impl RewardStore for PgStorage {
    async fn count_deployments(&self, user_address: &str) -> Result<u64> {
        let client = self.pool.get().await?;

        let row = client
            .query_one(
                "SELECT COUNT(*) FROM deployments WHERE user_address = $1",
                &[&user_address],
            )
            .await?;

        Ok(from_db_amount(row.get(0)))
    }

    async fn has_deployment_tx(&self, chain: &str, tx_hash: &str) -> Result<bool> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT 1 FROM deployments WHERE chain = $1 AND tx_hash = $2 LIMIT 1",
                &[&chain, &tx_hash],
            )
            .await?;

        Ok(row.is_some())
    }

    async fn distinct_chains_since(
        &self,
        user_address: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT DISTINCT chain FROM deployments
                 WHERE user_address = $1 AND created_at > $2
                 ORDER BY chain",
                &[&user_address, &since],
            )
            .await?;

        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn insert_deployment(&self, new: &NewDeployment) -> Result<DeploymentRecord> {
        let client = self.pool.get().await?;

        let sql = format!(
            "INSERT INTO deployments (user_address, contract_address, chain, tx_hash, reward_amount, reward_type, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {}",
            DEPLOYMENT_COLUMNS
        );
        let row = client
            .query_one(
                &sql,
                &[
                    &new.user_address,
                    &new.contract_address,
                    &new.chain,
                    &new.tx_hash,
                    &to_db_amount(new.reward_amount)?,
                    &new.reward_type.as_str(),
                    &new.created_at,
                ],
            )
            .await?;

        let record = deployment_from_row(&row)?;
        debug!(
            "Inserted deployment #{} for {} ({} {})",
            record.id, record.user_address, record.reward_amount, record.reward_type
        );
        Ok(record)
    }

    async fn insert_contribution(&self, new: &NewContribution) -> Result<ContributionRecord> {
        let client = self.pool.get().await?;

        let sql = format!(
            "INSERT INTO contributions (user_address, contribution_type, reference, reward_amount, approved_by, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            CONTRIBUTION_COLUMNS
        );
        let row = client
            .query_one(
                &sql,
                &[
                    &new.user_address,
                    &new.contribution_type,
                    &new.reference,
                    &to_db_amount(new.reward_amount)?,
                    &new.approved_by,
                    &new.created_at,
                ],
            )
            .await?;

        Ok(contribution_from_row(&row))
    }

    async fn has_contribution_reference(
        &self,
        user_address: &str,
        reference: &str,
    ) -> Result<bool> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT 1 FROM contributions WHERE user_address = $1 AND reference = $2 LIMIT 1",
                &[&user_address, &reference],
            )
            .await?;

        Ok(row.is_some())
    }

    async fn count_contributions_except(
        &self,
        user_address: &str,
        excluded_type: &str,
    ) -> Result<u64> {
        let client = self.pool.get().await?;

        let row = client
            .query_one(
                "SELECT COUNT(*) FROM contributions WHERE user_address = $1 AND contribution_type <> $2",
                &[&user_address, &excluded_type],
            )
            .await?;

        Ok(from_db_amount(row.get(0)))
    }

    async fn user_totals(&self, user_address: &str) -> Result<RewardTotals> {
        let client = self.pool.get().await?;

        let row = client
            .query_one(
                "SELECT
                    (SELECT COUNT(*) FROM deployments WHERE user_address = $1),
                    (SELECT COALESCE(SUM(reward_amount), 0)::BIGINT FROM deployments WHERE user_address = $1),
                    (SELECT COUNT(*) FROM contributions WHERE user_address = $1),
                    (SELECT COALESCE(SUM(reward_amount), 0)::BIGINT FROM contributions WHERE user_address = $1)",
                &[&user_address],
            )
            .await?;

        Ok(RewardTotals::new(
            from_db_amount(row.get(0)),
            from_db_amount(row.get(1)),
            from_db_amount(row.get(2)),
            from_db_amount(row.get(3)),
        ))
    }

    async fn top_deployers_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeployerAggregate>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT user_address,
                        COUNT(*) AS deployments,
                        COALESCE(SUM(reward_amount), 0)::BIGINT AS earned,
                        MIN(id) AS first_id
                 FROM deployments
                 WHERE created_at > $1
                 GROUP BY user_address
                 ORDER BY earned DESC, first_id ASC, user_address ASC
                 LIMIT $2",
                &[&since, &(limit as i64)],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| DeployerAggregate {
                user_address: r.get(0),
                deployments: from_db_amount(r.get(1)),
                earned: from_db_amount(r.get(2)),
            })
            .collect())
    }

    async fn unpaid_payouts(&self, limit: usize) -> Result<Vec<PendingPayout>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT kind, id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error
                 FROM (
                     SELECT 'deployment'::TEXT AS kind, id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error, created_at
                     FROM deployments WHERE payout_status IN ('pending', 'submitted')
                     UNION ALL
                     SELECT 'contribution'::TEXT AS kind, id, user_address, reward_amount, payout_status, payout_tx_hash, payout_attempts, last_error, created_at
                     FROM contributions WHERE payout_status IN ('pending', 'submitted')
                 ) unpaid
                 ORDER BY created_at ASC, id ASC
                 LIMIT $1",
                &[&(limit as i64)],
            )
            .await?;

        rows.iter().map(pending_from_row).collect()
    }

    async fn get_payout(&self, key: PayoutKey) -> Result<Option<PendingPayout>> {
        let client = self.pool.get().await?;

        let sql = format!(
            "SELECT '{}'::TEXT, {} FROM {} WHERE id = $1",
            key.kind.as_str(),
            PAYOUT_COLUMNS,
            key.kind.table()
        );
        let row = client.query_opt(&sql, &[&key.id]).await?;

        row.as_ref().map(pending_from_row).transpose()
    }

    async fn claim_payout(&self, key: PayoutKey) -> Result<Option<PendingPayout>> {
        let client = self.pool.get().await?;

        let sql = format!(
            "UPDATE {} SET payout_status = $2
             WHERE id = $1 AND payout_status = $3
             RETURNING '{}'::TEXT, {}",
            key.kind.table(),
            key.kind.as_str(),
            PAYOUT_COLUMNS
        );
        let row = client
            .query_opt(
                &sql,
                &[&key.id, &PayoutStatus::Submitting, &PayoutStatus::Pending],
            )
            .await?;

        if row.is_some() {
            debug!("Claimed payout {}", key);
        }
        row.as_ref().map(pending_from_row).transpose()
    }

    async fn mark_payout_submitted(&self, key: PayoutKey, tx_hash: &str) -> Result<bool> {
        let client = self.pool.get().await?;

        let sql = format!(
            "UPDATE {} SET payout_status = $2, payout_tx_hash = $3
             WHERE id = $1 AND payout_status = $4",
            key.kind.table()
        );
        let updated = client
            .execute(
                &sql,
                &[
                    &key.id,
                    &PayoutStatus::Submitted,
                    &tx_hash,
                    &PayoutStatus::Submitting,
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn mark_payout_paid(&self, key: PayoutKey, tx_hash: Option<&str>) -> Result<bool> {
        let client = self.pool.get().await?;

        let sql = format!(
            "UPDATE {} SET payout_status = $2, last_error = NULL
             WHERE id = $1
               AND payout_status IN ('submitting', 'submitted')
               AND payout_tx_hash IS NOT DISTINCT FROM $3",
            key.kind.table()
        );
        let updated = client
            .execute(&sql, &[&key.id, &PayoutStatus::Paid, &tx_hash])
            .await?;
        Ok(updated > 0)
    }

    async fn record_payout_failure(
        &self,
        key: PayoutKey,
        tx_hash: Option<&str>,
        error: &str,
        next: PayoutStatus,
    ) -> Result<bool> {
        let client = self.pool.get().await?;

        let clear_tx = next == PayoutStatus::Pending;
        let sql = format!(
            "UPDATE {} SET payout_status = $2,
                 payout_attempts = payout_attempts + 1,
                 last_error = $3,
                 payout_tx_hash = CASE WHEN $4 THEN NULL ELSE payout_tx_hash END
             WHERE id = $1
               AND payout_status IN ('submitting', 'submitted')
               AND payout_tx_hash IS NOT DISTINCT FROM $5",
            key.kind.table()
        );
        let updated = client
            .execute(&sql, &[&key.id, &next, &error, &clear_tx, &tx_hash])
            .await?;
        Ok(updated > 0)
    }
}

//! Payout outbox worker
//!
//! Ledger records are inserted as `pending`. Settling a record:
//!
//! ```text
//! pending ──claim──▶ submitting ──submit──▶ submitted ──receipt ok──▶ paid
//!    ▲                   │                      │
//!    └── send failed ────┘                      │
//!    └───────────────── reverted ───────────────┘
//!                           (max_attempts exhausted ▶ failed)
//! ```
//!
//! The claim is a conditional UPDATE in the store, so only one worker, in
//! any process, sends for a record. The transaction hash is stored before
//! waiting for the receipt, so a record that already has a hash is resolved
//! by receipt lookup and never sent twice. A record left in `submitting`
//! (the process died after claiming, or the hash could not be stored) is
//! never resent automatically and needs manual review.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::PayoutConfig;
use crate::disperser::RewardDisperser;
use crate::error::{Error, Result};
use crate::storage::{PayoutKey, PayoutState, PayoutStatus, PendingPayout, RewardStore};

/// Summary of one pass over the outbox
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PayoutRun {
    pub processed: usize,
    pub paid: usize,
    pub failed: usize,
}

pub struct PayoutWorker {
    store: Arc<dyn RewardStore>,
    disperser: Arc<RewardDisperser>,
    config: PayoutConfig,
    in_flight: Mutex<HashSet<PayoutKey>>,
}

/// Removes the key from the in-flight set when settling ends
struct InFlight<'a> {
    set: &'a Mutex<HashSet<PayoutKey>>,
    key: PayoutKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl PayoutWorker {
    pub fn new(
        store: Arc<dyn RewardStore>,
        disperser: Arc<RewardDisperser>,
        config: PayoutConfig,
    ) -> Self {
        Self {
            store,
            disperser,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn disperser(&self) -> &Arc<RewardDisperser> {
        &self.disperser
    }

    /// Try to pay one record and return its payout state afterwards.
    ///
    /// Transfer problems are recorded on the record, not returned; only
    /// storage failures are errors.
    pub async fn settle(&self, key: PayoutKey) -> Result<PayoutState> {
        let _guard = match self.claim_local(key) {
            Some(guard) => guard,
            None => {
                debug!("Payout {} already being settled", key);
                return self.current_state(key).await;
            }
        };

        let payout = self
            .store
            .get_payout(key)
            .await
            .map_err(Error::storage)?
            .ok_or_else(|| Error::Storage(format!("no ledger record {}", key)))?;

        match (payout.state.status, payout.state.tx_hash.clone()) {
            (PayoutStatus::Pending, _) => {
                let claimed = self.store.claim_payout(key).await.map_err(Error::storage)?;
                match claimed {
                    Some(claimed) => self.send(&claimed).await?,
                    None => debug!("Payout {} claimed by another worker", key),
                }
            }
            (PayoutStatus::Submitted, Some(tx_hash)) => self.resolve(&payout, &tx_hash).await?,
            (PayoutStatus::Submitted, None) => {
                warn!("Payout {} is submitted without a transaction hash", key)
            }
            (PayoutStatus::Submitting, _) | (PayoutStatus::Paid, _) | (PayoutStatus::Failed, _) => {
                return Ok(payout.state)
            }
        }

        self.current_state(key).await
    }

    /// Settle up to `batch_size` unpaid records, oldest first
    pub async fn run_once(&self) -> Result<PayoutRun> {
        let unpaid = self
            .store
            .unpaid_payouts(self.config.batch_size)
            .await
            .map_err(Error::storage)?;

        let mut run = PayoutRun::default();
        for payout in unpaid {
            run.processed += 1;
            match self.settle(payout.key).await {
                Ok(state) if state.status == PayoutStatus::Paid => run.paid += 1,
                Ok(state) if state.status == PayoutStatus::Failed => run.failed += 1,
                Ok(_) => {}
                Err(e) => error!("Failed to settle {}: {}", payout.key, e),
            }
        }

        if run.processed > 0 {
            info!(
                "Payout run: {} processed, {} paid, {} failed",
                run.processed, run.paid, run.failed
            );
        }
        Ok(run)
    }

    /// Background loop; picks up anything left unpaid, including records
    /// from before a restart
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("Payout worker started (interval: {:?})", interval);
        loop {
            if let Err(e) = self.run_once().await {
                error!("Payout run failed: {}", e);
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=interval.as_millis() as u64 / 10);
            tokio::time::sleep(interval + Duration::from_millis(jitter_ms)).await;
        }
    }

    fn claim_local(&self, key: PayoutKey) -> Option<InFlight<'_>> {
        if self.in_flight.lock().insert(key) {
            Some(InFlight {
                set: &self.in_flight,
                key,
            })
        } else {
            None
        }
    }

    /// Send the transfer for a record this worker has claimed
    async fn send(&self, payout: &PendingPayout) -> Result<()> {
        let key = payout.key;

        if payout.amount == 0 {
            return self.mark_paid(payout, None).await;
        }

        let tx_hash = match self.disperser.submit(&payout.user_address, payout.amount).await {
            Ok(hash) => hash,
            Err(e) => return self.record_failure(payout, None, &e, PayoutStatus::Pending).await,
        };

        match self.store.mark_payout_submitted(key, &tx_hash).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "Payout {} was no longer claimed when storing {}; needs review",
                    key, tx_hash
                );
                return Ok(());
            }
            Err(e) => {
                // The transfer is out; the record must not become sendable again
                let note = Error::Storage(format!(
                    "transfer {} sent but not recorded: {}",
                    tx_hash, e
                ));
                if let Err(flag_err) = self.flag(payout, &note).await {
                    error!(
                        "Could not flag payout {} (tx {}), left submitting: {}",
                        key, tx_hash, flag_err
                    );
                }
                return Err(Error::storage(e));
            }
        }

        match self.disperser.confirm(&tx_hash).await {
            Ok(_) => self.mark_paid(payout, Some(&tx_hash)).await,
            // Timed out or reverted: find out which before deciding
            Err(_) => self.resolve(payout, &tx_hash).await,
        }
    }

    /// Resolve a submitted transfer from its receipt.
    ///
    /// Only a revert counts as an attempt. A transfer that is not mined yet,
    /// or a receipt query that failed, leaves the record `submitted` for the
    /// next pass.
    async fn resolve(&self, payout: &PendingPayout, tx_hash: &str) -> Result<()> {
        match self.disperser.lookup(tx_hash).await {
            Ok(Some(_)) => self.mark_paid(payout, Some(tx_hash)).await,
            Ok(None) => {
                debug!("Payout {} waiting for {} to be mined", payout.key, tx_hash);
                Ok(())
            }
            Err(e @ Error::TransferFailed(_)) => {
                self.record_failure(payout, Some(tx_hash), &e, PayoutStatus::Pending)
                    .await
            }
            Err(e) => {
                warn!("Receipt lookup for {} failed: {}", payout.key, e);
                Ok(())
            }
        }
    }

    async fn mark_paid(&self, payout: &PendingPayout, tx_hash: Option<&str>) -> Result<()> {
        let updated = self
            .store
            .mark_payout_paid(payout.key, tx_hash)
            .await
            .map_err(Error::storage)?;
        if !updated {
            warn!("Payout {} changed while settling, not marked paid", payout.key);
            return Ok(());
        }
        info!(
            "Paid {} BROski$ to {} for {} (tx {})",
            payout.amount,
            payout.user_address,
            payout.key,
            tx_hash.unwrap_or("none")
        );
        Ok(())
    }

    async fn record_failure(
        &self,
        payout: &PendingPayout,
        tx_hash: Option<&str>,
        error: &Error,
        retry_as: PayoutStatus,
    ) -> Result<()> {
        let attempts = payout.state.attempts + 1;
        let next = if !error.is_transient() || attempts >= self.config.max_attempts {
            PayoutStatus::Failed
        } else {
            retry_as
        };

        if next == PayoutStatus::Failed {
            error!(
                "Payout {} to {} flagged for review after {} attempt(s): {}",
                payout.key, payout.user_address, attempts, error
            );
        } else {
            warn!(
                "Payout {} attempt {}/{} failed: {}",
                payout.key, attempts, self.config.max_attempts, error
            );
        }

        let updated = self
            .store
            .record_payout_failure(payout.key, tx_hash, &error.to_string(), next)
            .await
            .map_err(Error::storage)?;
        if !updated {
            warn!("Payout {} changed while settling, failure not recorded", payout.key);
        }
        Ok(())
    }

    /// Move a claimed record straight to `failed`
    async fn flag(&self, payout: &PendingPayout, error: &Error) -> Result<()> {
        error!("Payout {} flagged for review: {}", payout.key, error);
        self.store
            .record_payout_failure(payout.key, None, &error.to_string(), PayoutStatus::Failed)
            .await
            .map(|_| ())
            .map_err(Error::storage)
    }

    async fn current_state(&self, key: PayoutKey) -> Result<PayoutState> {
        self.store
            .get_payout(key)
            .await
            .map_err(Error::storage)?
            .map(|p| p.state)
            .ok_or_else(|| Error::Storage(format!("no ledger record {}", key)))
    }
}

//! BROski$ token transfers from the treasury wallet
//!
//! [`RewardDisperser::disperse`] sends and confirms in one call. The payout
//! worker uses the [`submit`](RewardDisperser::submit) /
//! [`confirm`](RewardDisperser::confirm) halves so the transaction hash can be
//! stored in between.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::parse_address;
use crate::config::ChainConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub success: bool,
}

/// ERC-20 calls on the BROski$ token, signed by the treasury wallet.
/// Implemented over RPC by [`EvmToken`](crate::chain::EvmToken).
#[async_trait]
pub trait TokenTransfer: Send + Sync {
    /// Address of the paying wallet
    fn treasury(&self) -> Address;

    /// Broadcast `transfer(to, amount)`; returns once the node accepted it
    async fn submit_transfer(&self, to: Address, amount: U256) -> anyhow::Result<TxHash>;

    /// Receipt for a sent transaction, `None` while it is not mined
    async fn receipt(&self, tx_hash: TxHash) -> anyhow::Result<Option<TransferReceipt>>;

    async fn balance_of(&self, owner: Address) -> anyhow::Result<U256>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TreasuryBalance {
    pub address: String,
    /// Raw base units
    pub balance: String,
    /// Whole tokens, rounded down
    pub tokens: String,
}

pub struct RewardDisperser {
    token: Arc<dyn TokenTransfer>,
    decimals: u8,
    request_timeout: Duration,
    confirmation_timeout: Duration,
    poll_interval: Duration,
}

impl RewardDisperser {
    pub fn new(token: Arc<dyn TokenTransfer>, config: &ChainConfig) -> Self {
        Self {
            token,
            decimals: config.token_decimals,
            request_timeout: config.request_timeout(),
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.receipt_poll_interval(),
        }
    }

    pub fn treasury(&self) -> Address {
        self.token.treasury()
    }

    /// Whole-token amount in base units
    pub fn to_base_units(&self, amount: u64) -> U256 {
        U256::from(amount) * U256::from(10u64).pow(U256::from(self.decimals))
    }

    /// Transfer `amount` whole tokens to `user_address` and wait for the receipt
    pub async fn disperse(&self, user_address: &str, amount: u64) -> Result<TransferReceipt> {
        let tx_hash = self.submit(user_address, amount).await?;
        self.confirm(&tx_hash).await
    }

    /// Send the transfer without waiting for it to be mined
    pub async fn submit(&self, user_address: &str, amount: u64) -> Result<String> {
        let to = parse_address(user_address)?;
        let value = self.to_base_units(amount);

        debug!("Submitting transfer of {} BROski$ to {}", amount, user_address);

        let tx_hash =
            match tokio::time::timeout(self.request_timeout, self.token.submit_transfer(to, value))
                .await
            {
                Ok(Ok(hash)) => hash,
                Ok(Err(e)) => {
                    warn!("Transfer to {} could not be sent: {:#}", user_address, e);
                    return Err(Error::TransferFailed(e.to_string()));
                }
                Err(_) => {
                    return Err(Error::TransferFailed(format!(
                        "send timed out after {}s",
                        self.request_timeout.as_secs()
                    )))
                }
            };

        let tx_hash = tx_hash.to_string();
        info!(
            "Sent {} BROski$ to {} (tx {})",
            amount, user_address, tx_hash
        );
        Ok(tx_hash)
    }

    /// Poll for the receipt until mined or the confirmation timeout expires.
    /// A reverted transfer is [`Error::TransferFailed`].
    pub async fn confirm(&self, tx_hash: &str) -> Result<TransferReceipt> {
        let hash = parse_tx_hash(tx_hash)?;

        let receipt = tokio::time::timeout(self.confirmation_timeout, async {
            loop {
                match self.fetch_receipt(hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    // Transient provider errors are retried until the deadline
                    Err(e) => debug!("Receipt poll for {} failed: {}", tx_hash, e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
        .await
        .map_err(|_| {
            Error::TransferFailed(format!(
                "no receipt for {} after {}s",
                tx_hash,
                self.confirmation_timeout.as_secs()
            ))
        })?;

        check_receipt(receipt)
    }

    /// Single receipt lookup for a previously sent transfer
    pub async fn lookup(&self, tx_hash: &str) -> Result<Option<TransferReceipt>> {
        let hash = parse_tx_hash(tx_hash)?;
        match self.fetch_receipt(hash).await? {
            Some(receipt) => check_receipt(receipt).map(Some),
            None => Ok(None),
        }
    }

    pub async fn treasury_balance(&self) -> Result<TreasuryBalance> {
        let treasury = self.token.treasury();
        let balance =
            match tokio::time::timeout(self.request_timeout, self.token.balance_of(treasury)).await
            {
                Ok(Ok(b)) => b,
                Ok(Err(e)) => return Err(Error::ChainQueryFailed(format!("balanceOf: {}", e))),
                Err(_) => {
                    return Err(Error::ChainQueryFailed(
                        "balanceOf timed out".to_string(),
                    ))
                }
            };

        let unit = U256::from(10u64).pow(U256::from(self.decimals));
        Ok(TreasuryBalance {
            address: treasury.to_checksum(None),
            balance: balance.to_string(),
            tokens: (balance / unit).to_string(),
        })
    }

    async fn fetch_receipt(&self, hash: TxHash) -> Result<Option<TransferReceipt>> {
        match tokio::time::timeout(self.request_timeout, self.token.receipt(hash)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(e)) => Err(Error::ChainQueryFailed(format!("receipt {}: {}", hash, e))),
            Err(_) => Err(Error::ChainQueryFailed(format!(
                "receipt {} timed out",
                hash
            ))),
        }
    }
}

fn parse_tx_hash(tx_hash: &str) -> Result<TxHash> {
    TxHash::from_str(tx_hash)
        .map_err(|e| Error::TransferFailed(format!("malformed tx hash {}: {}", tx_hash, e)))
}

fn check_receipt(receipt: TransferReceipt) -> Result<TransferReceipt> {
    if receipt.success {
        Ok(receipt)
    } else {
        warn!("Transfer {} reverted", receipt.tx_hash);
        Err(Error::TransferFailed(format!(
            "transaction {} reverted",
            receipt.tx_hash
        )))
    }
}

//! EVM RPC adapters
//!
//! Contract bindings for the FeatureGate and BROski$ token contracts and the
//! alloy-backed implementations of [`AccessGate`] and [`TokenTransfer`].

use std::str::FromStr;
use std::time::Duration;

use alloy::{
    network::{EthereumWallet, ReceiptResponse},
    primitives::{Address, TxHash, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::disperser::{TokenTransfer, TransferReceipt};
use crate::gate::{AccessGate, AccessResult};

sol! {
    #[sol(rpc)]
    interface IFeatureGate {
        function canAccess(string calldata feature, address user)
            external view returns (bool allowed, string memory reason);

        function checkMultiple(string[] calldata features, address user)
            external view returns (bool[] memory allowed, string[] memory reasons);
    }

    #[sol(rpc)]
    interface IBroskiToken {
        function balanceOf(address owner) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
        function decimals() external view returns (uint8);
    }
}

/// Read-only provider
pub fn read_provider(rpc_url: &str) -> Result<DynProvider> {
    let url = rpc_url
        .parse()
        .with_context(|| format!("Invalid RPC URL: {}", rpc_url))?;
    Ok(ProviderBuilder::new().connect_http(url).erased())
}

/// Provider that signs with the treasury key. Returns the treasury address.
pub fn wallet_provider(rpc_url: &str, private_key: &str) -> Result<(DynProvider, Address)> {
    let signer = PrivateKeySigner::from_str(private_key.trim_start_matches("0x"))
        .context("Invalid treasury private key")?;
    let treasury = signer.address();
    let url = rpc_url
        .parse()
        .with_context(|| format!("Invalid RPC URL: {}", rpc_url))?;
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(url)
        .erased();
    Ok((provider, treasury))
}

pub fn parse_contract(name: &str, address: &str) -> Result<Address> {
    Address::from_str(address).with_context(|| format!("Invalid {} address: {}", name, address))
}

// ============================================================================
// NETWORK
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub chain_id: u64,
    pub block_number: u64,
    pub status: String,
}

/// Provider wrapper for node status queries
#[derive(Clone)]
pub struct ChainClient {
    provider: DynProvider,
    timeout: Duration,
}

impl ChainClient {
    pub fn new(provider: DynProvider, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub async fn network_info(&self) -> Result<NetworkInfo> {
        let query = async {
            let chain_id = self.provider.get_chain_id().await?;
            let block_number = self.provider.get_block_number().await?;
            Ok::<_, anyhow::Error>(NetworkInfo {
                chain_id,
                block_number,
                status: "connected".to_string(),
            })
        };
        tokio::time::timeout(self.timeout, query)
            .await
            .context("Network query timed out")?
    }
}

// ============================================================================
// FEATURE GATE
// ============================================================================

pub struct EvmFeatureGate {
    provider: DynProvider,
    address: Address,
}

impl EvmFeatureGate {
    pub fn new(provider: DynProvider, address: Address) -> Self {
        Self { provider, address }
    }
}

#[async_trait]
impl AccessGate for EvmFeatureGate {
    async fn can_access(&self, feature: &str, user: Address) -> Result<AccessResult> {
        let gate = IFeatureGate::new(self.address, self.provider.clone());
        let answer = gate.canAccess(feature.to_string(), user).call().await?;
        debug!(
            "canAccess({}, {}) = {} ({})",
            feature, user, answer.allowed, answer.reason
        );
        Ok(AccessResult {
            can_access: answer.allowed,
            reason: answer.reason,
        })
    }

    async fn check_multiple(
        &self,
        features: &[String],
        user: Address,
    ) -> Result<(Vec<bool>, Vec<String>)> {
        let gate = IFeatureGate::new(self.address, self.provider.clone());
        let answer = gate.checkMultiple(features.to_vec(), user).call().await?;
        Ok((answer.allowed, answer.reasons))
    }
}

// ============================================================================
// TOKEN
// ============================================================================

pub struct EvmToken {
    provider: DynProvider,
    address: Address,
    treasury: Address,
}

impl EvmToken {
    /// `provider` must sign for `treasury`
    pub fn new(provider: DynProvider, address: Address, treasury: Address) -> Self {
        Self {
            provider,
            address,
            treasury,
        }
    }

    pub async fn decimals(&self) -> Result<u8> {
        let token = IBroskiToken::new(self.address, self.provider.clone());
        Ok(token.decimals().call().await?)
    }
}

#[async_trait]
impl TokenTransfer for EvmToken {
    fn treasury(&self) -> Address {
        self.treasury
    }

    async fn submit_transfer(&self, to: Address, amount: U256) -> Result<TxHash> {
        let token = IBroskiToken::new(self.address, self.provider.clone());
        let pending = token
            .transfer(to, amount)
            .from(self.treasury)
            .send()
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TransferReceipt>> {
        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        Ok(receipt.map(|r| TransferReceipt {
            tx_hash: tx_hash.to_string(),
            block_number: r.block_number(),
            gas_used: r.gas_used(),
            success: r.status(),
        }))
    }

    async fn balance_of(&self, owner: Address) -> Result<U256> {
        let token = IBroskiToken::new(self.address, self.provider.clone());
        Ok(token.balanceOf(owner).call().await?)
    }
}

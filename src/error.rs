//! Error types for the rewards service

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed account identifier, rejected before any external call
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Provider error or timeout on a chain read. Callers must treat this as
    /// "access unknown", never as granted.
    #[error("chain query failed: {0}")]
    ChainQueryFailed(String),

    /// Token transfer reverted, could not be sent, or was never confirmed
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("unknown contribution type: {0}")]
    UnknownContributionType(String),

    #[error("access denied to '{feature}': {reason}")]
    AccessDenied { feature: String, reason: String },

    #[error("quest not found: {0}")]
    QuestNotFound(String),

    #[error("quest '{id}' incomplete ({progress}/{required})")]
    QuestIncomplete {
        id: String,
        progress: u64,
        required: u64,
    },

    #[error("quest '{0}' already claimed")]
    QuestAlreadyClaimed(String),

    #[error("unauthorized")]
    Unauthorized,

    /// The deployment transaction is already in the ledger
    #[error("deployment {tx_hash} on {chain} already recorded")]
    DuplicateDeployment { chain: String, tx_hash: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidAddress(_) => "invalid_address",
            Error::ChainQueryFailed(_) => "chain_query_failed",
            Error::TransferFailed(_) => "transfer_failed",
            Error::UnknownContributionType(_) => "unknown_contribution_type",
            Error::AccessDenied { .. } => "access_denied",
            Error::QuestNotFound(_) => "quest_not_found",
            Error::QuestIncomplete { .. } => "quest_incomplete",
            Error::QuestAlreadyClaimed(_) => "quest_already_claimed",
            Error::Unauthorized => "unauthorized",
            Error::DuplicateDeployment { .. } => "duplicate_deployment",
            Error::Storage(_) => "storage",
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only chain-side failures qualify; address and contribution-type errors
    /// are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ChainQueryFailed(_) | Error::TransferFailed(_))
    }

    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        Error::Storage(e.to_string())
    }
}

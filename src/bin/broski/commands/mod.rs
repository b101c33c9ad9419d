//! CLI commands

pub mod access;
pub mod leaderboard;
pub mod quests;
pub mod rewards;

use anyhow::{bail, Result};

/// Reject malformed addresses before making a request
pub fn check_address(address: &str) -> Result<()> {
    if !broski_rewards::is_valid_address(address) {
        bail!("'{}' is not a valid 0x address", address);
    }
    Ok(())
}

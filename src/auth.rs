//! Authentication and Authorization
//!
//! - EVM address validation (EIP-55 checksum for mixed-case input)
//! - Admin bearer token check for contribution approval

use std::str::FromStr;

use alloy::primitives::Address;
use tracing::debug;

use crate::error::{Error, Result};

/// Check if a string is a well-formed `0x`-prefixed EVM account address.
///
/// All-lowercase and all-uppercase hex are accepted as is; mixed case must
/// match the EIP-55 checksum.
pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}

/// Parse and validate a user-supplied address
pub fn parse_address(address: &str) -> Result<Address> {
    let trimmed = address.trim();
    let hex_part = match trimmed.strip_prefix("0x") {
        Some(h) => h,
        None => return Err(Error::InvalidAddress(address.to_string())),
    };

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidAddress(address.to_string()));
    }

    let parsed = Address::from_str(trimmed).map_err(|e| {
        debug!("Failed to parse address {}: {}", trimmed, e);
        Error::InvalidAddress(address.to_string())
    })?;

    let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && parsed.to_checksum(None) != trimmed {
        debug!("Checksum mismatch for {}", trimmed);
        return Err(Error::InvalidAddress(address.to_string()));
    }

    Ok(parsed)
}

/// Storage form of an address: lowercase hex with `0x` prefix
pub fn normalize_address(address: &Address) -> String {
    format!("0x{}", alloy::hex::encode(address.as_slice()))
}

/// Validate and normalize in one step
pub fn canonical_address(address: &str) -> Result<(Address, String)> {
    let parsed = parse_address(address)?;
    Ok((parsed, normalize_address(&parsed)))
}

/// Check an `Authorization: Bearer <token>` header value against the
/// configured admin token. No configured token means admin routes are closed.
pub fn verify_admin_token(expected: Option<&str>, header: Option<&str>) -> bool {
    let expected = match expected {
        Some(t) if !t.is_empty() => t,
        _ => return false,
    };
    let provided = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(t) => t.trim(),
        None => return false,
    };

    // Length leaks, contents don't
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

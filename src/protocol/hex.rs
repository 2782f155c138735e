//! Hex helpers for command-line input and diagnostics

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HexError {
    #[error("Invalid hex: {0}")]
    Invalid(#[from] hex::FromHexError),
}

/// Encode bytes as lowercase hex
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a hex string, accepting an optional `0x` prefix and surrounding whitespace
pub fn from_hex(input: &str) -> Result<Vec<u8>, HexError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    Ok(hex::decode(digits)?)
}

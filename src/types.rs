//! Shared primitives: token addresses, unit conversion and constants

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Wrapped SOL mint, the quote currency for every position
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// SOL has 9 decimals (lamports)
pub const SOL_DECIMALS: u32 = 9;

/// Remaining amounts below this are treated as fully sold
pub const DUST_THRESHOLD: Decimal = dec!(0.000000001);

/// Normalized lookup key for a token address
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// A token address carrying both its original casing (used for outbound venue
/// calls, which may be case-sensitive) and its lowercase lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenAddress {
    original: String,
    key: String,
}

impl TokenAddress {
    pub fn new(address: &str) -> Self {
        Self {
            original: address.trim().to_string(),
            key: normalize_address(address),
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_sol(&self) -> bool {
        self.key == normalize_address(SOL_MINT)
    }
}

impl std::fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}

/// Validate a base58 Solana address (32 bytes)
pub fn is_valid_address(address: &str) -> bool {
    bs58::decode(address.trim())
        .into_vec()
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

/// Convert a smallest-unit integer amount into a decimal amount
pub fn from_smallest_units(amount: u64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(amount as i128, decimals).normalize()
}

/// Convert a decimal amount into smallest units, rounding down.
/// Returns `None` when the amount is negative or does not fit in a u64.
pub fn to_smallest_units(amount: Decimal, decimals: u32) -> Option<u64> {
    if amount.is_sign_negative() {
        return None;
    }
    let scale = Decimal::from_i128_with_scale(10i128.checked_pow(decimals)?, 0);
    amount.checked_mul(scale)?.floor().to_u64()
}

/// Percentage change of `current` relative to `reference`
pub fn percent_change(current: Decimal, reference: Decimal) -> Option<Decimal> {
    if reference <= Decimal::ZERO {
        return None;
    }
    Some((current - reference) / reference * dec!(100))
}

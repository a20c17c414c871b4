//! External collaborators: price feed, liquidity check, swap venue, token metadata
//!
//! The engine only sees the traits; HTTP adapters live in the submodules.

pub mod dexscreener;
pub mod fees;
pub mod jupiter;
pub mod rpc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use dexscreener::DexScreenerClient;
pub use fees::{parse_swap_fees, SwapFees};
pub use jupiter::JupiterClient;
pub use rpc::RpcTokenMetadata;

/// Latest price of one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPrice {
    /// Address as requested (original casing)
    pub token_address: String,
    pub price_sol: Decimal,
    pub price_usd: Option<Decimal>,
}

/// Liquidity snapshot used to detect collapsed markets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityReport {
    pub token_address: String,
    pub has_liquidity: bool,
    pub liquidity_sol: Decimal,
    pub has_pairs: bool,
    pub is_rug_pulled: bool,
    pub error: Option<String>,
}

impl LiquidityReport {
    /// A confirmed collapse: a clean answer with no tradable SOL-side liquidity
    pub fn is_collapsed(&self, threshold_sol: Decimal) -> bool {
        self.error.is_none()
            && self.liquidity_sol < threshold_sol
            && (!self.has_pairs || self.is_rug_pulled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    /// Input amount in the input token's smallest units
    pub amount: u64,
    pub wallet_address: Option<String>,
    pub slippage_bps: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub out_amount: u64,
    /// Price impact in percent
    pub price_impact_pct: Decimal,
    /// Venue response, passed back on execution and to the fee parser
    pub payload: serde_json::Value,
}

/// Result of an executed (or simulated) swap, amounts in smallest units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapExecution {
    pub input_amount: u64,
    pub output_amount: u64,
    /// Includes fees charged on top of `input_amount`, when reported
    pub total_input_amount: Option<u64>,
    /// Net of fees taken from the output, when reported
    pub total_output_amount: Option<u64>,
    pub transaction_hash: String,
    pub slippage_bps: Option<u16>,
    pub price_impact_pct: Decimal,
    /// Opaque venue payload; fees are extracted by [`parse_swap_fees`]
    pub swap_payload: serde_json::Value,
}

#[async_trait]
pub trait PriceVenue: Send + Sync {
    /// Batched lookup; addresses missing from the result failed to price
    async fn get_multiple_token_prices(&self, addresses: &[String]) -> Result<Vec<TokenPrice>>;
}

#[async_trait]
pub trait LiquidityCheck: Send + Sync {
    async fn check_liquidity_batch(&self, addresses: &[String]) -> Result<Vec<LiquidityReport>>;
}

#[async_trait]
pub trait SwapVenue: Send + Sync {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Quote>;

    async fn execute_swap(&self, quote: &Quote, wallet_address: &str) -> Result<SwapExecution>;
}

#[async_trait]
pub trait TokenMetadata: Send + Sync {
    async fn get_token_decimals(&self, address: &str) -> Result<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn report(liquidity: Decimal, has_pairs: bool, rugged: bool) -> LiquidityReport {
        LiquidityReport {
            token_address: "Mint".to_string(),
            has_liquidity: liquidity > Decimal::ZERO,
            liquidity_sol: liquidity,
            has_pairs,
            is_rug_pulled: rugged,
            error: None,
        }
    }

    #[test]
    fn test_collapse_detection() {
        let threshold = dec!(0.01);
        assert!(report(dec!(0), false, false).is_collapsed(threshold));
        assert!(report(dec!(0.001), true, true).is_collapsed(threshold));
        assert!(!report(dec!(5), true, false).is_collapsed(threshold));
        // Pairs still listed and not flagged: wait for a clearer signal
        assert!(!report(dec!(0.001), true, false).is_collapsed(threshold));

        let mut errored = report(dec!(0), false, false);
        errored.error = Some("timeout".to_string());
        assert!(!errored.is_collapsed(threshold));
    }
}

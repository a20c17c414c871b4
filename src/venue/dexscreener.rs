//! DexScreener liquidity check

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use super::{LiquidityCheck, LiquidityReport};
use crate::types::{normalize_address, SOL_MINT};

/// DexScreener accepts up to 30 addresses per token lookup
const BATCH_SIZE: usize = 30;

pub struct DexScreenerClient {
    http_client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PairToken {
    address: String,
}

#[derive(Debug, Default, Deserialize)]
struct PairLiquidity {
    #[serde(default)]
    base: Option<Decimal>,
    #[serde(default)]
    quote: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    base_token: PairToken,
    quote_token: PairToken,
    #[serde(default)]
    liquidity: Option<PairLiquidity>,
}

impl Pair {
    /// SOL held by the pool, zero for pairs not quoted in SOL
    fn sol_liquidity(&self) -> Decimal {
        let liquidity = match &self.liquidity {
            Some(liquidity) => liquidity,
            None => return Decimal::ZERO,
        };
        if self.quote_token.address == SOL_MINT {
            liquidity.quote.unwrap_or(Decimal::ZERO)
        } else if self.base_token.address == SOL_MINT {
            liquidity.base.unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }
}

/// Fold the pairs returned for a batch into one report per requested address
fn build_reports(addresses: &[String], pairs: &[Pair]) -> Vec<LiquidityReport> {
    let mut by_token: HashMap<String, (usize, Decimal)> = HashMap::new();
    for pair in pairs {
        let sol = pair.sol_liquidity();
        for side in [&pair.base_token.address, &pair.quote_token.address] {
            if side == SOL_MINT {
                continue;
            }
            let entry = by_token.entry(normalize_address(side)).or_default();
            entry.0 += 1;
            entry.1 += sol;
        }
    }

    addresses
        .iter()
        .map(|address| {
            let (pair_count, liquidity_sol) = by_token
                .get(&normalize_address(address))
                .copied()
                .unwrap_or((0, Decimal::ZERO));
            let has_pairs = pair_count > 0;
            LiquidityReport {
                token_address: address.clone(),
                has_liquidity: liquidity_sol > Decimal::ZERO,
                liquidity_sol,
                has_pairs,
                is_rug_pulled: has_pairs && liquidity_sol.is_zero(),
                error: None,
            }
        })
        .collect()
}

impl DexScreenerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_pairs(&self, addresses: &[String]) -> Result<Vec<Pair>> {
        let url = format!("{}/tokens/v1/solana/{}", self.base_url, addresses.join(","));
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .context("Failed to send liquidity request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Liquidity request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse liquidity response")
    }
}

#[async_trait]
impl LiquidityCheck for DexScreenerClient {
    async fn check_liquidity_batch(&self, addresses: &[String]) -> Result<Vec<LiquidityReport>> {
        let mut reports = Vec::with_capacity(addresses.len());
        for chunk in addresses.chunks(BATCH_SIZE) {
            match self.fetch_pairs(chunk).await {
                Ok(pairs) => reports.extend(build_reports(chunk, &pairs)),
                Err(e) => {
                    // A failed lookup is never evidence of a collapse
                    warn!("Liquidity check failed for {} tokens: {:#}", chunk.len(), e);
                    reports.extend(chunk.iter().map(|address| LiquidityReport {
                        token_address: address.clone(),
                        has_liquidity: false,
                        liquidity_sol: Decimal::ZERO,
                        has_pairs: false,
                        is_rug_pulled: false,
                        error: Some(e.to_string()),
                    }));
                }
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reports_sum_sol_side_liquidity() {
        let pairs: Vec<Pair> = serde_json::from_value(serde_json::json!([
            {
                "baseToken": { "address": "TokenA" },
                "quoteToken": { "address": SOL_MINT },
                "liquidity": { "usd": 3000.0, "base": 1000000, "quote": 10.5 }
            },
            {
                "baseToken": { "address": "TokenA" },
                "quoteToken": { "address": SOL_MINT },
                "liquidity": { "base": 5, "quote": 0.5 }
            },
            {
                "baseToken": { "address": "TokenB" },
                "quoteToken": { "address": SOL_MINT },
                "liquidity": { "base": 10, "quote": 0 }
            }
        ]))
        .unwrap();

        let addresses = vec!["TokenA".to_string(), "tokenb".to_string(), "TokenC".to_string()];
        let reports = build_reports(&addresses, &pairs);

        assert_eq!(reports[0].liquidity_sol, dec!(11));
        assert!(reports[0].has_liquidity);

        assert!(reports[1].has_pairs);
        assert!(reports[1].is_rug_pulled);

        assert!(!reports[2].has_pairs);
        assert!(reports[2].is_collapsed(dec!(0.01)));
    }
}

//! Jupiter HTTP adapter: batched USD prices converted to SOL, and swap quotes

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{PriceVenue, Quote, QuoteRequest, SwapExecution, SwapVenue, TokenPrice};
use crate::types::SOL_MINT;

/// Jupiter price endpoint accepts at most this many ids per request
const PRICE_BATCH_SIZE: usize = 50;

pub struct JupiterClient {
    http_client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceEntry {
    usd_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    input_mint: String,
    output_mint: String,
    in_amount: String,
    out_amount: String,
    /// Fraction, e.g. "0.0125" for 1.25%
    price_impact_pct: String,
}

impl JupiterClient {
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

    async fn fetch_usd_prices(&self, ids: &[String]) -> Result<HashMap<String, PriceEntry>> {
        let url = format!("{}/price/v3", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[("ids", ids.join(","))])
            .send()
            .await
            .context("Failed to send price request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Price request failed: {} - {}", status, body);
        }

        // Tokens without a price are simply absent (or null)
        let raw: HashMap<String, Option<PriceEntry>> = response
            .json()
            .await
            .context("Failed to parse price response")?;
        Ok(raw
            .into_iter()
            .filter_map(|(mint, entry)| entry.map(|e| (mint, e)))
            .collect())
    }
}

#[async_trait]
impl PriceVenue for JupiterClient {
    async fn get_multiple_token_prices(&self, addresses: &[String]) -> Result<Vec<TokenPrice>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let mut usd = HashMap::new();
        for chunk in addresses.chunks(PRICE_BATCH_SIZE - 1) {
            let mut ids: Vec<String> = chunk.to_vec();
            if !ids.iter().any(|id| id == SOL_MINT) {
                ids.push(SOL_MINT.to_string());
            }
            usd.extend(self.fetch_usd_prices(&ids).await?);
        }

        let sol_usd = usd
            .get(SOL_MINT)
            .map(|entry| entry.usd_price)
            .filter(|price| *price > Decimal::ZERO)
            .context("SOL price missing from price response")?;

        let prices: Vec<TokenPrice> = addresses
            .iter()
            .filter_map(|address| {
                let entry = usd.get(address)?;
                Some(TokenPrice {
                    token_address: address.clone(),
                    price_sol: entry.usd_price / sol_usd,
                    price_usd: Some(entry.usd_price),
                })
            })
            .collect();

        if prices.len() < addresses.len() {
            debug!(
                "Priced {}/{} tokens ({} missing)",
                prices.len(),
                addresses.len(),
                addresses.len() - prices.len()
            );
        }
        Ok(prices)
    }
}

#[async_trait]
impl SwapVenue for JupiterClient {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let url = format!("{}/swap/v1/quote", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("inputMint", request.input_mint.clone()),
                ("outputMint", request.output_mint.clone()),
                ("amount", request.amount.to_string()),
                ("slippageBps", request.slippage_bps.to_string()),
            ])
            .send()
            .await
            .context("Failed to send quote request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Quote request failed: {} - {}", status, body);
            anyhow::bail!("Quote request failed: {} - {}", status, body);
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .context("Failed to read quote response")?;
        let parsed: QuoteResponse =
            serde_json::from_value(payload.clone()).context("Failed to parse quote response")?;

        let impact_fraction: Decimal = parsed
            .price_impact_pct
            .parse()
            .context("Invalid priceImpactPct in quote")?;

        Ok(Quote {
            input_mint: parsed.input_mint,
            output_mint: parsed.output_mint,
            in_amount: parsed.in_amount.parse().context("Invalid inAmount in quote")?,
            out_amount: parsed.out_amount.parse().context("Invalid outAmount in quote")?,
            price_impact_pct: impact_fraction.abs() * Decimal::ONE_HUNDRED,
            payload,
        })
    }

    async fn execute_swap(&self, quote: &Quote, wallet_address: &str) -> Result<SwapExecution> {
        // Signing needs wallet custody, which this service does not hold
        anyhow::bail!(
            "Live execution of {} -> {} for wallet {} requires a signing service; run the agent in simulation mode",
            quote.input_mint,
            quote.output_mint,
            wallet_address
        )
    }
}

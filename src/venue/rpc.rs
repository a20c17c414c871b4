//! Token decimals over Solana JSON-RPC, memoized per mint

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::TokenMetadata;
use crate::types::{SOL_DECIMALS, SOL_MINT};

pub struct RpcTokenMetadata {
    http_client: Client,
    rpc_url: String,
    /// Decimals never change for a mint
    decimals: DashMap<String, u32>,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<TokenSupplyResult>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenSupplyResult {
    value: TokenSupplyValue,
}

#[derive(Debug, Deserialize)]
struct TokenSupplyValue {
    decimals: u32,
}

impl RpcTokenMetadata {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
            decimals: DashMap::new(),
        })
    }
}

#[async_trait]
impl TokenMetadata for RpcTokenMetadata {
    async fn get_token_decimals(&self, address: &str) -> Result<u32> {
        if address == SOL_MINT {
            return Ok(SOL_DECIMALS);
        }
        if let Some(cached) = self.decimals.get(address) {
            return Ok(*cached);
        }

        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "getTokenSupply",
            params: vec![address],
        };

        let response: RpcResponse = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .context("Failed to send getTokenSupply request")?
            .json()
            .await
            .context("Failed to parse getTokenSupply response")?;

        if let Some(error) = response.error {
            anyhow::bail!("getTokenSupply failed for {}: {} ({})", address, error.message, error.code);
        }
        let decimals = response
            .result
            .map(|r| r.value.decimals)
            .with_context(|| format!("getTokenSupply returned no result for {}", address))?;

        debug!("Token {} has {} decimals", address, decimals);
        self.decimals.insert(address.to_string(), decimals);
        Ok(decimals)
    }
}

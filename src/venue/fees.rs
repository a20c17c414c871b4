//! Fee extraction from swap venue payloads
//!
//! Amounts appear as JSON strings or numbers, in lamports. Fees charged in a
//! mint other than SOL are ignored here; they are already reflected in the
//! swap's output amount.

use rust_decimal::Decimal;
use serde_json::Value;

use crate::types::{from_smallest_units, SOL_DECIMALS, SOL_MINT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapFees {
    pub protocol_fee_sol: Decimal,
    pub network_fee_sol: Decimal,
}

impl SwapFees {
    pub fn total(&self) -> Decimal {
        self.protocol_fee_sol + self.network_fee_sol
    }
}

fn as_lamports(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_sol_mint(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .map(|mint| mint == SOL_MINT)
        .unwrap_or(false)
}

/// Extract protocol and network fees (in SOL) from a swap payload
pub fn parse_swap_fees(payload: &Value) -> SwapFees {
    let mut protocol: u64 = 0;

    if let Some(routes) = payload.get("routePlan").and_then(Value::as_array) {
        for route in routes {
            let Some(info) = route.get("swapInfo") else {
                continue;
            };
            if is_sol_mint(info.get("feeMint")) {
                protocol = protocol.saturating_add(info.get("feeAmount").and_then(as_lamports).unwrap_or(0));
            }
        }
    }

    if let Some(platform) = payload.get("platformFee") {
        if is_sol_mint(platform.get("feeMint")) {
            protocol = protocol.saturating_add(platform.get("amount").and_then(as_lamports).unwrap_or(0));
        }
    }

    let base_fee = payload
        .get("meta")
        .and_then(|meta| meta.get("fee"))
        .or_else(|| payload.get("networkFeeLamports"))
        .and_then(as_lamports)
        .unwrap_or(0);
    let priority_fee = payload
        .get("prioritizationFeeLamports")
        .and_then(as_lamports)
        .unwrap_or(0);

    SwapFees {
        protocol_fee_sol: from_smallest_units(protocol, SOL_DECIMALS),
        network_fee_sol: from_smallest_units(base_fee.saturating_add(priority_fee), SOL_DECIMALS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_route_and_network_fees() {
        let payload = json!({
            "routePlan": [
                { "swapInfo": { "feeAmount": "2500000", "feeMint": SOL_MINT } },
                { "swapInfo": { "feeAmount": "999", "feeMint": "OtherMint111" } }
            ],
            "platformFee": { "amount": 500000, "feeMint": SOL_MINT },
            "meta": { "fee": 5000 },
            "prioritizationFeeLamports": "10000"
        });

        let fees = parse_swap_fees(&payload);
        assert_eq!(fees.protocol_fee_sol, dec!(0.003));
        assert_eq!(fees.network_fee_sol, dec!(0.000015));
        assert_eq!(fees.total(), dec!(0.003015));
    }

    #[test]
    fn test_unknown_payload_has_no_fees() {
        assert_eq!(parse_swap_fees(&json!({ "unexpected": true })), SwapFees::default());
        assert_eq!(parse_swap_fees(&Value::Null), SwapFees::default());
    }
}

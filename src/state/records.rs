//! Balance, trade and historical records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::Position;

/// One wallet's holding of one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub wallet_address: String,
    /// Lowercase token key
    pub token_key: String,
    pub symbol: String,
    pub amount: Decimal,
    pub last_updated: DateTime<Utc>,
}

/// Why a position (or part of it) was sold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    StaleTrade,
    Manual,
    LiquidityCollapse,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StaleTrade => "stale_trade",
            CloseReason::Manual => "manual",
            CloseReason::LiquidityCollapse => "liquidity_collapse",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of trade record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    Buy,
    DcaBuy,
    Sell,
    TakeProfitSell,
    WriteOff,
}

/// Trade history entry, written in the same transaction as the balance deltas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub wallet_address: String,
    pub position_id: Option<Uuid>,
    pub kind: TradeKind,
    pub reason: Option<CloseReason>,
    pub input_mint: String,
    pub output_mint: String,
    pub input_amount: Decimal,
    pub output_amount: Decimal,
    /// SOL per token
    pub price: Decimal,
    pub protocol_fee_sol: Decimal,
    pub network_fee_sol: Decimal,
    pub price_impact_pct: Decimal,
    pub transaction_hash: String,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of a fully closed position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSwap {
    pub id: Uuid,
    pub position_id: Uuid,
    pub agent_id: String,
    pub wallet_address: String,
    pub token_address: String,
    pub token_symbol: String,
    /// Full size ever held, DCA included
    pub original_amount: Decimal,
    pub average_purchase_price: Decimal,
    /// Total SOL received across partial and final sales divided by tokens sold
    pub effective_sale_price: Decimal,
    pub total_invested_sol: Decimal,
    pub total_received_sol: Decimal,
    pub realized_pnl_sol: Decimal,
    pub pnl_percent: Decimal,
    pub close_reason: CloseReason,
    pub dca_count: u32,
    pub take_profit_levels_hit: u32,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl HistoricalSwap {
    /// Build the closed-trade record for a position whose final sale returned
    /// `final_net_sol` for `final_tokens_sold`
    pub fn from_close(
        position: &Position,
        final_tokens_sold: Decimal,
        final_net_sol: Decimal,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Self {
        let total_received = position.take_profit_proceeds_sol + final_net_sol;
        let tokens_sold =
            position.purchase_amount - position.remaining_amount + final_tokens_sold;
        let effective_sale_price = if tokens_sold > Decimal::ZERO {
            total_received / tokens_sold
        } else {
            Decimal::ZERO
        };
        let realized = position.close_profit(final_net_sol);
        let pnl_percent = if position.total_invested_sol > Decimal::ZERO {
            realized / position.total_invested_sol * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        Self {
            id: Uuid::new_v4(),
            position_id: position.id,
            agent_id: position.agent_id.clone(),
            wallet_address: position.wallet_address.clone(),
            token_address: position.token_address.clone(),
            token_symbol: position.token_symbol.clone(),
            original_amount: position.purchase_amount,
            average_purchase_price: position.purchase_price,
            effective_sale_price,
            total_invested_sol: position.total_invested_sol,
            total_received_sol: total_received,
            realized_pnl_sol: realized,
            pnl_percent,
            close_reason: reason,
            dca_count: position.dca_count,
            take_profit_levels_hit: position.take_profit_levels_hit,
            opened_at: position.created_at,
            closed_at,
        }
    }
}

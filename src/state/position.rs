//! Position tracking structures

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{percent_change, TokenAddress, DUST_THRESHOLD};

/// Represents an open position for one (agent, wallet, token)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub agent_id: String,
    pub wallet_address: String,
    /// Token mint as received (venues may be case-sensitive)
    pub token_address: String,
    /// Lowercase lookup key
    pub token_key: String,
    pub token_symbol: String,

    /// Weighted-average entry price in SOL per token
    pub purchase_price: Decimal,
    /// Total tokens ever acquired, DCA included
    pub purchase_amount: Decimal,
    /// Cumulative SOL spent, fees included
    pub total_invested_sol: Decimal,
    /// Tokens currently held
    pub remaining_amount: Decimal,
    /// P&L already banked by partial sales
    pub realized_profit_sol: Decimal,
    /// Net SOL received from partial sales (take-profit and reduced-size exits)
    pub take_profit_proceeds_sol: Decimal,

    pub current_stop_loss_percentage: Option<Decimal>,
    pub peak_price: Option<Decimal>,
    pub last_stop_loss_update: Option<DateTime<Utc>>,
    /// Lifetime low since purchase
    pub lowest_price: Option<Decimal>,

    pub dca_count: u32,
    /// Configured DCA levels below this index are spent
    #[serde(default)]
    pub dca_levels_consumed: u32,
    pub last_dca_time: Option<DateTime<Utc>>,
    pub dca_transaction_ids: Vec<String>,

    pub take_profit_levels_hit: u32,
    pub take_profit_transaction_ids: Vec<String>,
    pub moon_bag_activated: bool,
    pub moon_bag_amount: Option<Decimal>,
    /// First level index of the current take-profit batch
    pub tp_batch_start_level: u32,
    /// Total levels known for this position across all batches
    pub total_take_profit_levels: u32,

    pub purchase_transaction_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields the poll loop may persist outside of a trade
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskUpdate {
    pub peak_price: Option<Decimal>,
    pub current_stop_loss_percentage: Option<Decimal>,
    pub lowest_price: Option<Decimal>,
}

impl RiskUpdate {
    pub fn is_empty(&self) -> bool {
        self.peak_price.is_none()
            && self.current_stop_loss_percentage.is_none()
            && self.lowest_price.is_none()
    }
}

impl Position {
    /// Create a position from a completed purchase
    pub fn new(
        agent_id: &str,
        wallet_address: &str,
        token: &TokenAddress,
        token_symbol: &str,
        tokens_bought: Decimal,
        sol_spent: Decimal,
        purchase_transaction_id: String,
    ) -> Self {
        let now = Utc::now();
        let purchase_price = if tokens_bought > Decimal::ZERO {
            sol_spent / tokens_bought
        } else {
            Decimal::ZERO
        };

        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            wallet_address: wallet_address.to_string(),
            token_address: token.original().to_string(),
            token_key: token.key().to_string(),
            token_symbol: token_symbol.to_string(),
            purchase_price,
            purchase_amount: tokens_bought,
            total_invested_sol: sol_spent,
            remaining_amount: tokens_bought,
            realized_profit_sol: Decimal::ZERO,
            take_profit_proceeds_sol: Decimal::ZERO,
            current_stop_loss_percentage: None,
            peak_price: None,
            last_stop_loss_update: None,
            lowest_price: Some(purchase_price),
            dca_count: 0,
            dca_levels_consumed: 0,
            last_dca_time: None,
            dca_transaction_ids: Vec::new(),
            take_profit_levels_hit: 0,
            take_profit_transaction_ids: Vec::new(),
            moon_bag_activated: false,
            moon_bag_amount: None,
            tp_batch_start_level: 0,
            total_take_profit_levels: 0,
            purchase_transaction_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn token(&self) -> TokenAddress {
        TokenAddress::new(&self.token_address)
    }

    /// Profit percentage at `price` relative to the average entry
    pub fn profit_percent(&self, price: Decimal) -> Option<Decimal> {
        percent_change(price, self.purchase_price)
    }

    /// Minutes since the position was opened
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes()
    }

    /// True when the remaining amount is below the dust threshold
    pub fn is_dust(&self) -> bool {
        is_dust(self.remaining_amount)
    }

    /// DCA mixed with take-profit sales at different average costs
    pub fn has_interleaved_dca(&self) -> bool {
        self.dca_count > 0 && self.take_profit_proceeds_sol > Decimal::ZERO
    }

    /// SOL cost attributable to the tokens still held
    pub fn remaining_cost_basis(&self) -> Decimal {
        if self.has_interleaved_dca() {
            self.total_invested_sol - self.take_profit_proceeds_sol + self.realized_profit_sol
        } else if self.purchase_amount > Decimal::ZERO {
            self.remaining_amount / self.purchase_amount * self.total_invested_sol
        } else {
            Decimal::ZERO
        }
    }

    /// Cost basis to release when selling `tokens_sold`
    pub fn cost_basis_for(&self, tokens_sold: Decimal) -> Decimal {
        if self.has_interleaved_dca() {
            if self.remaining_amount <= Decimal::ZERO {
                return Decimal::ZERO;
            }
            self.remaining_cost_basis() * (tokens_sold / self.remaining_amount)
        } else if self.purchase_amount > Decimal::ZERO {
            tokens_sold / self.purchase_amount * self.total_invested_sol
        } else {
            Decimal::ZERO
        }
    }

    /// Unrealized P&L of the held tokens at `price`
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.remaining_amount * price - self.remaining_cost_basis()
    }

    /// Fold a DCA fill into the cost basis
    pub fn apply_dca_fill(
        &mut self,
        tokens_bought: Decimal,
        sol_spent: Decimal,
        transaction_id: String,
        at: DateTime<Utc>,
    ) {
        let total_invested = self.total_invested_sol + sol_spent;
        let total_amount = self.purchase_amount + tokens_bought;
        if total_amount > Decimal::ZERO {
            self.purchase_price = total_invested / total_amount;
        }
        self.total_invested_sol = total_invested;
        self.purchase_amount = total_amount;
        self.remaining_amount += tokens_bought;
        self.dca_count += 1;
        self.last_dca_time = Some(at);
        self.dca_transaction_ids.push(transaction_id);
        self.updated_at = at;
    }

    /// Book a partial sale; returns the realized P&L of this sale
    pub fn apply_partial_sale(
        &mut self,
        tokens_sold: Decimal,
        net_sol_received: Decimal,
        at: DateTime<Utc>,
    ) -> Decimal {
        let tokens_sold = tokens_sold.min(self.remaining_amount);
        let realized = net_sol_received - self.cost_basis_for(tokens_sold);
        self.remaining_amount -= tokens_sold;
        if is_dust(self.remaining_amount) {
            self.remaining_amount = Decimal::ZERO;
        }
        self.realized_profit_sol += realized;
        self.take_profit_proceeds_sol += net_sol_received;
        self.updated_at = at;
        realized
    }

    /// Cash-flow P&L for a full close given the final sale's net proceeds
    pub fn close_profit(&self, final_net_sol: Decimal) -> Decimal {
        final_net_sol + self.take_profit_proceeds_sol - self.total_invested_sol
    }

    /// Apply a poll-loop risk update. Risk fields sit outside the
    /// `updated_at` version, so this never invalidates a trade in flight.
    pub fn apply_risk_update(&mut self, update: &RiskUpdate, at: DateTime<Utc>) {
        if let Some(peak) = update.peak_price {
            self.peak_price = Some(peak);
        }
        if let Some(pct) = update.current_stop_loss_percentage {
            self.current_stop_loss_percentage = Some(pct);
            self.last_stop_loss_update = Some(at);
        }
        if let Some(low) = update.lowest_price {
            self.lowest_price = Some(low);
        }
    }

    /// Fold risk fields written to `stored` since this copy was loaded:
    /// highest peak, lowest low, and the most recent stop-loss percentage
    pub fn merge_risk_state(&mut self, stored: &Position) {
        self.peak_price = match (self.peak_price, stored.peak_price) {
            (Some(ours), Some(theirs)) => Some(ours.max(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
        self.lowest_price = match (self.lowest_price, stored.lowest_price) {
            (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
        if stored.last_stop_loss_update > self.last_stop_loss_update {
            self.current_stop_loss_percentage = stored.current_stop_loss_percentage;
            self.last_stop_loss_update = stored.last_stop_loss_update;
        }
    }

    /// Structural invariants every persisted position must hold
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.purchase_price <= Decimal::ZERO {
            return Err(format!("position {} has non-positive purchase price", self.id));
        }
        if self.purchase_amount <= Decimal::ZERO {
            return Err(format!("position {} has non-positive purchase amount", self.id));
        }
        if self.remaining_amount.is_sign_negative() {
            return Err(format!("position {} has negative remaining amount", self.id));
        }
        if self.remaining_amount > self.purchase_amount {
            return Err(format!(
                "position {} remaining {} exceeds purchased {}",
                self.id, self.remaining_amount, self.purchase_amount
            ));
        }
        Ok(())
    }
}

pub fn is_dust(amount: Decimal) -> bool {
    amount < DUST_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::new(
            "agent",
            "wallet",
            &TokenAddress::new("MintAbc"),
            "ABC",
            dec!(1000),
            dec!(1000),
            "buy_sig".to_string(),
        )
    }

    #[test]
    fn test_position_creation() {
        let position = position();

        assert_eq!(position.purchase_price, dec!(1));
        assert_eq!(position.remaining_amount, dec!(1000));
        assert_eq!(position.token_key, "mintabc");
        assert_eq!(position.token_address, "MintAbc");
        assert!(position.check_invariants().is_ok());
    }

    #[test]
    fn test_dca_lowers_weighted_average() {
        let mut position = position();
        position.apply_dca_fill(dec!(500), dec!(420), "dca_sig".to_string(), Utc::now());

        assert_eq!(position.purchase_amount, dec!(1500));
        assert_eq!(position.total_invested_sol, dec!(1420));
        assert_eq!(position.purchase_price, dec!(1420) / dec!(1500));
        assert!(position.purchase_price < dec!(1));
        assert_eq!(position.dca_count, 1);
        assert_eq!(position.dca_transaction_ids, vec!["dca_sig".to_string()]);
    }

    #[test]
    fn test_partial_sale_proportional_basis() {
        let mut position = position();
        let realized = position.apply_partial_sale(dec!(250), dec!(500), Utc::now());

        // 250 of 1000 tokens carry 250 SOL of basis
        assert_eq!(realized, dec!(250));
        assert_eq!(position.remaining_amount, dec!(750));
        assert_eq!(position.remaining_cost_basis(), dec!(750));
        assert!(position.check_invariants().is_ok());
    }

    #[test]
    fn test_interleaved_basis_matches_average_price() {
        let mut position = position();
        position.apply_dca_fill(dec!(500), dec!(420), "dca_sig".to_string(), Utc::now());

        // Take profit at the post-DCA average price (no price change)
        let price = position.purchase_price;
        let sold = dec!(300);
        position.apply_partial_sale(sold, sold * price, Utc::now());

        assert!(position.has_interleaved_dca());
        let expected = position.purchase_price * position.remaining_amount;
        let diff = (position.remaining_cost_basis() - expected).abs();
        assert!(diff < dec!(0.000000001), "diff {}", diff);
    }

    #[test]
    fn test_interleaved_second_sale_uses_remaining_basis() {
        let mut position = position();
        position.apply_partial_sale(dec!(500), dec!(1000), Utc::now());
        position.apply_dca_fill(dec!(1000), dec!(500), "dca".to_string(), Utc::now());

        // Basis left: 500 (original half) + 500 (DCA) for 1500 tokens held
        assert_eq!(position.remaining_amount, dec!(1500));
        assert_eq!(position.remaining_cost_basis(), dec!(1000));
        assert_eq!(position.cost_basis_for(dec!(750)), dec!(500));
    }

    #[test]
    fn test_dust_sale_zeroes_remaining() {
        let mut position = position();
        position.apply_partial_sale(dec!(999.9999999999), dec!(1500), Utc::now());
        assert_eq!(position.remaining_amount, Decimal::ZERO);
        assert!(position.is_dust());
    }

    #[test]
    fn test_close_profit_counts_prior_take_profits() {
        let mut position = position();
        position.apply_partial_sale(dec!(500), dec!(750), Utc::now());
        assert_eq!(position.close_profit(dec!(600)), dec!(350));
    }
}

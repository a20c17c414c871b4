//! Stale-trade closure: positions held long enough inside a flat P&L band

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::Position;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaleTradeConfig {
    pub enabled: bool,
    pub min_hold_time_minutes: i64,
    pub min_profit_percent: Decimal,
    pub max_profit_percent: Decimal,
}

impl Default for StaleTradeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_hold_time_minutes: 1_440,
            min_profit_percent: dec!(-5),
            max_profit_percent: dec!(5),
        }
    }
}

impl StaleTradeConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_hold_time_minutes < 0 {
            return Err(EngineError::Validation(
                "stale_trade.min_hold_time_minutes must not be negative".to_string(),
            ));
        }
        // An inverted band is accepted and simply never fires
        Ok(())
    }
}

/// True when the position should be closed as stale; bounds are inclusive
pub fn evaluate_stale_trade(
    position: &Position,
    current_price: Decimal,
    config: &StaleTradeConfig,
    now: DateTime<Utc>,
) -> bool {
    if !config.enabled || config.min_profit_percent > config.max_profit_percent {
        return false;
    }
    if position.age_minutes(now) < config.min_hold_time_minutes {
        return false;
    }
    match position.profit_percent(current_price) {
        Some(profit) => profit >= config.min_profit_percent && profit <= config.max_profit_percent,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenAddress;

    fn aged_position(minutes: i64) -> Position {
        let mut position = Position::new(
            "agent",
            "wallet",
            &TokenAddress::new("Mint"),
            "MNT",
            dec!(1000),
            dec!(1000),
            "buy".to_string(),
        );
        position.created_at = Utc::now() - chrono::Duration::minutes(minutes);
        position
    }

    fn band(min: Decimal, max: Decimal) -> StaleTradeConfig {
        StaleTradeConfig {
            enabled: true,
            min_hold_time_minutes: 60,
            min_profit_percent: min,
            max_profit_percent: max,
        }
    }

    #[test]
    fn test_flat_position_past_hold_time() {
        let position = aged_position(61);
        let config = band(dec!(1), dec!(10));

        assert!(evaluate_stale_trade(&position, dec!(1.05), &config, Utc::now()));
        assert!(!evaluate_stale_trade(&position, dec!(1.15), &config, Utc::now()));
    }

    #[test]
    fn test_hold_time_not_reached() {
        let position = aged_position(30);
        assert!(!evaluate_stale_trade(&position, dec!(1.05), &band(dec!(1), dec!(10)), Utc::now()));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let position = aged_position(120);
        let config = band(dec!(1), dec!(10));

        assert!(evaluate_stale_trade(&position, dec!(1.01), &config, Utc::now()));
        assert!(evaluate_stale_trade(&position, dec!(1.10), &config, Utc::now()));
        assert!(!evaluate_stale_trade(&position, dec!(1.0099), &config, Utc::now()));
    }

    #[test]
    fn test_negative_and_straddling_bands() {
        let position = aged_position(120);

        assert!(evaluate_stale_trade(&position, dec!(0.95), &band(dec!(-10), dec!(-2)), Utc::now()));
        assert!(evaluate_stale_trade(&position, dec!(1), &band(dec!(-3), dec!(3)), Utc::now()));
    }

    #[test]
    fn test_inverted_band_never_fires() {
        let position = aged_position(10_000);
        let config = band(dec!(10), dec!(1));
        for price in [dec!(0.5), dec!(1.01), dec!(1.05), dec!(1.1), dec!(2)] {
            assert!(!evaluate_stale_trade(&position, price, &config, Utc::now()));
        }
        assert!(config.validate().is_ok());
    }
}

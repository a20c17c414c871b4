//! Take-profit ladder with optional moon bag

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::{is_dust, Position};

/// A gain target and the share of the position to sell when it is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    /// Gain over the average entry price, in percent
    pub target_gain_percent: Decimal,
    /// Percent of `purchase_amount` to sell
    pub sell_percent: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitConfig {
    pub enabled: bool,
    pub levels: Vec<TakeProfitLevel>,
    /// Percent of `purchase_amount` kept after the final level
    pub moon_bag_percent: Option<Decimal>,
}

impl TakeProfitConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.levels.is_empty() {
            return Err(EngineError::Validation(
                "take_profit is enabled without levels".to_string(),
            ));
        }
        for level in &self.levels {
            if level.target_gain_percent <= Decimal::ZERO {
                return Err(EngineError::Validation(format!(
                    "take_profit target {} must be positive",
                    level.target_gain_percent
                )));
            }
            if level.sell_percent <= Decimal::ZERO || level.sell_percent > Decimal::ONE_HUNDRED {
                return Err(EngineError::Validation(format!(
                    "take_profit sell_percent {} must be within (0, 100]",
                    level.sell_percent
                )));
            }
        }
        if self
            .levels
            .windows(2)
            .any(|w| w[0].target_gain_percent >= w[1].target_gain_percent)
        {
            return Err(EngineError::Validation(
                "take_profit levels must be strictly ascending".to_string(),
            ));
        }
        if let Some(moon) = self.moon_bag_percent {
            if moon < Decimal::ZERO || moon >= Decimal::ONE_HUNDRED {
                return Err(EngineError::Validation(format!(
                    "take_profit moon_bag_percent {} must be within [0, 100)",
                    moon
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TakeProfitDecision {
    pub should_execute: bool,
    /// Absolute level indices crossed by this tick
    pub levels_to_execute: Vec<u32>,
    pub sell_amount: Decimal,
    pub activate_moon_bag: bool,
    pub moon_bag_amount: Decimal,
    pub new_remaining_amount: Decimal,
    /// First absolute index of the batch these levels belong to
    pub tp_batch_start_level: u32,
    /// Absolute level count once this batch is fully hit
    pub total_take_profit_levels: u32,
}

impl TakeProfitDecision {
    /// Levels hit once this decision is applied
    pub fn levels_hit_after(&self) -> u32 {
        self.levels_to_execute
            .last()
            .map(|last| last + 1)
            .unwrap_or(self.tp_batch_start_level)
    }

    /// Selling everything with nothing retained closes the position
    pub fn closes_position(&self) -> bool {
        self.new_remaining_amount.is_zero() && !self.activate_moon_bag
    }
}

/// Which configured levels the current price crosses, if any
pub fn evaluate_take_profit(
    position: &Position,
    current_price: Decimal,
    config: &TakeProfitConfig,
) -> Option<TakeProfitDecision> {
    if !config.enabled || config.levels.is_empty() || position.moon_bag_activated {
        return None;
    }
    if position.remaining_amount <= Decimal::ZERO || position.purchase_price <= Decimal::ZERO {
        return None;
    }

    let batch_start = position.tp_batch_start_level;
    let next = position.take_profit_levels_hit.saturating_sub(batch_start) as usize;
    if next >= config.levels.len() {
        return None;
    }

    let gain = (current_price - position.purchase_price) / position.purchase_price
        * Decimal::ONE_HUNDRED;

    let crossed: Vec<usize> = (next..config.levels.len())
        .take_while(|&i| gain >= config.levels[i].target_gain_percent)
        .collect();
    let last_crossed = *crossed.last()?;

    let final_level = last_crossed == config.levels.len() - 1;
    let remaining = position.remaining_amount;

    let (sell_amount, activate_moon_bag, moon_bag_amount) = if final_level {
        let moon_bag = config
            .moon_bag_percent
            .filter(|pct| *pct > Decimal::ZERO)
            .map(|pct| (position.purchase_amount * pct / Decimal::ONE_HUNDRED).min(remaining))
            .unwrap_or(Decimal::ZERO);
        (remaining - moon_bag, moon_bag > Decimal::ZERO, moon_bag)
    } else {
        let pct: Decimal = crossed.iter().map(|&i| config.levels[i].sell_percent).sum();
        let amount = (position.purchase_amount * pct / Decimal::ONE_HUNDRED).min(remaining);
        (amount, false, Decimal::ZERO)
    };

    if is_dust(sell_amount) {
        return None;
    }

    let mut new_remaining = remaining - sell_amount;
    if is_dust(new_remaining) {
        new_remaining = Decimal::ZERO;
    }

    Some(TakeProfitDecision {
        should_execute: true,
        levels_to_execute: crossed.iter().map(|&i| batch_start + i as u32).collect(),
        sell_amount,
        activate_moon_bag,
        moon_bag_amount,
        new_remaining_amount: new_remaining,
        tp_batch_start_level: batch_start,
        total_take_profit_levels: batch_start + config.levels.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenAddress;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::new(
            "agent",
            "wallet",
            &TokenAddress::new("Mint"),
            "MNT",
            dec!(1000),
            dec!(1000),
            "buy".to_string(),
        )
    }

    fn ladder(moon_bag: Option<Decimal>) -> TakeProfitConfig {
        TakeProfitConfig {
            enabled: true,
            levels: vec![
                TakeProfitLevel {
                    target_gain_percent: dec!(50),
                    sell_percent: dec!(25),
                },
                TakeProfitLevel {
                    target_gain_percent: dec!(100),
                    sell_percent: dec!(25),
                },
                TakeProfitLevel {
                    target_gain_percent: dec!(200),
                    sell_percent: dec!(25),
                },
            ],
            moon_bag_percent: moon_bag,
        }
    }

    #[test]
    fn test_single_level() {
        let decision = evaluate_take_profit(&position(), dec!(1.6), &ladder(None)).unwrap();
        assert_eq!(decision.levels_to_execute, vec![0]);
        assert_eq!(decision.sell_amount, dec!(250));
        assert_eq!(decision.new_remaining_amount, dec!(750));
        assert_eq!(decision.levels_hit_after(), 1);
        assert!(!decision.closes_position());
    }

    #[test]
    fn test_price_jump_crosses_multiple_levels() {
        let decision = evaluate_take_profit(&position(), dec!(2.5), &ladder(None)).unwrap();
        assert_eq!(decision.levels_to_execute, vec![0, 1]);
        assert_eq!(decision.sell_amount, dec!(500));
    }

    #[test]
    fn test_below_first_level() {
        assert!(evaluate_take_profit(&position(), dec!(1.49), &ladder(None)).is_none());
    }

    #[test]
    fn test_final_level_liquidates_or_keeps_moon_bag() {
        let mut position = position();
        position.take_profit_levels_hit = 2;
        position.remaining_amount = dec!(500);

        let full = evaluate_take_profit(&position, dec!(3), &ladder(None)).unwrap();
        assert_eq!(full.sell_amount, dec!(500));
        assert!(full.closes_position());

        let moon = evaluate_take_profit(&position, dec!(3), &ladder(Some(dec!(10)))).unwrap();
        assert!(moon.activate_moon_bag);
        assert_eq!(moon.moon_bag_amount, dec!(100));
        assert_eq!(moon.sell_amount, dec!(400));
        assert_eq!(moon.new_remaining_amount, dec!(100));
        assert!(!moon.closes_position());
    }

    #[test]
    fn test_sell_amount_capped_at_remaining() {
        let mut position = position();
        position.remaining_amount = dec!(100);
        let decision = evaluate_take_profit(&position, dec!(2.5), &ladder(None)).unwrap();
        assert_eq!(decision.sell_amount, dec!(100));
        assert_eq!(decision.new_remaining_amount, dec!(0));
    }

    #[test]
    fn test_appended_batch_uses_absolute_indices() {
        let mut position = position();
        position.take_profit_levels_hit = 3;
        position.tp_batch_start_level = 3;
        position.total_take_profit_levels = 6;

        let decision = evaluate_take_profit(&position, dec!(1.7), &ladder(None)).unwrap();
        assert_eq!(decision.levels_to_execute, vec![3]);
        assert_eq!(decision.total_take_profit_levels, 6);
        assert_eq!(decision.levels_hit_after(), 4);
    }

    #[test]
    fn test_all_levels_hit() {
        let mut position = position();
        position.take_profit_levels_hit = 3;
        assert!(evaluate_take_profit(&position, dec!(10), &ladder(None)).is_none());

        position.take_profit_levels_hit = 0;
        position.moon_bag_activated = true;
        assert!(evaluate_take_profit(&position, dec!(10), &ladder(None)).is_none());
    }

    #[test]
    fn test_validation() {
        assert!(ladder(Some(dec!(5))).validate().is_ok());
        assert!(TakeProfitConfig::default().validate().is_ok());

        let mut unordered = ladder(None);
        unordered.levels.swap(0, 1);
        assert!(unordered.validate().is_err());

        assert!(ladder(Some(dec!(100))).validate().is_err());
    }
}

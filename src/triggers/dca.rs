//! Dollar-cost averaging into losing positions
//!
//! Executing a level spends it and every shallower one, so only levels deeper
//! than the last executed remain candidates. Drops are measured against the
//! average entry price.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::Position;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcaLevel {
    /// Drop from the average entry, negative percent
    pub drop_percent: Decimal,
    /// Percent of the current position value to buy
    pub buy_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcaConfig {
    pub enabled: bool,
    pub levels: Vec<DcaLevel>,
    pub max_dca_count: u32,
    pub cooldown_minutes: i64,
    /// Buys smaller than this are not worth the fees
    pub min_buy_sol: Decimal,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            levels: Vec::new(),
            max_dca_count: 3,
            cooldown_minutes: 5,
            min_buy_sol: dec!(0.001),
        }
    }
}

impl DcaConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.levels.is_empty() {
            return Err(EngineError::Validation("dca is enabled without levels".to_string()));
        }
        for level in &self.levels {
            if level.drop_percent >= Decimal::ZERO || level.drop_percent <= dec!(-100) {
                return Err(EngineError::Validation(format!(
                    "dca drop_percent {} must be within (-100, 0)",
                    level.drop_percent
                )));
            }
            if level.buy_percent <= Decimal::ZERO {
                return Err(EngineError::Validation(format!(
                    "dca buy_percent {} must be positive",
                    level.buy_percent
                )));
            }
        }
        if self
            .levels
            .windows(2)
            .any(|w| w[0].drop_percent <= w[1].drop_percent)
        {
            return Err(EngineError::Validation(
                "dca levels must get strictly deeper".to_string(),
            ));
        }
        if self.cooldown_minutes < 0 || self.min_buy_sol < Decimal::ZERO {
            return Err(EngineError::Validation(
                "dca cooldown and minimum buy must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DcaDecision {
    pub should_trigger: bool,
    /// Index into the configured levels
    pub trigger_level: usize,
    pub drop_percent: Decimal,
    pub buy_amount_sol: Decimal,
    /// Position's DCA count when evaluated; identifies this trigger instance
    pub dca_count: u32,
}

/// Deepest uncrossed level the current price satisfies, if any
pub fn evaluate_dca(
    position: &Position,
    current_price: Decimal,
    config: &DcaConfig,
    now: DateTime<Utc>,
) -> Option<DcaDecision> {
    if !config.enabled || position.moon_bag_activated {
        return None;
    }
    if position.dca_count >= config.max_dca_count {
        return None;
    }
    if let Some(last) = position.last_dca_time {
        if now < last + Duration::minutes(config.cooldown_minutes) {
            return None;
        }
    }

    let drop = position.profit_percent(current_price)?;
    let first_candidate = position.dca_levels_consumed as usize;
    if first_candidate >= config.levels.len() {
        return None;
    }

    let (index, level) = config
        .levels
        .iter()
        .enumerate()
        .skip(first_candidate)
        .filter(|(_, level)| drop <= level.drop_percent)
        .last()?;

    let position_value = position.remaining_amount * current_price;
    let buy_amount_sol = position_value * level.buy_percent / Decimal::ONE_HUNDRED;
    if buy_amount_sol < config.min_buy_sol || buy_amount_sol <= Decimal::ZERO {
        return None;
    }

    Some(DcaDecision {
        should_trigger: true,
        trigger_level: index,
        drop_percent: level.drop_percent,
        buy_amount_sol,
        dca_count: position.dca_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenAddress;

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

    fn config() -> DcaConfig {
        DcaConfig {
            enabled: true,
            levels: vec![
                DcaLevel {
                    drop_percent: dec!(-15),
                    buy_percent: dec!(50),
                },
                DcaLevel {
                    drop_percent: dec!(-30),
                    buy_percent: dec!(100),
                },
            ],
            max_dca_count: 2,
            cooldown_minutes: 10,
            min_buy_sol: dec!(0.01),
        }
    }

    #[test]
    fn test_first_level_buys_half_of_position_value() {
        let mut position = position();
        let decision = evaluate_dca(&position, dec!(0.84), &config(), Utc::now()).unwrap();

        assert_eq!(decision.trigger_level, 0);
        assert_eq!(decision.buy_amount_sol, dec!(420));

        // Fill at the trigger price lowers the weighted average
        let tokens = decision.buy_amount_sol / dec!(0.84);
        position.apply_dca_fill(tokens, decision.buy_amount_sol, "dca".to_string(), Utc::now());
        assert!(position.purchase_price < dec!(1));
        assert_eq!(position.purchase_price, dec!(1420) / dec!(1500));
    }

    #[test]
    fn test_deepest_satisfied_level_wins() {
        let decision = evaluate_dca(&position(), dec!(0.6), &config(), Utc::now()).unwrap();
        assert_eq!(decision.trigger_level, 1);
        assert_eq!(decision.drop_percent, dec!(-30));
    }

    #[test]
    fn test_consumed_levels_are_skipped() {
        let mut position = position();
        position.dca_count = 1;
        position.dca_levels_consumed = 1;
        // Only -15% reached; level 0 already used
        assert!(evaluate_dca(&position, dec!(0.84), &config(), Utc::now()).is_none());
        // -30% is still open
        assert_eq!(
            evaluate_dca(&position, dec!(0.6), &config(), Utc::now()).unwrap().trigger_level,
            1
        );
    }

    #[test]
    fn test_gap_down_to_deepest_level_spends_all_levels() {
        let mut config = config();
        config.levels[0].buy_percent = dec!(10);
        config.levels[1].buy_percent = dec!(10);
        config.cooldown_minutes = 0;
        let mut position = position();

        let decision = evaluate_dca(&position, dec!(0.6), &config, Utc::now()).unwrap();
        assert_eq!(decision.trigger_level, 1);

        let tokens = decision.buy_amount_sol / dec!(0.6);
        position.apply_dca_fill(tokens, decision.buy_amount_sol, "dca".to_string(), Utc::now());
        position.dca_levels_consumed = decision.trigger_level as u32 + 1;

        assert!(evaluate_dca(&position, dec!(0.6), &config, Utc::now()).is_none());
        assert!(evaluate_dca(&position, dec!(0.3), &config, Utc::now()).is_none());
    }

    #[test]
    fn test_cooldown_and_max_count() {
        let mut position = position();
        position.last_dca_time = Some(Utc::now() - Duration::minutes(5));
        assert!(evaluate_dca(&position, dec!(0.5), &config(), Utc::now()).is_none());

        position.last_dca_time = Some(Utc::now() - Duration::minutes(11));
        assert!(evaluate_dca(&position, dec!(0.5), &config(), Utc::now()).is_some());

        position.dca_count = 2;
        assert!(evaluate_dca(&position, dec!(0.5), &config(), Utc::now()).is_none());
    }

    #[test]
    fn test_no_dca_on_gain_or_with_moon_bag() {
        let mut position = position();
        assert!(evaluate_dca(&position, dec!(1.1), &config(), Utc::now()).is_none());

        position.moon_bag_activated = true;
        assert!(evaluate_dca(&position, dec!(0.5), &config(), Utc::now()).is_none());
    }

    #[test]
    fn test_validation() {
        assert!(config().validate().is_ok());

        let mut positive = config();
        positive.levels[0].drop_percent = dec!(5);
        assert!(positive.validate().is_err());

        let mut shallower = config();
        shallower.levels.swap(0, 1);
        assert!(shallower.validate().is_err());
    }
}

//! Trailing stop-loss
//!
//! The allowed drawdown is a function of the peak gain over the average entry
//! price. It is only recomputed when a new peak is observed and never loosens.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::state::{Position, RiskUpdate};
use crate::types::percent_change;

/// One row of a gain → stop-loss table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossZone {
    /// Peak gain over entry, in percent
    pub gain_percent: Decimal,
    /// Allowed drawdown from peak (negative)
    pub stop_loss_percentage: Decimal,
}

/// How the drawdown tightens as the peak rises
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrailingMode {
    /// Tighten by `tighten_percent` for every `step_gain_percent` of gain
    Fixed {
        step_gain_percent: Decimal,
        tighten_percent: Decimal,
        max_percentage: Decimal,
    },
    /// Approach `max_percentage` exponentially as gain grows
    Exponential { decay: f64, max_percentage: Decimal },
    /// Step table: highest zone whose gain has been reached wins
    Zones { zones: Vec<StopLossZone> },
    /// Linear interpolation between table points
    Custom { points: Vec<StopLossZone> },
}

impl Default for TrailingMode {
    fn default() -> Self {
        TrailingMode::Fixed {
            step_gain_percent: dec!(50),
            tighten_percent: dec!(10),
            max_percentage: dec!(-5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopLossConfig {
    pub enabled: bool,
    /// Drawdown allowed before any gain (negative)
    pub initial_percentage: Decimal,
    pub mode: TrailingMode,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_percentage: dec!(-30),
            mode: TrailingMode::default(),
        }
    }
}

fn check_percentage(name: &str, value: Decimal) -> EngineResult<()> {
    if value >= Decimal::ZERO || value <= dec!(-100) {
        return Err(EngineError::Validation(format!(
            "stop_loss.{} must be within (-100, 0), got {}",
            name, value
        )));
    }
    Ok(())
}

fn check_table(name: &str, rows: &[StopLossZone]) -> EngineResult<()> {
    if rows.is_empty() {
        return Err(EngineError::Validation(format!("stop_loss.{} is empty", name)));
    }
    for row in rows {
        check_percentage(name, row.stop_loss_percentage)?;
    }
    if rows.windows(2).any(|w| w[0].gain_percent >= w[1].gain_percent) {
        return Err(EngineError::Validation(format!(
            "stop_loss.{} gains must be strictly ascending",
            name
        )));
    }
    Ok(())
}

impl StopLossConfig {
    pub fn validate(&self) -> EngineResult<()> {
        check_percentage("initial_percentage", self.initial_percentage)?;
        match &self.mode {
            TrailingMode::Fixed {
                step_gain_percent,
                tighten_percent,
                max_percentage,
            } => {
                if *step_gain_percent <= Decimal::ZERO || *tighten_percent < Decimal::ZERO {
                    return Err(EngineError::Validation(
                        "stop_loss fixed mode needs a positive step and non-negative tightening"
                            .to_string(),
                    ));
                }
                check_percentage("max_percentage", *max_percentage)?;
            }
            TrailingMode::Exponential {
                decay,
                max_percentage,
            } => {
                if !decay.is_finite() || *decay <= 0.0 {
                    return Err(EngineError::Validation(
                        "stop_loss exponential decay must be positive".to_string(),
                    ));
                }
                check_percentage("max_percentage", *max_percentage)?;
            }
            TrailingMode::Zones { zones } => check_table("zones", zones)?,
            TrailingMode::Custom { points } => check_table("points", points)?,
        }
        Ok(())
    }

    /// Stop-loss percentage for a given peak gain
    pub fn percentage_for_gain(&self, gain_percent: Decimal) -> Decimal {
        let initial = self.initial_percentage;
        if gain_percent <= Decimal::ZERO {
            return initial;
        }

        match &self.mode {
            TrailingMode::Fixed {
                step_gain_percent,
                tighten_percent,
                max_percentage,
            } => {
                let steps = (gain_percent / step_gain_percent).floor();
                (initial + steps * tighten_percent).min(*max_percentage)
            }
            TrailingMode::Exponential {
                decay,
                max_percentage,
            } => {
                let gain = gain_percent.to_f64().unwrap_or(0.0) / 100.0;
                let span = (initial - max_percentage).to_f64().unwrap_or(0.0);
                let curve = max_percentage.to_f64().unwrap_or(0.0) + span * (-decay * gain).exp();
                Decimal::from_f64(curve)
                    .map(|pct| pct.round_dp(4))
                    .unwrap_or(initial)
                    .min(*max_percentage)
            }
            TrailingMode::Zones { zones } => zones
                .iter()
                .rev()
                .find(|zone| gain_percent >= zone.gain_percent)
                .map(|zone| zone.stop_loss_percentage)
                .unwrap_or(initial),
            TrailingMode::Custom { points } => interpolate(points, gain_percent, initial),
        }
    }
}

fn interpolate(points: &[StopLossZone], gain: Decimal, fallback: Decimal) -> Decimal {
    let Some(first) = points.first() else {
        return fallback;
    };
    if gain < first.gain_percent {
        return fallback;
    }
    for pair in points.windows(2) {
        let (lo, hi) = (&pair[0], &pair[1]);
        if gain <= hi.gain_percent {
            let t = (gain - lo.gain_percent) / (hi.gain_percent - lo.gain_percent);
            return lo.stop_loss_percentage + t * (hi.stop_loss_percentage - lo.stop_loss_percentage);
        }
    }
    points
        .last()
        .map(|p| p.stop_loss_percentage)
        .unwrap_or(fallback)
}

/// Outcome of one stop-loss check
#[derive(Debug, Clone, PartialEq)]
pub struct StopLossDecision {
    pub should_trigger: bool,
    pub stop_loss_price: Decimal,
    pub current_stop_loss_percentage: Decimal,
    pub peak_price: Decimal,
    /// Peak or percentage changed and should be persisted
    pub updated: bool,
}

impl StopLossDecision {
    pub fn risk_update(&self) -> Option<RiskUpdate> {
        self.updated.then(|| RiskUpdate {
            peak_price: Some(self.peak_price),
            current_stop_loss_percentage: Some(self.current_stop_loss_percentage),
            lowest_price: None,
        })
    }
}

/// Initial trailing state for a freshly opened position
pub fn initial_state(purchase_price: Decimal, config: &StopLossConfig) -> (Decimal, Decimal) {
    (purchase_price, config.initial_percentage)
}

/// Evaluate the trailing stop; `None` when stop-loss is disabled
pub fn evaluate_stop_loss(
    position: &Position,
    current_price: Decimal,
    config: &StopLossConfig,
) -> Option<StopLossDecision> {
    if !config.enabled {
        return None;
    }

    let uninitialized =
        position.peak_price.is_none() || position.current_stop_loss_percentage.is_none();
    let (initial_peak, initial_pct) = initial_state(position.purchase_price, config);
    let mut peak = position.peak_price.unwrap_or(initial_peak);
    let mut percentage = position.current_stop_loss_percentage.unwrap_or(initial_pct);
    let mut updated = uninitialized;

    if current_price > peak {
        peak = current_price;
        let gain = percent_change(peak, position.purchase_price).unwrap_or(Decimal::ZERO);
        let computed = config.percentage_for_gain(gain);
        // Never loosen
        percentage = percentage.max(computed);
        updated = true;
    }

    let stop_loss_price = peak * (Decimal::ONE + percentage / Decimal::ONE_HUNDRED);

    Some(StopLossDecision {
        should_trigger: current_price <= stop_loss_price,
        stop_loss_price,
        current_stop_loss_percentage: percentage,
        peak_price: peak,
        updated,
    })
}

//! Stop-Loss Policy
//!
//! Pure mapping from favorable price movement to a target protective stop.
//!
//! # Rules
//!
//! - [`StopLossRule::Stepped`]: every `step_percent` of favorable movement
//!   raises the stop by `raise_percent` of the entry price. With the
//!   reference parameters (10 / 10 / 5) a 10% gain locks in 105% of entry,
//!   a 20% gain 110%, and so on.
//! - [`StopLossRule::Banded`]: trails the current price, keeping a fraction
//!   of it that depends on how far the position has run.
//!
//! Both rules only activate once the change reaches `trigger_percent`
//! (inclusive), and [`StopLossPolicy::evaluate`] only emits a stop that is
//! strictly more favorable than the current one. Stops never loosen.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::position::PositionSide;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Decimal places kept for trailing-band stops.
pub const BANDED_STOP_SCALE: u32 = 8;

// =============================================================================
// Rule Configuration
// =============================================================================

/// One band of the trailing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingBand {
    /// Minimum favorable change (percent, inclusive) for this band.
    pub min_change_percent: Decimal,
    /// Fraction of the current price kept as the stop (long side).
    pub keep_ratio: Decimal,
}

impl TrailingBand {
    /// Create a band.
    #[must_use]
    pub const fn new(min_change_percent: Decimal, keep_ratio: Decimal) -> Self {
        Self {
            min_change_percent,
            keep_ratio,
        }
    }
}

/// Escalation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopLossRule {
    /// Stop moves to `100 + raise_percent * floor(change / step_percent)`
    /// percent of entry.
    Stepped {
        /// Change (percent) at which escalation starts.
        trigger_percent: Decimal,
        /// Width of one step (percent).
        step_percent: Decimal,
        /// Stop raise per step (percent of entry).
        raise_percent: Decimal,
    },
    /// Stop trails the current price by a band-dependent fraction.
    Banded {
        /// Change (percent) at which escalation starts.
        trigger_percent: Decimal,
        /// Bands, highest threshold first.
        bands: Vec<TrailingBand>,
    },
}

impl StopLossRule {
    /// The reference stepped rule: trigger 10%, step 10%, raise 5%.
    #[must_use]
    pub const fn stepped_reference() -> Self {
        Self::Stepped {
            trigger_percent: Decimal::TEN,
            step_percent: Decimal::TEN,
            raise_percent: Decimal::from_parts(5, 0, 0, false, 0),
        }
    }

    /// The reference banded rule, triggering at 10%.
    #[must_use]
    pub fn banded_reference() -> Self {
        Self::banded(Decimal::TEN)
    }

    /// Default trailing bands with a custom trigger: `>=20% → 0.85`,
    /// `>=15% → 0.80`, else `0.75`.
    #[must_use]
    pub fn banded(trigger_percent: Decimal) -> Self {
        Self::Banded {
            trigger_percent,
            bands: vec![
                TrailingBand::new(Decimal::from(20), Decimal::new(85, 2)),
                TrailingBand::new(Decimal::from(15), Decimal::new(80, 2)),
                TrailingBand::new(Decimal::ZERO, Decimal::new(75, 2)),
            ],
        }
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stepped { .. } => "stepped",
            Self::Banded { .. } => "banded",
        }
    }

    const fn trigger_percent(&self) -> Decimal {
        match self {
            Self::Stepped {
                trigger_percent, ..
            }
            | Self::Banded {
                trigger_percent, ..
            } => *trigger_percent,
        }
    }
}

impl Default for StopLossRule {
    fn default() -> Self {
        Self::stepped_reference()
    }
}

/// Invalid policy parameters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// A parameter is out of its valid range.
    #[error("invalid stop-loss parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: Decimal,
    },

    /// The banded rule has no bands or they are not ordered.
    #[error("trailing bands must be non-empty and ordered by descending threshold")]
    InvalidBands,
}

// =============================================================================
// Policy
// =============================================================================

/// Stop-loss policy: seeding and escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopLossPolicy {
    rule: StopLossRule,
    initial_ratio: Decimal,
}

impl Default for StopLossPolicy {
    fn default() -> Self {
        Self::reference()
    }
}

impl StopLossPolicy {
    /// Create a policy, validating its parameters.
    ///
    /// `initial_ratio` is the fraction of entry used to seed long stops
    /// (shorts use the mirror image, `2 - initial_ratio`).
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if a percentage is not positive, the ratio is
    /// outside `(0, 1)`, or bands are empty, unordered or out of range.
    pub fn new(rule: StopLossRule, initial_ratio: Decimal) -> Result<Self, PolicyError> {
        if initial_ratio <= Decimal::ZERO || initial_ratio >= Decimal::ONE {
            return Err(PolicyError::InvalidParameter {
                name: "initial_ratio",
                value: initial_ratio,
            });
        }

        match &rule {
            StopLossRule::Stepped {
                trigger_percent,
                step_percent,
                raise_percent,
            } => {
                for (name, value) in [
                    ("trigger_percent", *trigger_percent),
                    ("step_percent", *step_percent),
                    ("raise_percent", *raise_percent),
                ] {
                    if value <= Decimal::ZERO {
                        return Err(PolicyError::InvalidParameter { name, value });
                    }
                }
            }
            StopLossRule::Banded {
                trigger_percent,
                bands,
            } => {
                if *trigger_percent <= Decimal::ZERO {
                    return Err(PolicyError::InvalidParameter {
                        name: "trigger_percent",
                        value: *trigger_percent,
                    });
                }
                let ordered = bands
                    .windows(2)
                    .all(|pair| pair[0].min_change_percent > pair[1].min_change_percent);
                let ratios_valid = bands
                    .iter()
                    .all(|band| band.keep_ratio > Decimal::ZERO && band.keep_ratio < Decimal::ONE);
                if bands.is_empty() || !ordered || !ratios_valid {
                    return Err(PolicyError::InvalidBands);
                }
            }
        }

        Ok(Self {
            rule,
            initial_ratio,
        })
    }

    /// Reference policy: stepped 10/10/5 with a 95% seed.
    #[must_use]
    pub const fn reference() -> Self {
        Self {
            rule: StopLossRule::stepped_reference(),
            initial_ratio: Decimal::from_parts(95, 0, 0, false, 2),
        }
    }

    /// Active rule.
    #[must_use]
    pub const fn rule(&self) -> &StopLossRule {
        &self.rule
    }

    /// Seed ratio for long positions.
    #[must_use]
    pub const fn initial_ratio(&self) -> Decimal {
        self.initial_ratio
    }

    /// Seed stop for a newly observed position.
    ///
    /// A venue-reported stop wins if it is already more protective.
    #[must_use]
    pub fn initial_stop(
        &self,
        side: PositionSide,
        entry_price: Decimal,
        venue_stop: Option<Decimal>,
    ) -> Decimal {
        let seed = match side {
            PositionSide::Long => entry_price * self.initial_ratio,
            PositionSide::Short => entry_price * (Decimal::TWO - self.initial_ratio),
        };

        match venue_stop {
            Some(stop) if stop > Decimal::ZERO && Self::is_more_favorable(side, stop, seed) => stop,
            _ => seed,
        }
    }

    /// Favorable price change in percent.
    ///
    /// Positive when the position is in profit, for either side. Returns
    /// `None` when `entry_price` is not positive.
    #[must_use]
    pub fn price_change_percent(
        side: PositionSide,
        entry_price: Decimal,
        current_price: Decimal,
    ) -> Option<Decimal> {
        if entry_price <= Decimal::ZERO {
            return None;
        }
        let delta = match side {
            PositionSide::Long => current_price - entry_price,
            PositionSide::Short => entry_price - current_price,
        };
        (delta * HUNDRED).checked_div(entry_price)
    }

    /// Whether `candidate` protects more than `current` for `side`.
    #[must_use]
    pub fn is_more_favorable(side: PositionSide, candidate: Decimal, current: Decimal) -> bool {
        match side {
            PositionSide::Long => candidate > current,
            PositionSide::Short => candidate < current,
        }
    }

    /// Target stop implied by the rule at `current_price`, ignoring the
    /// ratchet. `None` below the trigger.
    #[must_use]
    pub fn candidate_stop(
        &self,
        side: PositionSide,
        entry_price: Decimal,
        current_price: Decimal,
    ) -> Option<Decimal> {
        let change = Self::price_change_percent(side, entry_price, current_price)?;
        if change < self.rule.trigger_percent() {
            return None;
        }

        let candidate = match &self.rule {
            StopLossRule::Stepped {
                step_percent,
                raise_percent,
                ..
            } => {
                let steps = change.checked_div(*step_percent)?.floor();
                let offset = *raise_percent * steps;
                let target_percent = match side {
                    PositionSide::Long => HUNDRED + offset,
                    PositionSide::Short => HUNDRED - offset,
                };
                entry_price * target_percent / HUNDRED
            }
            StopLossRule::Banded { bands, .. } => {
                let band = bands
                    .iter()
                    .find(|band| change >= band.min_change_percent)?;
                let ratio = match side {
                    PositionSide::Long => band.keep_ratio,
                    PositionSide::Short => Decimal::TWO - band.keep_ratio,
                };
                (current_price * ratio).round_dp(BANDED_STOP_SCALE)
            }
        };

        (candidate > Decimal::ZERO).then_some(candidate)
    }

    /// Escalation decision for one price observation.
    ///
    /// Returns the new stop only if it is strictly more favorable than
    /// `current_stop`; equal or looser candidates are no-ops.
    #[must_use]
    pub fn evaluate(
        &self,
        side: PositionSide,
        entry_price: Decimal,
        current_stop: Decimal,
        current_price: Decimal,
    ) -> Option<Decimal> {
        self.candidate_stop(side, entry_price, current_price)
            .filter(|candidate| Self::is_more_favorable(side, *candidate, current_stop))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;

    #[test_case(dec!(109.999), None ; "just below first tier")]
    #[test_case(dec!(110), Some(dec!(105)) ; "first tier boundary is inclusive")]
    #[test_case(dec!(119.999), Some(dec!(105)) ; "still first tier")]
    #[test_case(dec!(120), Some(dec!(110)) ; "second tier boundary")]
    #[test_case(dec!(135), Some(dec!(115)) ; "third tier")]
    fn stepped_tiers_for_long(price: Decimal, expected: Option<Decimal>) {
        let policy = StopLossPolicy::reference();
        assert_eq!(
            policy.evaluate(PositionSide::Long, dec!(100), dec!(95), price),
            expected
        );
    }

    #[test_case(dec!(90.001), None ; "just below first tier")]
    #[test_case(dec!(90), Some(dec!(95)) ; "first tier")]
    #[test_case(dec!(80), Some(dec!(90)) ; "second tier")]
    fn stepped_tiers_for_short(price: Decimal, expected: Option<Decimal>) {
        let policy = StopLossPolicy::reference();
        assert_eq!(
            policy.evaluate(PositionSide::Short, dec!(100), dec!(105), price),
            expected
        );
    }

    #[test]
    fn tie_is_not_an_update() {
        let policy = StopLossPolicy::reference();
        assert_eq!(
            policy.evaluate(PositionSide::Long, dec!(100), dec!(105), dec!(111)),
            None
        );
    }

    #[test]
    fn scenario_ticks_ratchet_and_hold() {
        let policy = StopLossPolicy::reference();
        let mut stop = policy.initial_stop(PositionSide::Long, dec!(100), None);
        assert_eq!(stop, dec!(95));

        let mut history = Vec::new();
        for price in [dec!(109), dec!(111), dec!(108), dec!(121)] {
            if let Some(next) = policy.evaluate(PositionSide::Long, dec!(100), stop, price) {
                stop = next;
            }
            history.push(stop);
        }

        assert_eq!(history, vec![dec!(95), dec!(105), dec!(105), dec!(110)]);
    }

    #[test]
    fn banded_rule_trails_current_price() {
        let policy = StopLossPolicy::new(StopLossRule::banded_reference(), dec!(0.95)).unwrap();

        // 25% gain keeps 85% of the current price
        assert_eq!(
            policy.evaluate(PositionSide::Long, dec!(100), dec!(95), dec!(125)),
            Some(dec!(106.25))
        );
        // 16% gain keeps 80%: 92.8 is below the seed, so nothing moves
        assert_eq!(
            policy.evaluate(PositionSide::Long, dec!(100), dec!(95), dec!(116)),
            None
        );
        assert_eq!(
            policy.candidate_stop(PositionSide::Long, dec!(100), dec!(116)),
            Some(dec!(92.8))
        );
        // below the trigger
        assert_eq!(
            policy.candidate_stop(PositionSide::Long, dec!(100), dec!(109)),
            None
        );
    }

    #[test]
    fn banded_rule_mirrors_for_short() {
        let policy = StopLossPolicy::new(StopLossRule::banded_reference(), dec!(0.95)).unwrap();
        assert_eq!(
            policy.candidate_stop(PositionSide::Short, dec!(100), dec!(75)),
            Some(dec!(86.25))
        );
    }

    #[test]
    fn initial_stop_prefers_more_protective_venue_stop() {
        let policy = StopLossPolicy::reference();
        assert_eq!(
            policy.initial_stop(PositionSide::Long, dec!(100), Some(dec!(98))),
            dec!(98)
        );
        assert_eq!(
            policy.initial_stop(PositionSide::Long, dec!(100), Some(dec!(90))),
            dec!(95)
        );
        assert_eq!(
            policy.initial_stop(PositionSide::Short, dec!(100), Some(dec!(0))),
            dec!(105)
        );
    }

    #[test]
    fn non_positive_entry_yields_nothing() {
        let policy = StopLossPolicy::reference();
        assert_eq!(
            policy.evaluate(PositionSide::Long, dec!(0), dec!(0), dec!(100)),
            None
        );
    }

    #[test]
    fn new_rejects_invalid_parameters() {
        assert!(StopLossPolicy::new(StopLossRule::default(), dec!(1)).is_err());
        assert_eq!(
            StopLossPolicy::new(
                StopLossRule::Stepped {
                    trigger_percent: dec!(10),
                    step_percent: dec!(0),
                    raise_percent: dec!(5),
                },
                dec!(0.95)
            ),
            Err(PolicyError::InvalidParameter {
                name: "step_percent",
                value: dec!(0)
            })
        );
        assert_eq!(
            StopLossPolicy::new(
                StopLossRule::Banded {
                    trigger_percent: dec!(10),
                    bands: vec![
                        TrailingBand::new(dec!(10), dec!(0.8)),
                        TrailingBand::new(dec!(20), dec!(0.9)),
                    ],
                },
                dec!(0.95)
            ),
            Err(PolicyError::InvalidBands)
        );
    }

    #[test]
    fn reference_constants() {
        let policy = StopLossPolicy::reference();
        assert_eq!(policy.initial_ratio(), dec!(0.95));
        assert_eq!(policy.rule().name(), "stepped");
        assert_eq!(
            policy.rule(),
            &StopLossRule::Stepped {
                trigger_percent: dec!(10),
                step_percent: dec!(10),
                raise_percent: dec!(5),
            }
        );
    }

    proptest! {
        #[test]
        fn stop_never_loosens_for_long(prices in prop::collection::vec(1_i64..50_000, 1..64)) {
            let policy = StopLossPolicy::reference();
            let entry = dec!(100);
            let mut stop = policy.initial_stop(PositionSide::Long, entry, None);

            for cents in prices {
                let price = Decimal::new(cents, 2);
                if let Some(next) = policy.evaluate(PositionSide::Long, entry, stop, price) {
                    prop_assert!(next > stop);
                    stop = next;
                }
            }
            prop_assert!(stop >= dec!(95));
        }

        #[test]
        fn stop_never_loosens_for_short(prices in prop::collection::vec(1_i64..20_000, 1..64)) {
            let policy = StopLossPolicy::new(StopLossRule::banded_reference(), dec!(0.95)).unwrap();
            let entry = dec!(100);
            let mut stop = policy.initial_stop(PositionSide::Short, entry, None);

            for cents in prices {
                let price = Decimal::new(cents, 2);
                if let Some(next) = policy.evaluate(PositionSide::Short, entry, stop, price) {
                    prop_assert!(next < stop);
                    stop = next;
                }
            }
            prop_assert!(stop <= dec!(105));
        }
    }
}

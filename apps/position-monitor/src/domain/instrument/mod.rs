//! Instrument trading rules: price band, tick size and lot size.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Price and quantity constraints for one instrument.
///
/// A zero `max_price` or `max_quantity` means the venue sets no upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentFilters {
    /// Lowest valid price.
    pub min_price: Decimal,
    /// Highest valid price (zero = unbounded).
    pub max_price: Decimal,
    /// Price increment.
    pub tick_size: Decimal,
    /// Smallest order quantity.
    pub min_quantity: Decimal,
    /// Largest order quantity (zero = unbounded).
    pub max_quantity: Decimal,
    /// Quantity increment.
    pub step_size: Decimal,
}

/// Violations of instrument constraints.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    /// Price lies outside the instrument's valid band.
    #[error("price {price} outside valid range [{min}, {max}]")]
    OutOfRange {
        /// Offending price.
        price: Decimal,
        /// Lower bound.
        min: Decimal,
        /// Upper bound (zero = unbounded).
        max: Decimal,
    },

    /// Quantity after quantization is under the instrument minimum.
    #[error("quantity {quantity} below minimum {min}")]
    BelowMinimumSize {
        /// Quantized quantity.
        quantity: Decimal,
        /// Minimum order size.
        min: Decimal,
    },

    /// Price used for sizing is not positive.
    #[error("invalid reference price {0}")]
    InvalidPrice(Decimal),
}

impl InstrumentFilters {
    fn above_max_price(&self, price: Decimal) -> bool {
        !self.max_price.is_zero() && price > self.max_price
    }

    /// Round `price` to the nearest tick within the valid band.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::OutOfRange`] if `price` itself lies outside
    /// `[min_price, max_price]`. Inputs are never silently clamped; only the
    /// rounded result is kept inside the band.
    pub fn round_price(&self, price: Decimal) -> Result<Decimal, FilterError> {
        if price < self.min_price || self.above_max_price(price) || price <= Decimal::ZERO {
            return Err(FilterError::OutOfRange {
                price,
                min: self.min_price,
                max: self.max_price,
            });
        }

        let rounded = if self.tick_size.is_zero() {
            price
        } else {
            let ticks = (price / self.tick_size).round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
            (ticks * self.tick_size).normalize()
        };

        let mut bounded = rounded.max(self.min_price);
        if !self.max_price.is_zero() {
            bounded = bounded.min(self.max_price);
        }
        Ok(bounded)
    }

    /// Quantity purchasable with `notional` at `price`, floored to the step.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidPrice`] for non-positive prices and
    /// [`FilterError::BelowMinimumSize`] if the result is under the minimum.
    pub fn quantize_quantity(&self, notional: Decimal, price: Decimal) -> Result<Decimal, FilterError> {
        if price <= Decimal::ZERO {
            return Err(FilterError::InvalidPrice(price));
        }

        let raw = notional / price;
        let mut quantity = self.floor_to_step(raw);
        if !self.max_quantity.is_zero() {
            quantity = quantity.min(self.floor_to_step(self.max_quantity));
        }

        if quantity < self.min_quantity || quantity <= Decimal::ZERO {
            return Err(FilterError::BelowMinimumSize {
                quantity,
                min: self.min_quantity,
            });
        }
        Ok(quantity)
    }

    fn floor_to_step(&self, quantity: Decimal) -> Decimal {
        if self.step_size.is_zero() {
            return quantity;
        }
        ((quantity / self.step_size).floor() * self.step_size).normalize()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn btc() -> InstrumentFilters {
        InstrumentFilters {
            min_price: dec!(261.10),
            max_price: dec!(809484),
            tick_size: dec!(0.10),
            min_quantity: dec!(0.001),
            max_quantity: dec!(1000),
            step_size: dec!(0.001),
        }
    }

    #[test]
    fn round_price_snaps_to_tick() {
        assert_eq!(btc().round_price(dec!(65432.17)).unwrap(), dec!(65432.2));
        assert_eq!(btc().round_price(dec!(65432.12)).unwrap(), dec!(65432.1));
    }

    #[test]
    fn round_price_rejects_out_of_band_input() {
        assert_eq!(
            btc().round_price(dec!(100)),
            Err(FilterError::OutOfRange {
                price: dec!(100),
                min: dec!(261.10),
                max: dec!(809484),
            })
        );
        assert!(btc().round_price(dec!(900000)).is_err());
    }

    #[test]
    fn zero_max_price_is_unbounded() {
        let filters = InstrumentFilters {
            max_price: Decimal::ZERO,
            ..btc()
        };
        assert_eq!(filters.round_price(dec!(9000000.04)).unwrap(), dec!(9000000));
    }

    #[test]
    fn quantize_floors_to_step() {
        assert_eq!(btc().quantize_quantity(dec!(100), dec!(65000)).unwrap(), dec!(0.001));
        assert_eq!(btc().quantize_quantity(dec!(1000), dec!(300)).unwrap(), dec!(3.333));
    }

    #[test]
    fn quantize_rejects_below_minimum() {
        assert!(matches!(
            btc().quantize_quantity(dec!(10), dec!(65000)),
            Err(FilterError::BelowMinimumSize { .. })
        ));
        assert_eq!(
            btc().quantize_quantity(dec!(10), dec!(0)),
            Err(FilterError::InvalidPrice(dec!(0)))
        );
    }
}

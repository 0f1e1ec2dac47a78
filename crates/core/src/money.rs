//! Fixed-point money helpers.
//!
//! All monetary values in the engine are [`Decimal`]s with two fractional
//! digits. Floating point never appears on a money path.

use rust_decimal::{Decimal, RoundingStrategy};

/// Number of fractional digits kept for every monetary amount.
pub const MONEY_SCALE: u32 = 2;

/// Round to [`MONEY_SCALE`] digits, midpoint away from zero.
///
/// Always returns a value with exactly two fractional digits so that `10`
/// and `10.00` serialize identically.
pub fn round_money(amount: Decimal) -> Decimal {
    let mut rounded =
        amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_SCALE);
    rounded
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(2.745)), dec!(2.75));
        assert_eq!(round_money(dec!(-2.745)), dec!(-2.75));
        assert_eq!(round_money(dec!(2.744)), dec!(2.74));
    }

    #[test]
    fn pads_to_two_digits() {
        assert_eq!(round_money(dec!(10)).to_string(), "10.00");
        assert_eq!(round_money(dec!(2.5)).to_string(), "2.50");
    }

    proptest! {
        #[test]
        fn rounding_is_idempotent(cents in -10_000_000i64..10_000_000i64, extra in 0u32..1000) {
            let amount = Decimal::new(cents, 2) + Decimal::new(i64::from(extra), 5);
            let once = round_money(amount);
            prop_assert_eq!(round_money(once), once);
            prop_assert_eq!(once.scale(), MONEY_SCALE);
        }
    }
}

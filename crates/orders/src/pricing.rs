//! Order totals.
//!
//! Every amount is rounded to cents at the point it is derived, and the grand
//! total is the exact sum of those rounded parts.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult, ValueObject, round_money};

use crate::shipping::ShippingZone;

/// Order-level discount.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
    Amount(Decimal),
    /// Percentage of the subtotal, `0..=100`.
    Percent(Decimal),
}

impl Discount {
    pub fn validate(&self) -> DomainResult<()> {
        match *self {
            Discount::Amount(v) if v < Decimal::ZERO => {
                Err(DomainError::validation("discount must not be negative"))
            }
            Discount::Percent(p) if p < Decimal::ZERO || p > Decimal::ONE_HUNDRED => Err(
                DomainError::validation("discount percent must be between 0 and 100"),
            ),
            _ => Ok(()),
        }
    }

    /// Discount amount against `subtotal`.
    pub fn resolve(&self, subtotal: Decimal) -> DomainResult<Decimal> {
        match *self {
            Discount::Amount(v) => Ok(round_money(v)),
            Discount::Percent(p) => subtotal
                .checked_mul(p)
                .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
                .map(round_money)
                .ok_or_else(out_of_range),
        }
    }
}

impl ValueObject for Discount {}

/// Shipping input to [`compute`], with any zone already loaded.
#[derive(Debug, Copy, Clone)]
pub enum ShippingCharge<'a> {
    Manual(Decimal),
    Zone(&'a ShippingZone),
}

/// Quantity and unit amounts of one order line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PriceLine {
    pub quantity: i64,
    pub unit_price: Decimal,
    pub unit_cost: Decimal,
}

impl PriceLine {
    pub fn line_total(&self) -> DomainResult<Decimal> {
        extend(self.quantity, self.unit_price)
    }

    pub fn line_cost(&self) -> DomainResult<Decimal> {
        extend(self.quantity, self.unit_cost)
    }
}

fn extend(quantity: i64, unit: Decimal) -> DomainResult<Decimal> {
    Decimal::from(quantity)
        .checked_mul(unit)
        .map(round_money)
        .ok_or_else(out_of_range)
}

/// Largest amount an order field may hold (`NUMERIC(14, 2)`).
pub fn max_order_amount() -> Decimal {
    Decimal::new(99_999_999_999_999, 2)
}

fn out_of_range() -> DomainError {
    DomainError::validation("order amount out of range")
}

fn sum<I>(amounts: I) -> DomainResult<Decimal>
where
    I: IntoIterator<Item = DomainResult<Decimal>>,
{
    let mut total = Decimal::ZERO;
    for amount in amounts {
        total = total.checked_add(amount?).ok_or_else(out_of_range)?;
    }
    Ok(round_money(total))
}

/// Derived monetary fields of an order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub vat_rate: Decimal,
    pub vat: Decimal,
    pub shipping_fee: Decimal,
    pub discount: Decimal,
    pub cogs: Decimal,
    pub total: Decimal,
}

impl Totals {
    /// `subtotal + vat + shipping_fee - discount`.
    pub fn is_balanced(&self) -> bool {
        self.subtotal
            .checked_add(self.vat)
            .and_then(|v| v.checked_add(self.shipping_fee))
            .and_then(|v| v.checked_sub(self.discount))
            == Some(self.total)
    }
}

impl ValueObject for Totals {}

pub fn compute(
    lines: &[PriceLine],
    vat_rate: Decimal,
    discount: Option<&Discount>,
    shipping: ShippingCharge<'_>,
) -> DomainResult<Totals> {
    if vat_rate < Decimal::ZERO {
        return Err(DomainError::validation("vat rate must not be negative"));
    }

    let subtotal = sum(lines.iter().map(PriceLine::line_total))?;
    let cogs = sum(lines.iter().map(PriceLine::line_cost))?;
    let vat = subtotal
        .checked_mul(vat_rate)
        .map(round_money)
        .ok_or_else(out_of_range)?;

    let discount = match discount {
        Some(d) => {
            d.validate()?;
            d.resolve(subtotal)?
        }
        None => round_money(Decimal::ZERO),
    };
    if discount > subtotal {
        return Err(DomainError::validation(format!(
            "discount {discount} exceeds subtotal {subtotal}"
        )));
    }

    let shipping_fee = match shipping {
        ShippingCharge::Manual(fee) => {
            if fee < Decimal::ZERO {
                return Err(DomainError::validation("shipping fee must not be negative"));
            }
            round_money(fee)
        }
        ShippingCharge::Zone(zone) => zone.fee_for(subtotal - discount),
    };

    let totals = Totals {
        subtotal,
        vat_rate,
        vat,
        shipping_fee,
        discount,
        cogs,
        total: sum([Ok(subtotal), Ok(vat), Ok(shipping_fee), Ok(-discount)])?,
    };
    let limit = max_order_amount();
    if [totals.subtotal, totals.vat, totals.shipping_fee, totals.cogs, totals.total]
        .iter()
        .any(|amount| *amount > limit)
    {
        return Err(out_of_range());
    }
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shipping::ShippingZoneId;
    use orderdesk_core::TenantId;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn line(quantity: i64, unit_price: Decimal) -> PriceLine {
        PriceLine {
            quantity,
            unit_price,
            unit_cost: dec!(0),
        }
    }

    fn zone() -> ShippingZone {
        ShippingZone {
            id: ShippingZoneId::new(),
            tenant_id: TenantId::new(),
            name: "Domestic".to_string(),
            currency: "USD".to_string(),
            countries: vec!["US".to_string()],
            shipping_cost: dec!(8.00),
            free_shipping_threshold: Some(dec!(50.00)),
        }
    }

    #[test]
    fn two_line_order_with_manual_shipping() {
        let totals = compute(
            &[line(3, dec!(10.00)), line(1, dec!(25.00))],
            dec!(0.05),
            None,
            ShippingCharge::Manual(dec!(5.00)),
        )
        .unwrap();

        assert_eq!(totals.subtotal, dec!(55.00));
        assert_eq!(totals.vat, dec!(2.75));
        assert_eq!(totals.shipping_fee, dec!(5.00));
        assert_eq!(totals.discount, dec!(0.00));
        assert_eq!(totals.total, dec!(62.75));
        assert!(totals.is_balanced());
    }

    #[test]
    fn zone_fee_applies_below_threshold() {
        let z = zone();
        let totals =
            compute(&[line(4, dec!(10.00))], dec!(0), None, ShippingCharge::Zone(&z)).unwrap();
        assert_eq!(totals.shipping_fee, dec!(8.00));
        assert_eq!(totals.total, dec!(48.00));
    }

    #[test]
    fn zone_ships_free_above_threshold() {
        let z = zone();
        let totals =
            compute(&[line(6, dec!(10.00))], dec!(0), None, ShippingCharge::Zone(&z)).unwrap();
        assert_eq!(totals.shipping_fee, dec!(0.00));
    }

    #[test]
    fn discount_is_taken_off_the_threshold_base() {
        let z = zone();
        let totals = compute(
            &[line(6, dec!(10.00))],
            dec!(0),
            Some(&Discount::Amount(dec!(15))),
            ShippingCharge::Zone(&z),
        )
        .unwrap();
        // 60 - 15 = 45 < 50
        assert_eq!(totals.shipping_fee, dec!(8.00));
        assert_eq!(totals.total, dec!(53.00));
    }

    #[test]
    fn percent_discount_is_rounded_to_cents() {
        let totals = compute(
            &[line(1, dec!(33.33))],
            dec!(0),
            Some(&Discount::Percent(dec!(12.5))),
            ShippingCharge::Manual(dec!(0)),
        )
        .unwrap();
        // 33.33 * 0.125 = 4.16625
        assert_eq!(totals.discount, dec!(4.17));
        assert_eq!(totals.total, dec!(29.16));
    }

    #[test]
    fn cogs_tracks_unit_cost() {
        let totals = compute(
            &[PriceLine {
                quantity: 3,
                unit_price: dec!(10),
                unit_cost: dec!(4.25),
            }],
            dec!(0.15),
            None,
            ShippingCharge::Manual(dec!(0)),
        )
        .unwrap();
        assert_eq!(totals.cogs, dec!(12.75));
        assert_eq!(totals.vat, dec!(4.50));
    }

    #[test]
    fn rejects_negative_fee_and_oversized_discount() {
        assert!(matches!(
            compute(&[line(1, dec!(10))], dec!(0), None, ShippingCharge::Manual(dec!(-1))),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            compute(
                &[line(1, dec!(10))],
                dec!(0),
                Some(&Discount::Amount(dec!(10.01))),
                ShippingCharge::Manual(dec!(0))
            ),
            Err(DomainError::Validation(_))
        ));
        assert!(Discount::Percent(dec!(101)).validate().is_err());
    }

    #[test]
    fn overflowing_amounts_are_rejected() {
        let huge = PriceLine {
            quantity: i64::MAX,
            unit_price: dec!(100000000000),
            unit_cost: dec!(0),
        };
        assert!(matches!(huge.line_total(), Err(DomainError::Validation(_))));

        let at_max = line(1, Decimal::MAX);
        assert!(matches!(
            compute(&[at_max, at_max], dec!(0), None, ShippingCharge::Manual(dec!(0))),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            compute(&[at_max], dec!(2), None, ShippingCharge::Manual(dec!(0))),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn amounts_beyond_storage_precision_are_rejected() {
        assert!(matches!(
            compute(&[line(1_000_000, dec!(10000000))], dec!(0), None, ShippingCharge::Manual(dec!(0))),
            Err(DomainError::Validation(_))
        ));
        let at_limit = compute(
            &[line(1, max_order_amount())],
            dec!(0),
            None,
            ShippingCharge::Manual(dec!(0)),
        )
        .unwrap();
        assert_eq!(at_limit.total, max_order_amount());
    }

    proptest! {
        #[test]
        fn total_is_exact_sum_of_parts(
            lines in prop::collection::vec((1i64..50, 1i64..100_000, 0i64..100_000), 1..8),
            vat_bp in 0i64..3000,
            fee_cents in 0i64..10_000,
            discount_pct in 0i64..=100,
        ) {
            let lines: Vec<PriceLine> = lines
                .into_iter()
                .map(|(q, p, c)| PriceLine {
                    quantity: q,
                    unit_price: Decimal::new(p, 2),
                    unit_cost: Decimal::new(c, 2),
                })
                .collect();
            let vat_rate = Decimal::new(vat_bp, 4);
            let discount = Discount::Percent(Decimal::from(discount_pct));
            let shipping = ShippingCharge::Manual(Decimal::new(fee_cents, 2));

            let first = compute(&lines, vat_rate, Some(&discount), shipping).unwrap();
            let second = compute(&lines, vat_rate, Some(&discount), shipping).unwrap();

            prop_assert!(first.is_balanced());
            prop_assert_eq!(first, second);
            prop_assert!(first.discount <= first.subtotal);
        }
    }
}

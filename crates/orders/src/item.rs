use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult, Entity, round_money};
use orderdesk_inventory::{StockAdjustment, VariantId};

use crate::pricing::PriceLine;

/// Largest quantity a single line may carry.
pub const MAX_ITEM_QUANTITY: i64 = 1_000_000;

orderdesk_core::domain_id!(
    /// Identifier of an order line.
    OrderItemId
);

/// A line of an order. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub variant_id: VariantId,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub unit_cost: Decimal,
    pub line_total: Decimal,
    pub line_cost: Decimal,
}

impl OrderItem {
    pub fn new(
        variant_id: VariantId,
        quantity: i64,
        unit_price: Decimal,
        unit_cost: Decimal,
    ) -> DomainResult<Self> {
        validate_quantity(quantity)?;
        let unit_price = round_money(unit_price);
        if unit_price <= Decimal::ZERO {
            return Err(DomainError::validation("item unit price must be positive"));
        }
        let unit_cost = round_money(unit_cost);
        if unit_cost < Decimal::ZERO {
            return Err(DomainError::validation("item unit cost must not be negative"));
        }

        let line = PriceLine {
            quantity,
            unit_price,
            unit_cost,
        };
        Ok(Self {
            id: OrderItemId::new(),
            variant_id,
            quantity,
            unit_price,
            unit_cost,
            line_total: line.line_total()?,
            line_cost: line.line_cost()?,
        })
    }

    pub fn price_line(&self) -> PriceLine {
        PriceLine {
            quantity: self.quantity,
            unit_price: self.unit_price,
            unit_cost: self.unit_cost,
        }
    }

    pub fn stock_adjustment(&self) -> StockAdjustment {
        StockAdjustment::new(self.variant_id, self.quantity)
    }
}

impl Entity for OrderItem {
    type Id = OrderItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

pub fn validate_quantity(quantity: i64) -> DomainResult<()> {
    if quantity < 1 {
        return Err(DomainError::validation("item quantity must be at least 1"));
    }
    if quantity > MAX_ITEM_QUANTITY {
        return Err(DomainError::validation(format!(
            "item quantity must be at most {MAX_ITEM_QUANTITY}"
        )));
    }
    Ok(())
}

pub fn price_lines(items: &[OrderItem]) -> Vec<PriceLine> {
    items.iter().map(OrderItem::price_line).collect()
}

pub fn stock_lines(items: &[OrderItem]) -> Vec<StockAdjustment> {
    items.iter().map(OrderItem::stock_adjustment).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn line_amounts_are_rounded() {
        let item = OrderItem::new(VariantId::new(), 3, dec!(3.333), dec!(1.005)).unwrap();
        assert_eq!(item.unit_price, dec!(3.33));
        assert_eq!(item.unit_cost, dec!(1.01));
        assert_eq!(item.line_total, dec!(9.99));
        assert_eq!(item.line_cost, dec!(3.03));
    }

    #[test]
    fn rejects_invalid_lines() {
        let v = VariantId::new();
        assert!(OrderItem::new(v, 0, dec!(1), dec!(0)).is_err());
        assert!(OrderItem::new(v, 1, dec!(0), dec!(0)).is_err());
        assert!(OrderItem::new(v, 1, dec!(0.004), dec!(0)).is_err());
        assert!(OrderItem::new(v, 1, dec!(1), dec!(-0.01)).is_err());
        assert!(OrderItem::new(v, 1, dec!(1), dec!(0)).is_ok());
    }

    #[test]
    fn huge_lines_fail_validation_instead_of_overflowing() {
        let v = VariantId::new();
        let err = OrderItem::new(v, i64::MAX, dec!(100000000000), dec!(0)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = OrderItem::new(v, MAX_ITEM_QUANTITY, Decimal::MAX, dec!(0)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let item = OrderItem::new(v, MAX_ITEM_QUANTITY, dec!(1.50), dec!(0)).unwrap();
        assert_eq!(item.line_total, dec!(1500000.00));
    }
}

//! Caller-facing inputs and outputs of the order service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult};
use orderdesk_inventory::VariantId;

use crate::item::validate_quantity;
use crate::note::note_content;
use crate::parties::{AddressId, CustomerId};
use crate::payment::{PaymentMethod, PaymentStatus};
use crate::pricing::{Discount, Totals};
use crate::shipping::ShippingMode;
use crate::status::OrderStatus;

pub const MAX_ORDER_ITEMS: usize = 100;
pub const MAX_PAYMENT_REFERENCE_LENGTH: usize = 128;
pub const DEFAULT_CHANNEL: &str = "manual";
pub const STOREFRONT_CHANNEL: &str = "storefront";

/// One requested line. Missing prices default to the variant's own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemInput {
    pub variant_id: VariantId,
    pub quantity: i64,
    pub unit_price: Option<Decimal>,
    pub unit_cost: Option<Decimal>,
}

impl OrderItemInput {
    pub fn new(variant_id: VariantId, quantity: i64) -> Self {
        Self {
            variant_id,
            quantity,
            unit_price: None,
            unit_cost: None,
        }
    }

    pub fn priced(mut self, unit_price: Decimal, unit_cost: Decimal) -> Self {
        self.unit_price = Some(unit_price);
        self.unit_cost = Some(unit_cost);
        self
    }
}

pub fn validate_item_count(count: usize) -> DomainResult<()> {
    if count == 0 {
        return Err(DomainError::validation("order must have at least one item"));
    }
    if count > MAX_ORDER_ITEMS {
        return Err(DomainError::validation(format!(
            "order may have at most {MAX_ORDER_ITEMS} items"
        )));
    }
    Ok(())
}

pub fn validate_payment_reference(reference: Option<&str>) -> DomainResult<()> {
    match reference {
        Some(r) if r.trim().chars().count() > MAX_PAYMENT_REFERENCE_LENGTH => {
            Err(DomainError::validation(format!(
                "payment reference must be at most {MAX_PAYMENT_REFERENCE_LENGTH} characters"
            )))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: CustomerId,
    pub shipping_address_id: AddressId,
    pub items: Vec<OrderItemInput>,
    pub shipping: ShippingMode,
    pub discount: Option<Discount>,
    pub channel: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_reference: Option<String>,
    pub ordered_at: Option<DateTime<Utc>>,
    /// Status to move the new order to right after creation.
    pub status: Option<OrderStatus>,
    /// Payment status to move the new order to right after creation.
    pub payment_status: Option<PaymentStatus>,
    pub note: Option<String>,
}

impl CreateOrderRequest {
    pub fn new(
        customer_id: CustomerId,
        shipping_address_id: AddressId,
        items: Vec<OrderItemInput>,
        shipping: ShippingMode,
    ) -> Self {
        Self {
            customer_id,
            shipping_address_id,
            items,
            shipping,
            discount: None,
            channel: None,
            payment_method: None,
            payment_reference: None,
            ordered_at: None,
            status: None,
            payment_status: None,
            note: None,
        }
    }

    /// Shape checks that need no storage access.
    pub fn validate(&self) -> DomainResult<()> {
        validate_item_count(self.items.len())?;
        for item in &self.items {
            validate_quantity(item.quantity)?;
        }
        self.shipping.validate()?;
        if let Some(discount) = &self.discount {
            discount.validate()?;
        }
        if let Some(channel) = &self.channel {
            if channel.trim().is_empty() {
                return Err(DomainError::validation("channel must not be empty"));
            }
        }
        validate_payment_reference(self.payment_reference.as_deref())?;
        if let Some(note) = &self.note {
            note_content(note)?;
        }
        Ok(())
    }

    pub fn channel(&self) -> String {
        self.channel
            .as_deref()
            .map(str::trim)
            .unwrap_or(DEFAULT_CHANNEL)
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorefrontItem {
    pub variant_id: VariantId,
    pub quantity: i64,
}

/// Checkout from the public storefront; prices always come from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorefrontOrderRequest {
    pub customer_id: CustomerId,
    pub shipping_address_id: AddressId,
    pub items: Vec<StorefrontItem>,
    pub payment_method: Option<PaymentMethod>,
    /// Payment is settled outside the engine; the order starts as `skipped`.
    pub bypass_payment: bool,
    pub note: Option<String>,
}

impl StorefrontOrderRequest {
    pub fn validate(&self) -> DomainResult<()> {
        validate_item_count(self.items.len())?;
        for item in &self.items {
            validate_quantity(item.quantity)?;
        }
        if let Some(note) = &self.note {
            note_content(note)?;
        }
        Ok(())
    }
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOrderRequest {
    pub channel: Option<String>,
    pub shipping_address_id: Option<AddressId>,
    pub shipping: Option<ShippingMode>,
    pub discount: Option<Discount>,
    /// Remove the current discount. Cannot be combined with `discount`.
    #[serde(default)]
    pub clear_discount: bool,
    pub ordered_at: Option<DateTime<Utc>>,
    pub items: Option<Vec<OrderItemInput>>,
}

impl UpdateOrderRequest {
    pub fn items(items: Vec<OrderItemInput>) -> Self {
        Self {
            items: Some(items),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let Some(items) = &self.items {
            validate_item_count(items.len())?;
            for item in items {
                validate_quantity(item.quantity)?;
            }
        }
        if let Some(shipping) = &self.shipping {
            shipping.validate()?;
        }
        if let Some(discount) = &self.discount {
            if self.clear_discount {
                return Err(DomainError::validation(
                    "discount cannot be set and cleared in one update",
                ));
            }
            discount.validate()?;
        }
        if let Some(channel) = &self.channel {
            if channel.trim().is_empty() {
                return Err(DomainError::validation("channel must not be empty"));
            }
        }
        Ok(())
    }

    /// Whether the revision touches the order's discount at all.
    pub fn changes_discount(&self) -> bool {
        self.discount.is_some() || self.clear_discount
    }
}

/// Availability of one previewed line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLine {
    pub variant_id: VariantId,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub available: i64,
    pub sufficient: bool,
}

/// Priced, unpersisted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPreview {
    pub totals: Totals,
    pub lines: Vec<PreviewLine>,
    pub in_stock: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MAX_ITEM_QUANTITY;
    use rust_decimal_macros::dec;

    fn request(items: usize) -> CreateOrderRequest {
        CreateOrderRequest::new(
            CustomerId::new(),
            AddressId::new(),
            (0..items)
                .map(|_| OrderItemInput::new(VariantId::new(), 1))
                .collect(),
            ShippingMode::free(),
        )
    }

    #[test]
    fn item_count_is_bounded() {
        assert!(request(0).validate().is_err());
        assert!(request(1).validate().is_ok());
        assert!(request(MAX_ORDER_ITEMS).validate().is_ok());
        assert!(matches!(
            request(MAX_ORDER_ITEMS + 1).validate(),
            Err(DomainError::Validation(m)) if m.contains("at most 100")
        ));
    }

    #[test]
    fn create_rejects_negative_fee_discount_and_long_note() {
        let mut req = request(1);
        req.shipping = ShippingMode::Manual(dec!(-5));
        assert!(req.validate().is_err());

        let mut req = request(1);
        req.discount = Some(Discount::Amount(dec!(-1)));
        assert!(req.validate().is_err());

        let mut req = request(1);
        req.note = Some("x".repeat(2001));
        assert!(req.validate().is_err());
    }

    #[test]
    fn channel_defaults_to_manual() {
        assert_eq!(request(1).channel(), DEFAULT_CHANNEL);
        let mut req = request(1);
        req.channel = Some(" pos ".to_string());
        assert_eq!(req.channel(), "pos");
    }

    #[test]
    fn quantities_are_capped_on_every_request() {
        let mut req = request(1);
        req.items[0].quantity = MAX_ITEM_QUANTITY + 1;
        assert!(matches!(req.validate(), Err(DomainError::Validation(_))));
        req.items[0].quantity = MAX_ITEM_QUANTITY;
        assert!(req.validate().is_ok());

        let update = UpdateOrderRequest::items(vec![OrderItemInput::new(VariantId::new(), i64::MAX)]);
        assert!(matches!(update.validate(), Err(DomainError::Validation(_))));

        let storefront = StorefrontOrderRequest {
            customer_id: CustomerId::new(),
            shipping_address_id: AddressId::new(),
            items: vec![StorefrontItem {
                variant_id: VariantId::new(),
                quantity: i64::MAX,
            }],
            payment_method: None,
            bypass_payment: false,
            note: None,
        };
        assert!(matches!(storefront.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn discount_cannot_be_set_and_cleared_together() {
        let update = UpdateOrderRequest {
            clear_discount: true,
            ..UpdateOrderRequest::default()
        };
        assert!(!update.is_empty());
        assert!(update.validate().is_ok());
        assert!(update.changes_discount());

        let both = UpdateOrderRequest {
            discount: Some(Discount::Amount(dec!(1))),
            clear_discount: true,
            ..UpdateOrderRequest::default()
        };
        assert!(matches!(both.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn empty_update_is_detected() {
        assert!(UpdateOrderRequest::default().is_empty());
        assert!(!UpdateOrderRequest::items(vec![]).is_empty());
        assert!(UpdateOrderRequest::items(vec![]).validate().is_err());
    }
}

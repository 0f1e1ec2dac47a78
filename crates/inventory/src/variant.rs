use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::TenantId;

orderdesk_core::domain_id!(
    /// Identifier of a purchasable variant (the unit of stock tracking).
    VariantId
);

/// Read model of a catalog variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub tenant_id: TenantId,
    pub name: String,
    pub sku: Option<String>,
    /// ISO 4217 code the prices are expressed in.
    pub currency: String,
    pub sale_price: Decimal,
    pub cost_price: Decimal,
    pub stock_quantity: i64,
}

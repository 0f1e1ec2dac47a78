//! Customer and address references.
//!
//! Both are owned by the parties domain; the order engine only checks that a
//! reference exists inside the tenant and reads the destination country.

use serde::{Deserialize, Serialize};

use orderdesk_core::TenantId;

orderdesk_core::domain_id!(
    /// Identifier of a customer.
    CustomerId
);

orderdesk_core::domain_id!(
    /// Identifier of a customer's shipping address.
    AddressId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub tenant_id: TenantId,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub country_code: String,
}

//! Transactional persistence for orders.
//!
//! Every order operation runs inside exactly one [`OrderTx`]. Writes become
//! visible only on [`OrderTx::commit`]; dropping a transaction (including a
//! cancelled future holding one) rolls everything back, stock included.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use orderdesk_core::{DomainError, ExpectedVersion, TenantId};
use orderdesk_inventory::{StockChange, StockLevel, Variant, VariantId};
use orderdesk_orders::{
    Address, AddressId, Customer, CustomerId, GroupTotal, OrderFilter, OrderId, OrderListQuery,
    OrderNote, OrderNoteId, OrderSnapshot, OrderSummary, ReportDimension, ShippingZone,
    ShippingZoneId,
};

pub use in_memory::{InMemoryOrderStore, InMemoryTx};
pub use postgres::{PgOrderTx, PostgresOrderStore, SCHEMA, apply_schema};

/// Unique constraint on `(tenant_id, order_number)`.
pub const ORDER_NUMBER_CONSTRAINT: &str = "orders_tenant_order_number_key";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("check constraint violated: {constraint}")]
    CheckViolation { constraint: String },

    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error("storage failure during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn storage(operation: &'static str, err: impl core::fmt::Display) -> Self {
        Self::Storage {
            operation,
            message: err.to_string(),
        }
    }

    /// The insert lost the race for its order number (and nothing else).
    pub fn is_order_number_collision(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { constraint } if constraint == ORDER_NUMBER_CONSTRAINT)
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Concurrency(msg) => DomainError::conflict(msg),
            StoreError::CheckViolation { constraint } if constraint.contains("stock") => {
                DomainError::conflict("insufficient stock")
            }
            other => {
                // Details stay in the logs; callers get a generic failure.
                tracing::error!(error = %other, "order store failure");
                DomainError::internal("storage failure")
            }
        }
    }
}

/// One atomic unit of work.
#[async_trait]
pub trait OrderTx: Send + Sized {
    /// Savepoint names are plain identifiers (`[A-Za-z0-9_]+`).
    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn customer(
        &mut self,
        tenant_id: TenantId,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError>;

    async fn address(
        &mut self,
        tenant_id: TenantId,
        id: AddressId,
    ) -> Result<Option<Address>, StoreError>;

    async fn shipping_zone(
        &mut self,
        tenant_id: TenantId,
        id: ShippingZoneId,
    ) -> Result<Option<ShippingZone>, StoreError>;

    /// Variants of `tenant_id` among `ids`; foreign or unknown ids are absent.
    async fn variants(
        &mut self,
        tenant_id: TenantId,
        ids: &[VariantId],
    ) -> Result<Vec<Variant>, StoreError>;

    /// Lock the stock rows of `ids` (in id order) and return their levels.
    async fn lock_stock(
        &mut self,
        tenant_id: TenantId,
        ids: &[VariantId],
    ) -> Result<Vec<StockLevel>, StoreError>;

    /// Write planned stock values in one statement.
    async fn apply_stock(
        &mut self,
        tenant_id: TenantId,
        changes: &[StockChange],
    ) -> Result<(), StoreError>;

    /// Insert an order with its items. Fails with
    /// [`StoreError::UniqueViolation`] naming [`ORDER_NUMBER_CONSTRAINT`] when
    /// the number is taken within the tenant.
    async fn insert_order(&mut self, order: &OrderSnapshot) -> Result<(), StoreError>;

    /// Load a live (not deleted) order and lock it for the transaction.
    async fn load_order_for_update(
        &mut self,
        tenant_id: TenantId,
        id: OrderId,
    ) -> Result<Option<OrderSnapshot>, StoreError>;

    /// Persist order fields (not items), guarded by the version it was
    /// loaded at.
    async fn update_order(
        &mut self,
        order: &OrderSnapshot,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// Replace the stored item set with `order.items`.
    async fn replace_items(&mut self, order: &OrderSnapshot) -> Result<(), StoreError>;

    async fn insert_note(&mut self, note: &OrderNote) -> Result<(), StoreError>;

    async fn find_note(
        &mut self,
        tenant_id: TenantId,
        order_id: OrderId,
        note_id: OrderNoteId,
    ) -> Result<Option<OrderNote>, StoreError>;

    async fn update_note(&mut self, note: &OrderNote) -> Result<(), StoreError>;

    /// Returns whether a note was removed.
    async fn delete_note(
        &mut self,
        tenant_id: TenantId,
        order_id: OrderId,
        note_id: OrderNoteId,
    ) -> Result<bool, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Order storage: transactions plus tenant-scoped reads.
#[async_trait]
pub trait OrderStore: Send + Sync {
    type Tx: OrderTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn find_order(
        &self,
        tenant_id: TenantId,
        id: OrderId,
    ) -> Result<Option<OrderSnapshot>, StoreError>;

    async fn find_order_by_number(
        &self,
        tenant_id: TenantId,
        order_number: &str,
    ) -> Result<Option<OrderSnapshot>, StoreError>;

    /// One page of live orders plus the total number of matches.
    async fn list_orders(
        &self,
        tenant_id: TenantId,
        query: &OrderListQuery,
    ) -> Result<(Vec<OrderSnapshot>, u64), StoreError>;

    async fn list_notes(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<Vec<OrderNote>, StoreError>;

    /// Count, revenue and cost of goods of the live orders matching `filter`.
    async fn summarize_orders(
        &self,
        tenant_id: TenantId,
        filter: &OrderFilter,
    ) -> Result<OrderSummary, StoreError>;

    /// Per-group count and revenue, largest revenue first.
    async fn group_orders(
        &self,
        tenant_id: TenantId,
        filter: &OrderFilter,
        dimension: ReportDimension,
    ) -> Result<Vec<GroupTotal>, StoreError>;
}

pub(crate) fn validate_savepoint_name(name: &str) -> Result<(), StoreError> {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Ok(())
    } else {
        Err(StoreError::storage(
            "savepoint",
            format!("invalid savepoint name {name:?}"),
        ))
    }
}

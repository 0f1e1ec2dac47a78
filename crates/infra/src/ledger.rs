//! Stock reservation inside an order transaction.

use tracing::debug;

use orderdesk_core::{DomainResult, TenantId};
use orderdesk_inventory::{StockAdjustment, StockChange, StockDirection, lock_order, plan};

use crate::store::OrderTx;

/// Allocates and restocks variant stock, all-or-nothing.
///
/// Rows are locked in ascending variant id order before anything is
/// computed, so concurrent batches over overlapping variants serialize
/// instead of deadlocking.
pub struct InventoryLedger;

impl InventoryLedger {
    pub async fn allocate<T: OrderTx>(
        tx: &mut T,
        tenant_id: TenantId,
        lines: &[StockAdjustment],
    ) -> DomainResult<Vec<StockChange>> {
        Self::adjust(tx, tenant_id, StockDirection::Allocate, lines).await
    }

    pub async fn restock<T: OrderTx>(
        tx: &mut T,
        tenant_id: TenantId,
        lines: &[StockAdjustment],
    ) -> DomainResult<Vec<StockChange>> {
        Self::adjust(tx, tenant_id, StockDirection::Restock, lines).await
    }

    async fn adjust<T: OrderTx>(
        tx: &mut T,
        tenant_id: TenantId,
        direction: StockDirection,
        lines: &[StockAdjustment],
    ) -> DomainResult<Vec<StockChange>> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        let ids = lock_order(lines);
        let levels = tx.lock_stock(tenant_id, &ids).await?;
        let changes = plan(&levels, direction, lines)?;
        tx.apply_stock(tenant_id, &changes).await?;
        debug!(?direction, variants = changes.len(), "stock adjusted");
        Ok(changes)
    }
}

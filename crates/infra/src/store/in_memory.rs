//! In-memory order store for tests/dev.
//!
//! A transaction holds the store-wide lock for its whole lifetime and works
//! on a private copy of the tables, so transactions are fully serialized and
//! an uncommitted transaction leaves no trace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use orderdesk_core::{ExpectedVersion, TenantId};
use orderdesk_inventory::{StockChange, StockLevel, Variant, VariantId};
use orderdesk_orders::report::group_totals;
use orderdesk_orders::shipping::normalize_country;
use orderdesk_orders::{
    Address, AddressId, Customer, CustomerId, GroupTotal, OrderFilter, OrderId, OrderListQuery,
    OrderNote, OrderNoteId, OrderSnapshot, OrderSummary, ReportDimension, SearchDocument,
    ShippingZone, ShippingZoneId,
};

use super::{ORDER_NUMBER_CONSTRAINT, OrderStore, OrderTx, StoreError, validate_savepoint_name};

#[derive(Debug, Clone, Default)]
struct Tables {
    orders: HashMap<OrderId, OrderSnapshot>,
    notes: HashMap<OrderNoteId, OrderNote>,
    variants: HashMap<VariantId, Variant>,
    customers: HashMap<CustomerId, Customer>,
    addresses: HashMap<AddressId, Address>,
    zones: HashMap<ShippingZoneId, ShippingZone>,
}

impl Tables {
    fn live_order(&self, tenant_id: TenantId, id: OrderId) -> Option<&OrderSnapshot> {
        self.orders
            .get(&id)
            .filter(|o| o.tenant_id == tenant_id && o.timestamps.deleted_at.is_none())
    }

    fn reported<'a>(
        &'a self,
        tenant_id: TenantId,
        filter: &'a OrderFilter,
    ) -> impl Iterator<Item = &'a OrderSnapshot> + 'a {
        self.orders.values().filter(move |o| {
            o.tenant_id == tenant_id && o.timestamps.deleted_at.is_none() && filter.matches(o)
        })
    }

    fn group_key(&self, order: &OrderSnapshot, dimension: ReportDimension) -> String {
        match dimension {
            ReportDimension::Status => order.status.as_str().to_string(),
            ReportDimension::Channel => order.channel.clone(),
            ReportDimension::Country => self
                .addresses
                .get(&order.shipping_address_id)
                .filter(|a| a.tenant_id == order.tenant_id)
                .map(|a| normalize_country(&a.country_code))
                .unwrap_or_default(),
            ReportDimension::Customer => order.customer_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_variant(&self, variant: Variant) {
        self.tables.lock().await.variants.insert(variant.id, variant);
    }

    pub async fn put_customer(&self, customer: Customer) {
        self.tables.lock().await.customers.insert(customer.id, customer);
    }

    pub async fn put_address(&self, address: Address) {
        self.tables.lock().await.addresses.insert(address.id, address);
    }

    pub async fn put_zone(&self, zone: ShippingZone) {
        self.tables.lock().await.zones.insert(zone.id, zone);
    }

    pub async fn variant(&self, id: VariantId) -> Option<Variant> {
        self.tables.lock().await.variants.get(&id).cloned()
    }

    /// Stored row of an order, soft-deleted ones included.
    pub async fn stored_order(&self, id: OrderId) -> Option<OrderSnapshot> {
        self.tables.lock().await.orders.get(&id).cloned()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTx {
            guard,
            working,
            savepoints: Vec::new(),
        })
    }

    async fn find_order(
        &self,
        tenant_id: TenantId,
        id: OrderId,
    ) -> Result<Option<OrderSnapshot>, StoreError> {
        Ok(self.tables.lock().await.live_order(tenant_id, id).cloned())
    }

    async fn find_order_by_number(
        &self,
        tenant_id: TenantId,
        order_number: &str,
    ) -> Result<Option<OrderSnapshot>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .values()
            .find(|o| {
                o.tenant_id == tenant_id
                    && o.order_number == order_number
                    && o.timestamps.deleted_at.is_none()
            })
            .cloned())
    }

    async fn list_orders(
        &self,
        tenant_id: TenantId,
        query: &OrderListQuery,
    ) -> Result<(Vec<OrderSnapshot>, u64), StoreError> {
        let tables = self.tables.lock().await;

        let mut matches: Vec<(u32, &OrderSnapshot)> = tables
            .orders
            .values()
            .filter(|o| o.tenant_id == tenant_id && o.timestamps.deleted_at.is_none())
            .filter(|o| query.filter.matches(o))
            .filter_map(|o| match &query.search {
                None => Some((0, o)),
                Some(term) => {
                    let customer = tables
                        .customers
                        .get(&o.customer_id)
                        .filter(|c| c.tenant_id == tenant_id);
                    let doc = SearchDocument {
                        order_number: &o.order_number,
                        channel: &o.channel,
                        currency: &o.currency,
                        payment_reference: o.payment_reference.as_deref(),
                        customer_name: customer.map(|c| c.name.as_str()),
                        customer_email: customer.and_then(|c| c.email.as_deref()),
                    };
                    term.rank(&doc).map(|rank| (rank, o))
                }
            })
            .collect();

        if query.ranks_by_relevance() {
            matches.sort_by(|(ra, a), (rb, b)| {
                rb.cmp(ra)
                    .then_with(|| b.timestamps.created_at.cmp(&a.timestamps.created_at))
            });
        } else {
            let keys = query.sort.effective();
            matches.sort_by(|(_, a), (_, b)| {
                keys.iter()
                    .map(|key| key.compare(a, b))
                    .find(|ord| ord.is_ne())
                    .unwrap_or(core::cmp::Ordering::Equal)
            });
        }

        let total = matches.len() as u64;
        let page = matches
            .into_iter()
            .skip(query.page.offset() as usize)
            .take(query.page.limit() as usize)
            .map(|(_, o)| o.clone())
            .collect();
        Ok((page, total))
    }

    async fn list_notes(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<Vec<OrderNote>, StoreError> {
        let tables = self.tables.lock().await;
        let mut notes: Vec<OrderNote> = tables
            .notes
            .values()
            .filter(|n| n.tenant_id == tenant_id && n.order_id == order_id)
            .cloned()
            .collect();
        notes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(notes)
    }

    async fn summarize_orders(
        &self,
        tenant_id: TenantId,
        filter: &OrderFilter,
    ) -> Result<OrderSummary, StoreError> {
        let tables = self.tables.lock().await;
        OrderSummary::accumulate(
            tables
                .reported(tenant_id, filter)
                .map(|o| (o.totals.total, o.totals.cogs)),
        )
        .map_err(|e| StoreError::storage("summarize_orders", e))
    }

    async fn group_orders(
        &self,
        tenant_id: TenantId,
        filter: &OrderFilter,
        dimension: ReportDimension,
    ) -> Result<Vec<GroupTotal>, StoreError> {
        let tables = self.tables.lock().await;
        group_totals(
            tables
                .reported(tenant_id, filter)
                .map(|o| (tables.group_key(o, dimension), o.totals.total)),
        )
        .map_err(|e| StoreError::storage("group_orders", e))
    }
}

pub struct InMemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    savepoints: Vec<(String, Tables)>,
}

impl InMemoryTx {
    fn savepoint_index(&self, name: &str) -> Result<usize, StoreError> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StoreError::storage("savepoint", format!("no savepoint {name:?}")))
    }
}

#[async_trait]
impl OrderTx for InMemoryTx {
    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        validate_savepoint_name(name)?;
        self.savepoints.push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let idx = self.savepoint_index(name)?;
        // The savepoint itself survives a rollback to it; later ones do not.
        self.savepoints.truncate(idx + 1);
        self.working = self.savepoints[idx].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let idx = self.savepoint_index(name)?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    async fn customer(
        &mut self,
        tenant_id: TenantId,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError> {
        Ok(self
            .working
            .customers
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn address(
        &mut self,
        tenant_id: TenantId,
        id: AddressId,
    ) -> Result<Option<Address>, StoreError> {
        Ok(self
            .working
            .addresses
            .get(&id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn shipping_zone(
        &mut self,
        tenant_id: TenantId,
        id: ShippingZoneId,
    ) -> Result<Option<ShippingZone>, StoreError> {
        Ok(self
            .working
            .zones
            .get(&id)
            .filter(|z| z.tenant_id == tenant_id)
            .cloned())
    }

    async fn variants(
        &mut self,
        tenant_id: TenantId,
        ids: &[VariantId],
    ) -> Result<Vec<Variant>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.working.variants.get(id))
            .filter(|v| v.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn lock_stock(
        &mut self,
        tenant_id: TenantId,
        ids: &[VariantId],
    ) -> Result<Vec<StockLevel>, StoreError> {
        let mut levels: Vec<StockLevel> = ids
            .iter()
            .filter_map(|id| self.working.variants.get(id))
            .filter(|v| v.tenant_id == tenant_id)
            .map(|v| StockLevel {
                variant_id: v.id,
                name: v.name.clone(),
                stock_quantity: v.stock_quantity,
            })
            .collect();
        levels.sort_by_key(|l| l.variant_id);
        Ok(levels)
    }

    async fn apply_stock(
        &mut self,
        tenant_id: TenantId,
        changes: &[StockChange],
    ) -> Result<(), StoreError> {
        for change in changes {
            let variant = self
                .working
                .variants
                .get_mut(&change.variant_id)
                .filter(|v| v.tenant_id == tenant_id)
                .ok_or_else(|| {
                    StoreError::storage("apply_stock", format!("variant {} vanished", change.variant_id))
                })?;
            if change.next < 0 {
                return Err(StoreError::CheckViolation {
                    constraint: "variants_stock_quantity_check".to_string(),
                });
            }
            variant.stock_quantity = change.next;
        }
        Ok(())
    }

    async fn insert_order(&mut self, order: &OrderSnapshot) -> Result<(), StoreError> {
        // Soft-deleted orders keep their number.
        let taken = self.working.orders.values().any(|o| {
            o.tenant_id == order.tenant_id && o.order_number == order.order_number
        });
        if taken {
            return Err(StoreError::UniqueViolation {
                constraint: ORDER_NUMBER_CONSTRAINT.to_string(),
            });
        }
        if self.working.orders.contains_key(&order.id) {
            return Err(StoreError::UniqueViolation {
                constraint: "orders_pkey".to_string(),
            });
        }
        self.working.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn load_order_for_update(
        &mut self,
        tenant_id: TenantId,
        id: OrderId,
    ) -> Result<Option<OrderSnapshot>, StoreError> {
        Ok(self.working.live_order(tenant_id, id).cloned())
    }

    async fn update_order(
        &mut self,
        order: &OrderSnapshot,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let stored = self
            .working
            .orders
            .get_mut(&order.id)
            .filter(|o| o.tenant_id == order.tenant_id)
            .ok_or_else(|| StoreError::Concurrency(format!("order {} vanished", order.id)))?;
        if expected.check(stored.version).is_err() {
            return Err(StoreError::Concurrency(format!(
                "order {} is at version {}",
                order.id, stored.version
            )));
        }
        let items = core::mem::take(&mut stored.items);
        *stored = order.clone();
        stored.items = items;
        Ok(())
    }

    async fn replace_items(&mut self, order: &OrderSnapshot) -> Result<(), StoreError> {
        let stored = self
            .working
            .orders
            .get_mut(&order.id)
            .filter(|o| o.tenant_id == order.tenant_id)
            .ok_or_else(|| StoreError::Concurrency(format!("order {} vanished", order.id)))?;
        stored.items = order.items.clone();
        Ok(())
    }

    async fn insert_note(&mut self, note: &OrderNote) -> Result<(), StoreError> {
        self.working.notes.insert(note.id, note.clone());
        Ok(())
    }

    async fn find_note(
        &mut self,
        tenant_id: TenantId,
        order_id: OrderId,
        note_id: OrderNoteId,
    ) -> Result<Option<OrderNote>, StoreError> {
        Ok(self
            .working
            .notes
            .get(&note_id)
            .filter(|n| n.tenant_id == tenant_id && n.order_id == order_id)
            .cloned())
    }

    async fn update_note(&mut self, note: &OrderNote) -> Result<(), StoreError> {
        match self.working.notes.get_mut(&note.id) {
            Some(stored) if stored.tenant_id == note.tenant_id => {
                *stored = note.clone();
                Ok(())
            }
            _ => Err(StoreError::Concurrency(format!("note {} vanished", note.id))),
        }
    }

    async fn delete_note(
        &mut self,
        tenant_id: TenantId,
        order_id: OrderId,
        note_id: OrderNoteId,
    ) -> Result<bool, StoreError> {
        let owned = self
            .working
            .notes
            .get(&note_id)
            .is_some_and(|n| n.tenant_id == tenant_id && n.order_id == order_id);
        if owned {
            self.working.notes.remove(&note_id);
        }
        Ok(owned)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let InMemoryTx {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn variant(tenant_id: TenantId, stock: i64) -> Variant {
        Variant {
            id: VariantId::new(),
            tenant_id,
            name: "Espresso beans 1kg".to_string(),
            sku: Some("ESP-1KG".to_string()),
            currency: "SAR".to_string(),
            sale_price: dec!(85.00),
            cost_price: dec!(40.00),
            stock_quantity: stock,
        }
    }

    fn change(v: &Variant, next: i64) -> StockChange {
        StockChange {
            variant_id: v.id,
            previous: v.stock_quantity,
            next,
        }
    }

    #[tokio::test]
    async fn uncommitted_work_is_discarded() {
        let store = InMemoryOrderStore::new();
        let tenant = TenantId::new();
        let v = variant(tenant, 10);
        store.put_variant(v.clone()).await;

        let mut tx = store.begin().await.unwrap();
        tx.apply_stock(tenant, &[change(&v, 4)]).await.unwrap();
        drop(tx);

        assert_eq!(store.variant(v.id).await.unwrap().stock_quantity, 10);

        let mut tx = store.begin().await.unwrap();
        tx.apply_stock(tenant, &[change(&v, 4)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.variant(v.id).await.unwrap().stock_quantity, 4);
    }

    #[tokio::test]
    async fn rollback_to_savepoint_restores_the_snapshot() {
        let store = InMemoryOrderStore::new();
        let tenant = TenantId::new();
        let v = variant(tenant, 10);
        store.put_variant(v.clone()).await;

        let mut tx = store.begin().await.unwrap();
        tx.apply_stock(tenant, &[change(&v, 9)]).await.unwrap();
        tx.savepoint("attempt_0").await.unwrap();
        tx.apply_stock(tenant, &[change(&v, 1)]).await.unwrap();
        tx.rollback_to_savepoint("attempt_0").await.unwrap();
        tx.release_savepoint("attempt_0").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.variant(v.id).await.unwrap().stock_quantity, 9);
    }

    #[tokio::test]
    async fn foreign_tenant_rows_are_invisible() {
        let store = InMemoryOrderStore::new();
        let owner = TenantId::new();
        let v = variant(owner, 10);
        store.put_variant(v.clone()).await;

        let mut tx = store.begin().await.unwrap();
        assert!(tx.variants(TenantId::new(), &[v.id]).await.unwrap().is_empty());
        assert!(tx.lock_stock(TenantId::new(), &[v.id]).await.unwrap().is_empty());
        assert_eq!(tx.lock_stock(owner, &[v.id]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn negative_stock_is_rejected_like_a_check_constraint() {
        let store = InMemoryOrderStore::new();
        let tenant = TenantId::new();
        let v = variant(tenant, 1);
        store.put_variant(v.clone()).await;

        let mut tx = store.begin().await.unwrap();
        let err = tx.apply_stock(tenant, &[change(&v, -1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::CheckViolation { .. }));
    }
}

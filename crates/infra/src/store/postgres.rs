//! Postgres-backed order store.
//!
//! One [`PgOrderTx`] wraps one database transaction. Stock rows are locked
//! with `SELECT ... FOR UPDATE` in ascending id order, order rows are locked
//! before they are changed, and the schema itself enforces non-negative stock
//! and per-tenant unique order numbers.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `UniqueViolation` | Order number taken within the tenant |
//! | Database (check constraint violation) | `23514` | `CheckViolation` | Stock would go negative, malformed row |
//! | Database (serialization / deadlock) | `40001` / `40P01` | `Concurrency` | Competing transaction won |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Storage` | Network errors, connection failures, etc. |

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use orderdesk_core::{DomainError, ExpectedVersion, TenantId, UserId, round_money};
use orderdesk_inventory::{StockChange, StockLevel, Variant, VariantId};
use orderdesk_orders::report::rank_groups;
use orderdesk_orders::{
    Address, AddressId, Customer, CustomerId, Discount, GroupTotal, OrderFilter, OrderId,
    OrderItem, OrderItemId, OrderListQuery, OrderNote, OrderNoteId, OrderSnapshot, OrderSummary,
    OrderTimestamps, ReportDimension, ShippingMode, ShippingZone, ShippingZoneId, Totals,
};

use super::{OrderStore, OrderTx, StoreError, validate_savepoint_name};

/// Migrations for the order engine tables.
pub static SCHEMA: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply pending schema migrations.
pub async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
    SCHEMA
        .run(pool)
        .await
        .map_err(|e| StoreError::storage("apply_schema", e))
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

const ORDER_COLUMNS: &str = r#"
    o.id, o.tenant_id, o.order_number, o.customer_id, o.shipping_address_id,
    o.channel, o.currency, o.status, o.payment_status, o.payment_method,
    o.payment_reference, o.shipping_mode, o.manual_shipping_fee, o.shipping_zone_id,
    o.discount_kind, o.discount_value, o.subtotal, o.vat_rate, o.vat, o.shipping_fee,
    o.discount, o.cogs, o.total, o.stock_allocated, o.ordered_at, o.created_at,
    o.updated_at, o.placed_at, o.ready_for_shipment_at, o.shipped_at, o.fulfilled_at,
    o.cancelled_at, o.returned_at, o.paid_at, o.failed_at, o.refunded_at,
    o.deleted_at, o.version
"#;

#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: Arc<PgPool>,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    type Tx = PgOrderTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PgOrderTx { tx })
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %id), err)]
    async fn find_order(
        &self,
        tenant_id: TenantId,
        id: OrderId,
    ) -> Result<Option<OrderSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o \
             WHERE o.tenant_id = $1 AND o.id = $2 AND o.deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(*tenant_id.as_uuid())
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_order", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut items = load_items(&*self.pool, tenant_id, &[*id.as_uuid()]).await?;
        let items = items.remove(id.as_uuid()).unwrap_or_default();
        order_from_row(&row, items).map(Some)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn find_order_by_number(
        &self,
        tenant_id: TenantId,
        order_number: &str,
    ) -> Result<Option<OrderSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o \
             WHERE o.tenant_id = $1 AND o.order_number = $2 AND o.deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(*tenant_id.as_uuid())
            .bind(order_number)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_order_by_number", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: Uuid = column(&row, "id")?;
        let mut items = load_items(&*self.pool, tenant_id, &[id]).await?;
        order_from_row(&row, items.remove(&id).unwrap_or_default()).map(Some)
    }

    #[instrument(skip(self, query), fields(tenant_id = %tenant_id, operation = tracing::field::Empty), err)]
    async fn list_orders(
        &self,
        tenant_id: TenantId,
        query: &OrderListQuery,
    ) -> Result<(Vec<OrderSnapshot>, u64), StoreError> {
        Span::current().record("operation", "list_orders");

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) ");
        push_from_and_filters(&mut count, tenant_id, query);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_orders", e))?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {ORDER_COLUMNS} "));
        let relevance = query.search.as_ref().filter(|_| query.ranks_by_relevance());
        if let Some(term) = relevance {
            select.push(", ts_rank_cd(o.search_vector, websearch_to_tsquery('simple', ");
            select.push_bind(term.as_str().to_string());
            select.push(")) + COALESCE(ts_rank_cd(c.search_vector, websearch_to_tsquery('simple', ");
            select.push_bind(term.as_str().to_string());
            select.push(")), 0) AS rank ");
        }
        push_from_and_filters(&mut select, tenant_id, query);

        if relevance.is_some() {
            select.push(" ORDER BY rank DESC, o.created_at DESC, o.id");
        } else {
            let order_by = query
                .sort
                .effective()
                .iter()
                .map(|key| format!("{} {}", key.field.column(), key.direction.as_sql()))
                .collect::<Vec<_>>()
                .join(", ");
            select.push(format!(" ORDER BY {order_by}, o.id"));
        }

        select.push(" LIMIT ");
        select.push_bind(to_i64(query.page.limit())?);
        select.push(" OFFSET ");
        select.push_bind(to_i64(query.page.offset())?);

        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_orders", e))?;

        let ids = rows
            .iter()
            .map(|row| column::<Uuid>(row, "id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut items = load_items(&*self.pool, tenant_id, &ids).await?;

        let mut orders = Vec::with_capacity(rows.len());
        for (row, id) in rows.iter().zip(&ids) {
            orders.push(order_from_row(row, items.remove(id).unwrap_or_default())?);
        }

        Ok((orders, u64::try_from(total).unwrap_or(0)))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id), err)]
    async fn list_notes(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<Vec<OrderNote>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, order_id, author_id, content, created_at, updated_at
            FROM order_notes
            WHERE tenant_id = $1 AND order_id = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*order_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_notes", e))?;

        rows.iter().map(note_from_row).collect()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    async fn summarize_orders(
        &self,
        tenant_id: TenantId,
        filter: &OrderFilter,
    ) -> Result<OrderSummary, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS order_count, \
             COALESCE(SUM(o.total), 0) AS total, \
             COALESCE(SUM(o.cogs), 0) AS cogs \
             FROM orders o WHERE o.tenant_id = ",
        );
        qb.push_bind(*tenant_id.as_uuid());
        qb.push(" AND o.deleted_at IS NULL");
        push_filter(&mut qb, filter);

        let row = qb
            .build()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("summarize_orders", e))?;
        let count: i64 = column(&row, "order_count")?;
        Ok(OrderSummary::from_sums(
            u64::try_from(count).unwrap_or(0),
            column(&row, "total")?,
            column(&row, "cogs")?,
        ))
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id, ?dimension), err)]
    async fn group_orders(
        &self,
        tenant_id: TenantId,
        filter: &OrderFilter,
        dimension: ReportDimension,
    ) -> Result<Vec<GroupTotal>, StoreError> {
        let key = match dimension {
            ReportDimension::Status => "o.status",
            ReportDimension::Channel => "o.channel",
            ReportDimension::Country => "COALESCE(upper(btrim(a.country_code)), '')",
            ReportDimension::Customer => "o.customer_id::text",
        };
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {key} AS group_key, COUNT(*) AS order_count, SUM(o.total) AS total \
             FROM orders o \
             LEFT JOIN customer_addresses a \
               ON a.id = o.shipping_address_id AND a.tenant_id = o.tenant_id \
             WHERE o.tenant_id = "
        ));
        qb.push_bind(*tenant_id.as_uuid());
        qb.push(" AND o.deleted_at IS NULL");
        push_filter(&mut qb, filter);
        qb.push(" GROUP BY 1 ORDER BY total DESC, group_key ASC");

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("group_orders", e))?;

        let mut groups = rows
            .iter()
            .map(|row| {
                let count: i64 = column(row, "order_count")?;
                Ok(GroupTotal {
                    key: column(row, "group_key")?,
                    count: u64::try_from(count).unwrap_or(0),
                    total: round_money(column(row, "total")?),
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        // Collation may order keys differently from Rust; settle ties here.
        rank_groups(&mut groups);
        Ok(groups)
    }
}

pub struct PgOrderTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OrderTx for PgOrderTx {
    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        validate_savepoint_name(name)?;
        sqlx::query(&format!("SAVEPOINT {name}"))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint", e))?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        validate_savepoint_name(name)?;
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("rollback_to_savepoint", e))?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        validate_savepoint_name(name)?;
        sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("release_savepoint", e))?;
        Ok(())
    }

    async fn customer(
        &mut self,
        tenant_id: TenantId,
        id: CustomerId,
    ) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, email FROM customers WHERE tenant_id = $1 AND id = $2",
        )
        .bind(*tenant_id.as_uuid())
        .bind(*id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("customer", e))?;

        row.map(|row| {
            Ok(Customer {
                id: CustomerId::from_uuid(column(&row, "id")?),
                tenant_id: TenantId::from_uuid(column(&row, "tenant_id")?),
                name: column(&row, "name")?,
                email: column(&row, "email")?,
            })
        })
        .transpose()
    }

    async fn address(
        &mut self,
        tenant_id: TenantId,
        id: AddressId,
    ) -> Result<Option<Address>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, customer_id, country_code
            FROM customer_addresses
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("address", e))?;

        row.map(|row| {
            Ok(Address {
                id: AddressId::from_uuid(column(&row, "id")?),
                tenant_id: TenantId::from_uuid(column(&row, "tenant_id")?),
                customer_id: CustomerId::from_uuid(column(&row, "customer_id")?),
                country_code: column(&row, "country_code")?,
            })
        })
        .transpose()
    }

    async fn shipping_zone(
        &mut self,
        tenant_id: TenantId,
        id: ShippingZoneId,
    ) -> Result<Option<ShippingZone>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, name, currency, countries, shipping_cost, free_shipping_threshold
            FROM shipping_zones
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("shipping_zone", e))?;

        row.map(|row| {
            Ok(ShippingZone {
                id: ShippingZoneId::from_uuid(column(&row, "id")?),
                tenant_id: TenantId::from_uuid(column(&row, "tenant_id")?),
                name: column(&row, "name")?,
                currency: column::<String>(&row, "currency")?.trim().to_string(),
                countries: column(&row, "countries")?,
                shipping_cost: column(&row, "shipping_cost")?,
                free_shipping_threshold: column(&row, "free_shipping_threshold")?,
            })
        })
        .transpose()
    }

    async fn variants(
        &mut self,
        tenant_id: TenantId,
        ids: &[VariantId],
    ) -> Result<Vec<Variant>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, name, sku, currency, sale_price, cost_price, stock_quantity
            FROM variants
            WHERE tenant_id = $1 AND id = ANY($2)
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(variant_uuids(ids))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("variants", e))?;

        rows.iter()
            .map(|row| {
                Ok(Variant {
                    id: VariantId::from_uuid(column(row, "id")?),
                    tenant_id: TenantId::from_uuid(column(row, "tenant_id")?),
                    name: column(row, "name")?,
                    sku: column(row, "sku")?,
                    currency: column::<String>(row, "currency")?.trim().to_string(),
                    sale_price: column(row, "sale_price")?,
                    cost_price: column(row, "cost_price")?,
                    stock_quantity: column(row, "stock_quantity")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, ids), fields(tenant_id = %tenant_id, variants = ids.len()), err)]
    async fn lock_stock(
        &mut self,
        tenant_id: TenantId,
        ids: &[VariantId],
    ) -> Result<Vec<StockLevel>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, stock_quantity
            FROM variants
            WHERE tenant_id = $1 AND id = ANY($2)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(variant_uuids(ids))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stock", e))?;

        rows.iter()
            .map(|row| {
                Ok(StockLevel {
                    variant_id: VariantId::from_uuid(column(row, "id")?),
                    name: column(row, "name")?,
                    stock_quantity: column(row, "stock_quantity")?,
                })
            })
            .collect()
    }

    async fn apply_stock(
        &mut self,
        tenant_id: TenantId,
        changes: &[StockChange],
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = changes.iter().map(|c| *c.variant_id.as_uuid()).collect();
        let quantities: Vec<i64> = changes.iter().map(|c| c.next).collect();

        let result = sqlx::query(
            r#"
            UPDATE variants AS v
            SET stock_quantity = s.stock_quantity
            FROM UNNEST($2::uuid[], $3::bigint[]) AS s(id, stock_quantity)
            WHERE v.tenant_id = $1 AND v.id = s.id
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(ids)
        .bind(quantities)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("apply_stock", e))?;

        if result.rows_affected() != changes.len() as u64 {
            return Err(StoreError::Concurrency(
                "stock rows changed while locked".to_string(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, order), fields(tenant_id = %order.tenant_id, order_id = %order.id), err)]
    async fn insert_order(&mut self, order: &OrderSnapshot) -> Result<(), StoreError> {
        let query = sqlx::query(
            r#"
            INSERT INTO orders (
                id, tenant_id, order_number, customer_id, currency, created_at,
                channel, status, payment_status, payment_method, payment_reference,
                shipping_mode, manual_shipping_fee, shipping_zone_id, discount_kind, discount_value,
                subtotal, vat_rate, vat, shipping_fee, discount, cogs, total, stock_allocated,
                shipping_address_id, ordered_at, updated_at, placed_at, ready_for_shipment_at,
                shipped_at, fulfilled_at, cancelled_at, returned_at, paid_at, failed_at,
                refunded_at, deleted_at, version
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24,
                $25, $26, $27, $28, $29,
                $30, $31, $32, $33, $34, $35,
                $36, $37, $38
            )
            "#,
        )
        .bind(*order.id.as_uuid())
        .bind(*order.tenant_id.as_uuid())
        .bind(order.order_number.as_str())
        .bind(*order.customer_id.as_uuid())
        .bind(order.currency.as_str())
        .bind(order.timestamps.created_at);

        bind_mutable_columns(query, order)?
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order", e))?;

        insert_items(&mut self.tx, order).await
    }

    async fn load_order_for_update(
        &mut self,
        tenant_id: TenantId,
        id: OrderId,
    ) -> Result<Option<OrderSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders o \
             WHERE o.tenant_id = $1 AND o.id = $2 AND o.deleted_at IS NULL \
             FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(*tenant_id.as_uuid())
            .bind(*id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_order_for_update", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut items = load_items(&mut *self.tx, tenant_id, &[*id.as_uuid()]).await?;
        order_from_row(&row, items.remove(id.as_uuid()).unwrap_or_default()).map(Some)
    }

    #[instrument(skip(self, order), fields(tenant_id = %order.tenant_id, order_id = %order.id), err)]
    async fn update_order(
        &mut self,
        order: &OrderSnapshot,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let expected = expected.get();

        let query = sqlx::query(
            r#"
            UPDATE orders SET
                channel = $4, status = $5, payment_status = $6, payment_method = $7,
                payment_reference = $8, shipping_mode = $9, manual_shipping_fee = $10,
                shipping_zone_id = $11, discount_kind = $12, discount_value = $13,
                subtotal = $14, vat_rate = $15, vat = $16, shipping_fee = $17, discount = $18,
                cogs = $19, total = $20, stock_allocated = $21, shipping_address_id = $22,
                ordered_at = $23, updated_at = $24, placed_at = $25, ready_for_shipment_at = $26,
                shipped_at = $27, fulfilled_at = $28, cancelled_at = $29, returned_at = $30,
                paid_at = $31, failed_at = $32, refunded_at = $33, deleted_at = $34, version = $35
            WHERE tenant_id = $1 AND id = $2 AND version = $3
            "#,
        )
        .bind(*order.tenant_id.as_uuid())
        .bind(*order.id.as_uuid())
        .bind(to_i64(expected)?);

        let result = bind_mutable_columns(query, order)?
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_order", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "order {} is no longer at version {expected}",
                order.id
            )));
        }
        Ok(())
    }

    async fn replace_items(&mut self, order: &OrderSnapshot) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM order_items WHERE tenant_id = $1 AND order_id = $2")
            .bind(*order.tenant_id.as_uuid())
            .bind(*order.id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("replace_items", e))?;

        insert_items(&mut self.tx, order).await
    }

    async fn insert_note(&mut self, note: &OrderNote) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO order_notes (id, tenant_id, order_id, author_id, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*note.id.as_uuid())
        .bind(*note.tenant_id.as_uuid())
        .bind(*note.order_id.as_uuid())
        .bind(note.author_id.map(|a| *a.as_uuid()))
        .bind(note.content.as_str())
        .bind(note.created_at)
        .bind(note.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_note", e))?;
        Ok(())
    }

    async fn find_note(
        &mut self,
        tenant_id: TenantId,
        order_id: OrderId,
        note_id: OrderNoteId,
    ) -> Result<Option<OrderNote>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, order_id, author_id, content, created_at, updated_at
            FROM order_notes
            WHERE tenant_id = $1 AND order_id = $2 AND id = $3
            FOR UPDATE
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(*order_id.as_uuid())
        .bind(*note_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_note", e))?;

        row.as_ref().map(note_from_row).transpose()
    }

    async fn update_note(&mut self, note: &OrderNote) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE order_notes SET content = $4, updated_at = $5
            WHERE tenant_id = $1 AND order_id = $2 AND id = $3
            "#,
        )
        .bind(*note.tenant_id.as_uuid())
        .bind(*note.order_id.as_uuid())
        .bind(*note.id.as_uuid())
        .bind(note.content.as_str())
        .bind(note.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_note", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!("note {} vanished", note.id)));
        }
        Ok(())
    }

    async fn delete_note(
        &mut self,
        tenant_id: TenantId,
        order_id: OrderId,
        note_id: OrderNoteId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM order_notes WHERE tenant_id = $1 AND order_id = $2 AND id = $3",
        )
        .bind(*tenant_id.as_uuid())
        .bind(*order_id.as_uuid())
        .bind(*note_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_note", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn push_from_and_filters(qb: &mut QueryBuilder<'_, Postgres>, tenant_id: TenantId, query: &OrderListQuery) {
    qb.push(
        "FROM orders o \
         LEFT JOIN customers c ON c.id = o.customer_id AND c.tenant_id = o.tenant_id \
         WHERE o.tenant_id = ",
    );
    qb.push_bind(*tenant_id.as_uuid());
    qb.push(" AND o.deleted_at IS NULL");
    push_filter(qb, &query.filter);
    push_search(qb, query);
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &OrderFilter) {
    if !filter.statuses.is_empty() {
        qb.push(" AND o.status = ANY(");
        qb.push_bind(
            filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect::<Vec<_>>(),
        );
        qb.push(")");
    }
    if !filter.payment_statuses.is_empty() {
        qb.push(" AND o.payment_status = ANY(");
        qb.push_bind(
            filter
                .payment_statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect::<Vec<_>>(),
        );
        qb.push(")");
    }
    if !filter.channels.is_empty() {
        qb.push(" AND lower(o.channel) = ANY(");
        qb.push_bind(
            filter
                .channels
                .iter()
                .map(|c| c.trim().to_lowercase())
                .collect::<Vec<_>>(),
        );
        qb.push(")");
    }
    if let Some(customer_id) = filter.customer_id {
        qb.push(" AND o.customer_id = ");
        qb.push_bind(*customer_id.as_uuid());
    }
    if let Some(number) = &filter.order_number {
        qb.push(" AND o.order_number = ");
        qb.push_bind(number.trim().to_string());
    }
    if let Some(from) = filter.ordered_from {
        qb.push(" AND o.ordered_at >= ");
        qb.push_bind(from);
    }
    if let Some(to) = filter.ordered_to {
        qb.push(" AND o.ordered_at <= ");
        qb.push_bind(to);
    }
}

fn push_search(qb: &mut QueryBuilder<'_, Postgres>, query: &OrderListQuery) {
    if let Some(term) = &query.search {
        let pattern = term.like_pattern();
        qb.push(" AND (o.order_number ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR c.name ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR c.email ILIKE ");
        qb.push_bind(pattern);
        qb.push(" OR o.search_vector @@ websearch_to_tsquery('simple', ");
        qb.push_bind(term.as_str().to_string());
        qb.push(") OR c.search_vector @@ websearch_to_tsquery('simple', ");
        qb.push_bind(term.as_str().to_string());
        qb.push("))");
    }
}

fn bind_mutable_columns<'q>(
    query: PgQuery<'q>,
    order: &'q OrderSnapshot,
) -> Result<PgQuery<'q>, StoreError> {
    let (shipping_mode, manual_fee, zone_id) = match order.shipping {
        ShippingMode::Manual(fee) => ("manual", Some(fee), None),
        ShippingMode::Zoned(zone) => ("zoned", None, Some(*zone.as_uuid())),
    };
    let (discount_kind, discount_value) = match order.discount {
        Some(Discount::Amount(v)) => (Some("amount"), Some(v)),
        Some(Discount::Percent(p)) => (Some("percent"), Some(p)),
        None => (None, None),
    };
    let t = &order.timestamps;
    let totals = &order.totals;

    Ok(query
        .bind(order.channel.as_str())
        .bind(order.status.as_str())
        .bind(order.payment_status.as_str())
        .bind(order.payment_method.as_str())
        .bind(order.payment_reference.as_deref())
        .bind(shipping_mode)
        .bind(manual_fee)
        .bind(zone_id)
        .bind(discount_kind)
        .bind(discount_value)
        .bind(totals.subtotal)
        .bind(totals.vat_rate)
        .bind(totals.vat)
        .bind(totals.shipping_fee)
        .bind(totals.discount)
        .bind(totals.cogs)
        .bind(totals.total)
        .bind(order.stock_allocated)
        .bind(*order.shipping_address_id.as_uuid())
        .bind(t.ordered_at)
        .bind(t.updated_at)
        .bind(t.placed_at)
        .bind(t.ready_for_shipment_at)
        .bind(t.shipped_at)
        .bind(t.fulfilled_at)
        .bind(t.cancelled_at)
        .bind(t.returned_at)
        .bind(t.paid_at)
        .bind(t.failed_at)
        .bind(t.refunded_at)
        .bind(t.deleted_at)
        .bind(to_i64(order.version)?))
}

async fn insert_items(
    tx: &mut Transaction<'static, Postgres>,
    order: &OrderSnapshot,
) -> Result<(), StoreError> {
    let items = &order.items;
    let positions = (0..items.len())
        .map(|i| i32::try_from(i).map_err(|e| StoreError::storage("insert_items", e)))
        .collect::<Result<Vec<_>, _>>()?;

    sqlx::query(
        r#"
        INSERT INTO order_items (
            id, tenant_id, order_id, position, variant_id, quantity,
            unit_price, unit_cost, line_total, line_cost
        )
        SELECT item.id, $1, $2, item.position, item.variant_id, item.quantity,
               item.unit_price, item.unit_cost, item.line_total, item.line_cost
        FROM UNNEST(
            $3::uuid[], $4::int4[], $5::uuid[], $6::int8[],
            $7::numeric[], $8::numeric[], $9::numeric[], $10::numeric[]
        ) AS item(id, position, variant_id, quantity, unit_price, unit_cost, line_total, line_cost)
        "#,
    )
    .bind(*order.tenant_id.as_uuid())
    .bind(*order.id.as_uuid())
    .bind(items.iter().map(|i| *i.id.as_uuid()).collect::<Vec<_>>())
    .bind(positions)
    .bind(items.iter().map(|i| *i.variant_id.as_uuid()).collect::<Vec<_>>())
    .bind(items.iter().map(|i| i.quantity).collect::<Vec<_>>())
    .bind(items.iter().map(|i| i.unit_price).collect::<Vec<Decimal>>())
    .bind(items.iter().map(|i| i.unit_cost).collect::<Vec<Decimal>>())
    .bind(items.iter().map(|i| i.line_total).collect::<Vec<Decimal>>())
    .bind(items.iter().map(|i| i.line_cost).collect::<Vec<Decimal>>())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_items", e))?;
    Ok(())
}

/// Items of the given orders, grouped by order id in position order.
async fn load_items<'e, E>(
    executor: E,
    tenant_id: TenantId,
    order_ids: &[Uuid],
) -> Result<HashMap<Uuid, Vec<OrderItem>>, StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let mut grouped: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
    if order_ids.is_empty() {
        return Ok(grouped);
    }

    let rows = sqlx::query(
        r#"
        SELECT order_id, id, variant_id, quantity, unit_price, unit_cost, line_total, line_cost
        FROM order_items
        WHERE tenant_id = $1 AND order_id = ANY($2)
        ORDER BY order_id, position
        "#,
    )
    .bind(*tenant_id.as_uuid())
    .bind(order_ids.to_vec())
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("load_items", e))?;

    for row in &rows {
        let item = OrderItem {
            id: OrderItemId::from_uuid(column(row, "id")?),
            variant_id: VariantId::from_uuid(column(row, "variant_id")?),
            quantity: column(row, "quantity")?,
            unit_price: column(row, "unit_price")?,
            unit_cost: column(row, "unit_cost")?,
            line_total: column(row, "line_total")?,
            line_cost: column(row, "line_cost")?,
        };
        grouped
            .entry(column(row, "order_id")?)
            .or_default()
            .push(item);
    }
    Ok(grouped)
}

fn order_from_row(row: &PgRow, items: Vec<OrderItem>) -> Result<OrderSnapshot, StoreError> {
    let shipping = match column::<String>(row, "shipping_mode")?.as_str() {
        "manual" => ShippingMode::Manual(
            column::<Option<Decimal>>(row, "manual_shipping_fee")?.unwrap_or(Decimal::ZERO),
        ),
        "zoned" => {
            let zone = column::<Option<Uuid>>(row, "shipping_zone_id")?
                .ok_or_else(|| StoreError::storage("decode_order", "zoned order without zone"))?;
            ShippingMode::Zoned(ShippingZoneId::from_uuid(zone))
        }
        other => {
            return Err(StoreError::storage(
                "decode_order",
                format!("unknown shipping mode {other:?}"),
            ));
        }
    };

    let discount_value: Option<Decimal> = column(row, "discount_value")?;
    let discount = match (column::<Option<String>>(row, "discount_kind")?.as_deref(), discount_value) {
        (Some("amount"), Some(v)) => Some(Discount::Amount(v)),
        (Some("percent"), Some(p)) => Some(Discount::Percent(p)),
        (None, _) => None,
        (Some(other), _) => {
            return Err(StoreError::storage(
                "decode_order",
                format!("malformed discount {other:?}"),
            ));
        }
    };

    let version: i64 = column(row, "version")?;

    Ok(OrderSnapshot {
        id: OrderId::from_uuid(column(row, "id")?),
        tenant_id: TenantId::from_uuid(column(row, "tenant_id")?),
        order_number: column(row, "order_number")?,
        customer_id: CustomerId::from_uuid(column(row, "customer_id")?),
        shipping_address_id: AddressId::from_uuid(column(row, "shipping_address_id")?),
        channel: column(row, "channel")?,
        currency: column::<String>(row, "currency")?.trim().to_string(),
        status: parse_column(row, "status")?,
        payment_status: parse_column(row, "payment_status")?,
        payment_method: parse_column(row, "payment_method")?,
        payment_reference: column(row, "payment_reference")?,
        shipping,
        discount,
        totals: Totals {
            subtotal: column(row, "subtotal")?,
            vat_rate: column(row, "vat_rate")?,
            vat: column(row, "vat")?,
            shipping_fee: column(row, "shipping_fee")?,
            discount: column(row, "discount")?,
            cogs: column(row, "cogs")?,
            total: column(row, "total")?,
        },
        items,
        stock_allocated: column(row, "stock_allocated")?,
        timestamps: OrderTimestamps {
            ordered_at: column(row, "ordered_at")?,
            created_at: column(row, "created_at")?,
            updated_at: column(row, "updated_at")?,
            placed_at: column(row, "placed_at")?,
            ready_for_shipment_at: column(row, "ready_for_shipment_at")?,
            shipped_at: column(row, "shipped_at")?,
            fulfilled_at: column(row, "fulfilled_at")?,
            cancelled_at: column(row, "cancelled_at")?,
            returned_at: column(row, "returned_at")?,
            paid_at: column(row, "paid_at")?,
            failed_at: column(row, "failed_at")?,
            refunded_at: column(row, "refunded_at")?,
            deleted_at: column(row, "deleted_at")?,
        },
        version: u64::try_from(version).map_err(|e| StoreError::storage("decode_order", e))?,
    })
}

fn note_from_row(row: &PgRow) -> Result<OrderNote, StoreError> {
    Ok(OrderNote {
        id: OrderNoteId::from_uuid(column(row, "id")?),
        tenant_id: TenantId::from_uuid(column(row, "tenant_id")?),
        order_id: OrderId::from_uuid(column(row, "order_id")?),
        author_id: column::<Option<Uuid>>(row, "author_id")?.map(UserId::from_uuid),
        content: column(row, "content")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::storage("decode", format!("{name}: {e}")))
}

fn parse_column<T>(row: &PgRow, name: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = DomainError>,
{
    column::<String>(row, name)?
        .parse()
        .map_err(|e: DomainError| StoreError::storage("decode", format!("{name}: {e}")))
}

fn variant_uuids(ids: &[VariantId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|e| StoreError::storage("encode", e))
}

/// Map SQLx errors to store errors.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        let constraint = || db.constraint().unwrap_or_default().to_string();
        match db.code().as_deref() {
            Some("23505") => return StoreError::UniqueViolation { constraint: constraint() },
            Some("23514") => return StoreError::CheckViolation { constraint: constraint() },
            Some("40001") | Some("40P01") => {
                return StoreError::Concurrency(format!("{operation}: {}", db.message()));
            }
            _ => {}
        }
    }
    StoreError::storage(operation, err)
}

//! Order service: every order operation, one transaction each.
//!
//! Each write follows the same shape: cheap validation and throttling first,
//! then one store transaction that locks what it touches, decides through
//! the `Order` aggregate and moves stock through the [`InventoryLedger`].
//! Events are published only after the transaction commits; a failed publish
//! is logged and never undoes the committed change.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use orderdesk_core::{Aggregate, DomainError, DomainResult, ExpectedVersion, TenantId, UserId};
use orderdesk_events::{EventBus, PublishedEvent, execute};
use orderdesk_inventory::{StockChange, StockDirection, StockLevel, Variant, VariantId, plan};
use orderdesk_orders::item::{price_lines, stock_lines};
use orderdesk_orders::note::note_content;
use orderdesk_orders::request::{STOREFRONT_CHANNEL, validate_payment_reference};
use orderdesk_orders::{
    Address, AddressId, ChangePaymentStatus, ChangeStatus, CreateOrderRequest, CustomerId,
    DeleteOrder, Discount, GroupTotal, MAX_ORDER_NUMBER_RETRIES, MAX_TOP_ORDERS, OpenOrder, Order,
    OrderCommand, OrderEvent, OrderFilter, OrderId, OrderItem, OrderItemInput, OrderListQuery,
    OrderNote, OrderNoteAdded, OrderNoteId, OrderNumberGenerator, OrderPage, OrderPreview,
    OrderSort, OrderStatus, OrderSummary, PageRequest, PaymentMethod, PaymentStatus, PreviewLine,
    RandomOrderNumbers, ReportDimension, ReviseOrder, ShippingCharge, ShippingMode, ShippingZone,
    StorefrontOrderRequest, TenantContext, UpdateOrderRequest, UpdatePaymentDetails, compute,
};

use crate::collaborators::{PaymentMethodPolicy, PlanGate};
use crate::config::EngineConfig;
use crate::ledger::InventoryLedger;
use crate::rate_limit::{self, RateLimitPolicy, RateLimiter};
use crate::store::{OrderStore, OrderTx};

const ORDER_AGGREGATE: &str = "orders.order";
const VARIANT_AGGREGATE: &str = "inventory.variant";

pub struct OrderService<S, B> {
    store: S,
    bus: B,
    config: EngineConfig,
    numbers: Arc<dyn OrderNumberGenerator>,
    payment_methods: Option<Arc<dyn PaymentMethodPolicy>>,
    plan_gate: Option<Arc<dyn PlanGate>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl<S, B> OrderService<S, B>
where
    S: OrderStore,
    B: EventBus<PublishedEvent>,
{
    pub fn new(store: S, bus: B, config: EngineConfig) -> Self {
        let numbers = Arc::new(RandomOrderNumbers::new(config.order_number_width));
        Self {
            store,
            bus,
            config,
            numbers,
            payment_methods: None,
            plan_gate: None,
            rate_limiter: None,
        }
    }

    pub fn with_order_numbers(mut self, numbers: Arc<dyn OrderNumberGenerator>) -> Self {
        self.numbers = numbers;
        self
    }

    pub fn with_payment_methods(mut self, policy: Arc<dyn PaymentMethodPolicy>) -> Self {
        self.payment_methods = Some(policy);
        self
    }

    pub fn with_plan_gate(mut self, gate: Arc<dyn PlanGate>) -> Self {
        self.plan_gate = Some(gate);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create an order from the back office.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id(), actor = %actor), err)]
    pub async fn create(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        request: CreateOrderRequest,
    ) -> DomainResult<Order> {
        request.validate()?;
        self.throttle(
            &rate_limit::create_key(ctx.tenant_id(), actor),
            &self.config.create_rate_limit,
        )?;
        self.ensure_quota(ctx.tenant_id()).await?;

        let draft = OrderDraft {
            channel: request.channel(),
            customer_id: request.customer_id,
            shipping_address_id: request.shipping_address_id,
            items: request.items,
            shipping: request.shipping,
            discount: request.discount,
            payment_method: request.payment_method.unwrap_or_default(),
            payment_reference: request.payment_reference,
            payment_status: PaymentStatus::Pending,
            ordered_at: request.ordered_at,
            target_status: request.status,
            target_payment_status: request.payment_status,
            note: request.note,
            author: Some(actor),
        };

        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::default();
        let result = self.create_in_tx(&mut tx, ctx, draft, &mut outbox).await;
        let order = finish(tx, result).await?;
        self.publish(outbox);
        Ok(order)
    }

    /// Checkout from the storefront: catalog prices, free shipping and no
    /// discount; the payment step may be skipped.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id()), err)]
    pub async fn create_storefront_order(
        &self,
        ctx: &TenantContext,
        request: StorefrontOrderRequest,
    ) -> DomainResult<Order> {
        request.validate()?;
        self.ensure_quota(ctx.tenant_id()).await?;

        let draft = OrderDraft {
            channel: STOREFRONT_CHANNEL.to_string(),
            customer_id: request.customer_id,
            shipping_address_id: request.shipping_address_id,
            items: request
                .items
                .iter()
                .map(|i| OrderItemInput::new(i.variant_id, i.quantity))
                .collect(),
            shipping: ShippingMode::free(),
            discount: None,
            payment_method: request.payment_method.unwrap_or_default(),
            payment_reference: None,
            payment_status: if request.bypass_payment {
                PaymentStatus::Skipped
            } else {
                PaymentStatus::Pending
            },
            ordered_at: None,
            target_status: None,
            target_payment_status: None,
            note: request.note,
            author: None,
        };

        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::default();
        let result = self.create_in_tx(&mut tx, ctx, draft, &mut outbox).await;
        let order = finish(tx, result).await?;
        self.publish(outbox);
        Ok(order)
    }

    /// Price a prospective order and report availability without persisting
    /// anything or touching stock.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id(), actor = %actor), err)]
    pub async fn preview(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        request: CreateOrderRequest,
    ) -> DomainResult<OrderPreview> {
        request.validate()?;
        self.throttle(
            &rate_limit::preview_key(ctx.tenant_id(), actor),
            &self.config.create_rate_limit,
        )?;
        if let Some(method) = request.payment_method {
            self.ensure_payment_method(ctx.tenant_id(), method).await?;
        }

        let mut tx = self.store.begin().await?;
        let result = self.preview_in_tx(&mut tx, ctx, &request).await;
        if let Err(err) = tx.rollback().await {
            warn!(error = %err, "preview rollback failed");
        }
        result
    }

    /// Partial update. Replacing items restocks the old set and allocates
    /// the new one; the order's stored VAT rate is kept.
    #[instrument(skip(self, ctx, request), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn update(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        request: UpdateOrderRequest,
    ) -> DomainResult<Order> {
        request.validate()?;
        if request.is_empty() {
            return Err(DomainError::validation("update must change at least one field"));
        }

        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::default();
        let result = self
            .update_in_tx(&mut tx, ctx, order_id, request, &mut outbox)
            .await;
        let order = finish(tx, result).await?;
        self.publish(outbox);
        info!(order_number = order.order_number(), "order updated");
        Ok(order)
    }

    /// Replace the item set (and reprice).
    pub async fn update_items(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        items: Vec<OrderItemInput>,
    ) -> DomainResult<Order> {
        self.update(ctx, actor, order_id, UpdateOrderRequest::items(items))
            .await
    }

    #[instrument(skip(self, ctx, reference), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn update_payment_details(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        method: PaymentMethod,
        reference: Option<String>,
    ) -> DomainResult<Order> {
        validate_payment_reference(reference.as_deref())?;
        self.ensure_payment_method(ctx.tenant_id(), method).await?;

        let command = |now| {
            OrderCommand::UpdatePaymentDetails(UpdatePaymentDetails {
                tenant_id: ctx.tenant_id(),
                order_id,
                payment_method: method,
                payment_reference: reference.clone(),
                occurred_at: now,
            })
        };
        self.run(ctx, order_id, command).await
    }

    /// Move the order through its lifecycle. Cancelling gives the stock
    /// back; returning does so only when configured to.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn transition_status(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        target: OrderStatus,
    ) -> DomainResult<Order> {
        let restock_on_return = self.config.restock_on_return;
        let order = self
            .run(ctx, order_id, |now| {
                OrderCommand::ChangeStatus(ChangeStatus {
                    tenant_id: ctx.tenant_id(),
                    order_id,
                    target,
                    restock_on_return,
                    occurred_at: now,
                })
            })
            .await?;
        info!(order_number = order.order_number(), status = %target, "order status changed");
        Ok(order)
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn transition_payment(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        target: PaymentStatus,
    ) -> DomainResult<Order> {
        let order = self
            .run(ctx, order_id, |now| {
                OrderCommand::ChangePaymentStatus(ChangePaymentStatus {
                    tenant_id: ctx.tenant_id(),
                    order_id,
                    target,
                    occurred_at: now,
                })
            })
            .await?;
        info!(order_number = order.order_number(), payment_status = %target, "payment status changed");
        Ok(order)
    }

    /// Soft delete. Only pending and cancelled orders qualify; any stock
    /// still reserved goes back.
    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn delete(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
    ) -> DomainResult<()> {
        let order = self
            .run(ctx, order_id, |now| {
                OrderCommand::Delete(DeleteOrder {
                    tenant_id: ctx.tenant_id(),
                    order_id,
                    occurred_at: now,
                })
            })
            .await?;
        info!(order_number = order.order_number(), "order deleted");
        Ok(())
    }

    pub async fn get(&self, ctx: &TenantContext, order_id: OrderId) -> DomainResult<Order> {
        self.store
            .find_order(ctx.tenant_id(), order_id)
            .await?
            .map(Order::from_snapshot)
            .ok_or_else(|| DomainError::not_found("order"))
    }

    pub async fn get_by_number(
        &self,
        ctx: &TenantContext,
        order_number: &str,
    ) -> DomainResult<Order> {
        self.store
            .find_order_by_number(ctx.tenant_id(), order_number.trim())
            .await?
            .map(Order::from_snapshot)
            .ok_or_else(|| DomainError::not_found("order"))
    }

    #[instrument(skip(self, ctx, query), fields(tenant_id = %ctx.tenant_id()), err)]
    pub async fn list(
        &self,
        ctx: &TenantContext,
        query: &OrderListQuery,
    ) -> DomainResult<OrderPage<Order>> {
        let (items, total) = self.store.list_orders(ctx.tenant_id(), query).await?;
        debug!(returned = items.len(), total, "orders listed");
        Ok(OrderPage {
            items: items.into_iter().map(Order::from_snapshot).collect(),
            total,
            page: query.page.page(),
            page_size: query.page.page_size(),
        })
    }

    // --- reporting ----------------------------------------------------------

    /// Count, revenue and cost of goods over the orders matching `filter`.
    #[instrument(skip(self, ctx, filter), fields(tenant_id = %ctx.tenant_id()), err)]
    pub async fn summarize(
        &self,
        ctx: &TenantContext,
        filter: &OrderFilter,
    ) -> DomainResult<OrderSummary> {
        let summary = self.store.summarize_orders(ctx.tenant_id(), filter).await?;
        debug!(count = summary.count, total = %summary.total, "orders summarized");
        Ok(summary)
    }

    /// Count and revenue per status, channel, country or customer.
    #[instrument(skip(self, ctx, filter), fields(tenant_id = %ctx.tenant_id(), ?dimension), err)]
    pub async fn breakdown(
        &self,
        ctx: &TenantContext,
        filter: &OrderFilter,
        dimension: ReportDimension,
    ) -> DomainResult<Vec<GroupTotal>> {
        Ok(self
            .store
            .group_orders(ctx.tenant_id(), filter, dimension)
            .await?)
    }

    /// Highest-value orders matching `filter`, at most [`MAX_TOP_ORDERS`].
    pub async fn top_orders(
        &self,
        ctx: &TenantContext,
        filter: OrderFilter,
        limit: u32,
    ) -> DomainResult<Vec<Order>> {
        let query = OrderListQuery {
            filter,
            sort: OrderSort::parse(["-total", "-orderedAt"]),
            search: None,
            page: PageRequest::new(Some(1), Some(limit.min(MAX_TOP_ORDERS))),
        };
        Ok(self.list(ctx, &query).await?.items)
    }

    #[instrument(skip(self, ctx, content), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn add_note(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        content: &str,
    ) -> DomainResult<OrderNote> {
        let content = note_content(content)?;
        self.throttle(
            &rate_limit::note_key(ctx.tenant_id(), actor, order_id),
            &self.config.note_rate_limit,
        )?;

        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::default();
        let result = async {
            lock_order_row(&mut tx, ctx.tenant_id(), order_id).await?;
            let note = OrderNote::new(ctx.tenant_id(), order_id, Some(actor), &content, Utc::now())?;
            tx.insert_note(&note).await?;
            outbox.note_added(&note)?;
            Ok::<_, DomainError>(note)
        }
        .await;
        let note = finish(tx, result).await?;
        self.publish(outbox);
        Ok(note)
    }

    #[instrument(skip(self, ctx, content), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn update_note(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        note_id: OrderNoteId,
        content: &str,
    ) -> DomainResult<OrderNote> {
        let content = note_content(content)?;

        let mut tx = self.store.begin().await?;
        let result = async {
            lock_order_row(&mut tx, ctx.tenant_id(), order_id).await?;
            let mut note = tx
                .find_note(ctx.tenant_id(), order_id, note_id)
                .await?
                .ok_or_else(|| DomainError::not_found("note"))?;
            note.revise(&content, Utc::now())?;
            tx.update_note(&note).await?;
            Ok::<_, DomainError>(note)
        }
        .await;
        finish(tx, result).await
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id(), actor = %actor, order_id = %order_id), err)]
    pub async fn delete_note(
        &self,
        ctx: &TenantContext,
        actor: UserId,
        order_id: OrderId,
        note_id: OrderNoteId,
    ) -> DomainResult<()> {
        let mut tx = self.store.begin().await?;
        let result = async {
            lock_order_row(&mut tx, ctx.tenant_id(), order_id).await?;
            if !tx.delete_note(ctx.tenant_id(), order_id, note_id).await? {
                return Err(DomainError::not_found("note"));
            }
            Ok::<_, DomainError>(())
        }
        .await;
        finish(tx, result).await
    }

    pub async fn list_notes(
        &self,
        ctx: &TenantContext,
        order_id: OrderId,
    ) -> DomainResult<Vec<OrderNote>> {
        if self.store.find_order(ctx.tenant_id(), order_id).await?.is_none() {
            return Err(DomainError::not_found("order"));
        }
        Ok(self.store.list_notes(ctx.tenant_id(), order_id).await?)
    }

    // --- transaction bodies -------------------------------------------------

    async fn create_in_tx(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        draft: OrderDraft,
        outbox: &mut Outbox,
    ) -> DomainResult<Order> {
        let tenant_id = ctx.tenant_id();
        self.ensure_payment_method(tenant_id, draft.payment_method).await?;

        if tx.customer(tenant_id, draft.customer_id).await?.is_none() {
            return Err(DomainError::not_found("customer"));
        }
        let address =
            resolve_address(tx, tenant_id, draft.customer_id, draft.shipping_address_id).await?;
        let (items, _) = price_items(tx, ctx, &draft.items).await?;
        let zone = resolve_zone(tx, ctx, &draft.shipping, &address).await?;
        let totals = compute(
            &price_lines(&items),
            ctx.vat_rate(),
            draft.discount.as_ref(),
            charge(&draft.shipping, zone.as_ref()),
        )?;

        let now = Utc::now();
        let changes = InventoryLedger::allocate(tx, tenant_id, &stock_lines(&items)).await?;
        outbox.stock(tenant_id, StockDirection::Allocate, &changes, now)?;

        let mut open = OpenOrder {
            tenant_id,
            order_id: OrderId::new(),
            order_number: String::new(),
            customer_id: draft.customer_id,
            shipping_address_id: draft.shipping_address_id,
            channel: draft.channel,
            currency: ctx.currency().to_string(),
            shipping: draft.shipping,
            discount: draft.discount,
            totals,
            items,
            payment_method: draft.payment_method,
            payment_reference: draft
                .payment_reference
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            payment_status: draft.payment_status,
            ordered_at: draft.ordered_at.unwrap_or(now),
            occurred_at: now,
        };

        let (mut order, created) = self.insert_with_fresh_number(tx, &mut open).await?;
        outbox.order_events(&order, std::slice::from_ref(&created))?;

        if let Some(target) = draft.target_status.filter(|s| *s != OrderStatus::Pending) {
            let command = OrderCommand::ChangeStatus(ChangeStatus {
                tenant_id,
                order_id: order.id_typed(),
                target,
                restock_on_return: self.config.restock_on_return,
                occurred_at: now,
            });
            apply_command(tx, &mut order, &command, outbox).await?;
        }
        if let Some(target) = draft
            .target_payment_status
            .filter(|s| *s != order.payment_status())
        {
            let command = OrderCommand::ChangePaymentStatus(ChangePaymentStatus {
                tenant_id,
                order_id: order.id_typed(),
                target,
                occurred_at: now,
            });
            apply_command(tx, &mut order, &command, outbox).await?;
        }

        if let Some(content) = draft.note {
            let note = OrderNote::new(tenant_id, order.id_typed(), draft.author, &content, now)?;
            tx.insert_note(&note).await?;
            outbox.note_added(&note)?;
        }

        info!(
            order_id = %order.id_typed(),
            order_number = order.order_number(),
            total = %order.totals().total,
            "order created"
        );
        Ok(order)
    }

    /// Insert under a freshly generated number, retrying on collision.
    ///
    /// Each attempt runs under its own savepoint so a lost race rolls back
    /// only the insert, never the stock already allocated in `tx`.
    async fn insert_with_fresh_number(
        &self,
        tx: &mut S::Tx,
        open: &mut OpenOrder,
    ) -> DomainResult<(Order, OrderEvent)> {
        for attempt in 0..=MAX_ORDER_NUMBER_RETRIES {
            open.order_number = self.numbers.generate(open.tenant_id);
            let (order, created) = Order::open(open)?;

            let savepoint = format!("order_number_{attempt}");
            tx.savepoint(&savepoint).await?;
            match tx.insert_order(order.snapshot()).await {
                Ok(()) => {
                    tx.release_savepoint(&savepoint).await?;
                    return Ok((order, created));
                }
                Err(err) if err.is_order_number_collision() => {
                    tx.rollback_to_savepoint(&savepoint).await?;
                    debug!(attempt, "order number collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            retries = MAX_ORDER_NUMBER_RETRIES,
            "no free order number found"
        );
        Err(DomainError::conflict(
            "could not allocate an order number: exhausted identifier space",
        ))
    }

    async fn preview_in_tx(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        request: &CreateOrderRequest,
    ) -> DomainResult<OrderPreview> {
        let tenant_id = ctx.tenant_id();
        if tx.customer(tenant_id, request.customer_id).await?.is_none() {
            return Err(DomainError::not_found("customer"));
        }
        let address =
            resolve_address(tx, tenant_id, request.customer_id, request.shipping_address_id)
                .await?;
        let (items, variants) = price_items(tx, ctx, &request.items).await?;
        let zone = resolve_zone(tx, ctx, &request.shipping, &address).await?;
        let totals = compute(
            &price_lines(&items),
            ctx.vat_rate(),
            request.discount.as_ref(),
            charge(&request.shipping, zone.as_ref()),
        )?;

        let mut demand: BTreeMap<VariantId, i64> = BTreeMap::new();
        for item in &items {
            let total = demand.entry(item.variant_id).or_insert(0);
            *total = total
                .checked_add(item.quantity)
                .ok_or_else(|| DomainError::validation("item quantity out of range"))?;
        }
        let levels: Vec<StockLevel> = variants
            .values()
            .map(|v| StockLevel {
                variant_id: v.id,
                name: v.name.clone(),
                stock_quantity: v.stock_quantity,
            })
            .collect();
        let in_stock = plan(
            &levels,
            StockDirection::Allocate,
            &stock_lines(&items),
        )
        .is_ok();

        let lines = items
            .iter()
            .map(|item| {
                let available = variants
                    .get(&item.variant_id)
                    .map(|v| v.stock_quantity)
                    .unwrap_or(0);
                PreviewLine {
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    line_total: item.line_total,
                    available,
                    sufficient: demand.get(&item.variant_id).copied().unwrap_or(0) <= available,
                }
            })
            .collect();

        Ok(OrderPreview {
            totals,
            lines,
            in_stock,
        })
    }

    async fn update_in_tx(
        &self,
        tx: &mut S::Tx,
        ctx: &TenantContext,
        order_id: OrderId,
        request: UpdateOrderRequest,
        outbox: &mut Outbox,
    ) -> DomainResult<Order> {
        let tenant_id = ctx.tenant_id();
        let mut order = load_for_update(tx, tenant_id, order_id).await?;
        let current = order.snapshot().clone();
        let status = current.status;

        if request.items.is_some() && !status.allows_item_changes() {
            return Err(DomainError::invalid_transition(format!(
                "items cannot be changed while order is {status}"
            )));
        }
        let address_changes = request
            .shipping_address_id
            .is_some_and(|id| id != current.shipping_address_id);
        if address_changes && !status.allows_address_change() {
            return Err(DomainError::invalid_transition(format!(
                "shipping address cannot be changed while order is {status}"
            )));
        }

        let now = Utc::now();
        let items = match &request.items {
            Some(inputs) => {
                if current.stock_allocated {
                    let released =
                        InventoryLedger::restock(tx, tenant_id, &stock_lines(&current.items))
                            .await?;
                    outbox.stock(tenant_id, StockDirection::Restock, &released, now)?;
                }
                let (items, _) = price_items(tx, ctx, inputs).await?;
                let allocated =
                    InventoryLedger::allocate(tx, tenant_id, &stock_lines(&items)).await?;
                outbox.stock(tenant_id, StockDirection::Allocate, &allocated, now)?;
                Some(items)
            }
            None => None,
        };

        let shipping = request.shipping.unwrap_or(current.shipping);
        let discount = if request.clear_discount {
            None
        } else {
            request.discount.or(current.discount)
        };
        let reprice = items.is_some()
            || request.shipping.is_some()
            || request.changes_discount()
            || address_changes;

        let totals = if reprice {
            let address_id = request
                .shipping_address_id
                .unwrap_or(current.shipping_address_id);
            let address = resolve_address(tx, tenant_id, current.customer_id, address_id).await?;
            let zone = resolve_zone(tx, ctx, &shipping, &address).await?;
            let effective_items = items.as_deref().unwrap_or(&current.items);
            compute(
                &price_lines(effective_items),
                current.totals.vat_rate,
                discount.as_ref(),
                charge(&shipping, zone.as_ref()),
            )?
        } else {
            current.totals
        };

        let replaces_items = items.is_some();
        let command = OrderCommand::Revise(ReviseOrder {
            tenant_id,
            order_id,
            channel: request.channel,
            shipping_address_id: request.shipping_address_id,
            shipping: request.shipping,
            discount: request.discount,
            clear_discount: request.clear_discount,
            ordered_at: request.ordered_at,
            items,
            totals,
            occurred_at: now,
        });
        let expected = ExpectedVersion::of(&order);
        let events = execute(&mut order, &command)?;

        if replaces_items {
            tx.replace_items(order.snapshot()).await?;
        }
        tx.update_order(order.snapshot(), expected).await?;
        outbox.order_events(&order, &events)?;
        Ok(order)
    }

    /// Load, decide, persist: the common path of single-command writes.
    async fn run<F>(&self, ctx: &TenantContext, order_id: OrderId, command: F) -> DomainResult<Order>
    where
        F: FnOnce(DateTime<Utc>) -> OrderCommand,
    {
        let mut tx = self.store.begin().await?;
        let mut outbox = Outbox::default();
        let result = async {
            let mut order = load_for_update(&mut tx, ctx.tenant_id(), order_id).await?;
            let command = command(Utc::now());
            apply_command(&mut tx, &mut order, &command, &mut outbox).await?;
            Ok::<_, DomainError>(order)
        }
        .await;
        let order = finish(tx, result).await?;
        self.publish(outbox);
        Ok(order)
    }

    // --- collaborators ------------------------------------------------------

    fn throttle(&self, key: &str, policy: &RateLimitPolicy) -> DomainResult<()> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        limiter.check(key, policy).into_result().inspect_err(|_| {
            warn!(key, "rate limit exceeded");
        })
    }

    async fn ensure_quota(&self, tenant_id: TenantId) -> DomainResult<()> {
        match &self.plan_gate {
            Some(gate) => gate.ensure_can_create_order(tenant_id).await,
            None => Ok(()),
        }
    }

    async fn ensure_payment_method(
        &self,
        tenant_id: TenantId,
        method: PaymentMethod,
    ) -> DomainResult<()> {
        let Some(policy) = &self.payment_methods else {
            return Ok(());
        };
        if policy.is_enabled(tenant_id, method).await? {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "payment method {method} is not enabled"
            )))
        }
    }

    fn publish(&self, outbox: Outbox) {
        for envelope in outbox.envelopes {
            let event_type = envelope.event_type().to_string();
            if let Err(err) = self.bus.publish(envelope) {
                warn!(event_type, error = ?err, "failed to publish event");
            }
        }
    }
}

/// Normalized creation input shared by the back office and the storefront.
struct OrderDraft {
    channel: String,
    customer_id: CustomerId,
    shipping_address_id: AddressId,
    items: Vec<OrderItemInput>,
    shipping: ShippingMode,
    discount: Option<Discount>,
    payment_method: PaymentMethod,
    payment_reference: Option<String>,
    payment_status: PaymentStatus,
    ordered_at: Option<DateTime<Utc>>,
    target_status: Option<OrderStatus>,
    target_payment_status: Option<PaymentStatus>,
    note: Option<String>,
    author: Option<UserId>,
}

/// Events waiting for the transaction to commit.
#[derive(Default)]
struct Outbox {
    envelopes: Vec<PublishedEvent>,
}

impl Outbox {
    fn order_events(&mut self, order: &Order, events: &[OrderEvent]) -> DomainResult<()> {
        // `order` already reflects `events`; the last one produced its version.
        let first = order.version() + 1 - events.len() as u64;
        for (offset, event) in events.iter().enumerate() {
            let envelope = PublishedEvent::wrap(
                order.tenant_id(),
                order.id_typed().0,
                ORDER_AGGREGATE,
                first + offset as u64,
                event,
            )
            .map_err(serialization_error)?;
            self.envelopes.push(envelope);
        }
        Ok(())
    }

    fn stock(
        &mut self,
        tenant_id: TenantId,
        direction: StockDirection,
        changes: &[StockChange],
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        for change in changes {
            let event = change.into_event(tenant_id, direction, at);
            // Variant stock is not versioned here.
            let envelope =
                PublishedEvent::wrap(tenant_id, change.variant_id.0, VARIANT_AGGREGATE, 0, &event)
                    .map_err(serialization_error)?;
            self.envelopes.push(envelope);
        }
        Ok(())
    }

    fn note_added(&mut self, note: &OrderNote) -> DomainResult<()> {
        let envelope = PublishedEvent::wrap(
            note.tenant_id,
            note.order_id.0,
            ORDER_AGGREGATE,
            0,
            &OrderNoteAdded::from(note),
        )
        .map_err(serialization_error)?;
        self.envelopes.push(envelope);
        Ok(())
    }
}

fn serialization_error(err: serde_json::Error) -> DomainError {
    tracing::error!(error = %err, "event serialization failed");
    DomainError::internal("event serialization failed")
}

/// Commit on success, roll back on failure.
async fn finish<T: OrderTx, R>(tx: T, result: DomainResult<R>) -> DomainResult<R> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Decide `command`, release stock if the outcome asks for it, persist.
async fn apply_command<T: OrderTx>(
    tx: &mut T,
    order: &mut Order,
    command: &OrderCommand,
    outbox: &mut Outbox,
) -> DomainResult<Vec<OrderEvent>> {
    let expected = ExpectedVersion::of(&*order);
    let events = execute(order, command)?;

    if events.iter().any(OrderEvent::releases_stock) {
        let released =
            InventoryLedger::restock(tx, order.tenant_id(), &stock_lines(order.items())).await?;
        let at = events
            .first()
            .map(orderdesk_events::Event::occurred_at)
            .unwrap_or_else(Utc::now);
        outbox.stock(order.tenant_id(), StockDirection::Restock, &released, at)?;
    }

    tx.update_order(order.snapshot(), expected).await?;
    outbox.order_events(order, &events)?;
    Ok(events)
}

async fn load_for_update<T: OrderTx>(
    tx: &mut T,
    tenant_id: TenantId,
    order_id: OrderId,
) -> DomainResult<Order> {
    tx.load_order_for_update(tenant_id, order_id)
        .await?
        .map(Order::from_snapshot)
        .ok_or_else(|| DomainError::not_found("order"))
}

async fn lock_order_row<T: OrderTx>(
    tx: &mut T,
    tenant_id: TenantId,
    order_id: OrderId,
) -> DomainResult<()> {
    load_for_update(tx, tenant_id, order_id).await.map(|_| ())
}

async fn resolve_address<T: OrderTx>(
    tx: &mut T,
    tenant_id: TenantId,
    customer_id: CustomerId,
    address_id: AddressId,
) -> DomainResult<Address> {
    tx.address(tenant_id, address_id)
        .await?
        .filter(|a| a.customer_id == customer_id)
        .ok_or_else(|| DomainError::not_found("shipping address"))
}

async fn resolve_zone<T: OrderTx>(
    tx: &mut T,
    ctx: &TenantContext,
    shipping: &ShippingMode,
    address: &Address,
) -> DomainResult<Option<ShippingZone>> {
    let Some(zone_id) = shipping.zone_id() else {
        return Ok(None);
    };
    let zone = tx
        .shipping_zone(ctx.tenant_id(), zone_id)
        .await?
        .ok_or_else(|| DomainError::not_found("shipping zone"))?;
    zone.ensure_eligible(ctx.currency(), &address.country_code)?;
    Ok(Some(zone))
}

fn charge<'a>(shipping: &ShippingMode, zone: Option<&'a ShippingZone>) -> ShippingCharge<'a> {
    match (shipping, zone) {
        (ShippingMode::Zoned(_), Some(zone)) => ShippingCharge::Zone(zone),
        (ShippingMode::Manual(fee), _) => ShippingCharge::Manual(*fee),
        // resolve_zone always loads the zone of a zoned order.
        (ShippingMode::Zoned(_), None) => ShippingCharge::Manual(rust_decimal::Decimal::ZERO),
    }
}

/// Build order lines from inputs, defaulting prices to the variant's own.
///
/// Variant prices may only stand in for the order's when they are quoted in
/// the tenant currency.
async fn price_items<T: OrderTx>(
    tx: &mut T,
    ctx: &TenantContext,
    inputs: &[OrderItemInput],
) -> DomainResult<(Vec<OrderItem>, HashMap<VariantId, Variant>)> {
    let mut ids: Vec<VariantId> = inputs.iter().map(|i| i.variant_id).collect();
    ids.sort();
    ids.dedup();

    let variants: HashMap<VariantId, Variant> = tx
        .variants(ctx.tenant_id(), &ids)
        .await?
        .into_iter()
        .map(|v| (v.id, v))
        .collect();

    let mut items = Vec::with_capacity(inputs.len());
    for input in inputs {
        let variant = variants
            .get(&input.variant_id)
            .ok_or_else(|| DomainError::not_found("variant"))?;
        if input.unit_price.is_none() && !variant.currency.eq_ignore_ascii_case(ctx.currency()) {
            return Err(DomainError::validation(format!(
                "variant {} is priced in {}, not {}",
                variant.name,
                variant.currency,
                ctx.currency()
            )));
        }
        items.push(OrderItem::new(
            input.variant_id,
            input.quantity,
            input.unit_price.unwrap_or(variant.sale_price),
            input.unit_cost.unwrap_or(variant.cost_price),
        )?);
    }
    Ok((items, variants))
}

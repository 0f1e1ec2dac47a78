use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::{Aggregate, DomainError, TenantId};
use orderdesk_events::Event;

use crate::item::OrderItem;
use crate::parties::{AddressId, CustomerId};
use crate::payment::{PaymentMethod, PaymentStatus};
use crate::pricing::{Discount, Totals};
use crate::shipping::ShippingMode;
use crate::status::OrderStatus;

orderdesk_core::domain_id!(
    /// Identifier of an order.
    OrderId
);

/// Lifecycle timestamps. Status and payment stamps are set by the transition
/// that enters the corresponding state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTimestamps {
    pub ordered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub placed_at: Option<DateTime<Utc>>,
    pub ready_for_shipment_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl OrderTimestamps {
    pub fn new(ordered_at: DateTime<Utc>, created_at: DateTime<Utc>) -> Self {
        Self {
            ordered_at,
            created_at,
            updated_at: created_at,
            placed_at: None,
            ready_for_shipment_at: None,
            shipped_at: None,
            fulfilled_at: None,
            cancelled_at: None,
            returned_at: None,
            paid_at: None,
            failed_at: None,
            refunded_at: None,
            deleted_at: None,
        }
    }

    fn stamp_status(&mut self, status: OrderStatus, at: DateTime<Utc>) {
        let slot = match status {
            OrderStatus::Pending => return,
            OrderStatus::Placed => &mut self.placed_at,
            OrderStatus::ReadyForShipment => &mut self.ready_for_shipment_at,
            OrderStatus::Shipped => &mut self.shipped_at,
            OrderStatus::Fulfilled => &mut self.fulfilled_at,
            OrderStatus::Cancelled => &mut self.cancelled_at,
            OrderStatus::Returned => &mut self.returned_at,
        };
        *slot = Some(at);
    }

    fn stamp_payment(&mut self, status: PaymentStatus, at: DateTime<Utc>) {
        let slot = match status {
            PaymentStatus::Pending | PaymentStatus::Skipped => return,
            PaymentStatus::Paid => &mut self.paid_at,
            PaymentStatus::Failed => &mut self.failed_at,
            PaymentStatus::Refunded => &mut self.refunded_at,
        };
        *slot = Some(at);
    }
}

/// Persisted state of an order, items included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: OrderId,
    pub tenant_id: TenantId,
    pub order_number: String,
    pub customer_id: CustomerId,
    pub shipping_address_id: AddressId,
    pub channel: String,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub shipping: ShippingMode,
    pub discount: Option<Discount>,
    pub totals: Totals,
    pub items: Vec<OrderItem>,
    /// Whether the items currently hold reserved stock.
    pub stock_allocated: bool,
    pub timestamps: OrderTimestamps,
    pub version: u64,
}

/// Aggregate root: Order.
///
/// Always represents an existing order: new orders come from [`Order::open`],
/// stored ones from [`Order::from_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    state: OrderSnapshot,
}

impl Order {
    /// Decide the creation of a new order.
    pub fn open(cmd: &OpenOrder) -> Result<(Self, OrderEvent), DomainError> {
        if cmd.items.is_empty() {
            return Err(DomainError::validation("order must have at least one item"));
        }
        if cmd.order_number.trim().is_empty() {
            return Err(DomainError::validation("order number must not be empty"));
        }
        if cmd.channel.trim().is_empty() {
            return Err(DomainError::validation("channel must not be empty"));
        }
        if !cmd.payment_status.is_initial() {
            return Err(DomainError::validation(format!(
                "order cannot be created with payment status {}",
                cmd.payment_status
            )));
        }
        if !cmd.totals.is_balanced() {
            return Err(DomainError::internal("order totals do not balance"));
        }
        cmd.shipping.validate()?;

        let snapshot = OrderSnapshot {
            id: cmd.order_id,
            tenant_id: cmd.tenant_id,
            order_number: cmd.order_number.clone(),
            customer_id: cmd.customer_id,
            shipping_address_id: cmd.shipping_address_id,
            channel: cmd.channel.trim().to_string(),
            currency: cmd.currency.clone(),
            status: OrderStatus::Pending,
            payment_status: cmd.payment_status,
            payment_method: cmd.payment_method,
            payment_reference: cmd.payment_reference.clone(),
            shipping: cmd.shipping,
            discount: cmd.discount,
            totals: cmd.totals,
            items: cmd.items.clone(),
            stock_allocated: true,
            timestamps: OrderTimestamps::new(cmd.ordered_at, cmd.occurred_at),
            version: 0,
        };

        let event = OrderEvent::OrderCreated(OrderCreated {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            order: Box::new(snapshot.clone()),
            occurred_at: cmd.occurred_at,
        });

        let mut order = Self { state: snapshot };
        order.apply(&event);
        Ok((order, event))
    }

    pub fn from_snapshot(state: OrderSnapshot) -> Self {
        Self { state }
    }

    pub fn snapshot(&self) -> &OrderSnapshot {
        &self.state
    }

    pub fn into_snapshot(self) -> OrderSnapshot {
        self.state
    }

    pub fn id_typed(&self) -> OrderId {
        self.state.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.state.tenant_id
    }

    pub fn order_number(&self) -> &str {
        &self.state.order_number
    }

    pub fn status(&self) -> OrderStatus {
        self.state.status
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.state.payment_status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.state.items
    }

    pub fn totals(&self) -> &Totals {
        &self.state.totals
    }

    pub fn timestamps(&self) -> &OrderTimestamps {
        &self.state.timestamps
    }

    pub fn stock_allocated(&self) -> bool {
        self.state.stock_allocated
    }

    pub fn is_deleted(&self) -> bool {
        self.state.timestamps.deleted_at.is_some()
    }
}

/// Command: OpenOrder. Totals and items are priced by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub order_number: String,
    pub customer_id: CustomerId,
    pub shipping_address_id: AddressId,
    pub channel: String,
    pub currency: String,
    pub shipping: ShippingMode,
    pub discount: Option<Discount>,
    pub totals: Totals,
    pub items: Vec<OrderItem>,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub payment_status: PaymentStatus,
    pub ordered_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReviseOrder. `None` fields keep their current value; `totals` is
/// the repriced result of the revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviseOrder {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub channel: Option<String>,
    pub shipping_address_id: Option<AddressId>,
    pub shipping: Option<ShippingMode>,
    pub discount: Option<Discount>,
    /// Drop the current discount; wins over `discount`.
    pub clear_discount: bool,
    pub ordered_at: Option<DateTime<Utc>>,
    pub items: Option<Vec<OrderItem>>,
    pub totals: Totals,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdatePaymentDetails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePaymentDetails {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub target: OrderStatus,
    /// Release reserved stock when the order is returned.
    pub restock_on_return: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangePaymentStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePaymentStatus {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub target: PaymentStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteOrder (soft delete).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOrder {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    Revise(ReviseOrder),
    UpdatePaymentDetails(UpdatePaymentDetails),
    ChangeStatus(ChangeStatus),
    ChangePaymentStatus(ChangePaymentStatus),
    Delete(DeleteOrder),
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub order: Box<OrderSnapshot>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderRevised. Carries the resulting values, not the deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRevised {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub channel: String,
    pub shipping_address_id: AddressId,
    pub shipping: ShippingMode,
    pub discount: Option<Discount>,
    pub ordered_at: DateTime<Utc>,
    /// `Some` when the item set was replaced.
    pub items: Option<Vec<OrderItem>>,
    pub totals: Totals,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentDetailsUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetailsUpdated {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    /// The transition gives the order's reserved stock back.
    pub released_stock: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusChanged {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderPaid, consumed by billing and accounting automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaid {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub order_number: String,
    pub payment_method: PaymentMethod,
    pub total: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDeleted {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub released_stock: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    OrderRevised(OrderRevised),
    PaymentDetailsUpdated(PaymentDetailsUpdated),
    StatusChanged(StatusChanged),
    PaymentStatusChanged(PaymentStatusChanged),
    OrderPaid(OrderPaid),
    OrderDeleted(OrderDeleted),
}

impl OrderEvent {
    /// Whether carrying out this event gives reserved stock back.
    pub fn releases_stock(&self) -> bool {
        match self {
            OrderEvent::StatusChanged(e) => e.released_stock,
            OrderEvent::OrderDeleted(e) => e.released_stock,
            _ => false,
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "orders.order.created",
            OrderEvent::OrderRevised(_) => "orders.order.revised",
            OrderEvent::PaymentDetailsUpdated(_) => "orders.order.payment_details_updated",
            OrderEvent::StatusChanged(_) => "orders.order.status_changed",
            OrderEvent::PaymentStatusChanged(_) => "orders.order.payment_status_changed",
            OrderEvent::OrderPaid(_) => "orders.order.paid",
            OrderEvent::OrderDeleted(_) => "orders.order.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.occurred_at,
            OrderEvent::OrderRevised(e) => e.occurred_at,
            OrderEvent::PaymentDetailsUpdated(e) => e.occurred_at,
            OrderEvent::StatusChanged(e) => e.occurred_at,
            OrderEvent::PaymentStatusChanged(e) => e.occurred_at,
            OrderEvent::OrderPaid(e) => e.occurred_at,
            OrderEvent::OrderDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Id = OrderId;
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn id(&self) -> &Self::Id {
        &self.state.id
    }

    fn version(&self) -> u64 {
        self.state.version
    }

    fn apply(&mut self, event: &Self::Event) {
        let state = &mut self.state;
        match event {
            OrderEvent::OrderCreated(e) => {
                let version = state.version;
                *state = (*e.order).clone();
                state.version = version;
            }
            OrderEvent::OrderRevised(e) => {
                state.channel = e.channel.clone();
                state.shipping_address_id = e.shipping_address_id;
                state.shipping = e.shipping;
                state.discount = e.discount;
                state.timestamps.ordered_at = e.ordered_at;
                if let Some(items) = &e.items {
                    state.items = items.clone();
                }
                state.totals = e.totals;
            }
            OrderEvent::PaymentDetailsUpdated(e) => {
                state.payment_method = e.payment_method;
                state.payment_reference = e.payment_reference.clone();
            }
            OrderEvent::StatusChanged(e) => {
                state.status = e.to;
                state.timestamps.stamp_status(e.to, e.occurred_at);
                if e.released_stock {
                    state.stock_allocated = false;
                }
            }
            OrderEvent::PaymentStatusChanged(e) => {
                state.payment_status = e.to;
                state.timestamps.stamp_payment(e.to, e.occurred_at);
            }
            OrderEvent::OrderPaid(_) => {}
            OrderEvent::OrderDeleted(e) => {
                state.timestamps.deleted_at = Some(e.occurred_at);
                if e.released_stock {
                    state.stock_allocated = false;
                }
            }
        }

        if !matches!(event, OrderEvent::OrderCreated(_)) {
            state.timestamps.updated_at = event.occurred_at();
        }

        // Deterministic version tracking: +1 per applied event.
        state.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::Revise(cmd) => self.handle_revise(cmd),
            OrderCommand::UpdatePaymentDetails(cmd) => self.handle_payment_details(cmd),
            OrderCommand::ChangeStatus(cmd) => self.handle_change_status(cmd),
            OrderCommand::ChangePaymentStatus(cmd) => self.handle_change_payment_status(cmd),
            OrderCommand::Delete(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Order {
    /// Foreign or deleted orders are indistinguishable from missing ones.
    fn ensure_visible(&self, tenant_id: TenantId, order_id: OrderId) -> Result<(), DomainError> {
        if self.state.tenant_id != tenant_id || self.state.id != order_id || self.is_deleted() {
            return Err(DomainError::not_found("order"));
        }
        Ok(())
    }

    fn handle_revise(&self, cmd: &ReviseOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.order_id)?;
        let status = self.state.status;

        if let Some(items) = &cmd.items {
            if !status.allows_item_changes() {
                return Err(DomainError::invalid_transition(format!(
                    "items cannot be changed while order is {status}"
                )));
            }
            if items.is_empty() {
                return Err(DomainError::validation("order must have at least one item"));
            }
        }

        if let Some(address_id) = cmd.shipping_address_id {
            if address_id != self.state.shipping_address_id && !status.allows_address_change() {
                return Err(DomainError::invalid_transition(format!(
                    "shipping address cannot be changed while order is {status}"
                )));
            }
        }

        let channel = match &cmd.channel {
            Some(channel) if channel.trim().is_empty() => {
                return Err(DomainError::validation("channel must not be empty"));
            }
            Some(channel) => channel.trim().to_string(),
            None => self.state.channel.clone(),
        };

        let shipping = cmd.shipping.unwrap_or(self.state.shipping);
        shipping.validate()?;
        if !cmd.totals.is_balanced() {
            return Err(DomainError::internal("order totals do not balance"));
        }

        Ok(vec![OrderEvent::OrderRevised(OrderRevised {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            channel,
            shipping_address_id: cmd
                .shipping_address_id
                .unwrap_or(self.state.shipping_address_id),
            shipping,
            discount: if cmd.clear_discount {
                None
            } else {
                cmd.discount.or(self.state.discount)
            },
            ordered_at: cmd.ordered_at.unwrap_or(self.state.timestamps.ordered_at),
            items: cmd.items.clone(),
            totals: cmd.totals,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_payment_details(
        &self,
        cmd: &UpdatePaymentDetails,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.order_id)?;
        let status = self.state.status;
        if !status.allows_payment_details() {
            return Err(DomainError::invalid_transition(format!(
                "payment details cannot be changed while order is {status}"
            )));
        }

        let reference = cmd
            .payment_reference
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        Ok(vec![OrderEvent::PaymentDetailsUpdated(PaymentDetailsUpdated {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            payment_method: cmd.payment_method,
            payment_reference: reference,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_status(&self, cmd: &ChangeStatus) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.order_id)?;
        let from = self.state.status;
        let to = from.transition_to(cmd.target)?;

        let releases = match to {
            OrderStatus::Cancelled => true,
            OrderStatus::Returned => cmd.restock_on_return,
            _ => false,
        };

        Ok(vec![OrderEvent::StatusChanged(StatusChanged {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            from,
            to,
            released_stock: releases && self.state.stock_allocated,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_payment_status(
        &self,
        cmd: &ChangePaymentStatus,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.order_id)?;
        let step = self
            .state
            .payment_status
            .transition_to(cmd.target, self.state.status)?;

        let mut events = vec![OrderEvent::PaymentStatusChanged(PaymentStatusChanged {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            from: step.from,
            to: step.to,
            occurred_at: cmd.occurred_at,
        })];

        if step.settles() {
            events.push(OrderEvent::OrderPaid(OrderPaid {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                order_number: self.state.order_number.clone(),
                payment_method: self.state.payment_method,
                total: self.state.totals.total,
                currency: self.state.currency.clone(),
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_delete(&self, cmd: &DeleteOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_visible(cmd.tenant_id, cmd.order_id)?;
        let status = self.state.status;
        if !status.allows_deletion() {
            return Err(DomainError::invalid_transition(format!(
                "order cannot be deleted while {status}"
            )));
        }

        Ok(vec![OrderEvent::OrderDeleted(OrderDeleted {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            released_stock: self.state.stock_allocated,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::price_lines;
    use crate::pricing::{ShippingCharge, compute};
    use orderdesk_events::execute;
    use orderdesk_inventory::VariantId;
    use rust_decimal_macros::dec;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_items() -> Vec<OrderItem> {
        vec![
            OrderItem::new(VariantId::new(), 3, dec!(10.00), dec!(4.00)).unwrap(),
            OrderItem::new(VariantId::new(), 1, dec!(25.00), dec!(12.00)).unwrap(),
        ]
    }

    fn open_cmd(tenant_id: TenantId) -> OpenOrder {
        let items = test_items();
        let totals = compute(
            &price_lines(&items),
            dec!(0.05),
            None,
            ShippingCharge::Manual(dec!(5.00)),
        )
        .unwrap();
        OpenOrder {
            tenant_id,
            order_id: OrderId::new(),
            order_number: "aB3xY9".to_string(),
            customer_id: CustomerId::new(),
            shipping_address_id: AddressId::new(),
            channel: "manual".to_string(),
            currency: "USD".to_string(),
            shipping: ShippingMode::Manual(dec!(5.00)),
            discount: None,
            totals,
            items,
            payment_method: PaymentMethod::BankTransfer,
            payment_reference: None,
            payment_status: PaymentStatus::Pending,
            ordered_at: test_time(),
            occurred_at: test_time(),
        }
    }

    fn opened() -> (Order, TenantId) {
        let tenant_id = test_tenant_id();
        let (order, _) = Order::open(&open_cmd(tenant_id)).unwrap();
        (order, tenant_id)
    }

    fn change_status(order: &Order, target: OrderStatus) -> OrderCommand {
        OrderCommand::ChangeStatus(ChangeStatus {
            tenant_id: order.tenant_id(),
            order_id: order.id_typed(),
            target,
            restock_on_return: false,
            occurred_at: test_time(),
        })
    }

    fn change_payment(order: &Order, target: PaymentStatus) -> OrderCommand {
        OrderCommand::ChangePaymentStatus(ChangePaymentStatus {
            tenant_id: order.tenant_id(),
            order_id: order.id_typed(),
            target,
            occurred_at: test_time(),
        })
    }

    #[test]
    fn open_emits_order_created_event() {
        let tenant_id = test_tenant_id();
        let cmd = open_cmd(tenant_id);

        let (order, event) = Order::open(&cmd).unwrap();

        match &event {
            OrderEvent::OrderCreated(e) => {
                assert_eq!(e.tenant_id, tenant_id);
                assert_eq!(e.order_id, cmd.order_id);
                assert_eq!(e.order.totals.total, dec!(62.75));
            }
            _ => panic!("Expected OrderCreated event"),
        }
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.payment_status(), PaymentStatus::Pending);
        assert!(order.stock_allocated());
        assert_eq!(order.version(), 1);
    }

    #[test]
    fn open_rejects_empty_items_and_paid_start() {
        let mut cmd = open_cmd(test_tenant_id());
        cmd.items.clear();
        assert!(matches!(Order::open(&cmd), Err(DomainError::Validation(_))));

        let mut cmd = open_cmd(test_tenant_id());
        cmd.payment_status = PaymentStatus::Paid;
        assert!(matches!(Order::open(&cmd), Err(DomainError::Validation(_))));
    }

    #[test]
    fn pending_to_shipped_is_rejected_without_mutation() {
        let (mut order, _) = opened();
        let before = order.clone();

        let err = execute(&mut order, &change_status(&before, OrderStatus::Shipped)).unwrap_err();

        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(order, before);
    }

    #[test]
    fn placed_then_shipped_stamps_both_timestamps() {
        let (mut order, _) = opened();

        let cmd = change_status(&order, OrderStatus::Placed);
        execute(&mut order, &cmd).unwrap();
        let cmd = change_status(&order, OrderStatus::Shipped);
        execute(&mut order, &cmd).unwrap();

        assert_eq!(order.status(), OrderStatus::Shipped);
        assert!(order.timestamps().placed_at.is_some());
        assert!(order.timestamps().shipped_at.is_some());
        assert!(order.timestamps().ready_for_shipment_at.is_none());
        assert_eq!(order.version(), 3);
    }

    #[test]
    fn cancelling_releases_stock_once() {
        let (mut order, _) = opened();

        let cmd = change_status(&order, OrderStatus::Cancelled);
        let events = execute(&mut order, &cmd).unwrap();
        assert!(events[0].releases_stock());
        assert!(!order.stock_allocated());
        assert!(order.timestamps().cancelled_at.is_some());

        let delete = OrderCommand::Delete(DeleteOrder {
            tenant_id: order.tenant_id(),
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });
        let events = execute(&mut order, &delete).unwrap();
        assert!(!events[0].releases_stock());
        assert!(order.is_deleted());
    }

    #[test]
    fn returns_keep_stock_unless_configured() {
        for (restock_on_return, expected) in [(false, false), (true, true)] {
            let (mut order, _) = opened();
            for target in [
                OrderStatus::Placed,
                OrderStatus::Shipped,
                OrderStatus::Fulfilled,
            ] {
                let cmd = change_status(&order, target);
                execute(&mut order, &cmd).unwrap();
            }

            let cmd = OrderCommand::ChangeStatus(ChangeStatus {
                tenant_id: order.tenant_id(),
                order_id: order.id_typed(),
                target: OrderStatus::Returned,
                restock_on_return,
                occurred_at: test_time(),
            });
            let events = execute(&mut order, &cmd).unwrap();

            assert_eq!(events[0].releases_stock(), expected);
            assert!(order.timestamps().returned_at.is_some());
        }
    }

    #[test]
    fn delete_requires_pending_or_cancelled() {
        let (mut order, _) = opened();
        let cmd = change_status(&order, OrderStatus::Placed);
        execute(&mut order, &cmd).unwrap();

        let delete = OrderCommand::Delete(DeleteOrder {
            tenant_id: order.tenant_id(),
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });
        assert!(matches!(
            order.handle(&delete),
            Err(DomainError::InvalidTransition(_))
        ));
    }

    #[test]
    fn deleting_a_pending_order_releases_stock() {
        let (mut order, _) = opened();
        let delete = OrderCommand::Delete(DeleteOrder {
            tenant_id: order.tenant_id(),
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });

        let events = execute(&mut order, &delete).unwrap();

        assert!(events[0].releases_stock());
        assert!(order.is_deleted());
        assert!(matches!(
            order.handle(&change_status(&order, OrderStatus::Placed)),
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn payment_is_rejected_while_pending() {
        let (order, _) = opened();
        assert!(matches!(
            order.handle(&change_payment(&order, PaymentStatus::Paid)),
            Err(DomainError::InvalidTransition(_))
        ));
    }

    #[test]
    fn entering_paid_emits_order_paid_once() {
        let (mut order, _) = opened();
        let cmd = change_status(&order, OrderStatus::Placed);
        execute(&mut order, &cmd).unwrap();

        let cmd = change_payment(&order, PaymentStatus::Paid);
        let events = execute(&mut order, &cmd).unwrap();

        assert_eq!(events.len(), 2);
        match &events[1] {
            OrderEvent::OrderPaid(e) => {
                assert_eq!(e.order_id, order.id_typed());
                assert_eq!(e.total, dec!(62.75));
                assert_eq!(e.currency, "USD");
            }
            _ => panic!("Expected OrderPaid event"),
        }
        assert_eq!(order.payment_status(), PaymentStatus::Paid);
        assert!(order.timestamps().paid_at.is_some());

        // replaying the same command is rejected, so nothing is emitted twice
        assert!(order.handle(&cmd).is_err());
    }

    #[test]
    fn failed_then_retried_payment_settles() {
        let (mut order, _) = opened();
        for cmd in [
            change_status(&order, OrderStatus::Placed),
            change_payment(&order, PaymentStatus::Failed),
            change_payment(&order, PaymentStatus::Pending),
        ] {
            execute(&mut order, &cmd).unwrap();
        }
        assert!(order.timestamps().failed_at.is_some());

        let pay = change_payment(&order, PaymentStatus::Paid);
        let events = execute(&mut order, &pay).unwrap();
        assert!(matches!(events.last(), Some(OrderEvent::OrderPaid(_))));
    }

    #[test]
    fn item_replacement_is_blocked_after_shipping() {
        let (mut order, tenant_id) = opened();
        for target in [OrderStatus::Placed, OrderStatus::Shipped] {
            let cmd = change_status(&order, target);
            execute(&mut order, &cmd).unwrap();
        }

        let revise = OrderCommand::Revise(ReviseOrder {
            tenant_id,
            order_id: order.id_typed(),
            channel: None,
            shipping_address_id: None,
            shipping: None,
            discount: None,
            clear_discount: false,
            ordered_at: None,
            items: Some(test_items()),
            totals: *order.totals(),
            occurred_at: test_time(),
        });

        assert!(matches!(
            order.handle(&revise),
            Err(DomainError::InvalidTransition(_))
        ));
    }

    #[test]
    fn revise_keeps_unspecified_fields() {
        let (mut order, tenant_id) = opened();
        let before = order.snapshot().clone();

        let revise = OrderCommand::Revise(ReviseOrder {
            tenant_id,
            order_id: order.id_typed(),
            channel: Some(" instagram ".to_string()),
            shipping_address_id: None,
            shipping: None,
            discount: None,
            clear_discount: false,
            ordered_at: None,
            items: None,
            totals: before.totals,
            occurred_at: test_time(),
        });
        execute(&mut order, &revise).unwrap();

        let after = order.snapshot();
        assert_eq!(after.channel, "instagram");
        assert_eq!(after.items, before.items);
        assert_eq!(after.shipping, before.shipping);
        assert_eq!(after.shipping_address_id, before.shipping_address_id);
    }

    #[test]
    fn payment_details_are_closed_after_cancellation() {
        let (mut order, tenant_id) = opened();
        let cmd = change_status(&order, OrderStatus::Cancelled);
        execute(&mut order, &cmd).unwrap();

        let update = OrderCommand::UpdatePaymentDetails(UpdatePaymentDetails {
            tenant_id,
            order_id: order.id_typed(),
            payment_method: PaymentMethod::Tabby,
            payment_reference: Some("ref-1".to_string()),
            occurred_at: test_time(),
        });
        assert!(matches!(
            order.handle(&update),
            Err(DomainError::InvalidTransition(_))
        ));
    }

    #[test]
    fn foreign_tenant_sees_not_found() {
        let (order, _) = opened();
        let cmd = OrderCommand::ChangeStatus(ChangeStatus {
            tenant_id: test_tenant_id(),
            order_id: order.id_typed(),
            target: OrderStatus::Placed,
            restock_on_return: false,
            occurred_at: test_time(),
        });
        assert_eq!(order.handle(&cmd), Err(DomainError::not_found("order")));
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (order, _) = opened();
        let before = order.clone();
        let _ = order.handle(&change_status(&order, OrderStatus::Placed)).unwrap();
        assert_eq!(order, before);
    }
}

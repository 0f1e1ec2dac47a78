//! Orders domain module.
//!
//! Deterministic domain logic for the order lifecycle: the order aggregate
//! and its two state machines, pricing, numbering, notes and the list-query
//! and reporting models. No IO; storage and orchestration live in `orderdesk-infra`.

pub mod context;
pub mod item;
pub mod note;
pub mod numbering;
pub mod order;
pub mod parties;
pub mod payment;
pub mod pricing;
pub mod query;
pub mod report;
pub mod request;
pub mod shipping;
pub mod status;

pub use context::TenantContext;
pub use item::{MAX_ITEM_QUANTITY, OrderItem, OrderItemId};
pub use note::{MAX_NOTE_LENGTH, OrderNote, OrderNoteAdded, OrderNoteId};
pub use numbering::{
    MAX_ORDER_NUMBER_RETRIES, OrderNumberGenerator, RandomOrderNumbers,
};
pub use order::{
    ChangePaymentStatus, ChangeStatus, DeleteOrder, OpenOrder, Order, OrderCommand, OrderCreated,
    OrderDeleted, OrderEvent, OrderId, OrderPaid, OrderRevised, OrderSnapshot, OrderTimestamps,
    PaymentDetailsUpdated, PaymentStatusChanged, ReviseOrder, StatusChanged,
    UpdatePaymentDetails,
};
pub use parties::{Address, AddressId, Customer, CustomerId};
pub use payment::{PaymentMethod, PaymentStatus, PaymentTransition};
pub use pricing::{Discount, PriceLine, ShippingCharge, Totals, compute, max_order_amount};
pub use query::{
    OrderFilter, OrderListQuery, OrderPage, OrderSort, PageRequest, SearchDocument, SearchTerm,
    SortDirection, SortField, SortKey,
};
pub use report::{GroupTotal, MAX_TOP_ORDERS, OrderSummary, ReportDimension};
pub use request::{
    CreateOrderRequest, OrderItemInput, OrderPreview, PreviewLine, StorefrontItem,
    StorefrontOrderRequest, UpdateOrderRequest,
};
pub use shipping::{ShippingMode, ShippingZone, ShippingZoneId};
pub use status::OrderStatus;

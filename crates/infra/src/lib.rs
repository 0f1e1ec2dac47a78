//! Infrastructure layer: storage, configuration and the order service.

pub mod collaborators;
pub mod config;
pub mod ledger;
pub mod rate_limit;
pub mod service;
pub mod store;


pub use collaborators::{PaymentMethodPolicy, PlanGate, StaticPaymentMethods};
pub use config::{ConfigError, EngineConfig};
pub use ledger::InventoryLedger;
pub use rate_limit::{InMemoryRateLimiter, RateDecision, RateLimitPolicy, RateLimiter};
pub use service::OrderService;
pub use store::{
    InMemoryOrderStore, OrderStore, OrderTx, PostgresOrderStore, StoreError, apply_schema,
};

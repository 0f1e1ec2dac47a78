//! `orderdesk-events`: domain event contracts and pub/sub mechanics.
//!
//! Aggregates return events; the service layer wraps them in
//! [`EventEnvelope`]s and publishes them on an [`EventBus`] once the enclosing
//! transaction has committed.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::{EventEnvelope, PublishedEvent};
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};

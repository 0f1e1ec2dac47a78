//! `orderdesk-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the error model, identifiers, aggregate traits and money rounding.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod model;
pub mod money;

pub use aggregate::{Aggregate, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId, UserId};
pub use model::{Entity, ValueObject};
pub use money::{MONEY_SCALE, round_money};

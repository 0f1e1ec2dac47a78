//! Inventory domain module.
//!
//! Variants are owned by the catalog; this crate only models what the order
//! engine needs from them (price/cost defaults and the stock counter) and the
//! pure arithmetic behind allocation and restocking. Applying the result to
//! storage is the infrastructure layer's job.

pub mod stock;
pub mod variant;

pub use stock::{
    StockAdjusted, StockAdjustment, StockChange, StockDirection, StockLevel, lock_order, plan,
};
pub use variant::{Variant, VariantId};

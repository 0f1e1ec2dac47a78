//! Stock planning: the all-or-nothing arithmetic behind allocate/restock.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult, TenantId};
use orderdesk_events::Event;

use crate::variant::VariantId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockDirection {
    /// Decrement stock to reserve it against an order.
    Allocate,
    /// Increment stock to release a prior reservation.
    Restock,
}

/// One requested movement: `quantity` units of a variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub variant_id: VariantId,
    pub quantity: i64,
}

impl StockAdjustment {
    pub fn new(variant_id: VariantId, quantity: i64) -> Self {
        Self {
            variant_id,
            quantity,
        }
    }
}

/// Current (locked) stock of a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub variant_id: VariantId,
    pub name: String,
    pub stock_quantity: i64,
}

/// Planned new stock value for one variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChange {
    pub variant_id: VariantId,
    pub previous: i64,
    pub next: i64,
}

impl StockChange {
    pub fn delta(&self) -> i64 {
        self.next - self.previous
    }

    pub fn into_event(
        self,
        tenant_id: TenantId,
        direction: StockDirection,
        occurred_at: DateTime<Utc>,
    ) -> StockAdjusted {
        StockAdjusted {
            tenant_id,
            variant_id: self.variant_id,
            direction,
            delta: self.delta(),
            stock_quantity: self.next,
            occurred_at,
        }
    }
}

/// Distinct variant ids of a batch, in the order rows must be locked.
///
/// Every caller locks in ascending id order, so two transactions touching an
/// overlapping set of variants cannot deadlock on each other.
pub fn lock_order(lines: &[StockAdjustment]) -> Vec<VariantId> {
    let mut ids: Vec<VariantId> = lines.iter().map(|l| l.variant_id).collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Compute the new stock of every variant touched by `lines`.
///
/// Lines for the same variant are summed first. The whole batch is rejected
/// with a conflict if any variant would end below zero; nothing is returned
/// for the variants that would have been fine.
pub fn plan(
    levels: &[StockLevel],
    direction: StockDirection,
    lines: &[StockAdjustment],
) -> DomainResult<Vec<StockChange>> {
    let mut requested: BTreeMap<VariantId, i64> = BTreeMap::new();
    for line in lines {
        if line.quantity < 1 {
            return Err(DomainError::validation("stock quantity must be at least 1"));
        }
        let total = requested.entry(line.variant_id).or_insert(0);
        *total = total
            .checked_add(line.quantity)
            .ok_or_else(|| DomainError::validation("stock quantity out of range"))?;
    }

    let current: HashMap<VariantId, &StockLevel> =
        levels.iter().map(|l| (l.variant_id, l)).collect();

    let mut changes = Vec::with_capacity(requested.len());
    let mut shortages = Vec::new();
    for (variant_id, quantity) in requested {
        let level = current
            .get(&variant_id)
            .ok_or_else(|| DomainError::not_found("variant"))?;

        let next = match direction {
            StockDirection::Allocate => level.stock_quantity.checked_sub(quantity),
            StockDirection::Restock => level.stock_quantity.checked_add(quantity),
        }
        .ok_or_else(|| DomainError::validation("stock quantity out of range"))?;

        if next < 0 {
            shortages.push(format!(
                "{} (requested {quantity}, available {})",
                level.name, level.stock_quantity
            ));
            continue;
        }

        changes.push(StockChange {
            variant_id,
            previous: level.stock_quantity,
            next,
        });
    }

    if !shortages.is_empty() {
        return Err(DomainError::conflict(format!(
            "insufficient stock: {}",
            shortages.join(", ")
        )));
    }

    Ok(changes)
}

/// Event: a variant's stock counter moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjusted {
    pub tenant_id: TenantId,
    pub variant_id: VariantId,
    pub direction: StockDirection,
    pub delta: i64,
    pub stock_quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

impl Event for StockAdjusted {
    fn event_type(&self) -> &'static str {
        "inventory.variant.stock_adjusted"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

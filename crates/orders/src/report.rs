//! Reporting reads: order counts, revenue and cost of goods over a filter.
//!
//! Reports cover live orders of one tenant, scoped by the same
//! [`OrderFilter`](crate::OrderFilter) the list query uses (status set, date
//! range on `ordered_at`, channel, customer).

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult, round_money};

/// Largest page of top orders a report returns.
pub const MAX_TOP_ORDERS: u32 = 100;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub count: u64,
    pub total: Decimal,
    pub average_total: Decimal,
    pub cogs: Decimal,
    pub average_cogs: Decimal,
}

impl OrderSummary {
    /// Build from raw sums. Averages are rounded to cents; an empty set
    /// averages to zero.
    pub fn from_sums(count: u64, total: Decimal, cogs: Decimal) -> Self {
        Self {
            count,
            total: round_money(total),
            average_total: average(total, count),
            cogs: round_money(cogs),
            average_cogs: average(cogs, count),
        }
    }

    /// Fold `(total, cogs)` pairs of individual orders.
    pub fn accumulate<I>(orders: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = (Decimal, Decimal)>,
    {
        let mut count = 0u64;
        let mut total = Decimal::ZERO;
        let mut cogs = Decimal::ZERO;
        for (order_total, order_cogs) in orders {
            count += 1;
            total = total.checked_add(order_total).ok_or_else(out_of_range)?;
            cogs = cogs.checked_add(order_cogs).ok_or_else(out_of_range)?;
        }
        Ok(Self::from_sums(count, total, cogs))
    }
}

fn average(sum: Decimal, count: u64) -> Decimal {
    match sum.checked_div(Decimal::from(count)) {
        Some(avg) if count > 0 => round_money(avg),
        _ => round_money(Decimal::ZERO),
    }
}

fn out_of_range() -> DomainError {
    DomainError::validation("report amount out of range")
}

/// What a breakdown groups orders by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportDimension {
    Status,
    Channel,
    /// Normalized country code of the shipping address.
    Country,
    Customer,
}

/// One group of a breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTotal {
    pub key: String,
    pub count: u64,
    pub total: Decimal,
}

/// Group `(key, total)` pairs, largest revenue first.
pub fn group_totals<I>(rows: I) -> DomainResult<Vec<GroupTotal>>
where
    I: IntoIterator<Item = (String, Decimal)>,
{
    let mut groups: BTreeMap<String, (u64, Decimal)> = BTreeMap::new();
    for (key, total) in rows {
        let (count, sum) = groups.entry(key).or_insert((0, Decimal::ZERO));
        *count += 1;
        *sum = sum.checked_add(total).ok_or_else(out_of_range)?;
    }
    let mut groups: Vec<GroupTotal> = groups
        .into_iter()
        .map(|(key, (count, total))| GroupTotal {
            key,
            count,
            total: round_money(total),
        })
        .collect();
    rank_groups(&mut groups);
    Ok(groups)
}

/// Revenue descending, then key ascending.
pub fn rank_groups(groups: &mut [GroupTotal]) {
    groups.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.key.cmp(&b.key)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn summary_averages_are_rounded() {
        let summary = OrderSummary::accumulate([
            (dec!(10.00), dec!(4.00)),
            (dec!(10.00), dec!(4.00)),
            (dec!(10.01), dec!(4.01)),
        ])
        .unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.total, dec!(30.01));
        assert_eq!(summary.average_total, dec!(10.00));
        assert_eq!(summary.cogs, dec!(12.01));
        assert_eq!(summary.average_cogs, dec!(4.00));
    }

    #[test]
    fn empty_summary_is_zero() {
        let summary = OrderSummary::accumulate(std::iter::empty()).unwrap();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.average_total, dec!(0.00));
        assert_eq!(summary, OrderSummary::from_sums(0, dec!(0), dec!(0)));
    }

    #[test]
    fn groups_rank_by_revenue_then_key() {
        let groups = group_totals([
            ("pos".to_string(), dec!(5)),
            ("manual".to_string(), dec!(20)),
            ("storefront".to_string(), dec!(12.5)),
            ("pos".to_string(), dec!(7.5)),
        ])
        .unwrap();
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, ["manual", "pos", "storefront"]);
        assert_eq!(groups[1].count, 2);
        assert_eq!(groups[1].total, dec!(12.50));
    }

    #[test]
    fn overflowing_sums_fail_validation() {
        let err = OrderSummary::accumulate([(Decimal::MAX, dec!(0)), (Decimal::MAX, dec!(0))])
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}

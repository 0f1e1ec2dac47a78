//! List queries: filters, allow-listed sorting, search and pagination.

use core::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult};

use crate::order::OrderSnapshot;
use crate::parties::CustomerId;
use crate::payment::PaymentStatus;
use crate::status::OrderStatus;

pub const DEFAULT_PAGE_SIZE: u32 = 30;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_SEARCH_LENGTH: usize = 128;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFilter {
    pub statuses: Vec<OrderStatus>,
    pub payment_statuses: Vec<PaymentStatus>,
    pub channels: Vec<String>,
    pub customer_id: Option<CustomerId>,
    pub order_number: Option<String>,
    pub ordered_from: Option<DateTime<Utc>>,
    pub ordered_to: Option<DateTime<Utc>>,
}

impl OrderFilter {
    /// Evaluate the filter against one order (empty sets match everything).
    pub fn matches(&self, order: &OrderSnapshot) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&order.status) {
            return false;
        }
        if !self.payment_statuses.is_empty()
            && !self.payment_statuses.contains(&order.payment_status)
        {
            return false;
        }
        if !self.channels.is_empty()
            && !self
                .channels
                .iter()
                .any(|c| c.trim().eq_ignore_ascii_case(&order.channel))
        {
            return false;
        }
        if self.customer_id.is_some_and(|id| id != order.customer_id) {
            return false;
        }
        if let Some(number) = &self.order_number {
            if number.trim() != order.order_number {
                return false;
            }
        }
        let ordered_at = order.timestamps.ordered_at;
        if self.ordered_from.is_some_and(|from| ordered_at < from) {
            return false;
        }
        if self.ordered_to.is_some_and(|to| ordered_at > to) {
            return false;
        }
        true
    }
}

/// Sortable fields. Anything not listed here cannot be sorted on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortField {
    OrderNumber,
    OrderedAt,
    CreatedAt,
    UpdatedAt,
    Total,
    Subtotal,
    Status,
    PaymentStatus,
    Channel,
}

impl SortField {
    /// Resolve an external (camelCase) field name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "orderNumber" => SortField::OrderNumber,
            "orderedAt" => SortField::OrderedAt,
            "createdAt" => SortField::CreatedAt,
            "updatedAt" => SortField::UpdatedAt,
            "total" => SortField::Total,
            "subtotal" => SortField::Subtotal,
            "status" => SortField::Status,
            "paymentStatus" => SortField::PaymentStatus,
            "channel" => SortField::Channel,
            _ => return None,
        })
    }

    /// Column on the `orders` table (aliased `o`).
    pub fn column(self) -> &'static str {
        match self {
            SortField::OrderNumber => "o.order_number",
            SortField::OrderedAt => "o.ordered_at",
            SortField::CreatedAt => "o.created_at",
            SortField::UpdatedAt => "o.updated_at",
            SortField::Total => "o.total",
            SortField::Subtotal => "o.subtotal",
            SortField::Status => "o.status",
            SortField::PaymentStatus => "o.payment_status",
            SortField::Channel => "o.channel",
        }
    }

    /// Ascending comparison, consistent with how the column sorts in SQL.
    pub fn compare(self, a: &OrderSnapshot, b: &OrderSnapshot) -> Ordering {
        match self {
            SortField::OrderNumber => a.order_number.cmp(&b.order_number),
            SortField::OrderedAt => a.timestamps.ordered_at.cmp(&b.timestamps.ordered_at),
            SortField::CreatedAt => a.timestamps.created_at.cmp(&b.timestamps.created_at),
            SortField::UpdatedAt => a.timestamps.updated_at.cmp(&b.timestamps.updated_at),
            SortField::Total => a.totals.total.cmp(&b.totals.total),
            SortField::Subtotal => a.totals.subtotal.cmp(&b.totals.subtotal),
            SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            SortField::PaymentStatus => a.payment_status.as_str().cmp(b.payment_status.as_str()),
            SortField::Channel => a.channel.cmp(&b.channel),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn compare(&self, a: &OrderSnapshot, b: &OrderSnapshot) -> Ordering {
        let ord = self.field.compare(a, b);
        match self.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    }
}

/// Requested ordering; empty when the caller asked for nothing recognisable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSort {
    keys: Vec<SortKey>,
}

impl OrderSort {
    /// Parse `["-orderedAt", "total"]`-style specs; unknown fields are skipped.
    pub fn parse<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = fields
            .into_iter()
            .filter_map(|raw| {
                let raw = raw.as_ref().trim();
                let (direction, name) = match raw.strip_prefix('-') {
                    Some(name) => (SortDirection::Desc, name),
                    None => (SortDirection::Asc, raw.strip_prefix('+').unwrap_or(raw)),
                };
                SortField::parse(name).map(|field| SortKey { field, direction })
            })
            .collect();
        Self { keys }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_explicit(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Keys to apply when no relevance ranking takes over: the requested ones,
    /// or newest first.
    pub fn effective(&self) -> Vec<SortKey> {
        if self.keys.is_empty() {
            vec![SortKey {
                field: SortField::CreatedAt,
                direction: SortDirection::Desc,
            }]
        } else {
            self.keys.clone()
        }
    }
}

/// Normalized full-text search input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTerm(String);

impl SearchTerm {
    /// Trim and collapse whitespace; blank input means "no search".
    pub fn parse(raw: &str) -> DomainResult<Option<Self>> {
        let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return Ok(None);
        }
        if normalized.chars().count() > MAX_SEARCH_LENGTH {
            return Err(DomainError::validation(format!(
                "search term must be at most {MAX_SEARCH_LENGTH} characters"
            )));
        }
        Ok(Some(Self(normalized)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `LIKE` pattern matching the term anywhere, with wildcards escaped.
    pub fn like_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.0.len() + 2);
        pattern.push('%');
        for c in self.0.chars() {
            if matches!(c, '%' | '_' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('%');
        pattern
    }

    /// Relevance of `doc`, or `None` when it does not match at all.
    ///
    /// Substring hits on the order number and the customer's name/email match
    /// outright; whole-word hits on the weighted order and customer fields add
    /// to the rank (order number and customer name weigh most).
    pub fn rank(&self, doc: &SearchDocument<'_>) -> Option<u32> {
        let needle = self.0.to_lowercase();
        let contains = |field: Option<&str>| {
            field.is_some_and(|f| f.to_lowercase().contains(&needle))
        };

        let mut score = 0;
        if contains(Some(doc.order_number)) {
            score += 8;
        }
        if contains(doc.customer_name) {
            score += 4;
        }
        if contains(doc.customer_email) {
            score += 2;
        }

        let weighted: [(Option<&str>, u32); 6] = [
            (Some(doc.order_number), 8),
            (Some(doc.channel), 4),
            (Some(doc.currency), 2),
            (doc.payment_reference, 2),
            (doc.customer_name, 8),
            (doc.customer_email, 4),
        ];
        for token in needle.split(' ') {
            for (field, weight) in weighted {
                let hit = field.is_some_and(|f| {
                    f.split(|c: char| !c.is_alphanumeric())
                        .any(|word| word.eq_ignore_ascii_case(token))
                });
                if hit {
                    score += weight;
                }
            }
        }

        (score > 0).then_some(score)
    }
}

/// Searchable projection of an order and its customer.
#[derive(Debug, Clone, Copy)]
pub struct SearchDocument<'a> {
    pub order_number: &'a str,
    pub channel: &'a str,
    pub currency: &'a str,
    pub payment_reference: Option<&'a str>,
    pub customer_name: Option<&'a str>,
    pub customer_email: Option<&'a str>,
}

/// 1-based page request, clamped to `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: u32,
    page_size: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderListQuery {
    pub filter: OrderFilter,
    pub sort: OrderSort,
    pub search: Option<SearchTerm>,
    pub page: PageRequest,
}

impl OrderListQuery {
    /// Relevance ordering applies when searching without an explicit sort.
    pub fn ranks_by_relevance(&self) -> bool {
        self.search.is_some() && !self.sort.is_explicit()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPage<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> OrderPage<T> {
    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.page_size) < self.total
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> OrderPage<U> {
        OrderPage {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sort_fields_are_ignored() {
        let sort = OrderSort::parse(["-orderedAt", "password", "total", ""]);
        assert_eq!(
            sort.keys(),
            &[
                SortKey {
                    field: SortField::OrderedAt,
                    direction: SortDirection::Desc
                },
                SortKey {
                    field: SortField::Total,
                    direction: SortDirection::Asc
                },
            ]
        );
    }

    #[test]
    fn nothing_recognised_falls_back_to_newest_first() {
        let sort = OrderSort::parse(["drop table orders"]);
        assert!(!sort.is_explicit());
        assert_eq!(
            sort.effective(),
            vec![SortKey {
                field: SortField::CreatedAt,
                direction: SortDirection::Desc
            }]
        );
    }

    #[test]
    fn columns_come_from_the_allow_list() {
        assert_eq!(SortField::PaymentStatus.column(), "o.payment_status");
        assert_eq!(SortField::parse("o.total; --"), None);
    }

    #[test]
    fn search_term_is_normalized_and_bounded() {
        let term = SearchTerm::parse("  jane \t  doe ").unwrap().unwrap();
        assert_eq!(term.as_str(), "jane doe");
        assert_eq!(SearchTerm::parse("   ").unwrap(), None);
        assert!(SearchTerm::parse(&"x".repeat(MAX_SEARCH_LENGTH + 1)).is_err());
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        let term = SearchTerm::parse("50%_off").unwrap().unwrap();
        assert_eq!(term.like_pattern(), "%50\\%\\_off%");
    }

    #[test]
    fn order_number_hits_outrank_channel_hits() {
        let term = SearchTerm::parse("aB3").unwrap().unwrap();
        let by_number = SearchDocument {
            order_number: "xaB3yz",
            channel: "manual",
            currency: "USD",
            payment_reference: None,
            customer_name: None,
            customer_email: None,
        };
        let by_reference = SearchDocument {
            order_number: "QQQQQQ",
            channel: "manual",
            currency: "USD",
            payment_reference: Some("ab3"),
            customer_name: None,
            customer_email: None,
        };
        let miss = SearchDocument {
            order_number: "ZZZZZZ",
            ..by_number
        };

        let high = term.rank(&by_number).unwrap();
        let low = term.rank(&by_reference).unwrap();
        assert!(high > low);
        assert_eq!(term.rank(&miss), None);
    }

    #[test]
    fn customer_fields_are_searchable() {
        let term = SearchTerm::parse("jane").unwrap().unwrap();
        let doc = SearchDocument {
            order_number: "AAAAAA",
            channel: "storefront",
            currency: "USD",
            payment_reference: None,
            customer_name: Some("Jane Doe"),
            customer_email: Some("jd@example.com"),
        };
        assert!(term.rank(&doc).is_some());
    }

    #[test]
    fn page_requests_are_clamped() {
        let page = PageRequest::new(Some(0), Some(1_000));
        assert_eq!(page.page(), 1);
        assert_eq!(page.page_size(), MAX_PAGE_SIZE);

        let page = PageRequest::new(Some(3), None);
        assert_eq!(page.offset(), 60);
        assert_eq!(page.limit(), u64::from(DEFAULT_PAGE_SIZE));
    }

    #[test]
    fn has_more_accounts_for_the_current_page() {
        let page: OrderPage<u8> = OrderPage {
            items: vec![],
            total: 61,
            page: 2,
            page_size: 30,
        };
        assert!(page.has_more());
        let last = OrderPage { page: 3, ..page };
        assert!(!last.has_more());
    }
}

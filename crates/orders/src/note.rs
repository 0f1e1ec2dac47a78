//! Free-text notes attached to an order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult, Entity, TenantId, UserId};
use orderdesk_events::Event;

use crate::order::OrderId;

orderdesk_core::domain_id!(
    /// Identifier of an order note.
    OrderNoteId
);

/// Maximum note length, in characters.
pub const MAX_NOTE_LENGTH: usize = 2000;

/// Validate and normalize note content.
///
/// Content is opaque plain text: it is stored verbatim apart from surrounding
/// whitespace and never interpreted as markup.
pub fn note_content(raw: &str) -> DomainResult<String> {
    let content = raw.trim();
    if content.is_empty() {
        return Err(DomainError::validation("note must not be empty"));
    }
    if content.chars().count() > MAX_NOTE_LENGTH {
        return Err(DomainError::validation(format!(
            "note must be at most {MAX_NOTE_LENGTH} characters"
        )));
    }
    Ok(content.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNote {
    pub id: OrderNoteId,
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    /// `None` for notes left by storefront customers.
    pub author_id: Option<UserId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderNote {
    pub fn new(
        tenant_id: TenantId,
        order_id: OrderId,
        author_id: Option<UserId>,
        content: &str,
        at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        Ok(Self {
            id: OrderNoteId::new(),
            tenant_id,
            order_id,
            author_id,
            content: note_content(content)?,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn revise(&mut self, content: &str, at: DateTime<Utc>) -> DomainResult<()> {
        self.content = note_content(content)?;
        self.updated_at = at;
        Ok(())
    }
}

impl Entity for OrderNote {
    type Id = OrderNoteId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Event: a note was added to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNoteAdded {
    pub tenant_id: TenantId,
    pub order_id: OrderId,
    pub note_id: OrderNoteId,
    pub author_id: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl From<&OrderNote> for OrderNoteAdded {
    fn from(note: &OrderNote) -> Self {
        Self {
            tenant_id: note.tenant_id,
            order_id: note.order_id,
            note_id: note.id,
            author_id: note.author_id,
            occurred_at: note.created_at,
        }
    }
}

impl Event for OrderNoteAdded {
    fn event_type(&self) -> &'static str {
        "orders.order.note_added"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_trimmed_and_bounded_by_characters() {
        assert_eq!(note_content("  call before delivery \n").unwrap(), "call before delivery");
        assert!(note_content("   ").is_err());

        // multi-byte characters count once each
        let arabic = "ب".repeat(MAX_NOTE_LENGTH);
        assert!(note_content(&arabic).is_ok());
        assert!(note_content(&format!("{arabic}x")).is_err());
    }

    #[test]
    fn markup_is_kept_verbatim() {
        let note = OrderNote::new(
            TenantId::new(),
            OrderId::new(),
            Some(UserId::new()),
            "<b>fragile</b>",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(note.content, "<b>fragile</b>");
    }

    #[test]
    fn revise_bumps_updated_at_only() {
        let created = Utc::now();
        let mut note =
            OrderNote::new(TenantId::new(), OrderId::new(), None, "first", created).unwrap();
        let later = created + chrono::Duration::seconds(5);

        note.revise("second", later).unwrap();

        assert_eq!(note.content, "second");
        assert_eq!(note.created_at, created);
        assert_eq!(note.updated_at, later);
        assert!(note.revise("", later).is_err());
    }
}

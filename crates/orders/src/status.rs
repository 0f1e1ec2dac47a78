//! Fulfillment lifecycle state machine.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult};

/// Fulfillment status of an order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Placed,
    ReadyForShipment,
    Shipped,
    Fulfilled,
    Cancelled,
    Returned,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Placed,
        OrderStatus::ReadyForShipment,
        OrderStatus::Shipped,
        OrderStatus::Fulfilled,
        OrderStatus::Cancelled,
        OrderStatus::Returned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Placed => "placed",
            OrderStatus::ReadyForShipment => "ready_for_shipment",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
        }
    }

    /// Destinations reachable in one step.
    ///
    /// `placed -> shipped` skips `ready_for_shipment`; older clients rely on it.
    pub fn allowed_transitions(self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[Placed, Cancelled],
            Placed => &[ReadyForShipment, Shipped, Cancelled],
            ReadyForShipment => &[Shipped, Cancelled],
            Shipped => &[Fulfilled],
            Fulfilled => &[Returned],
            Cancelled | Returned => &[],
        }
    }

    pub fn can_transition_to(self, target: OrderStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Validate a single step of the lifecycle.
    pub fn transition_to(self, target: OrderStatus) -> DomainResult<OrderStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(DomainError::invalid_transition(format!(
                "cannot move order from {self} to {target}"
            )))
        }
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Only orders that never left `pending`, or were cancelled, may be deleted.
    pub fn allows_deletion(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Cancelled)
    }

    /// Items may be replaced until the order ships.
    pub fn allows_item_changes(self) -> bool {
        !matches!(
            self,
            OrderStatus::Shipped
                | OrderStatus::Fulfilled
                | OrderStatus::Cancelled
                | OrderStatus::Returned
        )
    }

    /// The destination can change under the same rule as the items.
    pub fn allows_address_change(self) -> bool {
        self.allows_item_changes()
    }

    pub fn allows_payment_details(self) -> bool {
        !matches!(self, OrderStatus::Cancelled | OrderStatus::Returned)
    }

    /// Payment may only move while the order is live past `pending`.
    pub fn allows_payment_transitions(self) -> bool {
        matches!(
            self,
            OrderStatus::Placed
                | OrderStatus::ReadyForShipment
                | OrderStatus::Shipped
                | OrderStatus::Fulfilled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown order status: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pending_cannot_jump_to_shipped() {
        let err = OrderStatus::Pending
            .transition_to(OrderStatus::Shipped)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::invalid_transition("cannot move order from pending to shipped")
        );
    }

    #[test]
    fn placed_may_ship_directly() {
        assert_eq!(
            OrderStatus::Placed.transition_to(OrderStatus::Shipped),
            Ok(OrderStatus::Shipped)
        );
    }

    #[test]
    fn cancelled_and_returned_are_terminal() {
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Returned.is_terminal());
        assert!(!OrderStatus::Fulfilled.is_terminal());
    }

    #[test]
    fn self_transitions_are_rejected() {
        for status in OrderStatus::ALL {
            assert!(status.transition_to(status).is_err(), "{status} -> {status}");
        }
    }

    #[test]
    fn status_guards() {
        assert!(OrderStatus::Pending.allows_deletion());
        assert!(OrderStatus::Cancelled.allows_deletion());
        assert!(!OrderStatus::Placed.allows_deletion());

        assert!(OrderStatus::ReadyForShipment.allows_item_changes());
        assert!(!OrderStatus::Shipped.allows_item_changes());

        assert!(OrderStatus::Fulfilled.allows_payment_details());
        assert!(!OrderStatus::Returned.allows_payment_details());

        assert!(!OrderStatus::Pending.allows_payment_transitions());
        assert!(OrderStatus::Shipped.allows_payment_transitions());
    }

    #[test]
    fn parses_wire_names() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("on_hold".parse::<OrderStatus>().is_err());
    }

    proptest! {
        #[test]
        fn only_table_entries_are_accepted(from in 0usize..7, to in 0usize..7) {
            let (from, to) = (OrderStatus::ALL[from], OrderStatus::ALL[to]);
            let expected = matches!(
                (from, to),
                (OrderStatus::Pending, OrderStatus::Placed)
                    | (OrderStatus::Pending, OrderStatus::Cancelled)
                    | (OrderStatus::Placed, OrderStatus::ReadyForShipment)
                    | (OrderStatus::Placed, OrderStatus::Shipped)
                    | (OrderStatus::Placed, OrderStatus::Cancelled)
                    | (OrderStatus::ReadyForShipment, OrderStatus::Shipped)
                    | (OrderStatus::ReadyForShipment, OrderStatus::Cancelled)
                    | (OrderStatus::Shipped, OrderStatus::Fulfilled)
                    | (OrderStatus::Fulfilled, OrderStatus::Returned)
            );
            prop_assert_eq!(from.transition_to(to).is_ok(), expected);
        }
    }
}

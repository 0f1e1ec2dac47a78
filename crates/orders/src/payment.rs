//! Payment lifecycle state machine and payment methods.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult};

use crate::status::OrderStatus;

/// Payment status of an order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    /// Storefront orders that bypass payment collection. Never left.
    Skipped,
}

/// Outcome of an accepted payment transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PaymentTransition {
    pub from: PaymentStatus,
    pub to: PaymentStatus,
}

impl PaymentTransition {
    /// Whether this step must notify billing (entering `paid` from elsewhere).
    pub fn settles(&self) -> bool {
        self.to == PaymentStatus::Paid && self.from != PaymentStatus::Paid
    }
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::Pending,
        PaymentStatus::Paid,
        PaymentStatus::Failed,
        PaymentStatus::Refunded,
        PaymentStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Skipped => "skipped",
        }
    }

    pub fn allowed_transitions(self) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match self {
            Pending => &[Paid, Failed],
            Failed => &[Pending],
            Paid => &[Refunded],
            Refunded | Skipped => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Statuses an order may be created with.
    pub fn is_initial(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Skipped)
    }

    /// Validate a payment step against both the payment table and the
    /// fulfillment status guard.
    pub fn transition_to(
        self,
        target: PaymentStatus,
        order_status: OrderStatus,
    ) -> DomainResult<PaymentTransition> {
        if !order_status.allows_payment_transitions() {
            return Err(DomainError::invalid_transition(format!(
                "payment status cannot change while order is {order_status}"
            )));
        }
        if !self.allowed_transitions().contains(&target) {
            return Err(DomainError::invalid_transition(format!(
                "cannot move payment from {self} to {target}"
            )));
        }
        Ok(PaymentTransition {
            from: self,
            to: target,
        })
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown payment status: {s}")))
    }
}

/// How the customer pays.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    Paypal,
    #[default]
    BankTransfer,
    CashOnDelivery,
    Tamara,
    Tabby,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 6] = [
        PaymentMethod::CreditCard,
        PaymentMethod::Paypal,
        PaymentMethod::BankTransfer,
        PaymentMethod::CashOnDelivery,
        PaymentMethod::Tamara,
        PaymentMethod::Tabby,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::CashOnDelivery => "cash_on_delivery",
            PaymentMethod::Tamara => "tamara",
            PaymentMethod::Tabby => "tabby",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown payment method: {s}")))
    }
}

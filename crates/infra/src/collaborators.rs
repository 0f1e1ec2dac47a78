//! Policies owned by other parts of the platform, consulted before writes.

use std::collections::HashSet;

use async_trait::async_trait;

use orderdesk_core::{DomainResult, TenantId};
use orderdesk_orders::PaymentMethod;

/// Which payment methods a tenant has switched on.
#[async_trait]
pub trait PaymentMethodPolicy: Send + Sync {
    async fn is_enabled(&self, tenant_id: TenantId, method: PaymentMethod) -> DomainResult<bool>;
}

/// Subscription-plan quota on order creation. Returns
/// `DomainError::LimitExceeded` once the tenant's allowance is used up.
#[async_trait]
pub trait PlanGate: Send + Sync {
    async fn ensure_can_create_order(&self, tenant_id: TenantId) -> DomainResult<()>;
}

/// Same enabled set for every tenant.
#[derive(Debug, Clone)]
pub struct StaticPaymentMethods {
    enabled: HashSet<PaymentMethod>,
}

impl StaticPaymentMethods {
    pub fn new(methods: impl IntoIterator<Item = PaymentMethod>) -> Self {
        Self {
            enabled: methods.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PaymentMethodPolicy for StaticPaymentMethods {
    async fn is_enabled(&self, _tenant_id: TenantId, method: PaymentMethod) -> DomainResult<bool> {
        Ok(self.enabled.contains(&method))
    }
}

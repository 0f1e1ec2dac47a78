use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult, TenantId};

/// Decimal places a VAT rate may carry; matches the stored column.
pub const VAT_RATE_SCALE: u32 = 4;

/// The already-resolved tenant every order operation runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    tenant_id: TenantId,
    currency: String,
    vat_rate: Decimal,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, currency: &str, vat_rate: Decimal) -> DomainResult<Self> {
        let currency = currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "invalid currency code: {currency:?}"
            )));
        }
        if vat_rate < Decimal::ZERO || vat_rate > Decimal::ONE {
            return Err(DomainError::validation("vat rate must be between 0 and 1"));
        }
        let vat_rate = vat_rate.normalize();
        if vat_rate.scale() > VAT_RATE_SCALE {
            return Err(DomainError::validation(format!(
                "vat rate may have at most {VAT_RATE_SCALE} decimal places"
            )));
        }
        Ok(Self {
            tenant_id,
            currency,
            vat_rate,
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn vat_rate(&self) -> Decimal {
        self.vat_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn normalizes_currency() {
        let ctx = TenantContext::new(TenantId::new(), " sar", dec!(0.15)).unwrap();
        assert_eq!(ctx.currency(), "SAR");
    }

    #[test]
    fn rejects_bad_currency_and_rate() {
        assert!(TenantContext::new(TenantId::new(), "RIYAL", dec!(0.15)).is_err());
        assert!(TenantContext::new(TenantId::new(), "SAR", dec!(15)).is_err());
    }

    #[test]
    fn vat_rate_precision_fits_storage() {
        let err = TenantContext::new(TenantId::new(), "SAR", dec!(0.12345)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let ctx = TenantContext::new(TenantId::new(), "SAR", dec!(0.125000)).unwrap();
        assert_eq!(ctx.vat_rate(), dec!(0.125));
        assert!(TenantContext::new(TenantId::new(), "SAR", dec!(0.1234)).is_ok());
    }
}

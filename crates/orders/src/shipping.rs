//! Shipping zones and the manual/zoned shipping mode.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use orderdesk_core::{DomainError, DomainResult, TenantId, ValueObject, round_money};

orderdesk_core::domain_id!(
    /// Identifier of a shipping zone.
    ShippingZoneId
);

/// How an order's shipping fee is determined. Exactly one mode is active.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum ShippingMode {
    /// Caller-supplied fee.
    Manual(Decimal),
    /// Fee rated by a tenant's shipping zone.
    Zoned(ShippingZoneId),
}

impl ShippingMode {
    pub fn free() -> Self {
        ShippingMode::Manual(Decimal::ZERO)
    }

    pub fn zone_id(&self) -> Option<ShippingZoneId> {
        match self {
            ShippingMode::Zoned(id) => Some(*id),
            ShippingMode::Manual(_) => None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        match self {
            ShippingMode::Manual(fee) if *fee < Decimal::ZERO => {
                Err(DomainError::validation("shipping fee must not be negative"))
            }
            _ => Ok(()),
        }
    }
}

impl Default for ShippingMode {
    fn default() -> Self {
        Self::free()
    }
}

impl ValueObject for ShippingMode {}

/// Read model of a tenant's shipping zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingZone {
    pub id: ShippingZoneId,
    pub tenant_id: TenantId,
    pub name: String,
    pub currency: String,
    /// ISO 3166-1 alpha-2 codes, upper case.
    pub countries: Vec<String>,
    pub shipping_cost: Decimal,
    pub free_shipping_threshold: Option<Decimal>,
}

impl ShippingZone {
    pub fn covers(&self, country: &str) -> bool {
        let country = normalize_country(country);
        !country.is_empty()
            && self
                .countries
                .iter()
                .any(|c| normalize_country(c) == country)
    }

    /// A zone may rate an order only in the tenant's currency and only for a
    /// destination it lists.
    pub fn ensure_eligible(&self, tenant_currency: &str, country: &str) -> DomainResult<()> {
        if !self.currency.eq_ignore_ascii_case(tenant_currency) {
            return Err(DomainError::validation(format!(
                "shipping zone currency {} does not match business currency {}",
                self.currency, tenant_currency
            )));
        }
        if !self.covers(country) {
            return Err(DomainError::validation(format!(
                "shipping zone {} does not ship to country {:?}",
                self.name,
                normalize_country(country)
            )));
        }
        Ok(())
    }

    /// Fee for an order whose discounted subtotal is `base`.
    pub fn fee_for(&self, base: Decimal) -> Decimal {
        let base = base.max(Decimal::ZERO);
        match self.free_shipping_threshold {
            Some(threshold) if threshold > Decimal::ZERO && base >= threshold => {
                round_money(Decimal::ZERO)
            }
            _ => round_money(self.shipping_cost),
        }
    }
}

pub fn normalize_country(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn zone(threshold: Option<Decimal>) -> ShippingZone {
        ShippingZone {
            id: ShippingZoneId::new(),
            tenant_id: TenantId::new(),
            name: "Gulf".to_string(),
            currency: "SAR".to_string(),
            countries: vec!["SA".to_string(), "AE".to_string()],
            shipping_cost: dec!(8.00),
            free_shipping_threshold: threshold,
        }
    }

    #[test]
    fn threshold_not_met_charges_flat_cost() {
        assert_eq!(zone(Some(dec!(50.00))).fee_for(dec!(40.00)), dec!(8.00));
    }

    #[test]
    fn threshold_met_ships_free() {
        assert_eq!(zone(Some(dec!(50.00))).fee_for(dec!(60.00)), dec!(0.00));
        assert_eq!(zone(Some(dec!(50.00))).fee_for(dec!(50.00)), dec!(0.00));
    }

    #[test]
    fn zero_threshold_means_no_free_shipping() {
        assert_eq!(zone(Some(Decimal::ZERO)).fee_for(dec!(1000)), dec!(8.00));
        assert_eq!(zone(None).fee_for(dec!(1000)), dec!(8.00));
    }

    #[test]
    fn country_is_normalized_before_matching() {
        let z = zone(None);
        assert!(z.covers(" sa "));
        assert!(!z.covers("EG"));
        assert!(!z.covers("   "));
    }

    #[test]
    fn eligibility_checks_currency_then_country() {
        let z = zone(None);
        assert!(z.ensure_eligible("sar", "ae").is_ok());
        assert!(matches!(
            z.ensure_eligible("USD", "AE"),
            Err(DomainError::Validation(m)) if m.contains("currency")
        ));
        assert!(matches!(
            z.ensure_eligible("SAR", "EG"),
            Err(DomainError::Validation(m)) if m.contains("\"EG\"")
        ));
    }

    #[test]
    fn negative_manual_fee_is_invalid() {
        assert!(ShippingMode::Manual(dec!(-1)).validate().is_err());
        assert!(ShippingMode::Manual(dec!(0)).validate().is_ok());
        assert!(ShippingMode::Zoned(ShippingZoneId::new()).validate().is_ok());
    }

    #[test]
    fn shipping_mode_wire_format() {
        let json = serde_json::to_value(ShippingMode::Manual(dec!(5.00))).unwrap();
        assert_eq!(json, serde_json::json!({"mode": "manual", "value": "5.00"}));
    }
}

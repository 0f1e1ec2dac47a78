//! Short, tenant-scoped order numbers.
//!
//! Numbers are random base-62 codes with no uniqueness lookup; the store's
//! per-tenant unique constraint rejects collisions and the service retries.

use rand::Rng;

use orderdesk_core::TenantId;

pub const ORDER_NUMBER_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub const DEFAULT_ORDER_NUMBER_WIDTH: usize = 6;

/// Retries after the first attempt collides.
pub const MAX_ORDER_NUMBER_RETRIES: u32 = 5;

pub trait OrderNumberGenerator: Send + Sync {
    fn generate(&self, tenant_id: TenantId) -> String;
}

#[derive(Debug, Clone)]
pub struct RandomOrderNumbers {
    width: usize,
}

impl RandomOrderNumbers {
    pub fn new(width: usize) -> Self {
        Self { width }
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

impl Default for RandomOrderNumbers {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER_NUMBER_WIDTH)
    }
}

impl OrderNumberGenerator for RandomOrderNumbers {
    fn generate(&self, _tenant_id: TenantId) -> String {
        let mut rng = rand::rng();
        (0..self.width)
            .map(|_| {
                let idx = rng.random_range(0..ORDER_NUMBER_ALPHABET.len());
                char::from(ORDER_NUMBER_ALPHABET[idx])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_have_fixed_width_and_base62_alphabet() {
        let numbers = RandomOrderNumbers::default();
        let tenant = TenantId::new();
        for _ in 0..200 {
            let code = numbers.generate(tenant);
            assert_eq!(code.len(), DEFAULT_ORDER_NUMBER_WIDTH);
            assert!(code.bytes().all(|b| ORDER_NUMBER_ALPHABET.contains(&b)), "{code}");
        }
    }

    #[test]
    fn codes_are_spread_out() {
        let numbers = RandomOrderNumbers::new(8);
        let tenant = TenantId::new();
        let distinct: HashSet<String> = (0..500).map(|_| numbers.generate(tenant)).collect();
        assert!(distinct.len() > 490);
    }
}

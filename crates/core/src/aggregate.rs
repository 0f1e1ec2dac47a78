//! Decide/evolve contract for versioned domain state.

use crate::error::{DomainError, DomainResult};

/// A versioned unit of consistency.
///
/// `handle` decides which events a command produces without touching state;
/// `apply` folds one event into state and bumps the version by one. Neither
/// does IO: stock movement and publishing happen in the caller once the
/// decision is made.
pub trait Aggregate {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Number of events applied so far; persisted with the state.
    fn version(&self) -> u64;

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    fn apply(&mut self, event: &Self::Event);
}

/// The version a write was decided against. A store refuses the write when
/// the row has moved on since it was loaded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpectedVersion(u64);

impl ExpectedVersion {
    pub fn of<A: Aggregate>(aggregate: &A) -> Self {
        Self(aggregate.version())
    }

    pub fn exact(version: u64) -> Self {
        Self(version)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.0 == actual {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "order was modified concurrently (loaded at version {}, found {actual})",
                self.0
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_versions_conflict() {
        assert!(ExpectedVersion::exact(3).check(3).is_ok());
        assert!(matches!(
            ExpectedVersion::exact(3).check(4),
            Err(DomainError::Conflict(_))
        ));
        assert_eq!(ExpectedVersion::exact(7).get(), 7);
    }
}

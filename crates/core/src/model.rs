//! Building blocks shared by the order model.

/// Something with an identity of its own inside an aggregate.
///
/// Order items and notes keep their ids when the order around them is revised,
/// which is what lets storage update them in place.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}

/// Compared by value; two equal discounts are interchangeable.
///
/// Implemented by totals, discounts and shipping modes.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

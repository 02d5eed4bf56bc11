//! Identity and persistence state shared by stored domain records.

/// A record with a stable identity that outlives its state changes.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Never persisted yet. Decides between insert and update, and whether
    /// a failed first transition may discard the record outright.
    fn is_new(&self) -> bool;
}

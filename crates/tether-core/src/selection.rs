//! Selections: owners of work that must serialize on one run loop

use crate::id::SelectionId;

/// A client, transport or other owner pinned to a run loop by the pool
///
/// `weight` is only a load-balancing signal; the pool never relies on it
/// for correctness.
pub trait Selection: Send + Sync {
    /// Identity used as the pool key
    fn id(&self) -> SelectionId;

    /// Declared load of this selection
    fn weight(&self) -> u32;
}

/// Plain selection value with a fixed id and weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightedSelection {
    id: SelectionId,
    weight: u32,
}

impl WeightedSelection {
    /// Create a selection with an explicit id
    #[inline]
    pub const fn new(id: SelectionId, weight: u32) -> Self {
        Self { id, weight }
    }

    /// Create a selection with a fresh unique id
    #[inline]
    pub fn unique(weight: u32) -> Self {
        Self::new(SelectionId::unique(), weight)
    }
}

impl Selection for WeightedSelection {
    #[inline]
    fn id(&self) -> SelectionId {
        self.id
    }

    #[inline]
    fn weight(&self) -> u32 {
        self.weight
    }
}

impl<S: Selection + ?Sized> Selection for std::sync::Arc<S> {
    fn id(&self) -> SelectionId {
        (**self).id()
    }

    fn weight(&self) -> u32 {
        (**self).weight()
    }
}

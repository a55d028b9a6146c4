//! Loader handles.

use crate::resolver::LayeredResolver;
use parking_lot::RwLock;
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, Weak},
};

/// Opaque handle to a name-resolution namespace served by a
/// [`LayeredEngine`](crate::LayeredEngine).
///
/// Handles are cheap to clone; clones refer to the same loader. Two loaders
/// are equal when the same engine handed them out under the same number.
/// The engine keeps only weak references to the loaders it created, so a
/// loader lives exactly as long as its holders.
pub struct Loader {
    inner: Arc<LoaderInner>,
}

pub(crate) struct LoaderInner {
    engine_id: u64,
    number: u64,
    attached: bool,
    resolver: RwLock<Arc<LayeredResolver>>,
}

impl Loader {
    pub(crate) fn new(
        engine_id: u64,
        number: u64,
        attached: bool,
        resolver: Arc<LayeredResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                engine_id,
                number,
                attached,
                resolver: RwLock::new(resolver),
            }),
        }
    }

    /// The loader's number within its engine; the default loader is 0.
    pub fn number(&self) -> u64 {
        self.inner.number
    }

    /// Whether layer updates on the owning engine reach this loader.
    pub fn is_attached(&self) -> bool {
        self.inner.attached
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.inner.engine_id
    }

    /// Snapshot of the currently published resolver.
    pub(crate) fn resolver(&self) -> Arc<LayeredResolver> {
        self.inner.resolver.read().clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<LoaderInner> {
        Arc::downgrade(&self.inner)
    }
}

impl LoaderInner {
    /// Publishes a new resolver. Only the owning engine reaches this, under
    /// its write lock.
    pub(crate) fn set_resolver(&self, resolver: Arc<LayeredResolver>) {
        *self.resolver.write() = resolver;
    }
}

impl Clone for Loader {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl PartialEq for Loader {
    fn eq(&self, other: &Self) -> bool {
        self.inner.engine_id == other.inner.engine_id && self.inner.number == other.inner.number
    }
}

impl Eq for Loader {}

impl Hash for Loader {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.engine_id.hash(state);
        self.inner.number.hash(state);
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("engine", &self.inner.engine_id)
            .field("number", &self.inner.number)
            .field("attached", &self.inner.attached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{EmptyResolver, LoadMode};

    fn resolver() -> Arc<LayeredResolver> {
        Arc::new(LayeredResolver::new(
            Arc::new(EmptyResolver),
            Vec::new().into(),
            None,
            LoadMode::CurrentFirst,
            LoadMode::ParentFirst,
        ))
    }

    #[test]
    fn equality_is_by_engine_and_number() {
        let a = Loader::new(1, 0, true, resolver());
        let b = Loader::new(1, 1, true, resolver());
        let foreign = Loader::new(2, 0, true, resolver());

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a, foreign);
    }

    #[test]
    fn clones_observe_resolver_swaps() {
        let loader = Loader::new(1, 0, true, resolver());
        let clone = loader.clone();

        let fresh = resolver();
        loader.inner.set_resolver(fresh.clone());
        assert!(Arc::ptr_eq(&clone.resolver(), &fresh));
    }
}

// Per-connection feature bag
//
// A TypeId-keyed bag of shared state attached to a connection, in the style
// of tower/http request extensions. The bus-backed manager uses it to track
// a connection's group memberships and per-connection bus subscriptions.

use parking_lot::{Mutex as SyncMutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Concurrent, type-keyed feature bag.
#[derive(Default)]
pub struct Features {
    entries: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a feature, replacing any existing feature of the same type.
    pub fn insert<T: Send + Sync + 'static>(&self, feature: Arc<T>) {
        self.entries.write().insert(TypeId::of::<T>(), feature);
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let entry = self.entries.read().get(&TypeId::of::<T>()).cloned()?;
        entry.downcast().ok()
    }

    /// Fetch a feature, attaching a freshly built one when absent.
    pub fn get_or_insert_with<T, F>(&self, build: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(build()) as Arc<dyn Any + Send + Sync>);
        // Entries are keyed by TypeId, so the stored value is always a T.
        Arc::clone(entry).downcast().expect("feature entry type")
    }

    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let entry = self.entries.write().remove(&TypeId::of::<T>())?;
        entry.downcast().ok()
    }
}

/// State the bus-backed manager attaches to every connection it manages.
pub struct BusFeature {
    /// Group names this connection belongs to, folded to lowercase.
    /// Always locked before any bucket lock.
    pub groups: Mutex<HashSet<String>>,
    /// Bus topics subscribed on behalf of this connection alone.
    pub subscriptions: SyncMutex<HashSet<String>>,
}

impl BusFeature {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashSet::new()),
            subscriptions: SyncMutex::new(HashSet::new()),
        }
    }
}

impl Default for BusFeature {
    fn default() -> Self {
        Self::new()
    }
}

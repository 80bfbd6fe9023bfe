// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deduplicating registry for structural layouts.
//!
//! A [`LayoutRegistry`] gives every distinct shape (an ordered list of binding view
//! kinds, or a vertex stream description) a small, stable [`LayoutId`]. IDs are
//! handed out in registration order, are never reused, and `0` always means the
//! empty shape.
//!
//! # Architecture
//!
//! ```text
//! register(shape)
//!   ├─ thread-local cache: (registry, hash) -> [(shape, id)]   no lock
//!   └─ miss: global table (RwLock)
//!        ├─ read: by_hash lookup
//!        └─ write: re-check, append, id = table length
//! ```
//!
//! [`BindingGroup`] and [`VertexInput`] bind device objects against a registered
//! layout and carry its ID.
//!
//! The registry is an ordinary value. Share it with `Arc` and inject it where layouts
//! are created; separate instances never observe each other's IDs. Dropping a registry
//! clears its entries from the dropping thread's cache; other threads drop theirs the
//! next time they miss.

mod binding;
mod group;
mod vertex;

pub use self::binding::{BindingShape, ViewKind};
pub use self::group::{BindingGroup, VertexInput};
pub use self::vertex::{VertexAttribute, VertexFormat, VertexShape, VertexStream};

use parking_lot::RwLock;
use std::any::Any;
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A structural description that can be deduplicated by a [`LayoutRegistry`].
pub trait LayoutShape: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Number of entries (bindings or vertex attributes) in the shape.
    fn entry_count(&self) -> usize;

    /// A human-readable description, used for debug display.
    fn describe(&self) -> String;

    /// Returns `true` for the empty shape, which always maps to [`LayoutId::EMPTY`].
    fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

/// The stable identity of a registered shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LayoutId(u32);

impl LayoutId {
    /// The reserved ID of the empty or invalid shape.
    pub const EMPTY: LayoutId = LayoutId(0);

    /// The ID as an array index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// The raw value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns `true` for [`LayoutId::EMPTY`].
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

type CachedEntry = (Arc<dyn Any + Send + Sync>, LayoutId);

#[derive(Default)]
struct FrontCache {
    entries: HashMap<(u64, u64), Vec<CachedEntry>>,
    /// Liveness of every registry with entries in this cache, by uid.
    owners: HashMap<u64, Weak<()>>,
}

impl FrontCache {
    fn insert(&mut self, uid: u64, alive: &Arc<()>, hash: u64, entry: CachedEntry) {
        self.prune();
        self.owners.entry(uid).or_insert_with(|| Arc::downgrade(alive));
        self.entries.entry((uid, hash)).or_default().push(entry);
    }

    fn remove(&mut self, uid: u64) {
        self.owners.remove(&uid);
        self.entries.retain(|(owner, _), _| *owner != uid);
    }

    /// Drops the entries of registries that no longer exist.
    fn prune(&mut self) {
        let dead: Vec<u64> = self
            .owners
            .iter()
            .filter(|(_, alive)| alive.strong_count() == 0)
            .map(|(uid, _)| *uid)
            .collect();
        for uid in dead {
            self.remove(uid);
        }
    }
}

thread_local! {
    static FRONT_CACHE: RefCell<FrontCache> = RefCell::new(FrontCache::default());
}

static NEXT_REGISTRY_UID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct LayoutTable<S> {
    /// Slot 0 is the reserved empty entry.
    entries: Vec<Option<Arc<S>>>,
    by_hash: HashMap<u64, Vec<LayoutId>>,
}

impl<S: LayoutShape> LayoutTable<S> {
    fn find(&self, hash: u64, shape: &S) -> Option<(LayoutId, Arc<S>)> {
        self.by_hash.get(&hash)?.iter().find_map(|id| {
            let entry = self.entries.get(id.index())?.as_ref()?;
            (**entry == *shape).then(|| (*id, Arc::clone(entry)))
        })
    }
}

/// Assigns stable, process-lifetime IDs to structural shapes.
#[derive(Debug)]
pub struct LayoutRegistry<S: LayoutShape> {
    uid: u64,
    alive: Arc<()>,
    table: RwLock<LayoutTable<S>>,
    lock_acquisitions: AtomicU64,
}

impl<S: LayoutShape> LayoutRegistry<S> {
    /// Creates an empty registry holding only the reserved empty entry.
    pub fn new() -> Self {
        Self {
            uid: NEXT_REGISTRY_UID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            table: RwLock::new(LayoutTable {
                entries: vec![None],
                by_hash: HashMap::new(),
            }),
            lock_acquisitions: AtomicU64::new(0),
        }
    }

    /// Returns the ID of `shape`, registering it on first sight.
    ///
    /// Equal shapes always receive the same ID. The calling thread's front cache is
    /// consulted first; the global table is only locked on a cache miss.
    #[must_use]
    pub fn register(&self, shape: &S) -> LayoutId {
        if shape.is_empty() {
            return LayoutId::EMPTY;
        }

        let hash = content_hash(shape);
        if let Some(id) = self.cached(hash, shape) {
            return id;
        }

        let (id, entry) = self.lookup_or_insert(hash, shape);
        let entry: Arc<dyn Any + Send + Sync> = entry;
        FRONT_CACHE.with(|cache| {
            cache
                .borrow_mut()
                .insert(self.uid, &self.alive, hash, (entry, id));
        });
        id
    }

    /// Returns the shape registered under `id`.
    pub fn layout_for(&self, id: LayoutId) -> Option<Arc<S>> {
        self.table.read().entries.get(id.index())?.clone()
    }

    /// Returns a printable name for `id`.
    pub fn name_for(&self, id: LayoutId) -> Option<String> {
        if id.is_empty() {
            return Some("<empty>".to_string());
        }
        self.layout_for(id).map(|shape| shape.describe())
    }

    /// Memory footprint of one instance of the layout: `entry_count * entry_size`.
    pub fn footprint(&self, id: LayoutId, entry_size: u64) -> Option<u64> {
        if id.is_empty() {
            return Some(0);
        }
        self.layout_for(id)
            .map(|shape| shape.entry_count() as u64 * entry_size)
    }

    /// Number of registered shapes, excluding the reserved empty entry.
    pub fn len(&self) -> usize {
        self.table.read().entries.len() - 1
    }

    /// Returns `true` if no shape has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times the global table had to be locked by `register`.
    pub fn lock_acquisitions(&self) -> u64 {
        self.lock_acquisitions.load(Ordering::Relaxed)
    }

    /// Forgets every entry of this registry in the calling thread's front cache.
    pub fn clear_thread_cache(&self) {
        FRONT_CACHE.with(|cache| cache.borrow_mut().remove(self.uid));
    }

    fn cached(&self, hash: u64, shape: &S) -> Option<LayoutId> {
        FRONT_CACHE.with(|cache| {
            let cache = cache.borrow();
            cache.entries.get(&(self.uid, hash))?.iter().find_map(|(entry, id)| {
                entry
                    .downcast_ref::<S>()
                    .filter(|cached| *cached == shape)
                    .map(|_| *id)
            })
        })
    }

    fn lookup_or_insert(&self, hash: u64, shape: &S) -> (LayoutId, Arc<S>) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);

        if let Some(found) = self.table.read().find(hash, shape) {
            return found;
        }

        let mut table = self.table.write();
        if let Some(found) = table.find(hash, shape) {
            return found;
        }

        let id = LayoutId(table.entries.len() as u32);
        let entry = Arc::new(shape.clone());
        table.entries.push(Some(Arc::clone(&entry)));
        table.by_hash.entry(hash).or_default().push(id);
        log::debug!("Registered layout {} as {:?}", shape.describe(), id);
        (id, entry)
    }
}

impl<S: LayoutShape> Drop for LayoutRegistry<S> {
    fn drop(&mut self) {
        // The thread-local may already be gone when a registry drops during thread exit.
        let _ = FRONT_CACHE.try_with(|cache| cache.borrow_mut().remove(self.uid));
    }
}

impl<S: LayoutShape> Default for LayoutRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn content_hash<S: Hash>(shape: &S) -> u64 {
    let mut hasher = DefaultHasher::new();
    shape.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
fn cached_registries() -> usize {
    FRONT_CACHE.with(|cache| cache.borrow().owners.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn shape(views: &[ViewKind]) -> BindingShape {
        BindingShape::new(views.to_vec())
    }

    #[test]
    fn test_empty_shape_maps_to_reserved_id() {
        let registry = LayoutRegistry::<BindingShape>::new();
        assert_eq!(registry.register(&shape(&[])), LayoutId::EMPTY);
        assert!(registry.is_empty());
        assert!(registry.layout_for(LayoutId::EMPTY).is_none());
        assert_eq!(registry.name_for(LayoutId::EMPTY).as_deref(), Some("<empty>"));
    }

    #[test]
    fn test_equal_shapes_share_an_id() {
        let registry = LayoutRegistry::new();
        let a = registry.register(&shape(&[ViewKind::ConstantBuffer, ViewKind::Image]));
        let b = registry.register(&shape(&[ViewKind::ConstantBuffer, ViewKind::Image]));
        assert_eq!(a, b);
        assert_eq!(a, LayoutId(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_order_matters() {
        let registry = LayoutRegistry::new();
        let k = registry.register(&shape(&[
            ViewKind::ConstantBuffer,
            ViewKind::Image,
            ViewKind::Sampler,
        ]));
        let k2 = registry.register(&shape(&[
            ViewKind::Image,
            ViewKind::ConstantBuffer,
            ViewKind::Sampler,
        ]));
        assert_ne!(k, k2);
        assert!(k2 > k);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = LayoutRegistry::new();
        let ids: Vec<_> = [ViewKind::Buffer, ViewKind::Image, ViewKind::Sampler]
            .iter()
            .map(|v| registry.register(&shape(&[*v])))
            .collect();
        assert_eq!(ids, vec![LayoutId(1), LayoutId(2), LayoutId(3)]);
    }

    #[test]
    fn test_cache_hit_skips_the_global_table() {
        let registry = LayoutRegistry::new();
        let s = shape(&[ViewKind::BufferStructured]);
        let first = registry.register(&s);
        assert_eq!(registry.lock_acquisitions(), 1);

        for _ in 0..10 {
            assert_eq!(registry.register(&s), first);
        }
        assert_eq!(registry.lock_acquisitions(), 1);

        registry.clear_thread_cache();
        assert_eq!(registry.register(&s), first);
        assert_eq!(registry.lock_acquisitions(), 2);
    }

    #[test]
    fn test_other_thread_gets_the_same_id() {
        let registry = Arc::new(LayoutRegistry::new());
        let s = shape(&[ViewKind::ConstantBuffer, ViewKind::Image, ViewKind::Sampler]);
        let k = registry.register(&s);

        let remote = {
            let registry = Arc::clone(&registry);
            let s = s.clone();
            thread::spawn(move || registry.register(&s)).join().unwrap()
        };
        assert_eq!(remote, k);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_registration_is_deduplicated() {
        let registry = Arc::new(LayoutRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..4u32)
                        .map(|n| {
                            let views = vec![ViewKind::Buffer; n as usize + 1];
                            registry.register(&BindingShape::new(views))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ids in &results {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_isolated_registries() {
        let a = LayoutRegistry::new();
        let b = LayoutRegistry::new();
        let first = shape(&[ViewKind::Image]);
        let second = shape(&[ViewKind::ImageWritable]);

        assert_eq!(a.register(&first), LayoutId(1));
        assert_eq!(b.register(&second), LayoutId(1));
        assert_eq!(a.layout_for(LayoutId(1)).as_deref(), Some(&first));
        assert_eq!(b.layout_for(LayoutId(1)).as_deref(), Some(&second));
    }

    #[test]
    fn test_footprint_and_name() {
        let registry = LayoutRegistry::new();
        let id = registry.register(&shape(&[ViewKind::ConstantBuffer, ViewKind::Sampler]));
        assert_eq!(registry.footprint(id, 16), Some(32));
        assert_eq!(
            registry.name_for(id).as_deref(),
            Some("[ConstantBuffer, Sampler]")
        );
        assert_eq!(registry.footprint(LayoutId(42), 16), None);
    }

    #[test]
    fn test_dropped_registry_leaves_the_cache() {
        let registry = LayoutRegistry::new();
        let _ = registry.register(&shape(&[ViewKind::Image]));
        assert_eq!(cached_registries(), 1);

        drop(registry);
        assert_eq!(cached_registries(), 0);
    }

    #[test]
    fn test_other_threads_prune_dropped_registries() {
        let first = Arc::new(LayoutRegistry::new());
        let (go, wait) = flume::bounded::<()>(0);
        let worker = {
            let first = Arc::clone(&first);
            thread::spawn(move || {
                let _ = first.register(&shape(&[ViewKind::Buffer]));
                drop(first);
                wait.recv().unwrap();

                let second = LayoutRegistry::new();
                let _ = second.register(&shape(&[ViewKind::Sampler]));
                cached_registries()
            })
        };

        drop(first);
        go.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), 1);
    }
}

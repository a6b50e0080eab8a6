//! Explicit roots and the per-heap root registry.
//!
//! A root pins a cell alive regardless of reachability from other cells.
//! The registry tracks three kinds of explicit sources: single handles
//! created with [`Heap::root`](crate::heap::Heap::root), collection
//! collaborators (root vectors and root hash maps) that enumerate their own
//! cells at gather time, and conservative vectors whose raw value words are
//! scanned like stack memory. Conservative stack and register roots are not
//! registered anywhere; the gatherer discovers them fresh each cycle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::Location;
use std::rc::{Rc, Weak};

use crate::cell::{Cell, CellPtr, Ptr};
use crate::nanbox::Value;

// ============================================================================
// Provenance
// ============================================================================

/// Where a root came from. Diagnostics only; no ownership semantics.
#[derive(Debug, Clone, Copy)]
pub enum HeapRoot {
    /// Found in a stack word at this address.
    StackPointer(usize),
    /// Found in a spilled machine register.
    RegisterPointer,
    /// An explicit [`Root`] handle, created at this source location.
    Handle(&'static Location<'static>),
    /// Enumerated by a [`RootVector`].
    RootVector,
    /// Enumerated by a [`RootHashMap`].
    RootHashMap,
    /// Found in a [`ConservativeVector`] slot.
    ConservativeVector,
    /// The cell demanded survival via
    /// [`Cell::must_survive_garbage_collection`].
    MustSurviveGc,
    /// Contributed by the embedder's root callback.
    Embedder,
    /// A pointer captured by an embedder closure or native frame.
    CapturedPointer,
}

impl std::fmt::Display for HeapRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StackPointer(addr) => write!(f, "StackPointer({addr:#x})"),
            Self::RegisterPointer => f.write_str("RegisterPointer"),
            Self::Handle(location) => write!(f, "Handle({location})"),
            Self::RootVector => f.write_str("RootVector"),
            Self::RootHashMap => f.write_str("RootHashMap"),
            Self::ConservativeVector => f.write_str("ConservativeVector"),
            Self::MustSurviveGc => f.write_str("MustSurviveGc"),
            Self::Embedder => f.write_str("Embedder"),
            Self::CapturedPointer => f.write_str("CapturedPointer"),
        }
    }
}

/// The root set for one collection cycle: reachable-candidate cells keyed by
/// address, each tagged with the provenance that first contributed it.
#[derive(Default)]
pub struct RootSet {
    cells: HashMap<CellPtr, HeapRoot>,
}

impl RootSet {
    /// Adds `cell` as a root. The first provenance recorded for a cell wins;
    /// later sources finding the same cell change nothing.
    pub fn insert(&mut self, cell: CellPtr, provenance: HeapRoot) {
        self.cells.entry(cell).or_insert(provenance);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (CellPtr, HeapRoot)> + '_ {
        self.cells.iter().map(|(&cell, &root)| (cell, root))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The provenance recorded for `cell`, if it is a root.
    #[must_use]
    pub fn get(&self, cell: CellPtr) -> Option<HeapRoot> {
        self.cells.get(&cell).copied()
    }
}

/// A collaborator that can enumerate the cells it keeps alive.
pub(crate) trait GatherRoots {
    fn gather_roots(&self, roots: &mut RootSet);
}

// ============================================================================
// Registry
// ============================================================================

/// Per-heap book of explicit root sources. Handles deregister themselves on
/// drop; collection collaborators are held weakly and pruned at gather time.
#[derive(Default)]
pub(crate) struct RootRegistry {
    handles: Vec<Option<(CellPtr, &'static Location<'static>)>>,
    free_handle_slots: Vec<usize>,
    gatherers: Vec<Weak<dyn GatherRoots>>,
    conservative: Vec<Weak<RefCell<Vec<Value>>>>,
}

impl RootRegistry {
    fn register_handle(&mut self, cell: CellPtr, location: &'static Location<'static>) -> usize {
        if let Some(slot) = self.free_handle_slots.pop() {
            self.handles[slot] = Some((cell, location));
            slot
        } else {
            self.handles.push(Some((cell, location)));
            self.handles.len() - 1
        }
    }

    fn deregister_handle(&mut self, slot: usize) {
        let entry = self.handles[slot].take();
        assert!(entry.is_some(), "root handle slot {slot} already vacated");
        self.free_handle_slots.push(slot);
    }

    pub(crate) fn register_gatherer(&mut self, gatherer: Weak<dyn GatherRoots>) {
        self.gatherers.push(gatherer);
    }

    pub(crate) fn register_conservative(&mut self, buffer: Weak<RefCell<Vec<Value>>>) {
        self.conservative.push(buffer);
    }

    /// Contributes every explicit root to `roots`, pruning collaborators
    /// that have since been dropped.
    pub(crate) fn gather(&mut self, roots: &mut RootSet) {
        for entry in self.handles.iter().flatten() {
            let (cell, location) = *entry;
            roots.insert(cell, HeapRoot::Handle(location));
        }
        self.gatherers.retain(|weak| {
            weak.upgrade().is_some_and(|gatherer| {
                gatherer.gather_roots(roots);
                true
            })
        });
    }

    /// Calls `f` with every raw value word held by a live conservative
    /// vector. The words get the same possible-pointer treatment as stack
    /// memory.
    pub(crate) fn for_each_conservative_value(&mut self, mut f: impl FnMut(Value)) {
        self.conservative.retain(|weak| {
            weak.upgrade().is_some_and(|buffer| {
                for &value in buffer.borrow().iter() {
                    f(value);
                }
                true
            })
        });
    }

    #[cfg(test)]
    fn live_handle_count(&self) -> usize {
        self.handles.iter().flatten().count()
    }
}

// ============================================================================
// Root handle
// ============================================================================

/// A stack-or-heap-owned handle keeping one cell alive.
///
/// Created with [`Heap::root`](crate::heap::Heap::root); deregisters itself
/// on drop. The source location of creation is retained so graph dumps can
/// say who pinned a cell.
pub struct Root<T: Cell> {
    registry: Rc<RefCell<RootRegistry>>,
    slot: usize,
    ptr: Ptr<T>,
}

impl<T: Cell> Root<T> {
    pub(crate) fn new(
        registry: Rc<RefCell<RootRegistry>>,
        ptr: Ptr<T>,
        location: &'static Location<'static>,
    ) -> Self {
        let slot = registry.borrow_mut().register_handle(ptr.erase(), location);
        Self {
            registry,
            slot,
            ptr,
        }
    }

    /// The rooted cell. The returned pointer does not root by itself.
    #[must_use]
    pub fn ptr(&self) -> Ptr<T> {
        self.ptr
    }
}

impl<T: Cell> Deref for Root<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.ptr
    }
}

impl<T: Cell> Drop for Root<T> {
    fn drop(&mut self) {
        self.registry.borrow_mut().deregister_handle(self.slot);
    }
}

// ============================================================================
// Root collections
// ============================================================================

struct VectorCells(RefCell<Vec<CellPtr>>);

impl GatherRoots for VectorCells {
    fn gather_roots(&self, roots: &mut RootSet) {
        for &cell in self.0.borrow().iter() {
            roots.insert(cell, HeapRoot::RootVector);
        }
    }
}

/// A growable vector whose elements are all roots.
pub struct RootVector<T: Cell> {
    inner: Rc<VectorCells>,
    _marker: PhantomData<*const T>,
}

impl<T: Cell> RootVector<T> {
    pub(crate) fn new(registry: &Rc<RefCell<RootRegistry>>) -> Self {
        let inner = Rc::new(VectorCells(RefCell::new(Vec::new())));
        let weak: Weak<dyn GatherRoots> =
            Rc::downgrade(&(Rc::clone(&inner) as Rc<dyn GatherRoots>));
        registry.borrow_mut().register_gatherer(weak);
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn push(&self, ptr: Ptr<T>) {
        self.inner.0.borrow_mut().push(ptr.erase());
    }

    #[must_use]
    pub fn at(&self, index: usize) -> Ptr<T> {
        let cell = self.inner.0.borrow()[index];
        // SAFETY: only Ptr<T> values enter this vector.
        unsafe { cell.downcast::<T>() }
    }

    pub fn remove(&self, index: usize) {
        self.inner.0.borrow_mut().remove(index);
    }

    pub fn clear(&self) {
        self.inner.0.borrow_mut().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.0.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.0.borrow().is_empty()
    }
}

struct MapCells<K>(RefCell<HashMap<K, CellPtr>>);

impl<K> GatherRoots for MapCells<K> {
    fn gather_roots(&self, roots: &mut RootSet) {
        for &cell in self.0.borrow().values() {
            roots.insert(cell, HeapRoot::RootHashMap);
        }
    }
}

/// A hash map whose values are all roots.
pub struct RootHashMap<K: Eq + Hash + 'static, T: Cell> {
    inner: Rc<MapCells<K>>,
    _marker: PhantomData<*const T>,
}

impl<K: Eq + Hash + 'static, T: Cell> RootHashMap<K, T> {
    pub(crate) fn new(registry: &Rc<RefCell<RootRegistry>>) -> Self {
        let inner = Rc::new(MapCells(RefCell::new(HashMap::new())));
        let weak: Weak<dyn GatherRoots> =
            Rc::downgrade(&(Rc::clone(&inner) as Rc<dyn GatherRoots>));
        registry.borrow_mut().register_gatherer(weak);
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn insert(&self, key: K, ptr: Ptr<T>) {
        self.inner.0.borrow_mut().insert(key, ptr.erase());
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<Ptr<T>> {
        let cell = *self.inner.0.borrow().get(key)?;
        // SAFETY: only Ptr<T> values enter this map.
        Some(unsafe { cell.downcast::<T>() })
    }

    pub fn remove(&self, key: &K) -> Option<Ptr<T>> {
        let cell = self.inner.0.borrow_mut().remove(key)?;
        // SAFETY: as above.
        Some(unsafe { cell.downcast::<T>() })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.0.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.0.borrow().is_empty()
    }
}

/// A vector of boxed values whose raw words are scanned conservatively.
///
/// Useful for embedder-side value buffers (argument stacks, scratch
/// registers) whose entries may or may not hold cell references.
pub struct ConservativeVector {
    inner: Rc<RefCell<Vec<Value>>>,
}

impl ConservativeVector {
    pub(crate) fn new(registry: &Rc<RefCell<RootRegistry>>) -> Self {
        let inner = Rc::new(RefCell::new(Vec::new()));
        registry
            .borrow_mut()
            .register_conservative(Rc::downgrade(&inner));
        Self { inner }
    }

    pub fn push(&self, value: Value) {
        self.inner.borrow_mut().push(value);
    }

    #[must_use]
    pub fn at(&self, index: usize) -> Value {
        self.inner.borrow()[index]
    }

    pub fn set(&self, index: usize, value: Value) {
        self.inner.borrow_mut()[index] = value;
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_cell(addr: usize) -> CellPtr {
        // SAFETY: never dereferenced by these tests.
        unsafe { CellPtr::from_addr(addr) }
    }

    #[test]
    fn handle_slots_recycle() {
        let mut registry = RootRegistry::default();
        let location = Location::caller();
        let a = registry.register_handle(fake_cell(0x1000), location);
        let b = registry.register_handle(fake_cell(0x2000), location);
        assert_ne!(a, b);
        assert_eq!(registry.live_handle_count(), 2);

        registry.deregister_handle(a);
        assert_eq!(registry.live_handle_count(), 1);
        let c = registry.register_handle(fake_cell(0x3000), location);
        assert_eq!(c, a);
    }

    #[test]
    #[should_panic(expected = "already vacated")]
    fn double_deregister_is_fatal() {
        let mut registry = RootRegistry::default();
        let slot = registry.register_handle(fake_cell(0x1000), Location::caller());
        registry.deregister_handle(slot);
        registry.deregister_handle(slot);
    }

    #[test]
    fn gather_prunes_dropped_collaborators() {
        let registry = Rc::new(RefCell::new(RootRegistry::default()));

        let inner = Rc::new(VectorCells(RefCell::new(vec![fake_cell(0x4000)])));
        let weak: Weak<dyn GatherRoots> =
            Rc::downgrade(&(Rc::clone(&inner) as Rc<dyn GatherRoots>));
        registry.borrow_mut().register_gatherer(weak);

        let mut roots = RootSet::default();
        registry.borrow_mut().gather(&mut roots);
        assert_eq!(roots.len(), 1);
        assert!(matches!(
            roots.get(fake_cell(0x4000)),
            Some(HeapRoot::RootVector)
        ));

        drop(inner);
        let mut roots = RootSet::default();
        registry.borrow_mut().gather(&mut roots);
        assert_eq!(roots.len(), 0);
        assert!(registry.borrow().gatherers.is_empty());
    }

    #[test]
    fn first_provenance_wins() {
        let mut roots = RootSet::default();
        let cell = fake_cell(0x5000);
        roots.insert(cell, HeapRoot::Embedder);
        roots.insert(cell, HeapRoot::RegisterPointer);
        assert!(matches!(roots.get(cell), Some(HeapRoot::Embedder)));
    }
}

//! Managed cells and their type-erased metadata.
//!
//! Every allocation the heap hands out is a cell: a fixed header followed by
//! the embedder's value. The header carries the liveness state the sweeper
//! flips, the free-list link used while the slot is dead, and a pointer to a
//! per-type vtable so the collector can visit, finalize and drop values it
//! only knows by address.

use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

// ============================================================================
// Cell state
// ============================================================================

/// Liveness of a cell slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellState {
    /// The slot is on its block's free list.
    Dead = 0,
    /// The slot holds a constructed value.
    Live = 1,
}

impl CellState {
    /// Decodes a raw state byte.
    ///
    /// # Panics
    ///
    /// A byte that is neither `Live` nor `Dead` means the slot was corrupted
    /// or never belonged to the collector; that is a fatal misuse.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Dead,
            1 => Self::Live,
            _ => panic!("cell state byte {raw:#x} is neither Live nor Dead"),
        }
    }
}

// ============================================================================
// Per-type vtable
// ============================================================================

/// Type-erased operations for one concrete cell type.
///
/// The collector stores one pointer to this per cell instead of a trait
/// object, so the header stays one word of metadata plus the state byte.
pub struct CellVTable {
    /// Human-readable type name for diagnostics.
    pub class_name: &'static str,
    /// Whether [`Cell::finalize`] does anything for this type.
    pub has_finalizer: bool,
    /// Whether [`Cell::must_survive_garbage_collection`] can return true.
    pub may_must_survive: bool,
    /// Enumerates the cell's outgoing edges.
    pub visit_edges: unsafe fn(*const u8, &mut dyn Visitor),
    /// Pre-destruction hook, run on doomed cells before sweeping.
    pub finalize: unsafe fn(*const u8),
    /// Asks the cell whether it pins itself for the next cycle.
    pub must_survive: unsafe fn(*const u8) -> bool,
    /// Drops the value in place when its slot is reclaimed.
    pub drop_in_place: unsafe fn(*mut u8),
}

unsafe fn visit_edges_shim<T: Cell>(data: *const u8, visitor: &mut dyn Visitor) {
    // SAFETY: the caller passes the data pointer of a live cell of type T.
    unsafe { (*data.cast::<T>()).visit_edges(visitor) }
}

unsafe fn finalize_shim<T: Cell>(data: *const u8) {
    // SAFETY: as above.
    unsafe { (*data.cast::<T>()).finalize() }
}

unsafe fn must_survive_shim<T: Cell>(data: *const u8) -> bool {
    // SAFETY: as above.
    unsafe { (*data.cast::<T>()).must_survive_garbage_collection() }
}

unsafe fn drop_shim<T: Cell>(data: *mut u8) {
    // SAFETY: the caller passes the data pointer of a live cell of type T
    // that is being reclaimed and will not be touched again.
    unsafe { data.cast::<T>().drop_in_place() }
}

struct VTableOf<T>(PhantomData<T>);

impl<T: Cell> VTableOf<T> {
    const VTABLE: CellVTable = CellVTable {
        class_name: T::CLASS_NAME,
        has_finalizer: T::HAS_FINALIZER,
        may_must_survive: T::MAY_MUST_SURVIVE,
        visit_edges: visit_edges_shim::<T>,
        finalize: finalize_shim::<T>,
        must_survive: must_survive_shim::<T>,
        drop_in_place: drop_shim::<T>,
    };
}

/// Returns the vtable for `T`.
#[must_use]
pub fn vtable_of<T: Cell>() -> &'static CellVTable {
    &VTableOf::<T>::VTABLE
}

// ============================================================================
// Cell trait
// ============================================================================

/// A managed object.
///
/// Implementations **must** report every cell reference they hold from
/// [`visit_edges`](Cell::visit_edges); a missed edge is a use-after-free
/// waiting for the next collection.
pub trait Cell {
    /// Diagnostic type name, reported in graph dumps and allocator stats.
    const CLASS_NAME: &'static str;

    /// Set to `true` when [`finalize`](Cell::finalize) is overridden, so the
    /// finalization phase only walks blocks that can contain finalizers.
    const HAS_FINALIZER: bool = false;

    /// Set to `true` when
    /// [`must_survive_garbage_collection`](Cell::must_survive_garbage_collection)
    /// is overridden.
    const MAY_MUST_SURVIVE: bool = false;

    /// Enumerates every outgoing reference: cells, spans of boxed values,
    /// and raw byte regions that may conservatively embed cell pointers.
    fn visit_edges(&self, _visitor: &mut dyn Visitor) {}

    /// Pre-destruction hook. Runs on unmarked cells after marking and before
    /// any storage is reclaimed; reading other cells is allowed, reviving
    /// them is not.
    fn finalize(&self) {}

    /// Cells that return `true` are treated as roots for the next cycle.
    fn must_survive_garbage_collection(&self) -> bool {
        false
    }
}

/// Graph traversal callback handed to [`Cell::visit_edges`].
pub trait Visitor {
    /// Visit one outgoing cell reference.
    fn visit_cell(&mut self, cell: CellPtr);

    /// Visit a span of boxed values; entries that encode cell pointers are
    /// followed, the rest are ignored.
    fn visit_values(&mut self, values: &[crate::nanbox::Value]);

    /// Conservatively scan `bytes` for embedded cell pointers.
    fn visit_possible_bytes(&mut self, bytes: &[u8]);
}

impl dyn Visitor + '_ {
    /// Typed convenience wrapper over [`Visitor::visit_cell`].
    pub fn visit<T: Cell>(&mut self, ptr: Ptr<T>) {
        self.visit_cell(ptr.erase());
    }
}

// ============================================================================
// Cell header and pointers
// ============================================================================

/// Sentinel for "no next free slot" in [`CellHeader::free_next`].
pub(crate) const FREE_NONE: u16 = u16::MAX;

/// Metadata at the start of every cell slot.
#[repr(C)]
pub struct CellHeader {
    pub(crate) state: u8,
    _pad0: u8,
    /// Next free slot index while this slot is dead; `FREE_NONE` terminates.
    pub(crate) free_next: u16,
    _pad1: u32,
    /// Stale while the slot is dead.
    pub(crate) vtable: *const CellVTable,
}

/// Distance from a slot's base address to the embedder's value.
pub const CELL_HEADER_SIZE: usize = std::mem::size_of::<CellHeader>();

const _: () = assert!(CELL_HEADER_SIZE == 16);

impl CellHeader {
    pub(crate) fn new_live(vtable: &'static CellVTable) -> Self {
        Self {
            state: CellState::Live as u8,
            _pad0: 0,
            free_next: FREE_NONE,
            _pad1: 0,
            vtable,
        }
    }

    pub(crate) fn new_dead(free_next: u16) -> Self {
        Self {
            state: CellState::Dead as u8,
            _pad0: 0,
            free_next,
            _pad1: 0,
            vtable: std::ptr::null(),
        }
    }

    pub(crate) fn state(&self) -> CellState {
        CellState::from_raw(self.state)
    }
}

/// Type-erased pointer to a cell slot.
///
/// Compares and hashes by address; the address is also the key used in root
/// maps and graph dumps.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellPtr(NonNull<CellHeader>);

impl CellPtr {
    /// Reinterprets a raw slot address. The caller is responsible for the
    /// address actually being a cell slot inside a live heap block.
    #[must_use]
    pub(crate) const unsafe fn from_addr(addr: usize) -> Self {
        // SAFETY: caller guarantees addr points at a cell slot, so non-null.
        Self(unsafe { NonNull::new_unchecked(addr as *mut CellHeader) })
    }

    /// The slot's base address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) const fn header_ptr(self) -> *mut CellHeader {
        self.0.as_ptr()
    }

    pub(crate) fn data_ptr(self) -> *mut u8 {
        // SAFETY: slot layout is header followed by value.
        unsafe { self.0.as_ptr().cast::<u8>().add(CELL_HEADER_SIZE) }
    }

    /// Reads the slot's liveness state.
    ///
    /// # Safety
    ///
    /// The slot's block must still be mapped.
    #[must_use]
    pub(crate) unsafe fn state(self) -> CellState {
        // SAFETY: caller guarantees the block is mapped.
        unsafe { (*self.0.as_ptr()).state() }
    }

    pub(crate) unsafe fn vtable(self) -> &'static CellVTable {
        // SAFETY: caller guarantees the cell is live, so vtable is set.
        unsafe { &*(*self.0.as_ptr()).vtable }
    }

    /// Restores the typed view of this cell.
    ///
    /// # Safety
    ///
    /// The cell must actually hold a `T`.
    #[must_use]
    pub unsafe fn downcast<T: Cell>(self) -> Ptr<T> {
        Ptr {
            header: self.0,
            _marker: PhantomData,
        }
    }
}

impl std::fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CellPtr({:#x})", self.addr())
    }
}

/// Typed pointer to a managed cell of type `T`.
///
/// `Ptr` is `Copy` and does not count as a root by itself: keep the cell
/// reachable through a [`Root`](crate::roots::Root), another cell's edges,
/// or (in conservative heaps) a stack or register slot.
pub struct Ptr<T: Cell> {
    header: NonNull<CellHeader>,
    _marker: PhantomData<*const T>,
}

impl<T: Cell> Ptr<T> {
    /// Drops the type, keeping the address.
    #[must_use]
    pub const fn erase(self) -> CellPtr {
        CellPtr(self.header)
    }

    /// The cell slot's base address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.header.as_ptr() as usize
    }
}

impl<T: Cell> Clone for Ptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Cell> Copy for Ptr<T> {}

impl<T: Cell> PartialEq for Ptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl<T: Cell> Eq for Ptr<T> {}

impl<T: Cell> Deref for Ptr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the slot layout is header then value; liveness is the
        // embedder's contract (a Ptr to a reclaimed cell must not be used).
        unsafe {
            &*self
                .header
                .as_ptr()
                .cast::<u8>()
                .add(CELL_HEADER_SIZE)
                .cast::<T>()
        }
    }
}

impl<T: Cell> std::fmt::Debug for Ptr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ptr<{}>({:#x})", T::CLASS_NAME, self.addr())
    }
}

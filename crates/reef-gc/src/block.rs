//! Fixed-size heap blocks.
//!
//! A block is a 16 KiB naturally-aligned mapping holding equal-size cell
//! slots for one size class, with its bookkeeping at the base: mark bitmap,
//! bump index, free list and occupancy counter. Natural alignment is what
//! makes conservative scanning cheap: masking the low bits of any candidate
//! address yields the owning block.

use std::ptr::NonNull;

use crate::cell::{CellHeader, CellPtr, CellState, CellVTable, FREE_NONE};

/// Size of each heap block. Blocks are aligned to this, so
/// `addr & !(BLOCK_SIZE - 1)` resolves any in-block address to its block.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Mask extracting the block base from a cell address.
pub const BLOCK_MASK: usize = !(BLOCK_SIZE - 1);

/// Per-block slot metadata and mark bitmap.
#[repr(C)]
pub struct HeapBlock {
    /// Size of each cell slot in bytes.
    cell_size: u32,
    /// Number of slots in this block.
    cell_count: u16,
    /// Slots below this index have been carved at least once.
    bump_index: u16,
    /// Head of the dead-slot free list; `FREE_NONE` terminates.
    free_head: u16,
    /// Live slots currently in the block.
    live_cells: u16,
    /// Set while the block waits on its allocator's pending-sweep queue.
    pub(crate) pending_sweep: bool,
    /// Any cell in this block may run a finalizer.
    pub(crate) has_finalizers: bool,
    /// Any cell in this block may demand survival.
    pub(crate) has_must_survive: bool,
    _pad: u8,
    /// One mark bit per slot, cleared every cycle.
    marks: [u64; 4],
}

// 256 mark bits cover the densest layout (16 KiB of 64-byte slots).
const _: () = assert!((BLOCK_SIZE - HeapBlock::header_size()) / 64 <= 256);

impl HeapBlock {
    /// Bytes from the block base to the first cell slot.
    pub(crate) const fn header_size() -> usize {
        (std::mem::size_of::<Self>() + 15) & !15
    }

    /// Maps and initializes a fresh block for `cell_size` slots.
    ///
    /// Running out of address space is the allocator collaborator's failure
    /// policy, which here means: fatal.
    pub(crate) fn create(cell_size: usize) -> NonNull<Self> {
        assert!(cell_size % 16 == 0 && cell_size >= 64);
        let mapping =
            sys_pages::map_aligned(BLOCK_SIZE, BLOCK_SIZE).expect("failed to map a heap block");
        let block = mapping.cast::<Self>();
        #[allow(clippy::cast_possible_truncation)]
        // SAFETY: the mapping is zeroed, block-aligned and BLOCK_SIZE long.
        unsafe {
            block.as_ptr().write(Self {
                cell_size: cell_size as u32,
                cell_count: ((BLOCK_SIZE - Self::header_size()) / cell_size) as u16,
                bump_index: 0,
                free_head: FREE_NONE,
                live_cells: 0,
                pending_sweep: false,
                has_finalizers: false,
                has_must_survive: false,
                _pad: 0,
                marks: [0; 4],
            });
        }
        block
    }

    /// Unmaps the block. Any remaining cells are gone with it.
    ///
    /// # Safety
    ///
    /// `block` must have come from [`HeapBlock::create`] and must not be
    /// used afterwards.
    pub(crate) unsafe fn destroy(block: NonNull<Self>) {
        // SAFETY: created by map_aligned(BLOCK_SIZE, BLOCK_SIZE).
        unsafe { sys_pages::unmap(block.cast(), BLOCK_SIZE) }
    }

    /// The block owning `cell`.
    pub(crate) fn from_cell(cell: CellPtr) -> NonNull<Self> {
        // SAFETY: cell addresses are interior to an aligned block, so the
        // masked address is the non-null block base.
        unsafe { NonNull::new_unchecked((cell.addr() & BLOCK_MASK) as *mut Self) }
    }

    pub(crate) fn base(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn cells_base(&self) -> usize {
        self.base() + Self::header_size()
    }

    pub(crate) const fn cell_size(&self) -> usize {
        self.cell_size as usize
    }

    pub(crate) const fn cell_count(&self) -> usize {
        self.cell_count as usize
    }

    pub(crate) const fn live_cells(&self) -> usize {
        self.live_cells as usize
    }

    /// Slots that have been carved at least once; the rest never held a cell.
    pub(crate) const fn carved_cells(&self) -> usize {
        self.bump_index as usize
    }

    /// Index of `cell` within this block.
    pub(crate) fn cell_index(&self, cell: CellPtr) -> usize {
        let offset = cell.addr() - self.cells_base();
        debug_assert_eq!(offset % self.cell_size(), 0);
        offset / self.cell_size()
    }

    pub(crate) fn cell_at(&self, index: usize) -> CellPtr {
        debug_assert!(index < self.cell_count());
        // SAFETY: slot addresses inside the block are never null.
        unsafe { CellPtr::from_addr(self.cells_base() + index * self.cell_size()) }
    }

    // ------------------------------------------------------------------
    // Mark bitmap
    // ------------------------------------------------------------------

    pub(crate) const fn is_marked(&self, index: usize) -> bool {
        (self.marks[index / 64] & (1 << (index % 64))) != 0
    }

    pub(crate) const fn set_marked(&mut self, index: usize) {
        self.marks[index / 64] |= 1 << (index % 64);
    }

    pub(crate) const fn clear_marked(&mut self, index: usize) {
        self.marks[index / 64] &= !(1 << (index % 64));
    }

    pub(crate) const fn clear_all_marks(&mut self) {
        self.marks = [0; 4];
    }

    // ------------------------------------------------------------------
    // Occupancy
    // ------------------------------------------------------------------

    pub(crate) const fn has_capacity(&self) -> bool {
        self.free_head != FREE_NONE || self.bump_index < self.cell_count
    }

    pub(crate) const fn is_full(&self) -> bool {
        !self.has_capacity()
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.live_cells == 0
    }

    // ------------------------------------------------------------------
    // Carving and reclamation
    // ------------------------------------------------------------------

    /// Carves one slot and installs a live header for `vtable`.
    ///
    /// Returns `None` when the block is full.
    pub(crate) fn allocate(&mut self, vtable: &'static CellVTable) -> Option<CellPtr> {
        let index = if self.free_head != FREE_NONE {
            let index = self.free_head as usize;
            // SAFETY: dead slots keep their free-list link in the header.
            self.free_head = unsafe { (*self.cell_at(index).header_ptr()).free_next };
            index
        } else if self.bump_index < self.cell_count {
            let index = self.bump_index as usize;
            self.bump_index += 1;
            index
        } else {
            return None;
        };

        let cell = self.cell_at(index);
        // SAFETY: the slot is ours; header precedes the value area.
        unsafe {
            cell.header_ptr().write(CellHeader::new_live(vtable));
        }
        self.live_cells += 1;
        self.has_finalizers |= vtable.has_finalizer;
        self.has_must_survive |= vtable.may_must_survive;
        Some(cell)
    }

    /// Drops the cell's value and threads its slot back onto the free list.
    pub(crate) fn deallocate(&mut self, cell: CellPtr) {
        let index = self.cell_index(cell);
        // SAFETY: the sweeper only deallocates live cells of this block.
        unsafe {
            debug_assert_eq!(cell.state(), CellState::Live);
            let vtable = cell.vtable();
            (vtable.drop_in_place)(cell.data_ptr());
            #[allow(clippy::cast_possible_truncation)]
            cell.header_ptr()
                .write(CellHeader::new_dead(std::mem::replace(
                    &mut self.free_head,
                    index as u16,
                )));
        }
        self.live_cells -= 1;
    }

    /// Resolves a conservative candidate address to a live cell.
    ///
    /// Only exact slot-start addresses of live slots qualify; anything else
    /// is a coincidental bit pattern.
    pub(crate) fn cell_from_possible_pointer(&self, addr: usize) -> Option<CellPtr> {
        let base = self.cells_base();
        if addr < base {
            return None;
        }
        let offset = addr - base;
        if offset % self.cell_size() != 0 {
            return None;
        }
        let index = offset / self.cell_size();
        if index >= self.bump_index as usize {
            return None;
        }
        let cell = self.cell_at(index);
        // SAFETY: the slot is within this mapped block.
        (unsafe { cell.state() } == CellState::Live).then_some(cell)
    }

    /// Applies the per-cell sweep rule to the whole block: unmarked live
    /// cells are reclaimed, marked cells survive with their mark cleared
    /// for the next cycle.
    pub(crate) fn sweep(&mut self) -> SweepOutcome {
        let was_full = self.is_full();
        let mut collected_cells = 0;
        let mut live_cells = 0;
        for index in 0..self.bump_index as usize {
            let cell = self.cell_at(index);
            // SAFETY: the slot is within this mapped block.
            if unsafe { cell.state() } != CellState::Live {
                continue;
            }
            if self.is_marked(index) {
                live_cells += 1;
            } else {
                self.deallocate(cell);
                collected_cells += 1;
            }
        }
        self.clear_all_marks();
        SweepOutcome {
            collected_cells,
            live_cells,
            was_full,
        }
    }

    /// Calls `f` for every live cell in the block.
    pub(crate) fn for_each_live_cell(&self, mut f: impl FnMut(CellPtr)) {
        for index in 0..self.bump_index as usize {
            let cell = self.cell_at(index);
            // SAFETY: the slot is within this mapped block.
            if unsafe { cell.state() } == CellState::Live {
                f(cell);
            }
        }
    }
}

/// What one block sweep found.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepOutcome {
    pub collected_cells: usize,
    pub live_cells: usize,
    /// The block had no capacity going in; regaining some means the owning
    /// allocator must move it back to the usable set.
    pub was_full: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{vtable_of, Cell};

    struct Probe;

    impl Cell for Probe {
        const CLASS_NAME: &'static str = "Probe";
    }

    #[test]
    fn block_geometry() {
        let block = HeapBlock::create(64);
        // SAFETY: freshly created block.
        unsafe {
            let b = block.as_ref();
            assert_eq!(b.base() % BLOCK_SIZE, 0);
            assert_eq!(b.cell_count(), (BLOCK_SIZE - HeapBlock::header_size()) / 64);
            assert!(b.has_capacity());
            assert!(b.is_empty());
            HeapBlock::destroy(block);
        }
    }

    #[test]
    fn carve_until_full_then_recycle() {
        let block = HeapBlock::create(512);
        // SAFETY: block is mapped for the whole test.
        unsafe {
            let b = &mut *block.as_ptr();
            let mut cells = Vec::new();
            while let Some(cell) = b.allocate(vtable_of::<Probe>()) {
                cells.push(cell);
            }
            assert!(b.is_full());
            assert_eq!(cells.len(), b.cell_count());

            b.deallocate(cells[3]);
            assert!(b.has_capacity());
            let again = b.allocate(vtable_of::<Probe>()).unwrap();
            assert_eq!(again, cells[3]);
            assert!(b.is_full());
            HeapBlock::destroy(block);
        }
    }

    #[test]
    fn sweep_reclaims_unmarked_and_unmarks_survivors() {
        let block = HeapBlock::create(1024);
        // SAFETY: block is mapped for the whole test.
        unsafe {
            let b = &mut *block.as_ptr();
            let keep = b.allocate(vtable_of::<Probe>()).unwrap();
            let doomed = b.allocate(vtable_of::<Probe>()).unwrap();
            b.set_marked(b.cell_index(keep));

            let outcome = b.sweep();
            assert_eq!(outcome.live_cells, 1);
            assert_eq!(outcome.collected_cells, 1);
            assert!(!outcome.was_full);

            assert_eq!(keep.state(), CellState::Live);
            assert_eq!(doomed.state(), CellState::Dead);
            // Survivor's mark is gone, ready for the next cycle.
            assert!(!b.is_marked(b.cell_index(keep)));
            HeapBlock::destroy(block);
        }
    }

    #[test]
    fn possible_pointer_resolution() {
        let block = HeapBlock::create(256);
        // SAFETY: block is mapped for the whole test.
        unsafe {
            let b = &mut *block.as_ptr();
            let cell = b.allocate(vtable_of::<Probe>()).unwrap();

            assert_eq!(b.cell_from_possible_pointer(cell.addr()), Some(cell));
            // Interior and misaligned addresses do not resolve.
            assert_eq!(b.cell_from_possible_pointer(cell.addr() + 8), None);
            // Never-carved slots do not resolve.
            assert_eq!(b.cell_from_possible_pointer(cell.addr() + 256), None);
            HeapBlock::destroy(block);
        }
    }
}

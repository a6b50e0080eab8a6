//! Weak-reference records.
//!
//! Weak records live in their own pool of blocks, parallel to and
//! independent of the strong object graph. A record observes a cell without
//! keeping it alive: the weak-sweep phase clears every record whose cell
//! went unmarked and returns its slot to the block's free list, so full
//! blocks regain capacity. Freed slots are reused; each record carries a
//! generation counter bumped on free and a `WeakRef` remembers the
//! generation it was issued against, so a stale handle to a reused slot
//! reads `None` instead of the slot's new target.

use std::cell::Cell as StdCell;
use std::ptr::NonNull;

use crate::cell::{CellPtr, FREE_NONE};

/// Weak records per block.
pub(crate) const WEAK_BLOCK_CAPACITY: usize = 128;

/// One weak-reference record.
pub struct WeakImpl {
    cell: StdCell<Option<CellPtr>>,
    allocated: StdCell<bool>,
    next_free: StdCell<u16>,
    /// Bumped every time the slot is freed; a handle issued against an
    /// earlier generation is stale.
    generation: StdCell<u32>,
}

impl WeakImpl {
    const fn empty(next_free: u16) -> Self {
        Self {
            cell: StdCell::new(None),
            allocated: StdCell::new(false),
            next_free: StdCell::new(next_free),
            generation: StdCell::new(0),
        }
    }

    /// The observed cell, or `None` once cleared.
    pub(crate) fn cell(&self) -> Option<CellPtr> {
        self.cell.get()
    }
}

/// Handle to a weak record, handed to the embedder by
/// [`Heap::create_weak_impl`](crate::heap::Heap::create_weak_impl).
#[derive(Clone, Copy)]
pub struct WeakRef {
    record: NonNull<WeakImpl>,
    generation: u32,
}

impl WeakRef {
    pub(crate) fn new(record: NonNull<WeakImpl>) -> Self {
        // SAFETY: the record was just allocated and stays pinned inside its
        // boxed block for the life of the pool.
        let generation = unsafe { record.as_ref() }.generation.get();
        Self { record, generation }
    }

    pub(crate) const fn as_ptr(self) -> NonNull<WeakImpl> {
        self.record
    }

    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }

    /// The observed cell, or `None` after the weak sweep cleared it. A
    /// handle whose slot was since reclaimed and reused also reads `None`,
    /// never the slot's new target.
    #[must_use]
    pub fn cell(self) -> Option<CellPtr> {
        // SAFETY: records stay pinned inside their boxed block for the life
        // of the pool.
        let record = unsafe { self.record.as_ref() };
        if record.generation.get() != self.generation {
            return None;
        }
        record.cell()
    }

    /// Whether the record has been cleared.
    #[must_use]
    pub fn is_cleared(self) -> bool {
        self.cell().is_none()
    }
}

/// A pool block of weak records with an index free list.
pub(crate) struct WeakBlock {
    entries: Box<[WeakImpl; WEAK_BLOCK_CAPACITY]>,
    free_head: u16,
}

impl WeakBlock {
    pub(crate) fn new() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let entries = Box::new(std::array::from_fn(|i| {
            if i + 1 < WEAK_BLOCK_CAPACITY {
                WeakImpl::empty((i + 1) as u16)
            } else {
                WeakImpl::empty(FREE_NONE)
            }
        }));
        Self {
            entries,
            free_head: 0,
        }
    }

    pub(crate) const fn can_allocate(&self) -> bool {
        self.free_head != FREE_NONE
    }

    /// Carves one record observing `cell`.
    ///
    /// # Panics
    ///
    /// Panics if the block is full; the heap only allocates from blocks
    /// with capacity.
    pub(crate) fn allocate(&mut self, cell: CellPtr) -> NonNull<WeakImpl> {
        assert!(self.can_allocate(), "weak block is full");
        let index = self.free_head as usize;
        let entry = &self.entries[index];
        self.free_head = entry.next_free.get();
        entry.cell.set(Some(cell));
        entry.allocated.set(true);
        NonNull::from(entry)
    }

    /// Whether `ptr` points into this block's record array.
    pub(crate) fn contains(&self, ptr: NonNull<WeakImpl>) -> bool {
        let base = self.entries.as_ptr() as usize;
        let end = base + WEAK_BLOCK_CAPACITY * std::mem::size_of::<WeakImpl>();
        (base..end).contains(&(ptr.as_ptr() as usize))
    }

    fn index_of(&self, ptr: NonNull<WeakImpl>) -> usize {
        debug_assert!(self.contains(ptr));
        let base = self.entries.as_ptr() as usize;
        (ptr.as_ptr() as usize - base) / std::mem::size_of::<WeakImpl>()
    }

    /// Whether the record at `ptr` still occupies its slot on behalf of the
    /// handle issued against `generation`.
    pub(crate) fn is_current(&self, ptr: NonNull<WeakImpl>, generation: u32) -> bool {
        let entry = &self.entries[self.index_of(ptr)];
        entry.allocated.get() && entry.generation.get() == generation
    }

    fn free_slot(&mut self, index: usize) {
        let entry = &self.entries[index];
        entry.allocated.set(false);
        entry.cell.set(None);
        entry.generation.set(entry.generation.get().wrapping_add(1));
        entry.next_free.set(self.free_head);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.free_head = index as u16;
        }
    }

    /// Returns a record's slot to the free list.
    pub(crate) fn deallocate(&mut self, ptr: NonNull<WeakImpl>) {
        let index = self.index_of(ptr);
        assert!(
            self.entries[index].allocated.get(),
            "double free of a weak record"
        );
        self.free_slot(index);
    }

    /// Clears every record whose cell went unmarked this cycle and frees its
    /// slot. Clearing is one-way: a cleared record reads as `None` and is
    /// never re-pointed at its cell.
    pub(crate) fn sweep(&mut self, is_marked: impl Fn(CellPtr) -> bool) -> usize {
        let mut cleared = 0;
        for index in 0..WEAK_BLOCK_CAPACITY {
            let entry = &self.entries[index];
            if !entry.allocated.get() {
                continue;
            }
            let Some(cell) = entry.cell() else { continue };
            if !is_marked(cell) {
                self.free_slot(index);
                cleared += 1;
            }
        }
        cleared
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
    fn allocate_fill_and_recycle() {
        let mut block = WeakBlock::new();
        let mut records = Vec::new();
        for i in 0..WEAK_BLOCK_CAPACITY {
            assert!(block.can_allocate());
            records.push(block.allocate(fake_cell(0x1000 + i * 16)));
        }
        assert!(!block.can_allocate());

        block.deallocate(records[7]);
        assert!(block.can_allocate());
        let again = block.allocate(fake_cell(0x9000));
        assert_eq!(again, records[7]);
    }

    #[test]
    fn sweep_clears_unmarked_only() {
        let mut block = WeakBlock::new();
        let kept = fake_cell(0x1000);
        let doomed = fake_cell(0x2000);
        let a = block.allocate(kept);
        let b = block.allocate(doomed);

        let cleared = block.sweep(|cell| cell == kept);
        assert_eq!(cleared, 1);
        // SAFETY: records live inside `block`.
        unsafe {
            assert_eq!(a.as_ref().cell(), Some(kept));
            assert_eq!(b.as_ref().cell(), None);
        }
        assert!(block.is_current(a, 0));
        assert!(!block.is_current(b, 0));

        // A later sweep can only clear the surviving record; the freed slot
        // is skipped.
        assert_eq!(block.sweep(|_| false), 1);
        // SAFETY: as above.
        unsafe { assert_eq!(b.as_ref().cell(), None) };
    }

    #[test]
    fn reused_slots_do_not_leak_into_stale_handles() {
        let mut block = WeakBlock::new();
        let record = block.allocate(fake_cell(0x1000));
        let stale = WeakRef::new(record);

        // Nothing marked: the record is cleared and its slot freed.
        assert_eq!(block.sweep(|_| false), 1);
        let replacement = block.allocate(fake_cell(0x2000));
        assert_eq!(replacement, record, "slot is reused");

        let fresh = WeakRef::new(replacement);
        assert_eq!(fresh.cell(), Some(fake_cell(0x2000)));
        assert!(stale.is_cleared());
        assert_eq!(stale.cell(), None);
    }

    #[test]
    fn sweep_frees_slots_in_a_full_block() {
        let mut block = WeakBlock::new();
        for i in 0..WEAK_BLOCK_CAPACITY {
            block.allocate(fake_cell(0x1000 + i * 16));
        }
        assert!(!block.can_allocate());

        // Nothing marked, so every record is cleared and every slot freed.
        assert_eq!(block.sweep(|_| false), WEAK_BLOCK_CAPACITY);
        assert!(block.can_allocate());
    }
}

//! Per-size-class block ownership.
//!
//! A `CellAllocator` owns every block of one cell size, partitioned into a
//! usable set (has capacity) and a full set. While an incremental sweep is
//! active it also keeps the queue of its blocks still awaiting their sweep
//! step; the heap pulls from that queue either on the timer or on demand
//! when allocation needs capacity out of an unswept block.

use std::collections::VecDeque;
use std::ptr::NonNull;

use crate::block::HeapBlock;

pub(crate) struct CellAllocator {
    cell_size: usize,
    usable_blocks: Vec<NonNull<HeapBlock>>,
    full_blocks: Vec<NonNull<HeapBlock>>,
    /// Blocks snapshotted at cycle end, each awaiting one sweep step.
    pending_sweep: VecDeque<NonNull<HeapBlock>>,
}

impl CellAllocator {
    pub(crate) const fn new(cell_size: usize) -> Self {
        Self {
            cell_size,
            usable_blocks: Vec::new(),
            full_blocks: Vec::new(),
            pending_sweep: VecDeque::new(),
        }
    }

    pub(crate) const fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// The block allocation will carve from next, if any.
    pub(crate) fn current_block(&self) -> Option<NonNull<HeapBlock>> {
        self.usable_blocks.last().copied()
    }

    /// Maps a fresh block and makes it current.
    pub(crate) fn add_block(&mut self) -> NonNull<HeapBlock> {
        let block = HeapBlock::create(self.cell_size);
        self.usable_blocks.push(block);
        block
    }

    /// Moves a block that ran out of capacity into the full set.
    pub(crate) fn block_did_become_full(&mut self, block: NonNull<HeapBlock>) {
        self.remove_from(block, ListKind::Usable);
        self.full_blocks.push(block);
    }

    /// Sweep callback: a full block regained capacity.
    pub(crate) fn block_did_become_usable(&mut self, block: NonNull<HeapBlock>) {
        self.remove_from(block, ListKind::Full);
        self.usable_blocks.push(block);
    }

    /// Sweep callback: a block lost its last live cell. The block is
    /// forgotten here and unmapped by the caller, which also owns the
    /// heap-wide live-block index.
    pub(crate) fn block_did_become_empty(&mut self, block: NonNull<HeapBlock>) {
        let list = if self.usable_blocks.contains(&block) {
            ListKind::Usable
        } else {
            ListKind::Full
        };
        self.remove_from(block, list);
    }

    fn remove_from(&mut self, block: NonNull<HeapBlock>, list: ListKind) {
        let blocks = match list {
            ListKind::Usable => &mut self.usable_blocks,
            ListKind::Full => &mut self.full_blocks,
        };
        let position = blocks
            .iter()
            .position(|&b| b == block)
            .expect("allocator asked to move a block it does not track");
        blocks.swap_remove(position);
    }

    /// Calls `f` for every block this allocator owns.
    pub(crate) fn for_each_block(&self, mut f: impl FnMut(NonNull<HeapBlock>)) {
        for &block in self.usable_blocks.iter().chain(&self.full_blocks) {
            f(block);
        }
    }

    pub(crate) fn block_count(&self) -> usize {
        self.usable_blocks.len() + self.full_blocks.len()
    }

    // ------------------------------------------------------------------
    // Incremental sweep queue
    // ------------------------------------------------------------------

    /// Snapshots the current block set into the pending-sweep queue.
    /// Blocks mapped after this point belong to the next cycle and are
    /// not queued.
    pub(crate) fn begin_pending_sweep(&mut self) -> usize {
        debug_assert!(self.pending_sweep.is_empty());
        for &block in self.usable_blocks.iter().chain(&self.full_blocks) {
            // SAFETY: tracked blocks are mapped.
            unsafe { (*block.as_ptr()).pending_sweep = true };
            self.pending_sweep.push_back(block);
        }
        self.pending_sweep.len()
    }

    pub(crate) fn has_blocks_pending_sweep(&self) -> bool {
        !self.pending_sweep.is_empty()
    }

    /// Next block awaiting its sweep step.
    pub(crate) fn first_pending(&self) -> Option<NonNull<HeapBlock>> {
        self.pending_sweep.front().copied()
    }

    /// Removes a block from the queue, either because its step just ran or
    /// because allocation-driven draining got to it first; the timer must
    /// not revisit it.
    pub(crate) fn unqueue_pending(&mut self, block: NonNull<HeapBlock>) {
        self.pending_sweep.retain(|&b| b != block);
        // SAFETY: the caller still holds the block mapped.
        unsafe { (*block.as_ptr()).pending_sweep = false };
    }
}

impl Drop for CellAllocator {
    fn drop(&mut self) {
        // Teardown collection has already reclaimed the cells; unmap
        // whatever bookkeeping is left.
        for &block in self.usable_blocks.iter().chain(&self.full_blocks) {
            // SAFETY: tracked blocks are mapped and no longer referenced.
            unsafe { HeapBlock::destroy(block) };
        }
    }
}

enum ListKind {
    Usable,
    Full,
}

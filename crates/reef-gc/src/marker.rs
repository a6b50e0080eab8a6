//! Mark-phase traversal.
//!
//! An explicit LIFO worklist instead of native recursion, so arbitrarily
//! deep object graphs cannot overflow the collector's own stack. Callers
//! only get a reachability guarantee; visitation order is not a contract.

use std::collections::HashSet;

use crate::block::HeapBlock;
use crate::cell::{CellPtr, Visitor};
use crate::conservative::PossiblePointerFilter;
use crate::nanbox::Value;
use crate::roots::RootSet;

pub(crate) struct MarkingVisitor<'a> {
    filter: PossiblePointerFilter<'a>,
    worklist: Vec<CellPtr>,
    marked_cells: usize,
}

impl<'a> MarkingVisitor<'a> {
    pub(crate) fn new(live_blocks: &'a HashSet<usize>) -> Self {
        Self {
            filter: PossiblePointerFilter::new(live_blocks),
            worklist: Vec::new(),
            marked_cells: 0,
        }
    }

    /// Seeds the worklist with every root, then drains it.
    pub(crate) fn mark_from_roots(&mut self, roots: &RootSet) {
        for (cell, _) in roots.iter() {
            self.mark(cell);
        }
        self.drain();
    }

    /// Sets the cell's mark bit and queues it for edge visitation if this
    /// is its first visit.
    fn mark(&mut self, cell: CellPtr) {
        let block = HeapBlock::from_cell(cell);
        // SAFETY: marked cells live in mapped blocks; the marker holds the
        // only mutable access during the stop-the-world phase.
        let block = unsafe { &mut *block.as_ptr() };
        let index = block.cell_index(cell);
        if block.is_marked(index) {
            return;
        }
        block.set_marked(index);
        self.marked_cells += 1;
        self.worklist.push(cell);
    }

    fn drain(&mut self) {
        while let Some(cell) = self.worklist.pop() {
            // SAFETY: only live cells are marked, so the vtable is valid.
            unsafe {
                let vtable = cell.vtable();
                (vtable.visit_edges)(cell.data_ptr(), self);
            }
        }
    }

    pub(crate) const fn marked_cells(&self) -> usize {
        self.marked_cells
    }
}

impl Visitor for MarkingVisitor<'_> {
    fn visit_cell(&mut self, cell: CellPtr) {
        self.mark(cell);
    }

    fn visit_values(&mut self, values: &[Value]) {
        for &value in values {
            if value.is_cell() {
                self.mark(value.as_cell());
            }
        }
    }

    fn visit_possible_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks_exact(std::mem::size_of::<usize>()) {
            let word = usize::from_ne_bytes(chunk.try_into().unwrap());
            if let Some(cell) = self.filter.resolve_word(word) {
                self.mark(cell);
            }
        }
    }
}

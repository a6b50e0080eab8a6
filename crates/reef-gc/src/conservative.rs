//! Possible-pointer resolution for conservative scanning.
//!
//! Any pointer-sized word of unknown provenance (stack slot, spilled
//! register, conservative vector entry, raw cell bytes) might be a cell
//! reference, possibly hidden inside a boxed value's non-canonical bit
//! pattern. The filter turns such a word into a live cell or nothing:
//! unpack the box if the tag says so, reject addresses outside the span of
//! live blocks, mask down to the owning block, and let the block decide
//! whether the address is the exact start of a live slot. False positives
//! over-retain and are acceptable; false negatives are not.

use std::collections::HashSet;

use crate::block::{HeapBlock, BLOCK_MASK, BLOCK_SIZE};
use crate::cell::CellPtr;
use crate::nanbox::Value;

/// Snapshot of the live-block address span for one scan.
pub(crate) struct PossiblePointerFilter<'a> {
    live_blocks: &'a HashSet<usize>,
    min_address: usize,
    max_address: usize,
}

impl<'a> PossiblePointerFilter<'a> {
    /// `live_blocks` holds the base address of every mapped block.
    pub(crate) fn new(live_blocks: &'a HashSet<usize>) -> Self {
        let min_address = live_blocks.iter().copied().min().unwrap_or(usize::MAX);
        let max_address = live_blocks
            .iter()
            .copied()
            .max()
            .map_or(0, |base| base + BLOCK_SIZE);
        Self {
            live_blocks,
            min_address,
            max_address,
        }
    }

    /// Resolves a raw word, unpacking a boxed cell reference first.
    pub(crate) fn resolve_word(&self, word: usize) -> Option<CellPtr> {
        let bits = word as u64;
        let addr = if Value::encodes_cell(bits) {
            Value::extract_pointer_bits(bits)
        } else {
            word
        };
        self.resolve_address(addr)
    }

    /// Resolves a canonical address to the live cell starting exactly there.
    pub(crate) fn resolve_address(&self, addr: usize) -> Option<CellPtr> {
        if addr < self.min_address || addr >= self.max_address {
            return None;
        }
        let base = addr & BLOCK_MASK;
        if !self.live_blocks.contains(&base) {
            return None;
        }
        // SAFETY: the base is in the live set, so the block is mapped.
        let block = unsafe { &*(base as *const HeapBlock) };
        block.cell_from_possible_pointer(addr)
    }
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
    fn empty_span_resolves_nothing() {
        let live = HashSet::new();
        let filter = PossiblePointerFilter::new(&live);
        assert_eq!(filter.resolve_word(0x1234_5678), None);
    }

    #[test]
    fn resolves_exact_slot_starts_only() {
        let block = HeapBlock::create(128);
        // SAFETY: block stays mapped for the whole test.
        unsafe {
            let b = &mut *block.as_ptr();
            let cell = b.allocate(vtable_of::<Probe>()).unwrap();

            let live: HashSet<usize> = [b.base()].into();
            let filter = PossiblePointerFilter::new(&live);

            assert_eq!(filter.resolve_word(cell.addr()), Some(cell));
            assert_eq!(filter.resolve_word(cell.addr() + 8), None);
            // A word in an untracked block's range resolves to nothing.
            assert_eq!(filter.resolve_word(b.base() + 3 * BLOCK_SIZE), None);

            HeapBlock::destroy(block);
        }
    }

    #[test]
    fn unpacks_boxed_cell_words() {
        let block = HeapBlock::create(128);
        // SAFETY: block stays mapped for the whole test.
        unsafe {
            let b = &mut *block.as_ptr();
            let cell = b.allocate(vtable_of::<Probe>()).unwrap();

            let live: HashSet<usize> = [b.base()].into();
            let filter = PossiblePointerFilter::new(&live);

            let boxed = Value::from_cell(cell);
            // The boxed form is not a canonical address but still resolves.
            assert_eq!(filter.resolve_word(boxed.raw() as usize), Some(cell));
            assert_eq!(filter.resolve_word(Value::from_f64(1.5).raw() as usize), None);

            HeapBlock::destroy(block);
        }
    }
}

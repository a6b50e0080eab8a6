//! The collector itself.
//!
//! A `Heap` is an explicit context object: it owns every block, allocator,
//! weak pool and root registry, and nothing about it is global. Collection
//! runs in strict phase order (gather roots, mark, finalize, weak sweep,
//! sweep), with the sweep either monolithic (teardown) or spread across
//! timer-driven slices (steady state).

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::panic::Location;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::allocator::CellAllocator;
use crate::block::{HeapBlock, SweepOutcome, BLOCK_SIZE};
use crate::cell::{vtable_of, Cell, CellPtr, CellVTable, Ptr, CELL_HEADER_SIZE};
use crate::conservative::PossiblePointerFilter;
use crate::graph::GraphVisitor;
use crate::marker::MarkingVisitor;
use crate::roots::{
    ConservativeVector, HeapRoot, Root, RootHashMap, RootRegistry, RootSet, RootVector,
};
use crate::stack::spill_registers_and_scan;
use crate::timer::{NullTimer, SweepTimer, SWEEP_TIMER_INTERVAL};
use crate::weak::{WeakBlock, WeakRef};

/// Cell sizes the heap hands out, header included. Anything larger is a
/// fatal misuse.
const CELL_SIZE_CLASSES: [usize; 7] = [64, 96, 128, 256, 512, 1024, 3072];

/// Floor for the adaptive allocation threshold between collections.
const GC_MIN_BYTES_THRESHOLD: usize = 4 * 1024 * 1024;

/// What kind of cycle [`Heap::collect_garbage`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// Full cycle: gather roots, mark, finalize, weak-sweep, then schedule
    /// an incremental sweep.
    CollectGarbage,
    /// Shutdown cycle: skip marking so nothing survives, and sweep
    /// monolithically before returning.
    CollectEverything,
}

/// Pause accounting for the most recent collection's stop-the-world phases.
#[derive(Debug, Clone, Copy)]
pub struct CollectionMetrics {
    pub roots: usize,
    pub marked_cells: usize,
    pub mark: Duration,
    pub finalize: Duration,
    pub weak: Duration,
    pub total: Duration,
}

/// Occupancy of one size-class allocator.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorStatistics {
    pub cell_size: usize,
    pub block_count: usize,
    pub live_cells: usize,
    pub dead_cells: usize,
}

/// Heap-wide occupancy snapshot.
#[derive(Debug, Clone)]
pub struct HeapStatistics {
    pub allocators: Vec<AllocatorStatistics>,
}

impl HeapStatistics {
    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.allocators.iter().map(|a| a.block_count).sum()
    }

    #[must_use]
    pub fn total_live_cells(&self) -> usize {
        self.allocators.iter().map(|a| a.live_cells).sum()
    }
}

/// Construction-time knobs.
pub struct HeapOptions {
    /// Run a full collection before every allocation. Debug aid.
    pub collect_on_every_allocation: bool,
    /// Scan the native stack and registers for roots. Precise embedders
    /// (and reclamation tests, which stale registers would flake) turn
    /// this off and rely on explicit roots alone.
    pub conservative_scanning: bool,
    /// Wall-clock budget for one timer-driven sweep slice.
    pub sweep_slice_budget: Duration,
    /// Periodic timer the heap arms while an incremental sweep is active.
    pub timer: Box<dyn SweepTimer>,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            collect_on_every_allocation: false,
            conservative_scanning: true,
            sweep_slice_budget: Duration::from_millis(5),
            timer: Box::new(NullTimer::new()),
        }
    }
}

impl HeapOptions {
    #[must_use]
    pub fn collect_on_every_allocation(mut self, value: bool) -> Self {
        self.collect_on_every_allocation = value;
        self
    }

    #[must_use]
    pub fn conservative_scanning(mut self, value: bool) -> Self {
        self.conservative_scanning = value;
        self
    }

    #[must_use]
    pub fn sweep_slice_budget(mut self, budget: Duration) -> Self {
        self.sweep_slice_budget = budget;
        self
    }

    #[must_use]
    pub fn timer(mut self, timer: Box<dyn SweepTimer>) -> Self {
        self.timer = timer;
        self
    }
}

pub struct Heap {
    collect_on_every_allocation: bool,
    conservative_scanning: bool,
    sweep_slice_budget: Duration,
    timer: Box<dyn SweepTimer>,

    allocators: Vec<CellAllocator>,
    /// Base address of every mapped block; the conservative range test and
    /// block-membership check run against this.
    live_blocks: HashSet<usize>,

    usable_weak_blocks: Vec<Box<WeakBlock>>,
    full_weak_blocks: Vec<Box<WeakBlock>>,

    registry: Rc<RefCell<RootRegistry>>,
    gather_embedder_roots: Option<Box<dyn FnMut(&mut RootSet)>>,
    uprooted_cells: Vec<CellPtr>,
    post_gc_tasks: Vec<Box<dyn FnOnce()>>,

    collecting_garbage: bool,
    gc_deferrals: usize,
    should_gc_when_deferral_ends: bool,

    allocated_bytes_since_last_gc: usize,
    gc_bytes_threshold: usize,

    incremental_sweep_active: bool,
    sweep_live_cell_bytes: usize,
    /// Indices of allocators that still have blocks pending sweep.
    allocators_to_sweep: VecDeque<usize>,
    cells_allocated_during_sweep: Vec<CellPtr>,

    last_collection: Option<CollectionMetrics>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(HeapOptions::default())
    }

    #[must_use]
    pub fn with_options(options: HeapOptions) -> Self {
        Self {
            collect_on_every_allocation: options.collect_on_every_allocation,
            conservative_scanning: options.conservative_scanning,
            sweep_slice_budget: options.sweep_slice_budget,
            timer: options.timer,
            allocators: CELL_SIZE_CLASSES
                .iter()
                .map(|&size| CellAllocator::new(size))
                .collect(),
            live_blocks: HashSet::new(),
            usable_weak_blocks: Vec::new(),
            full_weak_blocks: Vec::new(),
            registry: Rc::new(RefCell::new(RootRegistry::default())),
            gather_embedder_roots: None,
            uprooted_cells: Vec::new(),
            post_gc_tasks: Vec::new(),
            collecting_garbage: false,
            gc_deferrals: 0,
            should_gc_when_deferral_ends: false,
            allocated_bytes_since_last_gc: 0,
            gc_bytes_threshold: GC_MIN_BYTES_THRESHOLD,
            incremental_sweep_active: false,
            sweep_live_cell_bytes: 0,
            allocators_to_sweep: VecDeque::new(),
            cells_allocated_during_sweep: Vec::new(),
            last_collection: None,
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates `value` as a managed cell and returns a typed pointer to
    /// it. The pointer does not root the cell.
    ///
    /// # Panics
    ///
    /// Panics if the value exceeds the largest cell size class.
    pub fn allocate<T: Cell>(&mut self, value: T) -> Ptr<T> {
        const {
            assert!(std::mem::align_of::<T>() <= 16);
        }
        let size = CELL_HEADER_SIZE + std::mem::size_of::<T>();
        self.will_allocate(size);

        let index = Self::allocator_index_for(size);
        let cell = self.allocate_cell(index, vtable_of::<T>());
        // SAFETY: a freshly carved slot with room for T behind the header.
        unsafe { cell.data_ptr().cast::<T>().write(value) };

        if self.incremental_sweep_active {
            // Shield the new cell from the in-flight sweep; the stray mark
            // is cleared when the sweep finishes.
            let block = HeapBlock::from_cell(cell);
            // SAFETY: the cell's block was just allocated from, so mapped.
            unsafe {
                let block = &mut *block.as_ptr();
                let cell_index = block.cell_index(cell);
                block.set_marked(cell_index);
            }
            self.cells_allocated_during_sweep.push(cell);
        }

        // SAFETY: the slot was initialized with a T one statement ago.
        unsafe { cell.downcast::<T>() }
    }

    /// Applies allocation pressure: runs a collection first when configured
    /// to collect on every allocation, or when accumulated allocation since
    /// the last cycle crosses the adaptive byte threshold.
    pub fn will_allocate(&mut self, size: usize) {
        if self.collect_on_every_allocation {
            self.allocated_bytes_since_last_gc = 0;
            self.collect_garbage(CollectionType::CollectGarbage, false);
        } else if self.allocated_bytes_since_last_gc + size > self.gc_bytes_threshold {
            self.allocated_bytes_since_last_gc = 0;
            self.collect_garbage(CollectionType::CollectGarbage, false);
        }
        self.allocated_bytes_since_last_gc += size;
    }

    fn allocator_index_for(size: usize) -> usize {
        CELL_SIZE_CLASSES
            .iter()
            .position(|&class| size <= class)
            .unwrap_or_else(|| {
                panic!(
                    "cell of {size} bytes exceeds the largest size class ({})",
                    CELL_SIZE_CLASSES[CELL_SIZE_CLASSES.len() - 1]
                )
            })
    }

    fn allocate_cell(&mut self, index: usize, vtable: &'static CellVTable) -> CellPtr {
        loop {
            let Some(block) = self.allocators[index].current_block() else {
                let block = self.allocators[index].add_block();
                // SAFETY: freshly mapped block.
                let base = unsafe { block.as_ref().base() };
                self.live_blocks.insert(base);
                trace!(cell_size = self.allocators[index].cell_size(), base, "mapped block");
                continue;
            };

            // Allocation-directed draining: never carve from a block the
            // current incremental sweep has not visited yet.
            // SAFETY: tracked blocks are mapped.
            if self.incremental_sweep_active && unsafe { block.as_ref() }.pending_sweep {
                self.sweep_one_block(index, block);
                continue;
            }

            // SAFETY: as above; the heap has exclusive access.
            let block_ref = unsafe { &mut *block.as_ptr() };
            if let Some(cell) = block_ref.allocate(vtable) {
                if block_ref.is_full() {
                    self.allocators[index].block_did_become_full(block);
                }
                return cell;
            }
            self.allocators[index].block_did_become_full(block);
        }
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Creates a handle that keeps `ptr` alive until dropped.
    #[track_caller]
    pub fn root<T: Cell>(&self, ptr: Ptr<T>) -> Root<T> {
        Root::new(Rc::clone(&self.registry), ptr, Location::caller())
    }

    /// Creates a vector whose elements are all roots.
    #[must_use]
    pub fn root_vector<T: Cell>(&self) -> RootVector<T> {
        RootVector::new(&self.registry)
    }

    /// Creates a hash map whose values are all roots.
    #[must_use]
    pub fn root_hash_map<K: Eq + Hash + 'static, T: Cell>(&self) -> RootHashMap<K, T> {
        RootHashMap::new(&self.registry)
    }

    /// Creates a value buffer whose raw words are scanned conservatively.
    #[must_use]
    pub fn conservative_vector(&self) -> ConservativeVector {
        ConservativeVector::new(&self.registry)
    }

    /// Installs the embedder's root callback, invoked during every root
    /// gather to contribute externally-known roots.
    pub fn set_embedder_roots_callback(&mut self, callback: impl FnMut(&mut RootSet) + 'static) {
        self.gather_embedder_roots = Some(Box::new(callback));
    }

    /// Forcibly excludes `cell` from the next mark phase's result, even if
    /// a stale pointer still reaches it.
    pub fn uproot_cell(&mut self, cell: CellPtr) {
        self.uprooted_cells.push(cell);
    }

    fn gather_roots(&mut self) -> RootSet {
        let mut roots = RootSet::default();

        for allocator in &self.allocators {
            allocator.for_each_block(|block| {
                // SAFETY: tracked blocks are mapped.
                let block = unsafe { &*block.as_ptr() };
                if !block.has_must_survive {
                    return;
                }
                block.for_each_live_cell(|cell| {
                    // SAFETY: live cells carry a valid vtable.
                    unsafe {
                        let vtable = cell.vtable();
                        if vtable.may_must_survive && (vtable.must_survive)(cell.data_ptr()) {
                            roots.insert(cell, HeapRoot::MustSurviveGc);
                        }
                    }
                });
            });
        }

        if let Some(callback) = self.gather_embedder_roots.as_mut() {
            callback(&mut roots);
        }

        if self.conservative_scanning {
            self.gather_conservative_roots(&mut roots);
        } else {
            self.gather_conservative_vector_roots(&mut roots);
        }

        self.registry.borrow_mut().gather(&mut roots);

        debug!(roots = roots.len(), "gathered roots");
        roots
    }

    fn gather_conservative_roots(&mut self, roots: &mut RootSet) {
        let filter = PossiblePointerFilter::new(&self.live_blocks);
        // SAFETY: the heap is single-threaded; this is the owning thread's
        // own stack.
        unsafe {
            spill_registers_and_scan(|word, addr, is_register| {
                if let Some(cell) = filter.resolve_word(word) {
                    let provenance = if is_register {
                        HeapRoot::RegisterPointer
                    } else {
                        HeapRoot::StackPointer(addr)
                    };
                    roots.insert(cell, provenance);
                }
            });
        }
        self.gather_conservative_vector_roots(roots);
    }

    /// Conservative vectors are scanned even in precise mode; opting out of
    /// stack scanning does not opt their buffers out.
    fn gather_conservative_vector_roots(&self, roots: &mut RootSet) {
        let filter = PossiblePointerFilter::new(&self.live_blocks);
        self.registry
            .borrow_mut()
            .for_each_conservative_value(|value| {
                if let Some(cell) = filter.resolve_word(value.raw() as usize) {
                    roots.insert(cell, HeapRoot::ConservativeVector);
                }
            });
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Runs a collection cycle.
    ///
    /// # Panics
    ///
    /// Panics if called while a collection is already in progress.
    pub fn collect_garbage(&mut self, collection_type: CollectionType, print_report: bool) {
        assert!(
            !self.collecting_garbage,
            "collect_garbage is not reentrant"
        );

        // A previous cycle's sweep must finish before new phases begin.
        if self.incremental_sweep_active && !self.is_gc_deferred() {
            debug!("new collection requested, finishing incremental sweep first");
            while self.incremental_sweep_active {
                self.sweep_next_block();
            }
        }

        self.collecting_garbage = true;
        let gc_start = Instant::now();

        let mut root_count = 0;
        let mut marked_cells = 0;
        if collection_type == CollectionType::CollectGarbage {
            if self.gc_deferrals > 0 {
                self.should_gc_when_deferral_ends = true;
                self.collecting_garbage = false;
                return;
            }
            let roots = self.gather_roots();
            root_count = roots.len();
            marked_cells = self.mark_live_cells(&roots);
        }
        let after_mark = Instant::now();

        self.finalize_unmarked_cells();
        let after_finalize = Instant::now();

        self.sweep_weak_blocks();
        let after_weak = Instant::now();

        if collection_type == CollectionType::CollectEverything {
            self.sweep_dead_cells(print_report, gc_start);
        }
        let after_sweep = Instant::now();

        self.last_collection = Some(CollectionMetrics {
            roots: root_count,
            marked_cells,
            mark: after_mark - gc_start,
            finalize: after_finalize - after_mark,
            weak: after_weak - after_finalize,
            total: after_sweep - gc_start,
        });
        self.collecting_garbage = false;

        self.run_post_gc_tasks();

        if collection_type != CollectionType::CollectEverything {
            self.start_incremental_sweep();
        }
    }

    fn mark_live_cells(&mut self, roots: &RootSet) -> usize {
        let mut visitor = MarkingVisitor::new(&self.live_blocks);
        visitor.mark_from_roots(roots);
        let marked = visitor.marked_cells();
        debug!(marked, "marked live cells");

        for &cell in &self.uprooted_cells {
            let block = HeapBlock::from_cell(cell);
            // SAFETY: an uprooted cell's block is still mapped; sweeping
            // has not run yet this cycle.
            unsafe {
                let block = &mut *block.as_ptr();
                let index = block.cell_index(cell);
                block.clear_marked(index);
            }
        }
        self.uprooted_cells.clear();
        marked
    }

    fn finalize_unmarked_cells(&self) {
        for allocator in &self.allocators {
            allocator.for_each_block(|block| {
                // SAFETY: tracked blocks are mapped.
                let block = unsafe { &*block.as_ptr() };
                if !block.has_finalizers {
                    return;
                }
                block.for_each_live_cell(|cell| {
                    if block.is_marked(block.cell_index(cell)) {
                        return;
                    }
                    // SAFETY: live cells carry a valid vtable; the value is
                    // still constructed, reclamation comes later.
                    unsafe {
                        let vtable = cell.vtable();
                        if vtable.has_finalizer {
                            (vtable.finalize)(cell.data_ptr());
                        }
                    }
                });
            });
        }
    }

    fn sweep_weak_blocks(&mut self) {
        let is_marked = |cell: CellPtr| {
            let block = HeapBlock::from_cell(cell);
            // SAFETY: a weak record's cell was live at the last weak sweep,
            // so its block has not been unmapped.
            unsafe {
                let block = &*block.as_ptr();
                block.is_marked(block.cell_index(cell))
            }
        };

        let mut cleared = 0;
        for block in &mut self.usable_weak_blocks {
            cleared += block.sweep(is_marked);
        }
        let mut still_full = Vec::new();
        for mut block in std::mem::take(&mut self.full_weak_blocks) {
            cleared += block.sweep(is_marked);
            if block.can_allocate() {
                self.usable_weak_blocks.push(block);
            } else {
                still_full.push(block);
            }
        }
        self.full_weak_blocks = still_full;
        if cleared > 0 {
            debug!(cleared, "cleared weak records");
        }
    }

    // ------------------------------------------------------------------
    // Sweeping
    // ------------------------------------------------------------------

    /// Sweeps `block`, applies its state transitions, and unmaps it if it
    /// came out empty.
    fn sweep_one_block(
        &mut self,
        allocator_index: usize,
        block: std::ptr::NonNull<HeapBlock>,
    ) -> SweepOutcome {
        // SAFETY: tracked blocks are mapped; the heap has exclusive access.
        let block_ref = unsafe { &mut *block.as_ptr() };
        if block_ref.pending_sweep {
            self.allocators[allocator_index].unqueue_pending(block);
        }

        let outcome = block_ref.sweep();
        let cell_size = block_ref.cell_size();
        if self.incremental_sweep_active {
            self.sweep_live_cell_bytes += outcome.live_cells * cell_size;
        }

        if block_ref.is_empty() {
            trace!(
                base = block_ref.base(),
                collected = outcome.collected_cells,
                "block freed"
            );
            self.allocators[allocator_index].block_did_become_empty(block);
            self.live_blocks.remove(&block_ref.base());
            // SAFETY: the block is no longer tracked anywhere.
            unsafe { HeapBlock::destroy(block) };
        } else if outcome.was_full && block_ref.has_capacity() {
            trace!(
                base = block_ref.base(),
                live = outcome.live_cells,
                collected = outcome.collected_cells,
                "block usable again"
            );
            self.allocators[allocator_index].block_did_become_usable(block);
        }
        outcome
    }

    /// Monolithic sweep over every block, used by the shutdown cycle.
    fn sweep_dead_cells(&mut self, print_report: bool, gc_start: Instant) {
        let mut collected_cells = 0;
        let mut collected_bytes = 0;
        let mut live_cells = 0;
        let mut live_bytes = 0;
        let mut freed_blocks = 0;

        for index in 0..self.allocators.len() {
            let mut blocks = Vec::new();
            self.allocators[index].for_each_block(|block| blocks.push(block));
            for block in blocks {
                // SAFETY: tracked blocks are mapped.
                let cell_size = unsafe { block.as_ref().cell_size() };
                let outcome = self.sweep_one_block(index, block);
                collected_cells += outcome.collected_cells;
                collected_bytes += outcome.collected_cells * cell_size;
                live_cells += outcome.live_cells;
                live_bytes += outcome.live_cells * cell_size;
                if outcome.live_cells == 0 {
                    freed_blocks += 1;
                }
            }
        }

        self.gc_bytes_threshold = live_bytes.max(GC_MIN_BYTES_THRESHOLD);

        if print_report {
            let live_block_count = self.live_blocks.len();
            info!(
                elapsed_ms = gc_start.elapsed().as_millis() as u64,
                live_cells,
                live_bytes,
                collected_cells,
                collected_bytes,
                live_blocks = live_block_count,
                live_block_bytes = live_block_count * BLOCK_SIZE,
                freed_blocks,
                freed_block_bytes = freed_blocks * BLOCK_SIZE,
                "garbage collection report"
            );
            self.dump_allocators();
        }
    }

    /// Snapshots every allocator's blocks into pending-sweep queues and
    /// arms the timer. Blocks mapped after this point belong to the next
    /// cycle.
    fn start_incremental_sweep(&mut self) {
        self.incremental_sweep_active = true;
        self.sweep_live_cell_bytes = 0;
        self.allocators_to_sweep.clear();

        let mut total_blocks = 0;
        for index in 0..self.allocators.len() {
            let queued = self.allocators[index].begin_pending_sweep();
            total_blocks += queued;
            if queued > 0 {
                self.allocators_to_sweep.push_back(index);
            }
        }
        debug!(blocks = total_blocks, "incremental sweep started");

        self.timer.arm(SWEEP_TIMER_INTERVAL);
    }

    /// Sweeps one pending block. Returns `true` when no sweep work remains
    /// (finishing the sweep if one was active).
    pub fn sweep_next_block(&mut self) -> bool {
        if !self.incremental_sweep_active || self.is_gc_deferred() {
            return true;
        }

        while let Some(&index) = self.allocators_to_sweep.front() {
            if let Some(block) = self.allocators[index].first_pending() {
                self.sweep_one_block(index, block);
                if !self.allocators[index].has_blocks_pending_sweep() {
                    self.allocators_to_sweep.pop_front();
                }
                return false;
            }
            // Drained by allocation-directed sweeping.
            self.allocators_to_sweep.pop_front();
        }

        self.finish_incremental_sweep();
        true
    }

    fn finish_incremental_sweep(&mut self) {
        self.gc_bytes_threshold = self.sweep_live_cell_bytes.max(GC_MIN_BYTES_THRESHOLD);
        debug!(
            live_bytes = self.sweep_live_cell_bytes,
            next_threshold = self.gc_bytes_threshold,
            "incremental sweep complete"
        );

        // Sweeping already cleared marks on the blocks it visited; only the
        // shields on cells allocated mid-sweep remain.
        for cell in self.cells_allocated_during_sweep.drain(..) {
            let block = HeapBlock::from_cell(cell);
            // SAFETY: cells allocated during the sweep are live, so their
            // block is mapped.
            unsafe {
                let block = &mut *block.as_ptr();
                let index = block.cell_index(cell);
                block.clear_marked(index);
            }
        }

        self.incremental_sweep_active = false;
        self.timer.disarm();
    }

    /// Timer callback: sweeps blocks until the slice budget expires or no
    /// work remains. The host calls this on every firing of the timer it
    /// was handed.
    pub fn sweep_on_timer(&mut self) {
        if !self.incremental_sweep_active || self.is_gc_deferred() {
            return;
        }

        let start = Instant::now();
        let deadline = start + self.sweep_slice_budget;
        let mut blocks_swept = 0usize;
        while Instant::now() < deadline {
            if self.sweep_next_block() {
                break;
            }
            blocks_swept += 1;
        }

        if blocks_swept > 0 {
            trace!(
                blocks_swept,
                elapsed_us = start.elapsed().as_micros() as u64,
                "sweep slice"
            );
        }
    }

    // ------------------------------------------------------------------
    // Deferral
    // ------------------------------------------------------------------

    pub fn defer_gc(&mut self) {
        self.gc_deferrals += 1;
    }

    /// # Panics
    ///
    /// Panics if garbage collection is not currently deferred.
    pub fn undefer_gc(&mut self) {
        assert!(
            self.gc_deferrals > 0,
            "undefer_gc without a matching defer_gc"
        );
        self.gc_deferrals -= 1;

        if self.gc_deferrals == 0 {
            if self.should_gc_when_deferral_ends {
                self.collect_garbage(CollectionType::CollectGarbage, false);
            }
            self.should_gc_when_deferral_ends = false;
        }
    }

    #[must_use]
    pub fn is_gc_deferred(&self) -> bool {
        self.gc_deferrals > 0
    }

    // ------------------------------------------------------------------
    // Weak references
    // ------------------------------------------------------------------

    /// Allocates a weak record observing `cell` from the first weak block
    /// with capacity, mapping a new block if none has any.
    pub fn create_weak_impl(&mut self, cell: CellPtr) -> WeakRef {
        if self.usable_weak_blocks.is_empty() {
            self.usable_weak_blocks.push(Box::new(WeakBlock::new()));
        }
        let block = self
            .usable_weak_blocks
            .last_mut()
            .expect("usable weak block was just ensured");
        let record = block.allocate(cell);
        if !block.can_allocate() {
            let full = self
                .usable_weak_blocks
                .pop()
                .expect("the exhausted block is still in the usable set");
            self.full_weak_blocks.push(full);
        }
        WeakRef::new(record)
    }

    /// Returns a weak record's slot to its block. A stale handle, one whose
    /// slot the weak sweep already reclaimed (and possibly reissued), is a
    /// no-op; destroying a record the heap never issued is fatal.
    pub fn destroy_weak_impl(&mut self, weak: WeakRef) {
        let ptr = weak.as_ptr();
        let generation = weak.generation();
        if let Some(index) = self
            .usable_weak_blocks
            .iter()
            .position(|block| block.contains(ptr))
        {
            let block = &mut self.usable_weak_blocks[index];
            if block.is_current(ptr, generation) {
                block.deallocate(ptr);
            }
        } else if let Some(index) = self
            .full_weak_blocks
            .iter()
            .position(|block| block.contains(ptr))
        {
            if self.full_weak_blocks[index].is_current(ptr, generation) {
                let mut block = self.full_weak_blocks.swap_remove(index);
                block.deallocate(ptr);
                self.usable_weak_blocks.push(block);
            }
        } else {
            panic!("destroying a weak record the heap does not track");
        }
    }

    // ------------------------------------------------------------------
    // Post-collection tasks
    // ------------------------------------------------------------------

    /// Queues a callback to run once after the current (or next) cycle's
    /// stop-the-world phases, never from inside a phase.
    pub fn enqueue_post_gc_task(&mut self, task: impl FnOnce() + 'static) {
        self.post_gc_tasks.push(Box::new(task));
    }

    fn run_post_gc_tasks(&mut self) {
        let tasks = std::mem::take(&mut self.post_gc_tasks);
        for task in tasks {
            task();
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Pause accounting for the most recent collection.
    #[must_use]
    pub fn last_collection_metrics(&self) -> Option<CollectionMetrics> {
        self.last_collection
    }

    /// Per-allocator occupancy snapshot.
    #[must_use]
    pub fn statistics(&self) -> HeapStatistics {
        let allocators = self
            .allocators
            .iter()
            .map(|allocator| {
                let mut stats = AllocatorStatistics {
                    cell_size: allocator.cell_size(),
                    block_count: allocator.block_count(),
                    live_cells: 0,
                    dead_cells: 0,
                };
                allocator.for_each_block(|block| {
                    // SAFETY: tracked blocks are mapped.
                    let block = unsafe { &*block.as_ptr() };
                    stats.live_cells += block.live_cells();
                    stats.dead_cells += block.carved_cells() - block.live_cells();
                });
                stats
            })
            .collect();
        HeapStatistics { allocators }
    }

    /// Logs per-allocator occupancy and heap-wide totals.
    pub fn dump_allocators(&self) {
        let stats = self.statistics();
        let mut committed_bytes = 0;
        let mut waste_bytes = 0;
        for allocator in &stats.allocators {
            if allocator.block_count == 0 {
                continue;
            }
            committed_bytes += allocator.block_count * BLOCK_SIZE;
            let dead_bytes = allocator.dead_cells * allocator.cell_size;
            waste_bytes += dead_bytes;
            info!(
                cell_size = allocator.cell_size,
                blocks = allocator.block_count,
                live_cells = allocator.live_cells,
                dead_cells = allocator.dead_cells,
                dead_bytes,
                "allocator"
            );
        }
        info!(committed_bytes, waste_bytes, "allocator totals");
    }

    /// Builds the object-reachability graph from the current roots, keyed
    /// by decimal cell address.
    pub fn dump_graph(&mut self) -> serde_json::Value {
        let roots = self.gather_roots();
        let mut visitor = GraphVisitor::new(&self.live_blocks, &roots);
        visitor.visit_all_cells();
        visitor.dump()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.collect_garbage(CollectionType::CollectEverything, false);
    }
}

//! An incremental, conservative mark-and-sweep garbage collector.
//!
//! `reef-gc` owns every managed allocation of a runtime: cells live in
//! 16 KiB naturally-aligned blocks partitioned by size class, reachability
//! is discovered from explicit roots plus a conservative scan of the native
//! stack and registers, and reclamation runs either monolithically (at
//! teardown) or spread across small timer-driven slices so the host event
//! loop never stalls behind a full sweep.
//!
//! The heap is an explicit context object; nothing is process-global, and
//! several independent heaps can coexist on different threads.
//!
//! ```
//! use reef_gc::{Cell, CollectionType, Heap, HeapOptions};
//!
//! struct Counter {
//!     value: u64,
//! }
//!
//! impl Cell for Counter {
//!     const CLASS_NAME: &'static str = "Counter";
//! }
//!
//! let mut heap = Heap::with_options(HeapOptions::default().conservative_scanning(false));
//! let counter = heap.allocate(Counter { value: 7 });
//! let root = heap.root(counter);
//!
//! heap.collect_garbage(CollectionType::CollectGarbage, false);
//! assert_eq!(root.value, 7);
//! ```

pub mod block;
pub mod cell;
pub mod heap;
pub mod nanbox;
pub mod roots;
pub mod timer;
pub mod weak;

mod allocator;
mod conservative;
mod graph;
mod marker;
mod stack;

pub use block::BLOCK_SIZE;
pub use cell::{Cell, CellPtr, Ptr, Visitor, CELL_HEADER_SIZE};
pub use heap::{
    AllocatorStatistics, CollectionMetrics, CollectionType, Heap, HeapOptions, HeapStatistics,
};
pub use nanbox::Value;
pub use roots::{ConservativeVector, HeapRoot, Root, RootHashMap, RootSet, RootVector};
pub use timer::{NullTimer, SweepTimer, SWEEP_TIMER_INTERVAL};
pub use weak::WeakRef;

//! Deferral windows postpone and coalesce collection requests.

use std::cell::Cell as StdCell;
use std::rc::Rc;

use reef_gc::{Cell, CollectionType, Heap, HeapOptions};

struct Garbage {
    drops: Rc<StdCell<usize>>,
}

impl Cell for Garbage {
    const CLASS_NAME: &'static str = "Garbage";
}

impl Drop for Garbage {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn deferral_suppresses_allocation_triggered_collection() {
    let mut heap = Heap::with_options(
        HeapOptions::default()
            .conservative_scanning(false)
            .collect_on_every_allocation(true),
    );
    let drops = Rc::new(StdCell::new(0));

    heap.defer_gc();
    heap.defer_gc();
    for _ in 0..10 {
        let _ = heap.allocate(Garbage {
            drops: Rc::clone(&drops),
        });
    }
    // Every allocation requested a cycle; deferral swallowed all of them.
    assert_eq!(drops.get(), 0);

    heap.undefer_gc();
    assert_eq!(drops.get(), 0);
    heap.undefer_gc();
    // The coalesced run fires on the last undefer; drain its sweep.
    while !heap.sweep_next_block() {}
    assert_eq!(drops.get(), 10);
}

#[test]
fn explicit_request_while_deferred_runs_later() {
    let mut heap = Heap::with_options(HeapOptions::default().conservative_scanning(false));
    let drops = Rc::new(StdCell::new(0));
    let _ = heap.allocate(Garbage {
        drops: Rc::clone(&drops),
    });

    heap.defer_gc();
    heap.collect_garbage(CollectionType::CollectGarbage, false);
    assert_eq!(drops.get(), 0);

    heap.undefer_gc();
    while !heap.sweep_next_block() {}
    assert_eq!(drops.get(), 1);
}

#[test]
fn undeferred_windows_with_no_request_do_nothing() {
    let mut heap = Heap::with_options(HeapOptions::default().conservative_scanning(false));
    let drops = Rc::new(StdCell::new(0));
    let _ = heap.allocate(Garbage {
        drops: Rc::clone(&drops),
    });

    heap.defer_gc();
    heap.undefer_gc();
    // No collection was requested during the window.
    assert_eq!(drops.get(), 0);
}

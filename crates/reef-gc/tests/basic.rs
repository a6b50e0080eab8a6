//! Core reachability and reclamation behavior.

use std::cell::Cell as StdCell;
use std::rc::Rc;

use reef_gc::{Cell, CellPtr, CollectionType, Heap, HeapOptions, Visitor};

struct Node {
    next: StdCell<Option<CellPtr>>,
    drops: Rc<StdCell<usize>>,
}

impl Cell for Node {
    const CLASS_NAME: &'static str = "Node";

    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        if let Some(next) = self.next.get() {
            visitor.visit_cell(next);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

fn precise_heap() -> Heap {
    Heap::with_options(HeapOptions::default().conservative_scanning(false))
}

fn node(heap: &mut Heap, drops: &Rc<StdCell<usize>>) -> reef_gc::Ptr<Node> {
    heap.allocate(Node {
        next: StdCell::new(None),
        drops: Rc::clone(drops),
    })
}

fn collect_and_drain(heap: &mut Heap) {
    heap.collect_garbage(CollectionType::CollectGarbage, false);
    while !heap.sweep_next_block() {}
}

#[test]
fn rooted_cells_survive_collection() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let a = node(&mut heap, &drops);
    let root = heap.root(a);

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 0);
    assert!(root.next.get().is_none());
}

#[test]
fn unrooted_cells_are_reclaimed() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let _ = node(&mut heap, &drops);

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
}

#[test]
fn reachability_follows_edges_then_roots_move() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));

    // B is reachable only through A's edge.
    let a = node(&mut heap, &drops);
    let b = node(&mut heap, &drops);
    a.next.set(Some(b.erase()));
    let root_a = heap.root(a);

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 0);

    // Re-root B directly, drop A's root: A dies, B lives.
    let root_b = heap.root(b);
    drop(root_a);
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
    assert!(root_b.next.get().is_none());
}

#[test]
fn cycles_are_collected() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let a = node(&mut heap, &drops);
    let b = node(&mut heap, &drops);
    a.next.set(Some(b.erase()));
    b.next.set(Some(a.erase()));

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 2);
}

#[test]
fn collect_everything_reclaims_rooted_cells_too() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let a = node(&mut heap, &drops);
    let root = heap.root(a);

    heap.collect_garbage(CollectionType::CollectEverything, false);
    assert_eq!(drops.get(), 1);
    assert_eq!(heap.statistics().total_live_cells(), 0);
    drop(root);
}

#[test]
fn heap_drop_reclaims_everything() {
    let drops = Rc::new(StdCell::new(0));
    {
        let mut heap = precise_heap();
        for _ in 0..100 {
            let _ = node(&mut heap, &drops);
        }
    }
    assert_eq!(drops.get(), 100);
}

#[test]
fn statistics_track_occupancy() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let a = node(&mut heap, &drops);
    let _root = heap.root(a);

    let stats = heap.statistics();
    assert_eq!(stats.total_live_cells(), 1);
    assert_eq!(stats.total_blocks(), 1);
}

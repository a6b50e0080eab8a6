//! Root sources: vectors, maps, embedder callback, must-survive cells,
//! conservative vectors, and uprooting.

use std::cell::Cell as StdCell;
use std::rc::Rc;

use reef_gc::{Cell, CellPtr, CollectionType, Heap, HeapOptions, HeapRoot, Value};

struct Payload {
    value: u64,
    drops: Rc<StdCell<usize>>,
}

impl Cell for Payload {
    const CLASS_NAME: &'static str = "Payload";
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

struct Pinned {
    pinned: Rc<StdCell<bool>>,
    drops: Rc<StdCell<usize>>,
}

impl Cell for Pinned {
    const CLASS_NAME: &'static str = "Pinned";
    const MAY_MUST_SURVIVE: bool = true;

    fn must_survive_garbage_collection(&self) -> bool {
        self.pinned.get()
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

fn precise_heap() -> Heap {
    Heap::with_options(HeapOptions::default().conservative_scanning(false))
}

fn payload(heap: &mut Heap, value: u64, drops: &Rc<StdCell<usize>>) -> reef_gc::Ptr<Payload> {
    heap.allocate(Payload {
        value,
        drops: Rc::clone(drops),
    })
}

fn collect_and_drain(heap: &mut Heap) {
    heap.collect_garbage(CollectionType::CollectGarbage, false);
    while !heap.sweep_next_block() {}
}

#[test]
fn root_vector_pins_its_elements() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let vector = heap.root_vector::<Payload>();
    for i in 0..10u64 {
        let cell = payload(&mut heap, i, &drops);
        vector.push(cell);
    }

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 0);
    assert_eq!(vector.at(4).value, 4);

    vector.clear();
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 10);
}

#[test]
fn dropping_a_root_vector_releases_its_elements() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let vector = heap.root_vector::<Payload>();
    let cell = payload(&mut heap, 1, &drops);
    vector.push(cell);

    drop(vector);
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
}

#[test]
fn root_hash_map_pins_its_values() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let map = heap.root_hash_map::<String, Payload>();
    let cell = payload(&mut heap, 42, &drops);
    map.insert("answer".to_string(), cell);

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 0);
    assert_eq!(map.get(&"answer".to_string()).unwrap().value, 42);

    map.remove(&"answer".to_string());
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
}

#[test]
fn embedder_callback_contributes_roots() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let held: Rc<StdCell<Option<CellPtr>>> = Rc::new(StdCell::new(None));

    let callback_held = Rc::clone(&held);
    heap.set_embedder_roots_callback(move |roots| {
        if let Some(cell) = callback_held.get() {
            roots.insert(cell, HeapRoot::Embedder);
        }
    });

    let cell = payload(&mut heap, 7, &drops);
    held.set(Some(cell.erase()));
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 0);

    held.set(None);
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
}

#[test]
fn must_survive_cells_pin_themselves() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let pinned = Rc::new(StdCell::new(true));
    let _ = heap.allocate(Pinned {
        pinned: Rc::clone(&pinned),
        drops: Rc::clone(&drops),
    });

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 0);

    pinned.set(false);
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
}

#[test]
fn conservative_vector_words_retain_cells() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let buffer = heap.conservative_vector();
    let cell = payload(&mut heap, 7, &drops);
    buffer.push(Value::from_cell(cell.erase()));
    buffer.push(Value::from_f64(1.5));

    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 0);

    buffer.clear();
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
}

#[test]
fn uprooted_cells_die_despite_being_reachable() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let cell = payload(&mut heap, 7, &drops);
    let root = heap.root(cell);

    heap.uproot_cell(cell.erase());
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
    drop(root);
}

#[test]
fn uprooting_only_affects_the_next_cycle() {
    let mut heap = precise_heap();
    let drops = Rc::new(StdCell::new(0));
    let doomed = payload(&mut heap, 1, &drops);
    let kept = payload(&mut heap, 2, &drops);
    let root_doomed = heap.root(doomed);
    let _root_kept = heap.root(kept);

    heap.uproot_cell(doomed.erase());
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
    drop(root_doomed);

    // The uprooted set was consumed; later cycles are unaffected.
    collect_and_drain(&mut heap);
    assert_eq!(drops.get(), 1);
    assert_eq!(_root_kept.value, 2);
}

//! The diagnostic object-graph dump.

use std::cell::Cell as StdCell;

use reef_gc::{Cell, CellPtr, CollectionType, Heap, HeapOptions, Visitor};

struct Node {
    next: StdCell<Option<CellPtr>>,
}

impl Cell for Node {
    const CLASS_NAME: &'static str = "Node";

    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        if let Some(next) = self.next.get() {
            visitor.visit_cell(next);
        }
    }
}

fn precise_heap() -> Heap {
    Heap::with_options(HeapOptions::default().conservative_scanning(false))
}

#[test]
fn dump_graph_has_nodes_roots_and_edges() {
    let mut heap = precise_heap();
    let a = heap.allocate(Node {
        next: StdCell::new(None),
    });
    let b = heap.allocate(Node {
        next: StdCell::new(None),
    });
    a.next.set(Some(b.erase()));
    let _root = heap.root(a);

    let graph = heap.dump_graph();
    let graph = graph.as_object().expect("graph dump is a JSON object");

    let a_key = a.addr().to_string();
    let b_key = b.addr().to_string();

    let a_node = graph.get(&a_key).expect("rooted cell has a node");
    assert_eq!(a_node["class_name"], "Node");
    let root = a_node["root"].as_str().expect("root provenance is recorded");
    assert!(root.starts_with("Handle("), "unexpected provenance: {root}");
    let edges = a_node["edges"].as_array().expect("edges are an array");
    assert!(edges.iter().any(|edge| edge == &serde_json::json!(b_key)));

    let b_node = graph.get(&b_key).expect("reachable cell has a node");
    assert_eq!(b_node["class_name"], "Node");
    assert!(b_node.get("root").is_none());
}

#[test]
fn dump_graph_omits_unreachable_cells() {
    let mut heap = precise_heap();
    let kept = heap.allocate(Node {
        next: StdCell::new(None),
    });
    let orphan = heap.allocate(Node {
        next: StdCell::new(None),
    });
    let _root = heap.root(kept);

    let graph = heap.dump_graph();
    let graph = graph.as_object().unwrap();
    assert!(graph.contains_key(&kept.addr().to_string()));
    assert!(!graph.contains_key(&orphan.addr().to_string()));

    // Dumping is read-only; a collection afterwards still works.
    heap.collect_garbage(CollectionType::CollectGarbage, false);
    while !heap.sweep_next_block() {}
}

//! Object-reachability graph construction for diagnostics.
//!
//! Same traversal shape as the marker, but instead of flipping mark bits it
//! records one node per visited cell with its class name, root provenance
//! (for root cells) and outgoing edges, then serializes the lot keyed by
//! decimal cell address. Purely a debugging aid; collection never depends
//! on it.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value as JsonValue};

use crate::cell::{CellPtr, Visitor};
use crate::conservative::PossiblePointerFilter;
use crate::nanbox::Value;
use crate::roots::{HeapRoot, RootSet};

#[derive(Default)]
struct GraphNode {
    class_name: &'static str,
    root: Option<HeapRoot>,
    edges: HashSet<usize>,
}

pub(crate) struct GraphVisitor<'a> {
    filter: PossiblePointerFilter<'a>,
    graph: HashMap<usize, GraphNode>,
    work_queue: Vec<CellPtr>,
    current: Option<usize>,
}

impl<'a> GraphVisitor<'a> {
    pub(crate) fn new(live_blocks: &'a HashSet<usize>, roots: &RootSet) -> Self {
        let mut visitor = Self {
            filter: PossiblePointerFilter::new(live_blocks),
            graph: HashMap::new(),
            work_queue: Vec::with_capacity(roots.len()),
            current: None,
        };
        for (cell, provenance) in roots.iter() {
            visitor.discover(cell);
            visitor
                .graph
                .get_mut(&cell.addr())
                .expect("root node was just inserted")
                .root = Some(provenance);
        }
        visitor
    }

    /// Records an edge from the node being visited and queues the target if
    /// it has not been seen yet.
    fn discover(&mut self, cell: CellPtr) {
        if let Some(from) = self.current {
            self.graph
                .get_mut(&from)
                .expect("visited node exists")
                .edges
                .insert(cell.addr());
        }
        if self.graph.contains_key(&cell.addr()) {
            return;
        }
        // SAFETY: only live cells enter the graph, so the vtable is valid.
        let class_name = unsafe { cell.vtable() }.class_name;
        self.graph.insert(
            cell.addr(),
            GraphNode {
                class_name,
                root: None,
                edges: HashSet::new(),
            },
        );
        self.work_queue.push(cell);
    }

    pub(crate) fn visit_all_cells(&mut self) {
        while let Some(cell) = self.work_queue.pop() {
            self.current = Some(cell.addr());
            // SAFETY: queued cells are live.
            unsafe {
                let vtable = cell.vtable();
                (vtable.visit_edges)(cell.data_ptr(), self);
            }
            self.current = None;
        }
    }

    pub(crate) fn dump(&self) -> JsonValue {
        let mut graph = serde_json::Map::new();
        for (&addr, node) in &self.graph {
            let mut edges: Vec<String> = node.edges.iter().map(ToString::to_string).collect();
            edges.sort_unstable();
            let mut entry = json!({
                "class_name": node.class_name,
                "edges": edges,
            });
            if let Some(root) = node.root {
                entry["root"] = JsonValue::String(root.to_string());
            }
            graph.insert(addr.to_string(), entry);
        }
        JsonValue::Object(graph)
    }
}

impl Visitor for GraphVisitor<'_> {
    fn visit_cell(&mut self, cell: CellPtr) {
        self.discover(cell);
    }

    fn visit_values(&mut self, values: &[Value]) {
        for &value in values {
            if value.is_cell() {
                self.discover(value.as_cell());
            }
        }
    }

    fn visit_possible_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks_exact(std::mem::size_of::<usize>()) {
            let word = usize::from_ne_bytes(chunk.try_into().unwrap());
            if let Some(cell) = self.filter.resolve_word(word) {
                self.discover(cell);
            }
        }
    }
}

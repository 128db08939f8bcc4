//! Cross-store relationship index
//!
//! Edges are keyed by `(id, adapter)` references so one edge can point into
//! any store. The index is owned by the manager and shared with the graph
//! adapter for traversal.

use crate::item::{ItemRef, Metadata, Relationship};
use parking_lot::RwLock;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
struct EdgeData {
    relation_type: String,
    strength: f32,
    metadata: Metadata,
}

#[derive(Default)]
struct Inner {
    graph: StableDiGraph<ItemRef, EdgeData>,
    nodes: HashMap<ItemRef, NodeIndex>,
}

impl Inner {
    fn node(&mut self, item: &ItemRef) -> NodeIndex {
        if let Some(&index) = self.nodes.get(item) {
            return index;
        }
        let index = self.graph.add_node(item.clone());
        self.nodes.insert(item.clone(), index);
        index
    }

    fn relationship(&self, edge: petgraph::stable_graph::EdgeIndex) -> Option<Relationship> {
        let (source, target) = self.graph.edge_endpoints(edge)?;
        let data = self.graph.edge_weight(edge)?;
        Some(Relationship {
            source: self.graph[source].clone(),
            target: self.graph[target].clone(),
            relation_type: data.relation_type.clone(),
            strength: data.strength,
            metadata: data.metadata.clone(),
        })
    }
}

/// One step of a breadth-first traversal
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalHop {
    pub item: ItemRef,
    /// Distance from the start, 0 for the start itself
    pub hop: usize,
    /// References from the start to `item`, inclusive
    pub path: Vec<ItemRef>,
    /// Relation type of the edge that reached `item`
    pub via: Option<String>,
}

/// Directed relationship graph over item references
#[derive(Default)]
pub struct RelationGraph {
    inner: RwLock<Inner>,
}

impl RelationGraph {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edge; an existing edge with the same endpoints and type is updated
    pub fn add(&self, relationship: Relationship) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let source = inner.node(&relationship.source);
        let target = inner.node(&relationship.target);

        let existing = inner
            .graph
            .edges_directed(source, Direction::Outgoing)
            .find(|e| e.target() == target && e.weight().relation_type == relationship.relation_type)
            .map(|e| e.id());

        let data = EdgeData {
            relation_type: relationship.relation_type,
            strength: relationship.strength.clamp(0.0, 1.0),
            metadata: relationship.metadata,
        };

        if let Some(weight) = existing.and_then(|edge| inner.graph.edge_weight_mut(edge)) {
            *weight = data;
            return;
        }
        inner.graph.add_edge(source, target, data);
    }

    /// Every edge touching `id` in any adapter, outgoing first
    pub fn relationships_of(&self, id: &str) -> Vec<Relationship> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut incoming = Vec::new();

        for &node in inner.nodes.iter().filter(|(item, _)| item.id == id).map(|(_, node)| node) {
            for edge in inner.graph.edges_directed(node, Direction::Outgoing) {
                out.extend(inner.relationship(edge.id()));
            }
            for edge in inner.graph.edges_directed(node, Direction::Incoming) {
                incoming.extend(inner.relationship(edge.id()));
            }
        }

        out.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        incoming.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        out.extend(incoming);
        out
    }

    /// Breadth-first traversal over outgoing and incoming edges.
    ///
    /// Starts from every reference with the given id, or only the one in
    /// `adapter` when set. Neighbours are visited in reference order so the
    /// result is stable for a fixed graph.
    pub fn traverse(
        &self,
        id: &str,
        adapter: Option<&str>,
        relation_filter: Option<&str>,
        max_hops: usize,
    ) -> Vec<TraversalHop> {
        let inner = self.inner.read();

        let mut starts: Vec<(&ItemRef, NodeIndex)> = inner
            .nodes
            .iter()
            .filter(|(item, _)| item.id == id && adapter.map_or(true, |a| item.adapter == a))
            .map(|(item, &node)| (item, node))
            .collect();
        starts.sort_by(|a, b| a.0.cmp(b.0));

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<(NodeIndex, usize, Vec<ItemRef>, Option<String>)> = VecDeque::new();
        for (item, node) in starts {
            visited.insert(node);
            queue.push_back((node, 0, vec![item.clone()], None));
        }

        let mut hops = Vec::new();
        while let Some((node, hop, path, via)) = queue.pop_front() {
            hops.push(TraversalHop {
                item: inner.graph[node].clone(),
                hop,
                path: path.clone(),
                via,
            });
            if hop >= max_hops {
                continue;
            }

            let mut neighbours: Vec<(NodeIndex, String)> = inner
                .graph
                .edges_directed(node, Direction::Outgoing)
                .map(|e| (e.target(), e.weight().relation_type.clone()))
                .chain(
                    inner
                        .graph
                        .edges_directed(node, Direction::Incoming)
                        .map(|e| (e.source(), e.weight().relation_type.clone())),
                )
                .filter(|(_, relation)| relation_filter.map_or(true, |f| f == relation.as_str()))
                .collect();
            neighbours.sort_by(|a, b| inner.graph[a.0].cmp(&inner.graph[b.0]));

            for (next, relation) in neighbours {
                if visited.insert(next) {
                    let mut next_path = path.clone();
                    next_path.push(inner.graph[next].clone());
                    queue.push_back((next, hop + 1, next_path, Some(relation)));
                }
            }
        }

        hops
    }

    /// Whether any edge touches `id`
    pub fn contains_id(&self, id: &str) -> bool {
        self.inner.read().nodes.keys().any(|item| item.id == id)
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.inner.read().graph.edge_count()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().graph.node_count()
    }
}

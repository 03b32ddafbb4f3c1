//! Append-only directed graph of timestamped events.
//!
//! Nodes are [`MemoryEvent`]s; edges carry a relation label.  The graph is
//! the sole durable record of everything that happened — it is never
//! mutated or pruned except by explicit new events.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use uuid::Uuid;

use crate::schema::MemoryEvent;

/// Relation label for the automatic temporal edge.
pub const NEXT_IN_TIME: &str = "next_in_time";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("event {0} not in graph")]
    MissingNode(Uuid),
}

#[derive(Debug, Clone)]
struct Edge {
    dst: Uuid,
    relation: String,
}

/// Read-only derived metrics, recomputed on each call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    /// Mean of in-degree + out-degree over all nodes.
    pub avg_degree: f64,
    /// Average directed local clustering coefficient.
    pub clustering_coefficient: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EventGraph {
    nodes: HashMap<Uuid, MemoryEvent>,
    /// Insertion order — the stable iteration order retrieval tie-breaks on.
    order: Vec<Uuid>,
    /// Outgoing labeled edges per node.
    edges: HashMap<Uuid, Vec<Edge>>,
    edge_count: usize,
    /// Cached id of the node with the latest timestamp, updated on insert.
    /// Keeps `add_event` O(1) given non-decreasing timestamps; under a
    /// timestamp tie the later insertion wins, so linking stays
    /// deterministic by insertion order.
    latest: Option<Uuid>,
    /// Bumped on every mutation; retrieval caches key on it so stale hits
    /// are structurally impossible.
    version: u64,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new event node.  If the graph was non-empty, a
    /// `next_in_time` edge is added from the most recent prior node to the
    /// new one; the first event in an empty graph gains no edge.
    pub fn add_event(&mut self, event: MemoryEvent) {
        let id = event.id;
        let ts = event.timestamp;
        if let Some(prev) = self.latest {
            self.insert_edge(prev, id, NEXT_IN_TIME.to_string());
        }
        self.nodes.insert(id, event);
        self.order.push(id);
        let superseded = match self.latest {
            Some(prev) => self.nodes[&prev].timestamp <= ts,
            None => true,
        };
        if superseded {
            self.latest = Some(id);
        }
        self.version += 1;
    }

    /// Add a labeled edge between existing nodes.  Re-linking the same pair
    /// replaces the relation label rather than duplicating the edge.
    pub fn link_events(
        &mut self,
        src: Uuid,
        dst: Uuid,
        relation: impl Into<String>,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&src) {
            return Err(GraphError::MissingNode(src));
        }
        if !self.nodes.contains_key(&dst) {
            return Err(GraphError::MissingNode(dst));
        }
        self.insert_edge(src, dst, relation.into());
        self.version += 1;
        Ok(())
    }

    fn insert_edge(&mut self, src: Uuid, dst: Uuid, relation: String) {
        let out = self.edges.entry(src).or_default();
        if let Some(existing) = out.iter_mut().find(|e| e.dst == dst) {
            existing.relation = relation;
        } else {
            out.push(Edge { dst, relation });
            self.edge_count += 1;
        }
    }

    /// Events matching `predicate`, newest first, truncated to `max_results`.
    pub fn retrieve<F>(&self, predicate: F, max_results: usize) -> Vec<MemoryEvent>
    where
        F: Fn(&MemoryEvent) -> bool,
    {
        let mut matches: Vec<&MemoryEvent> = self
            .iter()
            .filter(|event| predicate(event))
            .collect();
        // Stable sort: equal timestamps keep insertion order.
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matches.into_iter().take(max_results).cloned().collect()
    }

    /// All events reachable within `depth` hops of `event_id` following
    /// outgoing edges, excluding the root, in breadth-first order.
    pub fn related(&self, event_id: Uuid, depth: usize) -> Result<Vec<MemoryEvent>, GraphError> {
        if !self.nodes.contains_key(&event_id) {
            return Err(GraphError::MissingNode(event_id));
        }
        let mut seen = HashSet::from([event_id]);
        let mut queue = VecDeque::from([(event_id, 0usize)]);
        let mut out = Vec::new();
        while let Some((id, dist)) = queue.pop_front() {
            if dist == depth {
                continue;
            }
            for edge in self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                if seen.insert(edge.dst) {
                    out.push(self.nodes[&edge.dst].clone());
                    queue.push_back((edge.dst, dist + 1));
                }
            }
        }
        Ok(out)
    }

    /// Iterate events in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryEvent> {
        self.order.iter().map(|id| &self.nodes[id])
    }

    pub fn get(&self, id: Uuid) -> Option<&MemoryEvent> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Monotonic mutation counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> GraphStats {
        let n = self.node_count();
        let avg_degree = if n == 0 {
            0.0
        } else {
            // Each directed edge contributes one out-degree and one in-degree.
            (2 * self.edge_count) as f64 / n as f64
        };
        GraphStats {
            node_count: n,
            edge_count: self.edge_count,
            avg_degree,
            clustering_coefficient: self.average_clustering(),
        }
    }

    /// Average directed local clustering (Fagiolo): per node, directed
    /// triangles through it over the possible count
    /// `d_tot·(d_tot−1) − 2·d_bi`, where `d_tot` is in-degree plus
    /// out-degree and `d_bi` counts reciprocal neighbours.  Nodes with no
    /// possible triangle contribute 0.
    fn average_clustering(&self) -> f64 {
        let n = self.node_count();
        if n == 0 {
            return 0.0;
        }
        let mut succ: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        let mut pred: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for (src, out) in &self.edges {
            for edge in out {
                succ.entry(*src).or_default().insert(edge.dst);
                pred.entry(edge.dst).or_default().insert(*src);
            }
        }
        // Symmetrised adjacency â_xy = a_xy + a_yx, in {0, 1, 2}.
        let adj = |x: Uuid, y: Uuid| -> f64 {
            let fwd = succ.get(&x).is_some_and(|s| s.contains(&y));
            let bwd = succ.get(&y).is_some_and(|s| s.contains(&x));
            f64::from(u8::from(fwd) + u8::from(bwd))
        };
        let empty = HashSet::new();
        let mut total = 0.0;
        for id in self.nodes.keys() {
            let out = succ.get(id).unwrap_or(&empty);
            let inc = pred.get(id).unwrap_or(&empty);
            let d_tot = out.len() + inc.len();
            if d_tot < 2 {
                continue;
            }
            let d_bi = out.intersection(inc).count();
            let possible = d_tot * (d_tot - 1) - 2 * d_bi;
            if possible == 0 {
                continue;
            }
            // t_i = ½·(Â³)_ii; summing over unordered neighbour pairs
            // absorbs the ½ against the ordered double-count.
            let nbrs: Vec<Uuid> = out.union(inc).copied().collect();
            let mut triangles = 0.0;
            for (i, &j) in nbrs.iter().enumerate() {
                for &k in nbrs.iter().skip(i + 1) {
                    triangles += adj(*id, j) * adj(j, k) * adj(k, *id);
                }
            }
            total += triangles / possible as f64;
        }
        total / n as f64
    }

    /// Edges as `(src, dst, relation)` triples, for persistence and tests.
    pub fn edge_triples(&self) -> Vec<(Uuid, Uuid, String)> {
        let mut out = Vec::with_capacity(self.edge_count);
        // Follow insertion order on the source side for a stable listing.
        for src in &self.order {
            for edge in self.edges.get(src).map(Vec::as_slice).unwrap_or(&[]) {
                out.push((*src, edge.dst, edge.relation.clone()));
            }
        }
        out
    }

    /// Rebuild from persisted parts, bypassing temporal auto-linking.
    /// Used only by [`crate::persist`]; edges must reference present nodes.
    pub(crate) fn from_parts(
        nodes: Vec<MemoryEvent>,
        edges: Vec<(Uuid, Uuid, String)>,
    ) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for event in nodes {
            let id = event.id;
            let ts = event.timestamp;
            graph.nodes.insert(id, event);
            graph.order.push(id);
            let superseded = match graph.latest {
                Some(prev) => graph.nodes[&prev].timestamp <= ts,
                None => true,
            };
            if superseded {
                graph.latest = Some(id);
            }
        }
        for (src, dst, relation) in edges {
            if !graph.nodes.contains_key(&src) {
                return Err(GraphError::MissingNode(src));
            }
            if !graph.nodes.contains_key(&dst) {
                return Err(GraphError::MissingNode(dst));
            }
            graph.insert_edge(src, dst, relation);
        }
        Ok(graph)
    }
}

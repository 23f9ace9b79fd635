//! In-memory bidirected sequence graph with linear-coordinate helpers.
//!
//! Nodes carry forward-strand sequences; edges connect oriented node sides.
//! Reference paths ("walks") ground the approximate linear coordinate system
//! and feed the FM index. The graph is read-only once finalized and safe to
//! share across worker threads.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read as _};
use std::path::Path as FsPath;

use flate2::read::MultiGzDecoder;
use log::debug;

use crate::cache::CacheSet;
use crate::model::{NodeId, Pos};

/// An oriented reference to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub node: NodeId,
    pub is_reverse: bool,
}

impl Handle {
    pub fn forward(node: NodeId) -> Handle {
        Handle { node, is_reverse: false }
    }

    pub fn reverse(node: NodeId) -> Handle {
        Handle { node, is_reverse: true }
    }

    pub fn flip(&self) -> Handle {
        Handle { node: self.node, is_reverse: !self.is_reverse }
    }
}

/// A named path through the graph.
#[derive(Clone, Debug, Default)]
pub struct Walk {
    pub name: String,
    pub handles: Vec<Handle>,
}

/// The full graph index.
#[derive(Clone, Debug, Default)]
pub struct GraphIndex {
    nodes: BTreeMap<NodeId, String>,
    successors: HashMap<Handle, Vec<Handle>>,
    edges_by_node: HashMap<NodeId, Vec<(Handle, Handle)>>,
    walks: Vec<Walk>,
    // cumulative forward-strand start of each node, in id order
    node_starts: BTreeMap<NodeId, i64>,
    starts_to_nodes: BTreeMap<i64, NodeId>,
    total_length: i64,
}

impl GraphIndex {
    pub fn new() -> GraphIndex {
        GraphIndex::default()
    }

    pub fn add_node(&mut self, id: NodeId, sequence: &str) {
        self.nodes.insert(id, sequence.to_uppercase());
    }

    /// Add a bidirected edge from the end of `from` to the start of `to`.
    pub fn add_edge(&mut self, from: Handle, to: Handle) {
        let fwd = self.successors.entry(from).or_default();
        if !fwd.contains(&to) {
            fwd.push(to);
        }
        let rev = self.successors.entry(to.flip()).or_default();
        if !rev.contains(&from.flip()) {
            rev.push(from.flip());
        }
        let canonical = canonical_edge(from, to);
        for node in [from.node, to.node] {
            let list = self.edges_by_node.entry(node).or_default();
            if !list.contains(&canonical) {
                list.push(canonical);
            }
        }
    }

    pub fn add_walk(&mut self, name: &str, handles: Vec<Handle>) {
        self.walks.push(Walk { name: name.to_string(), handles });
    }

    /// Compute the linear coordinate tables. Call once after construction.
    pub fn finalize(&mut self) {
        self.node_starts.clear();
        self.starts_to_nodes.clear();
        let mut at = 0i64;
        for (&id, seq) in &self.nodes {
            self.node_starts.insert(id, at);
            self.starts_to_nodes.insert(at, id);
            at += seq.len() as i64;
        }
        self.total_length = at;
        debug!("graph finalized: {} nodes, {} bp", self.nodes.len(), self.total_length);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_length(&self) -> i64 {
        self.total_length
    }

    pub fn average_node_length(&self) -> f64 {
        if self.nodes.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.nodes.len() as f64
        }
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_seq(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(&id).map(|s| s.as_str())
    }

    pub fn node_len(&self, id: NodeId) -> usize {
        self.nodes.get(&id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn min_node_id(&self) -> NodeId {
        self.nodes.keys().next().copied().unwrap_or(0)
    }

    pub fn max_node_id(&self) -> NodeId {
        self.nodes.keys().next_back().copied().unwrap_or(0)
    }

    pub fn walks(&self) -> &[Walk] {
        &self.walks
    }

    /// The strand-specific sequence of a handle.
    pub fn handle_seq(&self, handle: Handle) -> Option<String> {
        self.nodes.get(&handle.node).map(|s| {
            if handle.is_reverse {
                crate::model::reverse_complement(s)
            } else {
                s.clone()
            }
        })
    }

    /// Handles reachable by one edge step out of `handle`.
    pub fn next_handles(&self, handle: Handle) -> &[Handle] {
        self.successors.get(&handle).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Handles reaching `handle` by one edge step.
    pub fn prev_handles(&self, handle: Handle) -> Vec<Handle> {
        self.next_handles(handle.flip()).iter().map(|h| h.flip()).collect()
    }

    /// All edges touching a node, in canonical orientation.
    pub fn edges_of(&self, id: NodeId) -> &[(Handle, Handle)] {
        self.edges_by_node.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Cached variant of [`edges_of`](Self::edges_of).
    pub fn edges_of_cached(&self, id: NodeId, cache: &mut CacheSet) -> Vec<(Handle, Handle)> {
        if let Some(edges) = cache.edges.get(&id) {
            return edges;
        }
        let edges = self.edges_of(id).to_vec();
        cache.edges.put(id, edges.clone());
        edges
    }

    /// Cached node sequence lookup.
    pub fn node_seq_cached(&self, id: NodeId, cache: &mut CacheSet) -> Option<String> {
        if let Some(seq) = cache.node.get(&id) {
            return Some(seq);
        }
        let seq = self.node_seq(id)?.to_string();
        cache.node.put(id, seq.clone());
        Some(seq)
    }

    /// Forward-strand linear start of a node, cached.
    pub fn node_start_cached(&self, id: NodeId, cache: &mut CacheSet) -> i64 {
        if let Some(start) = cache.node_start.get(&id) {
            return start;
        }
        let start = self.node_starts.get(&id).copied().unwrap_or(0);
        cache.node_start.put(id, start);
        start
    }

    /// Approximate linear coordinate of a position. Reverse-strand positions
    /// are projected onto the forward strand first.
    pub fn approx_position(&self, pos: Pos) -> i64 {
        let fwd = if pos.is_reverse { pos.flip(self.node_len(pos.node)) } else { pos };
        self.node_starts.get(&fwd.node).copied().unwrap_or(0) + fwd.offset as i64
    }

    /// Signed approximate distance from `a` to `b` along the linear layout.
    pub fn approx_distance(&self, a: Pos, b: Pos) -> i64 {
        self.approx_position(b) - self.approx_position(a)
    }

    /// The node whose linear interval covers (or is nearest below) a
    /// coordinate.
    pub fn node_approximately_at(&self, approx: i64) -> NodeId {
        let clamped = approx.clamp(0, (self.total_length - 1).max(0));
        self.starts_to_nodes
            .range(..=clamped)
            .next_back()
            .map(|(_, &id)| id)
            .or_else(|| self.starts_to_nodes.values().next().copied())
            .unwrap_or(0)
    }

    /// All node ids in `[lo, hi]`.
    pub fn id_range(&self, lo: NodeId, hi: NodeId) -> Vec<NodeId> {
        self.nodes.range(lo..=hi).map(|(&id, _)| id).collect()
    }

    /// The base at a position, reading the strand the position names.
    pub fn pos_char(&self, pos: Pos) -> Option<u8> {
        let seq = self.nodes.get(&pos.node)?;
        if pos.offset >= seq.len() {
            return None;
        }
        let byte = if pos.is_reverse {
            complement(seq.as_bytes()[seq.len() - 1 - pos.offset])
        } else {
            seq.as_bytes()[pos.offset]
        };
        Some(byte)
    }

    /// Positions one base after `pos` on its strand, crossing edges at node
    /// ends.
    pub fn next_positions(&self, pos: Pos) -> Vec<Pos> {
        let len = self.node_len(pos.node);
        if pos.offset + 1 < len {
            return vec![Pos::new(pos.node, pos.offset + 1, pos.is_reverse)];
        }
        let handle = Handle { node: pos.node, is_reverse: pos.is_reverse };
        self.next_handles(handle)
            .iter()
            .map(|h| Pos::new(h.node, 0, h.is_reverse))
            .collect()
    }

    /// Exact distance in bases from `a` to `b` following edges, or `maximum`
    /// when `b` is not reachable within it. Positions are treated as cut
    /// points, so a node's one-past-end position is zero bases from the
    /// start of each successor.
    pub fn graph_distance(&self, a: Pos, b: Pos, maximum: usize) -> usize {
        let mut targets: HashSet<Pos> = HashSet::new();
        targets.insert(b);
        if b.offset == 0 {
            // the ends of predecessors coincide with b
            let to = Handle { node: b.node, is_reverse: b.is_reverse };
            for prev in self.prev_handles(to) {
                targets.insert(Pos::new(prev.node, self.node_len(prev.node), prev.is_reverse));
            }
        }
        if b.offset == self.node_len(b.node) {
            let from = Handle { node: b.node, is_reverse: b.is_reverse };
            for next in self.next_handles(from) {
                targets.insert(Pos::new(next.node, 0, next.is_reverse));
            }
        }
        if targets.contains(&a) {
            return 0;
        }
        // 0/1 BFS: crossing a node boundary is free, consuming a base costs 1
        let mut seen: HashSet<Pos> = HashSet::new();
        let mut frontier: VecDeque<(Pos, usize)> = VecDeque::new();
        frontier.push_back((a, 0));
        while let Some((pos, dist)) = frontier.pop_front() {
            if !seen.insert(pos) {
                continue;
            }
            if targets.contains(&pos) {
                return dist;
            }
            if pos.offset < self.node_len(pos.node) {
                if dist + 1 <= maximum {
                    frontier.push_back((Pos::new(pos.node, pos.offset + 1, pos.is_reverse), dist + 1));
                }
            } else {
                let handle = Handle { node: pos.node, is_reverse: pos.is_reverse };
                for next in self.next_handles(handle) {
                    frontier.push_front((Pos::new(next.node, 0, next.is_reverse), dist));
                }
            }
        }
        maximum
    }

    /// Occurrence offsets of a node in every walk, keyed by walk name.
    /// Offsets are the walk coordinate where the node's visit begins.
    pub fn node_positions_in_walks(&self, id: NodeId, is_reverse: bool) -> HashMap<String, Vec<usize>> {
        let mut out: HashMap<String, Vec<usize>> = HashMap::new();
        for walk in &self.walks {
            let mut at = 0usize;
            for handle in &walk.handles {
                if handle.node == id && handle.is_reverse == is_reverse {
                    out.entry(walk.name.clone()).or_default().push(at);
                }
                at += self.node_len(handle.node);
            }
        }
        out
    }

    /// Cached variant of [`node_positions_in_walks`](Self::node_positions_in_walks).
    pub fn node_positions_in_walks_cached(
        &self,
        id: NodeId,
        is_reverse: bool,
        cache: &mut CacheSet,
    ) -> HashMap<String, Vec<usize>> {
        let key = (id, is_reverse);
        if let Some(hit) = cache.node_paths.get(&key) {
            return hit;
        }
        let positions = self.node_positions_in_walks(id, is_reverse);
        cache.node_paths.put(key, positions.clone());
        positions
    }

    /// Read a graph from GFA (S/L/P lines); gzipped input is detected by
    /// magic bytes.
    pub fn from_gfa_path(path: &FsPath) -> Result<GraphIndex, String> {
        let mut file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
        let mut magic = [0u8; 2];
        let n = file.read(&mut magic).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let file = File::open(path).map_err(|e| format!("failed to reopen {}: {}", path.display(), e))?;
        if n == 2 && magic == [0x1f, 0x8b] {
            GraphIndex::from_gfa_reader(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            GraphIndex::from_gfa_reader(BufReader::new(file))
        }
        .map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }

    pub fn from_gfa_reader<R: BufRead>(reader: R) -> io::Result<GraphIndex> {
        let mut graph = GraphIndex::new();
        let mut links: Vec<(Handle, Handle)> = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let mut fields = line.split('\t');
            match fields.next() {
                Some("S") => {
                    let id = fields
                        .next()
                        .and_then(|s| s.parse::<NodeId>().ok())
                        .ok_or_else(|| gfa_error(lineno, "segment id"))?;
                    let seq = fields.next().ok_or_else(|| gfa_error(lineno, "segment sequence"))?;
                    graph.add_node(id, seq);
                }
                Some("L") => {
                    let from = parse_gfa_handle(fields.next(), fields.next())
                        .ok_or_else(|| gfa_error(lineno, "link source"))?;
                    let to = parse_gfa_handle(fields.next(), fields.next())
                        .ok_or_else(|| gfa_error(lineno, "link target"))?;
                    links.push((from, to));
                }
                Some("P") => {
                    let name = fields.next().ok_or_else(|| gfa_error(lineno, "path name"))?.to_string();
                    let steps = fields.next().ok_or_else(|| gfa_error(lineno, "path steps"))?;
                    let mut handles = Vec::new();
                    for step in steps.split(',') {
                        if step.is_empty() {
                            continue;
                        }
                        let (id_str, orient) = step.split_at(step.len() - 1);
                        let id = id_str
                            .parse::<NodeId>()
                            .map_err(|_| gfa_error(lineno, "path step id"))?;
                        let is_reverse = match orient {
                            "+" => false,
                            "-" => true,
                            _ => return Err(gfa_error(lineno, "path step orientation")),
                        };
                        handles.push(Handle { node: id, is_reverse });
                    }
                    graph.add_walk(&name, handles);
                }
                _ => {}
            }
        }
        for (from, to) in links {
            graph.add_edge(from, to);
        }
        // implied edges along walks
        let walk_edges: Vec<(Handle, Handle)> = graph
            .walks
            .iter()
            .flat_map(|w| w.handles.windows(2).map(|pair| (pair[0], pair[1])).collect::<Vec<_>>())
            .collect();
        for (from, to) in walk_edges {
            graph.add_edge(from, to);
        }
        graph.finalize();
        Ok(graph)
    }
}

fn gfa_error(lineno: usize, what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("GFA line {}: bad {}", lineno + 1, what))
}

fn parse_gfa_handle(id: Option<&str>, orient: Option<&str>) -> Option<Handle> {
    let node = id?.parse::<NodeId>().ok()?;
    let is_reverse = match orient? {
        "+" => false,
        "-" => true,
        _ => return None,
    };
    Some(Handle { node, is_reverse })
}

fn canonical_edge(from: Handle, to: Handle) -> (Handle, Handle) {
    let flipped = (to.flip(), from.flip());
    if (from, to) <= flipped { (from, to) } else { flipped }
}

pub fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        _ => b'N',
    }
}

/// A small extracted piece of the graph, aligned against directly.
#[derive(Clone, Debug, Default)]
pub struct Subgraph {
    pub nodes: BTreeMap<NodeId, String>,
    pub edges: BTreeSet<(Handle, Handle)>,
}

impl Subgraph {
    pub fn new() -> Subgraph {
        Subgraph::default()
    }

    pub fn add_node(&mut self, id: NodeId, seq: &str) {
        self.nodes.entry(id).or_insert_with(|| seq.to_string());
    }

    pub fn add_edge(&mut self, from: Handle, to: Handle) {
        self.edges.insert(canonical_edge(from, to));
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_len(&self, id: NodeId) -> usize {
        self.nodes.get(&id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn total_length(&self) -> usize {
        self.nodes.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop edges whose endpoints are not both present.
    pub fn remove_orphan_edges(&mut self) {
        let nodes = &self.nodes;
        self.edges.retain(|(a, b)| nodes.contains_key(&a.node) && nodes.contains_key(&b.node));
    }

    /// Successors of a handle, considering both stored edge orientations.
    pub fn next_handles(&self, handle: Handle) -> Vec<Handle> {
        let mut out = Vec::new();
        for &(a, b) in &self.edges {
            if a == handle {
                out.push(b);
            }
            if b.flip() == handle {
                out.push(a.flip());
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Whether `b` starts exactly one base after `a` ends, either within one
    /// node or across an edge.
    pub fn adjacent(&self, a: Pos, b: Pos) -> bool {
        if a.node == b.node && a.is_reverse == b.is_reverse && a.offset + 1 == b.offset {
            return true;
        }
        if a.offset + 1 == self.node_len(a.node) && b.offset == 0 {
            let from = Handle { node: a.node, is_reverse: a.is_reverse };
            let to = Handle { node: b.node, is_reverse: b.is_reverse };
            return self.next_handles(from).contains(&to);
        }
        false
    }

    /// Forward-orientation topological order used by the aligner. Edges that
    /// involve reverse orientations are not traversed; cycles are broken at
    /// the lowest-id back edge.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut indegree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|&id| (id, 0)).collect();
        let mut forward_edges: Vec<(NodeId, NodeId)> = Vec::new();
        for &(a, b) in &self.edges {
            if !a.is_reverse && !b.is_reverse && self.has_node(a.node) && self.has_node(b.node) {
                forward_edges.push((a.node, b.node));
            }
        }
        for &(_, to) in &forward_edges {
            *indegree.entry(to).or_insert(0) += 1;
        }
        let mut ready: BTreeSet<NodeId> =
            indegree.iter().filter(|(_, &d)| d == 0).map(|(&id, _)| id).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut remaining = indegree;
        while order.len() < self.nodes.len() {
            let id = match ready.iter().next().copied() {
                Some(id) => id,
                None => {
                    // cycle: force the smallest remaining node
                    match remaining.keys().find(|id| !order.contains(*id)).copied() {
                        Some(id) => {
                            debug!("breaking cycle at node {}", id);
                            id
                        }
                        None => break,
                    }
                }
            };
            ready.remove(&id);
            order.push(id);
            for &(from, to) in &forward_edges {
                if from == id {
                    if let Some(d) = remaining.get_mut(&to) {
                        if *d > 0 {
                            *d -= 1;
                            if *d == 0 && !order.contains(&to) {
                                ready.insert(to);
                            }
                        }
                    }
                }
            }
        }
        order
    }

    /// Forward-orientation predecessors, for the aligner.
    pub fn forward_predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        for &(a, b) in &self.edges {
            if !a.is_reverse && !b.is_reverse && b.node == id && self.has_node(a.node) {
                out.push(a.node);
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

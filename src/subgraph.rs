//! Extraction of small subgraphs to align against.
//!
//! Three entry points: walking out a neighborhood around a seed chain,
//! pulling an id range with fixed context expansion, and growing an existing
//! subgraph toward a soft-clipped read end.

use std::collections::{HashSet, VecDeque};

use log::trace;

use crate::cache::CacheSet;
use crate::cancel::CancelToken;
use crate::index::graph::{GraphIndex, Handle, Subgraph};
use crate::model::{NodeId, Pos};
use crate::seed::finder::Mem;

/// Growth factor applied to the remaining read length when walking out a
/// chain neighborhood.
pub const CONTEXT_EXPANSION: f64 = 1.61803;

/// Walk the graph from `pos`, adding every node and edge reached within
/// `length` bases to `sub`.
pub fn cached_graph_context(
    graph: &GraphIndex,
    sub: &mut Subgraph,
    pos: Pos,
    length: i64,
    cache: &mut CacheSet,
    cancel: &CancelToken,
) {
    let mut seen: HashSet<Handle> = HashSet::new();
    let mut frontier: VecDeque<(Handle, i64)> = VecDeque::new();
    let start = Handle { node: pos.node, is_reverse: pos.is_reverse };
    // bases before the position on its node are not traversed
    frontier.push_back((start, -(pos.offset as i64)));
    while let Some((handle, dist)) = frontier.pop_front() {
        if cancel.tripped() {
            break;
        }
        if !seen.insert(handle) {
            continue;
        }
        let seq = match graph.node_seq_cached(handle.node, cache) {
            Some(seq) => seq,
            None => continue,
        };
        sub.add_node(handle.node, &seq);
        for (from, to) in graph.edges_of_cached(handle.node, cache) {
            sub.add_edge(from, to);
        }
        let reached = dist + seq.len() as i64;
        if reached < length {
            for &next in graph.next_handles(handle) {
                frontier.push_back((next, reached));
            }
        }
    }
}

/// The subgraph a chain of single-position seeds should be aligned against:
/// each seed's neighborhood walked forward by the expanded remaining read
/// length, plus a backward walk before the first seed.
pub fn cluster_subgraph(
    graph: &GraphIndex,
    read: &str,
    mems: &[Mem],
    cache: &mut CacheSet,
    cancel: &CancelToken,
) -> Subgraph {
    let mut sub = Subgraph::new();
    let anchored: Vec<&Mem> = mems.iter().filter(|m| !m.positions.is_empty()).collect();
    if anchored.is_empty() {
        return sub;
    }
    let start_mem = anchored[0];
    let start_pos = start_mem.positions[0];
    let get_before = (start_mem.begin as f64 * CONTEXT_EXPANSION) as i64;
    if get_before > 0 {
        let rev_start = start_pos.flip(graph.node_len(start_pos.node));
        cached_graph_context(graph, &mut sub, rev_start, get_before, cache, cancel);
    }
    for (i, mem) in anchored.iter().enumerate() {
        let pos = mem.positions[0];
        let remaining = if i + 1 == anchored.len() {
            read.len().saturating_sub(mem.begin)
        } else {
            mem.len().max(anchored[i + 1].begin.saturating_sub(mem.begin))
        };
        let get_after = (CONTEXT_EXPANSION * remaining as f64) as i64;
        cached_graph_context(graph, &mut sub, pos, get_after, cache, cancel);
    }
    sub.remove_orphan_edges();
    trace!("cluster subgraph: {} nodes, {} bp", sub.node_count(), sub.total_length());
    sub
}

/// All nodes with ids in `[lo, hi]`, grown by `context_depth` edge steps.
pub fn id_range_subgraph(graph: &GraphIndex, lo: NodeId, hi: NodeId, context_depth: usize) -> Subgraph {
    let mut sub = Subgraph::new();
    for id in graph.id_range(lo, hi) {
        if let Some(seq) = graph.node_seq(id) {
            sub.add_node(id, seq);
        }
    }
    expand_context(graph, &mut sub, context_depth);
    sub.remove_orphan_edges();
    sub
}

/// Grow a subgraph by `steps` edge steps, pulling in neighbor nodes and all
/// touching edges.
pub fn expand_context(graph: &GraphIndex, sub: &mut Subgraph, steps: usize) {
    let mut frontier: Vec<NodeId> = sub.nodes.keys().copied().collect();
    for id in &frontier {
        for &(a, b) in graph.edges_of(*id) {
            sub.add_edge(a, b);
        }
    }
    for _ in 0..steps {
        let mut next_frontier: Vec<NodeId> = Vec::new();
        for &id in &frontier {
            for &(a, b) in graph.edges_of(id) {
                for neighbor in [a.node, b.node] {
                    if !sub.has_node(neighbor) {
                        if let Some(seq) = graph.node_seq(neighbor) {
                            sub.add_node(neighbor, seq);
                            next_frontier.push(neighbor);
                        }
                    }
                }
                sub.add_edge(a, b);
            }
        }
        if next_frontier.is_empty() {
            break;
        }
        for &id in &next_frontier {
            for &(a, b) in graph.edges_of(id) {
                sub.add_edge(a, b);
            }
        }
        frontier = next_frontier;
    }
}

/// A one-step context around two nodes, for adjacency checks.
pub fn positions_context(graph: &GraphIndex, id1: NodeId, id2: NodeId) -> Subgraph {
    let mut sub = Subgraph::new();
    for id in [id1, id2] {
        if let Some(seq) = graph.node_seq(id) {
            sub.add_node(id, seq);
        }
    }
    expand_context(graph, &mut sub, 1);
    sub.remove_orphan_edges();
    sub
}

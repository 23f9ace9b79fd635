//! Linear positions of node occurrences on reference paths.
//!
//! For every walk in the graph, records the offset of each node visit. Used
//! to estimate fragment lengths between mates and to check pair consistency
//! by reference coordinates.

use std::collections::HashMap;

use crate::index::graph::GraphIndex;
use crate::model::{Alignment, NodeId};

/// Per-path node occurrence offsets.
#[derive(Clone, Debug, Default)]
pub struct PathPositions {
    // path name -> node -> (offset, visit is on reverse strand)
    occurrences: HashMap<String, HashMap<NodeId, Vec<(usize, bool)>>>,
    lengths: HashMap<String, usize>,
}

impl PathPositions {
    pub fn build(graph: &GraphIndex) -> PathPositions {
        let mut occurrences: HashMap<String, HashMap<NodeId, Vec<(usize, bool)>>> = HashMap::new();
        let mut lengths = HashMap::new();
        for walk in graph.walks() {
            let by_node = occurrences.entry(walk.name.clone()).or_default();
            let mut at = 0usize;
            for handle in &walk.handles {
                by_node.entry(handle.node).or_default().push((at, handle.is_reverse));
                at += graph.node_len(handle.node);
            }
            lengths.insert(walk.name.clone(), at);
        }
        PathPositions { occurrences, lengths }
    }

    pub fn path_names(&self) -> impl Iterator<Item = &str> {
        self.occurrences.keys().map(|s| s.as_str())
    }

    pub fn path_length(&self, name: &str) -> Option<usize> {
        self.lengths.get(name).copied()
    }

    /// Offsets of a node's visits on a path.
    pub fn node_offsets(&self, path: &str, node: NodeId) -> &[(usize, bool)] {
        self.occurrences
            .get(path)
            .and_then(|m| m.get(&node))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The node visit nearest to `offset` on a path, within `radius` bases.
    pub fn nearest_offset(&self, path: &str, node: NodeId, offset: usize, radius: usize) -> Option<usize> {
        self.node_offsets(path, node)
            .iter()
            .map(|&(at, _)| at)
            .filter(|&at| at.abs_diff(offset) <= radius)
            .min_by_key(|&at| at.abs_diff(offset))
    }

    /// Mean per-path position of an alignment's mappings, projected onto
    /// the forward strand of each path; when `first_hit_only` is set, only
    /// the first mapping contributes.
    pub fn alignment_mean_positions(
        &self,
        aln: &Alignment,
        first_hit_only: bool,
        node_len: impl Fn(NodeId) -> usize,
    ) -> HashMap<String, f64> {
        let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
        for mapping in &aln.path.mappings {
            let pos = mapping.position;
            let len = node_len(pos.node);
            // forward-strand offset of the mapping's first graph base
            let fwd_off = if pos.is_reverse {
                len.saturating_sub(pos.offset + mapping.from_len())
            } else {
                pos.offset
            };
            for (name, by_node) in &self.occurrences {
                if let Some(visits) = by_node.get(&pos.node) {
                    let entry = sums.entry(name.clone()).or_insert((0.0, 0));
                    for &(at, _) in visits {
                        entry.0 += (at + fwd_off) as f64;
                        entry.1 += 1;
                    }
                }
            }
            if first_hit_only && !sums.is_empty() {
                break;
            }
        }
        sums.into_iter().map(|(name, (sum, n))| (name, sum / n as f64)).collect()
    }
}

//! Tail alignment for gapless extensions that do not cover the full read.
//!
//! For each uncovered read end, a depth-limited DFS over walk-constrained
//! edges materializes a forest of tree subgraphs rooted next to the
//! extension. Each tail is aligned pinned-left with X-drop against every
//! tree, the best translated path wins, and the tails are spliced onto the
//! extension.

use std::collections::{HashMap, HashSet};

use log::trace;

use crate::align::dp::AlignMode;
use crate::align::extend::GaplessExtension;
use crate::align::facade::Aligners;
use crate::cancel::CancelToken;
use crate::index::graph::{GraphIndex, Handle, Subgraph};
use crate::model::{
    merge_alignments, reverse_complement, reverse_complement_alignment, Alignment, Edit, Mapping,
    Path, Pos,
};

// X-drop bound for tail DP, matching the off-diagonal dropoff used by the
// banded kernels.
const TAIL_XDROP: i32 = 100;

/// A connected branch of the tail DFS: nodes paired with their parent
/// indices, with the root truncated to the part after the extension.
#[derive(Clone, Debug)]
pub struct TreeSubgraph {
    /// `(parent index, handle)`, parent `-1` for the root.
    pub nodes: Vec<(i64, Handle)>,
    pub root_offset: usize,
}

impl TreeSubgraph {
    /// Materialize the tree as an alignable subgraph with synthetic ids,
    /// returning the translation back to base-graph handles.
    fn materialize(&self, graph: &GraphIndex) -> (Subgraph, HashMap<i64, (Handle, usize)>) {
        let mut sub = Subgraph::new();
        let mut translation = HashMap::new();
        for (i, &(parent, handle)) in self.nodes.iter().enumerate() {
            let id = i as i64 + 1;
            let seq = graph.handle_seq(handle).unwrap_or_default();
            let trim = if parent < 0 { self.root_offset.min(seq.len()) } else { 0 };
            sub.add_node(id, &seq[trim..]);
            translation.insert(id, (handle, trim));
            if parent >= 0 {
                sub.add_edge(Handle::forward(parent + 1), Handle::forward(id));
            }
        }
        (sub, translation)
    }
}

// Edges that appear on some indexed walk, in either direction. Falls back
// to every edge when the graph carries no walks.
fn walk_edges(graph: &GraphIndex) -> Option<HashSet<(Handle, Handle)>> {
    if graph.walks().is_empty() {
        return None;
    }
    let mut allowed = HashSet::new();
    for walk in graph.walks() {
        for pair in walk.handles.windows(2) {
            allowed.insert((pair[0], pair[1]));
            allowed.insert((pair[1].flip(), pair[0].flip()));
        }
    }
    Some(allowed)
}

fn constrained_next(
    graph: &GraphIndex,
    allowed: &Option<HashSet<(Handle, Handle)>>,
    handle: Handle,
) -> Vec<Handle> {
    graph
        .next_handles(handle)
        .iter()
        .copied()
        .filter(|&next| match allowed {
            Some(set) => set.contains(&(handle, next)),
            None => true,
        })
        .collect()
}

/// DFS over walk-constrained edges out to `walk_distance` bases, producing
/// one tree per connected branch from the starting cut.
pub fn tail_forest(
    graph: &GraphIndex,
    from: Pos,
    tail_length: usize,
    walk_distance: usize,
    cancel: &CancelToken,
) -> Vec<TreeSubgraph> {
    let mut forest: Vec<TreeSubgraph> = Vec::new();
    if tail_length == 0 {
        return forest;
    }
    let allowed = walk_edges(graph);
    let start = Handle { node: from.node, is_reverse: from.is_reverse };
    let node_len = graph.node_len(from.node);
    let start_included = from.offset < node_len;

    let mut tree: Vec<(i64, Handle)> = Vec::new();
    // (handle, parent index in tree, bases consumed before entering it)
    let mut stack: Vec<(Handle, i64, i64)> = Vec::new();
    if start_included {
        stack.push((start, -1, -(from.offset as i64)));
    } else {
        // the whole root is behind the cut; its children become roots
        for next in constrained_next(graph, &allowed, start) {
            stack.push((next, -1, 0));
        }
    }
    let root_offset = if start_included { from.offset } else { 0 };
    while let Some((handle, parent, entered_at)) = stack.pop() {
        if cancel.tripped() {
            break;
        }
        if parent < 0 && !tree.is_empty() {
            forest.push(TreeSubgraph { nodes: std::mem::take(&mut tree), root_offset });
        }
        tree.push((parent, handle));
        let here = tree.len() as i64 - 1;
        let used = entered_at + graph.node_len(handle.node) as i64;
        if used < walk_distance as i64 {
            for next in constrained_next(graph, &allowed, handle) {
                stack.push((next, here, used));
            }
        }
    }
    if !tree.is_empty() {
        forest.push(TreeSubgraph { nodes: tree, root_offset });
    }
    trace!("tail forest from {}: {} trees", from, forest.len());
    forest
}

/// Align a tail against every tree, pinned to the root, and return the best
/// translated path with its score. Falls back to a pure soft clip placed at
/// `default_position`.
pub fn best_alignment_against_any_tree(
    graph: &GraphIndex,
    trees: &[TreeSubgraph],
    sequence: &str,
    default_position: Pos,
    pin_left: bool,
    aligners: &Aligners,
    cancel: &CancelToken,
) -> (Path, i32) {
    let mut best_path = Path::default();
    let mut best_score = 0i32;
    if sequence.is_empty() {
        return (best_path, best_score);
    }
    // start from the everything-clipped fallback
    best_path.mappings.push(Mapping {
        position: default_position,
        edits: vec![Edit::insertion(sequence)],
    });
    for tree in trees {
        if cancel.tripped() {
            break;
        }
        if tree.nodes.is_empty() {
            continue;
        }
        let (sub, translation) = tree.materialize(graph);
        if sub.total_length() == 0 {
            continue;
        }
        let mut query = Alignment::from_sequence("", sequence);
        if !pin_left {
            query.sequence = reverse_complement(sequence);
        }
        let root = 1;
        let aln = aligners.align_to_graph(&query, &sub, AlignMode::PinnedLeft { root }, Some(TAIL_XDROP));
        if aln.score > best_score {
            let oriented = if pin_left {
                aln
            } else {
                reverse_complement_alignment(&aln, |id| sub.node_len(id))
            };
            best_path = translate_down(&oriented.path, &translation);
            best_score = oriented.score;
        }
    }
    (best_path, best_score)
}

// Map a path over synthetic tree nodes back onto base-graph strand
// positions.
fn translate_down(path: &Path, translation: &HashMap<i64, (Handle, usize)>) -> Path {
    let mut out = Path::default();
    for mapping in &path.mappings {
        let (handle, trim) = match translation.get(&mapping.position.node) {
            Some(&entry) => entry,
            None => continue,
        };
        let (offset, is_reverse) = if mapping.position.is_reverse {
            // the tree node was visited against its stored orientation
            (mapping.position.offset, !handle.is_reverse)
        } else {
            (mapping.position.offset + trim, handle.is_reverse)
        };
        out.mappings.push(Mapping {
            position: Pos::new(handle.node, offset, is_reverse),
            edits: mapping.edits.clone(),
        });
    }
    out
}

/// Splice tail alignments onto a gapless extension and return the stitched
/// whole-read alignment. The caller rescores.
pub fn align_tails(
    graph: &GraphIndex,
    aligners: &Aligners,
    read: &Alignment,
    extension: &GaplessExtension,
    cancel: &CancelToken,
) -> Option<Alignment> {
    let read_len = read.sequence.len();
    let (ext_begin, ext_end) = extension.read_interval;
    let start_pos = extension.starting_position()?;
    let end_pos = extension.tail_position()?;
    let scoring = &aligners.scoring;

    // left tail: walk backward from the extension start on the flipped
    // strand
    let mut left_path = Path::default();
    if ext_begin > 0 {
        let tail = &read.sequence[..ext_begin];
        let from = start_pos.flip(graph.node_len(start_pos.node));
        let limit = scoring.longest_detectable_gap(tail.len(), read_len) + tail.len();
        let forest = tail_forest(graph, from, tail.len(), limit, cancel);
        let (path, score) =
            best_alignment_against_any_tree(graph, &forest, tail, start_pos, false, aligners, cancel);
        trace!("left tail of {} bp scored {}", tail.len(), score);
        left_path = path;
    }

    // right tail: walk forward from the extension end
    let mut right_path = Path::default();
    if ext_end < read_len {
        let tail = &read.sequence[ext_end..];
        let limit = scoring.longest_detectable_gap(tail.len(), read_len) + tail.len();
        let forest = tail_forest(graph, end_pos, tail.len(), limit, cancel);
        let (path, score) =
            best_alignment_against_any_tree(graph, &forest, tail, end_pos, true, aligners, cancel);
        trace!("right tail of {} bp scored {}", tail.len(), score);
        right_path = path;
    }

    let mut pieces: Vec<Alignment> = Vec::new();
    if !left_path.is_empty() {
        let mut piece = Alignment::from_sequence("", &read.sequence[..ext_begin]);
        piece.path = left_path;
        pieces.push(piece);
    }
    let mut middle = Alignment::from_sequence("", &read.sequence[ext_begin..ext_end]);
    middle.path = extension.path.clone();
    pieces.push(middle);
    if !right_path.is_empty() {
        let mut piece = Alignment::from_sequence("", &read.sequence[ext_end..]);
        piece.path = right_path;
        pieces.push(piece);
    }
    let mut stitched = merge_alignments(&pieces);
    stitched.name = read.name.clone();
    stitched.sequence = read.sequence.clone();
    stitched.quality = read.quality.clone();
    stitched.identity = stitched.compute_identity();
    Some(stitched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::extend::extend_seed;

    fn linear_graph() -> GraphIndex {
        let mut g = GraphIndex::new();
        g.add_node(1, "ACGGT");
        g.add_node(2, "GCATT");
        g.add_node(3, "TGACC");
        g.add_edge(Handle::forward(1), Handle::forward(2));
        g.add_edge(Handle::forward(2), Handle::forward(3));
        g.add_walk("ref", vec![Handle::forward(1), Handle::forward(2), Handle::forward(3)]);
        g.finalize();
        g
    }

    #[test]
    fn forest_bounded_by_distance() {
        let g = linear_graph();
        let forest = tail_forest(&g, Pos::new(1, 2, false), 4, 4, &CancelToken::none());
        assert_eq!(forest.len(), 1);
        // 3 bp remain on the root, so the walk stops after node 2
        let nodes: Vec<_> = forest[0].nodes.iter().map(|&(_, h)| h.node).collect();
        assert_eq!(nodes, vec![1, 2]);
        assert_eq!(forest[0].root_offset, 2);
    }

    #[test]
    fn forest_follows_only_walk_edges() {
        // a bubble where only one allele is on the indexed walk
        let mut g = GraphIndex::new();
        g.add_node(1, "ACGGT");
        g.add_node(2, "GC");
        g.add_node(3, "TT");
        g.add_node(4, "TGACC");
        g.add_edge(Handle::forward(1), Handle::forward(2));
        g.add_edge(Handle::forward(1), Handle::forward(3));
        g.add_edge(Handle::forward(2), Handle::forward(4));
        g.add_edge(Handle::forward(3), Handle::forward(4));
        g.add_walk("alpha", vec![Handle::forward(1), Handle::forward(2), Handle::forward(4)]);
        g.finalize();
        let forest = tail_forest(&g, Pos::new(1, 0, false), 10, 20, &CancelToken::none());
        let all_nodes: HashSet<i64> = forest
            .iter()
            .flat_map(|t| t.nodes.iter().map(|&(_, h)| h.node))
            .collect();
        assert!(all_nodes.contains(&2));
        assert!(!all_nodes.contains(&3));
    }

    #[test]
    fn right_tail_is_spliced() {
        let g = linear_graph();
        let aligners = Aligners::default();
        // read = graph bases 2..12; seed covers only the first 5 of them
        let read = Alignment::from_sequence("r", "GGTGCATTTG");
        let ext = extend_seed(&g, &read.sequence, 0, 5, Pos::new(1, 2, false), 1).unwrap();
        let aln = align_tails(&g, &aligners, &read, &ext, &CancelToken::none()).unwrap();
        assert_eq!(aln.path.to_len(), 10);
        assert!((aln.identity - 1.0).abs() < 1e-9);
        // everything should be matches after splicing
        assert!(aln
            .path
            .mappings
            .iter()
            .flat_map(|m| m.edits.iter())
            .all(|e| e.is_match()));
    }

    #[test]
    fn left_tail_is_spliced() {
        let g = linear_graph();
        let aligners = Aligners::default();
        let read = Alignment::from_sequence("r", "GGTGCATTTG");
        // seed covers only the last 4 read bases
        let ext = extend_seed(&g, &read.sequence, 6, 10, Pos::new(2, 3, false), 1).unwrap();
        let aln = align_tails(&g, &aligners, &read, &ext, &CancelToken::none()).unwrap();
        assert_eq!(aln.path.to_len(), 10);
        assert!((aln.identity - 1.0).abs() < 1e-9);
        assert_eq!(aln.path.start_position().unwrap(), Pos::new(1, 2, false));
    }

    #[test]
    fn unreachable_tail_stays_clipped() {
        let g = linear_graph();
        let aligners = Aligners::default();
        // the read runs off the end of the graph
        let read = Alignment::from_sequence("r", "GACCAAAAA");
        let ext = extend_seed(&g, &read.sequence, 0, 4, Pos::new(3, 1, false), 1).unwrap();
        let aln = align_tails(&g, &aligners, &read, &ext, &CancelToken::none()).unwrap();
        assert_eq!(crate::model::softclip_end(&aln), 5);
    }
}

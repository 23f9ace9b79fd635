//! Gapless extension: walking exact matches through the graph.
//!
//! Seeds come with graph positions; walking them forward through node
//! sequences turns a seed chain into a perfect-match alignment, which the
//! tail aligner then completes at the read ends.

use log::trace;

use crate::index::graph::GraphIndex;
use crate::model::{Alignment, Edit, Mapping, Path, Pos};

/// An exact match of a read interval walked out in the graph.
#[derive(Clone, Debug, Default)]
pub struct GaplessExtension {
    pub path: Path,
    /// Half-open read interval the extension covers.
    pub read_interval: (usize, usize),
    pub score: i32,
}

impl GaplessExtension {
    pub fn full_length(&self, read_len: usize) -> bool {
        self.read_interval.0 == 0 && self.read_interval.1 == read_len
    }

    /// Position of the first matched base.
    pub fn starting_position(&self) -> Option<Pos> {
        self.path.start_position()
    }

    /// Position just past the last matched base.
    pub fn tail_position(&self) -> Option<Pos> {
        self.path.end_position()
    }
}

/// Walk `seq` through the graph starting exactly at `pos`, following every
/// branch whose next base matches. Returns the path of the first complete
/// walk, or `None` when the sequence cannot be walked.
pub fn walk_match(graph: &GraphIndex, seq: &str, pos: Pos) -> Option<Path> {
    let bytes = seq.as_bytes();
    let mut stack: Vec<(Pos, usize)> = vec![(pos, 0)];
    let mut visits: Vec<Pos> = Vec::with_capacity(bytes.len());
    // iterative DFS, keeping the positions of the current partial walk
    while let Some((at, matched)) = stack.pop() {
        visits.truncate(matched);
        if graph.pos_char(at) != Some(bytes[matched]) {
            continue;
        }
        visits.push(at);
        if matched + 1 == bytes.len() {
            return Some(positions_to_path(&visits));
        }
        for next in graph.next_positions(at) {
            stack.push((next, matched + 1));
        }
    }
    trace!("walk of {} bases from {} failed", seq.len(), pos);
    None
}

// group a run of per-base positions into match mappings
fn positions_to_path(visits: &[Pos]) -> Path {
    let mut path = Path::default();
    for &pos in visits {
        let fold = match path.mappings.last() {
            Some(prev) => {
                let prev_end = prev.position.offset + prev.from_len();
                prev.position.node == pos.node
                    && prev.position.is_reverse == pos.is_reverse
                    && pos.offset == prev_end
            }
            None => false,
        };
        if fold {
            let prev = path.mappings.last_mut().unwrap();
            let edit = prev.edits.last_mut().unwrap();
            edit.from_len += 1;
            edit.to_len += 1;
        } else {
            path.mappings.push(Mapping { position: pos, edits: vec![Edit::matching(1)] });
        }
    }
    path
}

/// Walk a read interval from a seed position, producing an extension scored
/// as exact matches.
pub fn extend_seed(
    graph: &GraphIndex,
    read: &str,
    begin: usize,
    end: usize,
    pos: Pos,
    match_score: i32,
) -> Option<GaplessExtension> {
    let piece = &read[begin..end];
    let path = walk_match(graph, piece, pos)?;
    Some(GaplessExtension {
        path,
        read_interval: (begin, end),
        score: piece.len() as i32 * match_score,
    })
}

/// Turn a read-ordered chain of single-position seeds into one perfect-match
/// alignment, walking each seed and bridging uncovered read bases with
/// insertions. Overlapping seeds are trimmed against the previous one;
/// seeds that fail to walk are skipped.
pub fn seeds_to_alignment(
    graph: &GraphIndex,
    read: &str,
    seeds: &[(usize, usize, Pos)],
    match_score: i32,
) -> Alignment {
    let mut pieces: Vec<Alignment> = Vec::new();
    let mut covered = 0usize;
    for &(begin, end, pos) in seeds {
        if end <= covered {
            continue;
        }
        let (walk_begin, walk_pos) = if begin < covered {
            // trim the overlap with the previous seed
            let trim = covered - begin;
            match advance_position(graph, pos, trim) {
                Some(p) => (covered, p),
                None => continue,
            }
        } else {
            (begin, pos)
        };
        if walk_begin > covered {
            let mut gap = Alignment::from_sequence("", &read[covered..walk_begin]);
            gap.path.mappings.push(Mapping {
                position: walk_pos,
                edits: vec![Edit::insertion(&read[covered..walk_begin])],
            });
            pieces.push(gap);
        }
        match extend_seed(graph, read, walk_begin, end, walk_pos, match_score) {
            Some(ext) => {
                let mut piece = Alignment::from_sequence("", &read[walk_begin..end]);
                piece.path = ext.path;
                piece.score = ext.score;
                pieces.push(piece);
                covered = end;
            }
            None => continue,
        }
    }
    if covered < read.len() {
        let mut tail = Alignment::from_sequence("", &read[covered..]);
        if let Some(last) = pieces.last() {
            if let Some(end_pos) = last.path.end_position() {
                tail.path.mappings.push(Mapping {
                    position: end_pos,
                    edits: vec![Edit::insertion(&read[covered..])],
                });
            }
        }
        pieces.push(tail);
    }
    let mut merged = crate::model::merge_alignments(&pieces);
    merged.sequence = read.to_string();
    merged.identity = merged.compute_identity();
    merged
}

/// Step a position forward by `count` bases along a matching walk.
pub fn advance_position(graph: &GraphIndex, pos: Pos, count: usize) -> Option<Pos> {
    let mut at = pos;
    for _ in 0..count {
        let nexts = graph.next_positions(at);
        at = *nexts.first()?;
    }
    Some(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::Handle;

    fn chain_graph() -> GraphIndex {
        let mut g = GraphIndex::new();
        g.add_node(1, "ACGT");
        g.add_node(2, "GGGG");
        g.add_node(3, "TTTT");
        g.add_edge(Handle::forward(1), Handle::forward(2));
        g.add_edge(Handle::forward(2), Handle::forward(3));
        g.add_walk("ref", vec![Handle::forward(1), Handle::forward(2), Handle::forward(3)]);
        g.finalize();
        g
    }

    #[test]
    fn walk_spans_nodes() {
        let g = chain_graph();
        let path = walk_match(&g, "GTGGGGTT", Pos::new(1, 2, false)).unwrap();
        assert_eq!(path.mappings.len(), 3);
        assert_eq!(path.to_len(), 8);
        assert_eq!(path.mappings[0].position, Pos::new(1, 2, false));
        assert_eq!(path.mappings[1].position, Pos::new(2, 0, false));
    }

    #[test]
    fn walk_fails_on_mismatch() {
        let g = chain_graph();
        assert!(walk_match(&g, "GTAA", Pos::new(1, 2, false)).is_none());
    }

    #[test]
    fn walk_follows_branches() {
        let mut g = GraphIndex::new();
        g.add_node(1, "AC");
        g.add_node(2, "G");
        g.add_node(3, "T");
        g.add_node(4, "AA");
        g.add_edge(Handle::forward(1), Handle::forward(2));
        g.add_edge(Handle::forward(1), Handle::forward(3));
        g.add_edge(Handle::forward(2), Handle::forward(4));
        g.add_edge(Handle::forward(3), Handle::forward(4));
        g.finalize();
        let path = walk_match(&g, "ACTAA", Pos::new(1, 0, false)).unwrap();
        let nodes: Vec<_> = path.mappings.iter().map(|m| m.position.node).collect();
        assert_eq!(nodes, vec![1, 3, 4]);
    }

    #[test]
    fn seeds_bridge_uncovered_bases() {
        let g = chain_graph();
        // seeds cover [0,4) and [8,12); the middle GGGG is bridged as an
        // insertion by the perfect-match assembler
        let read = "ACGTGGGGTTTT";
        let seeds = vec![(0, 4, Pos::new(1, 0, false)), (8, 12, Pos::new(3, 0, false))];
        let aln = seeds_to_alignment(&g, read, &seeds, 1);
        assert_eq!(aln.sequence, read);
        assert_eq!(aln.path.to_len(), 12);
        let ins: usize = aln
            .path
            .mappings
            .iter()
            .flat_map(|m| m.edits.iter())
            .filter(|e| e.is_insertion())
            .map(|e| e.to_len)
            .sum();
        assert_eq!(ins, 4);
    }

    #[test]
    fn overlapping_seeds_are_trimmed() {
        let g = chain_graph();
        let read = "ACGTGGGGTTTT";
        let seeds = vec![(0, 8, Pos::new(1, 0, false)), (4, 12, Pos::new(2, 0, false))];
        let aln = seeds_to_alignment(&g, read, &seeds, 1);
        assert_eq!(aln.path.to_len(), 12);
        assert!(aln.path.mappings.iter().flat_map(|m| m.edits.iter()).all(|e| e.is_match()));
        assert!((aln.identity - 1.0).abs() < 1e-9);
    }
}

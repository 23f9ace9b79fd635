//! Core value types for graph alignments.
//!
//! An [`Alignment`] pairs a query sequence with a [`Path`] through the graph.
//! A path is an ordered list of [`Mapping`]s, each anchored at a [`Pos`] and
//! carrying [`Edit`]s that spell out how query bases relate to node bases.

use std::fmt;

/// Node identifier in the graph.
pub type NodeId = i64;

/// A position on one strand of a graph node.
///
/// Offsets count from the strand-specific start of the node, so reversing a
/// position maps `offset` to `node_length - offset`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pos {
    pub node: NodeId,
    pub offset: usize,
    pub is_reverse: bool,
}

impl Pos {
    pub fn new(node: NodeId, offset: usize, is_reverse: bool) -> Self {
        Pos { node, offset, is_reverse }
    }

    /// The same point on the opposite strand.
    pub fn flip(&self, node_len: usize) -> Pos {
        Pos {
            node: self.node,
            offset: node_len - self.offset,
            is_reverse: !self.is_reverse,
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.node, if self.is_reverse { '-' } else { '+' }, self.offset)
    }
}

/// One aligned piece of a mapping.
///
/// Matches have `from_len == to_len > 0` and an empty sequence; substitutions
/// carry the replacement sequence; insertions have `from_len == 0`; deletions
/// have `to_len == 0`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Edit {
    pub from_len: usize,
    pub to_len: usize,
    pub sequence: String,
}

impl Edit {
    pub fn matching(len: usize) -> Edit {
        Edit { from_len: len, to_len: len, sequence: String::new() }
    }

    pub fn substitution(seq: &str) -> Edit {
        Edit { from_len: seq.len(), to_len: seq.len(), sequence: seq.to_string() }
    }

    pub fn insertion(seq: &str) -> Edit {
        Edit { from_len: 0, to_len: seq.len(), sequence: seq.to_string() }
    }

    pub fn deletion(len: usize) -> Edit {
        Edit { from_len: len, to_len: 0, sequence: String::new() }
    }

    pub fn is_match(&self) -> bool {
        self.from_len == self.to_len && self.sequence.is_empty() && self.from_len > 0
    }

    pub fn is_sub(&self) -> bool {
        self.from_len == self.to_len && !self.sequence.is_empty()
    }

    pub fn is_insertion(&self) -> bool {
        self.from_len == 0 && self.to_len > 0
    }

    pub fn is_deletion(&self) -> bool {
        self.to_len == 0 && self.from_len > 0
    }
}

/// A contiguous alignment of query bases to a single node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mapping {
    pub position: Pos,
    pub edits: Vec<Edit>,
}

impl Mapping {
    /// Graph bases consumed by this mapping.
    pub fn from_len(&self) -> usize {
        self.edits.iter().map(|e| e.from_len).sum()
    }

    /// Query bases consumed by this mapping.
    pub fn to_len(&self) -> usize {
        self.edits.iter().map(|e| e.to_len).sum()
    }
}

/// An ordered walk of mappings describing one alignment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Path {
    pub mappings: Vec<Mapping>,
}

impl Path {
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn from_len(&self) -> usize {
        self.mappings.iter().map(|m| m.from_len()).sum()
    }

    pub fn to_len(&self) -> usize {
        self.mappings.iter().map(|m| m.to_len()).sum()
    }

    /// Position just past the final graph base of the path.
    pub fn end_position(&self) -> Option<Pos> {
        self.mappings.last().map(|m| {
            let mut p = m.position;
            p.offset += m.from_len();
            p
        })
    }

    pub fn start_position(&self) -> Option<Pos> {
        self.mappings.first().map(|m| m.position)
    }
}

/// Per-reference-path fragment length record attached to a paired alignment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FragmentEntry {
    pub path_name: String,
    pub length: i64,
}

/// A query sequence together with its (possibly empty) alignment to the graph.
///
/// An unmapped alignment keeps the sequence and name but has an empty path,
/// zero score, zero identity, and zero mapping quality.
#[derive(Clone, Debug, Default)]
pub struct Alignment {
    pub name: String,
    pub sequence: String,
    /// Phred base qualities; empty when absent.
    pub quality: Vec<u8>,
    pub path: Path,
    pub score: i32,
    pub identity: f64,
    pub mapping_quality: i32,
    pub is_secondary: bool,
    /// Name of the next mate in the fragment, for paired reads.
    pub fragment_next: Option<String>,
    /// Name of the previous mate in the fragment, for paired reads.
    pub fragment_prev: Option<String>,
    /// Fragment length observations, one per shared reference path.
    pub fragment: Vec<FragmentEntry>,
}

impl Alignment {
    pub fn from_sequence(name: &str, sequence: &str) -> Alignment {
        Alignment { name: name.to_string(), sequence: sequence.to_string(), ..Default::default() }
    }

    pub fn is_mapped(&self) -> bool {
        !self.path.is_empty() && self.score > 0
    }

    /// Drop any alignment state, keeping the query itself.
    pub fn clear_alignment(&mut self) {
        self.path = Path::default();
        self.score = 0;
        self.identity = 0.0;
        self.mapping_quality = 0;
    }

    /// Matched bases divided by query length.
    pub fn compute_identity(&self) -> f64 {
        if self.sequence.is_empty() {
            return 0.0;
        }
        let matches: usize = self
            .path
            .mappings
            .iter()
            .flat_map(|m| m.edits.iter())
            .filter(|e| e.is_match())
            .map(|e| e.to_len)
            .sum();
        matches as f64 / self.sequence.len() as f64
    }

    /// Total number of edit operations across the path.
    pub fn edit_count(&self) -> usize {
        self.path.mappings.iter().map(|m| m.edits.len()).sum()
    }
}

/// Length of the unaligned prefix of the query.
pub fn softclip_start(aln: &Alignment) -> usize {
    match aln.path.mappings.first().and_then(|m| m.edits.first()) {
        Some(e) if e.is_insertion() => e.to_len,
        _ => 0,
    }
}

/// Length of the unaligned suffix of the query.
pub fn softclip_end(aln: &Alignment) -> usize {
    match aln.path.mappings.last().and_then(|m| m.edits.last()) {
        Some(e) if e.is_insertion() => e.to_len,
        _ => 0,
    }
}

/// Query interval covered by aligned (non-soft-clipped) bases.
pub fn aligned_interval(aln: &Alignment) -> (usize, usize) {
    let start = softclip_start(aln);
    let end = aln.sequence.len().saturating_sub(softclip_end(aln));
    (start, end.max(start))
}

/// Number of query bases two alignments share in their aligned intervals.
pub fn query_overlap(a: &Alignment, b: &Alignment) -> usize {
    let (a1, a2) = aligned_interval(a);
    let (b1, b2) = aligned_interval(b);
    let lo = a1.max(b1);
    let hi = a2.min(b2);
    hi.saturating_sub(lo)
}

/// Reverse complement of a DNA sequence; characters outside A/C/G/T map to N.
pub fn reverse_complement(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|b| match b {
            b'A' | b'a' => 'T',
            b'C' | b'c' => 'G',
            b'G' | b'g' => 'C',
            b'T' | b't' => 'A',
            _ => 'N',
        })
        .collect()
}

/// Reverse-complement an alignment, flipping every mapping onto the other
/// strand. `node_len` resolves node lengths for offset arithmetic.
pub fn reverse_complement_alignment<F>(aln: &Alignment, node_len: F) -> Alignment
where
    F: Fn(NodeId) -> usize,
{
    let mut flipped = aln.clone();
    flipped.sequence = reverse_complement(&aln.sequence);
    if !aln.quality.is_empty() {
        flipped.quality = aln.quality.iter().rev().copied().collect();
    }
    flipped.path.mappings.clear();
    for mapping in aln.path.mappings.iter().rev() {
        let len = node_len(mapping.position.node);
        let from_len = mapping.from_len();
        let position = Pos {
            node: mapping.position.node,
            offset: len - (mapping.position.offset + from_len),
            is_reverse: !mapping.position.is_reverse,
        };
        let edits = mapping
            .edits
            .iter()
            .rev()
            .map(|e| Edit {
                from_len: e.from_len,
                to_len: e.to_len,
                sequence: reverse_complement(&e.sequence),
            })
            .collect();
        flipped.path.mappings.push(Mapping { position, edits });
    }
    flipped
}

/// Remove `count` query bases from the front of an alignment, returning the
/// alignment of the remaining suffix.
pub fn strip_from_start(aln: &Alignment, count: usize) -> Alignment {
    if count == 0 {
        return aln.clone();
    }
    let mut out = aln.clone();
    out.sequence = aln.sequence[count.min(aln.sequence.len())..].to_string();
    if !aln.quality.is_empty() {
        out.quality = aln.quality[count.min(aln.quality.len())..].to_vec();
    }
    out.path.mappings.clear();
    let mut remaining = count;
    for mapping in &aln.path.mappings {
        if out.path.mappings.is_empty() {
            // still consuming the prefix
            let mut offset = mapping.position.offset;
            let mut edits: Vec<Edit> = Vec::new();
            for edit in &mapping.edits {
                if remaining == 0 {
                    edits.push(edit.clone());
                    continue;
                }
                if edit.to_len <= remaining {
                    remaining -= edit.to_len;
                    offset += edit.from_len;
                } else {
                    // split this edit
                    let keep_to = edit.to_len - remaining;
                    if edit.is_match() {
                        offset += remaining;
                        edits.push(Edit::matching(keep_to));
                    } else if edit.is_sub() {
                        offset += remaining;
                        edits.push(Edit::substitution(&edit.sequence[remaining..]));
                    } else {
                        // insertion: keep the tail of the inserted sequence
                        edits.push(Edit::insertion(&edit.sequence[remaining..]));
                    }
                    remaining = 0;
                }
            }
            if !edits.is_empty() {
                let mut position = mapping.position;
                position.offset = offset;
                out.path.mappings.push(Mapping { position, edits });
            }
        } else {
            out.path.mappings.push(mapping.clone());
        }
    }
    out
}

/// Remove `count` query bases from the back of an alignment.
pub fn strip_from_end(aln: &Alignment, count: usize) -> Alignment {
    if count == 0 {
        return aln.clone();
    }
    let mut out = aln.clone();
    let keep = aln.sequence.len().saturating_sub(count);
    out.sequence = aln.sequence[..keep].to_string();
    if !aln.quality.is_empty() {
        out.quality = aln.quality[..keep.min(aln.quality.len())].to_vec();
    }
    out.path.mappings.clear();
    let mut remaining = count;
    for mapping in aln.path.mappings.iter().rev() {
        if remaining > 0 {
            let mut edits: Vec<Edit> = Vec::new();
            for edit in mapping.edits.iter().rev() {
                if remaining == 0 {
                    edits.push(edit.clone());
                    continue;
                }
                if edit.to_len <= remaining {
                    remaining -= edit.to_len;
                } else {
                    let keep_to = edit.to_len - remaining;
                    if edit.is_match() {
                        edits.push(Edit::matching(keep_to));
                    } else if edit.is_sub() {
                        edits.push(Edit::substitution(&edit.sequence[..keep_to]));
                    } else {
                        edits.push(Edit::insertion(&edit.sequence[..keep_to]));
                    }
                    remaining = 0;
                }
            }
            if !edits.is_empty() {
                edits.reverse();
                out.path.mappings.insert(0, Mapping { position: mapping.position, edits });
            }
        } else {
            out.path.mappings.insert(0, mapping.clone());
        }
    }
    out
}

/// Concatenate alignments of consecutive query pieces into one alignment.
///
/// When a later piece continues on the node where the previous piece ended,
/// at exactly the following offset, its edits are folded into the preceding
/// mapping rather than opening a new one.
pub fn merge_alignments(pieces: &[Alignment]) -> Alignment {
    let mut merged = Alignment::default();
    for piece in pieces {
        merged.sequence.push_str(&piece.sequence);
        merged.quality.extend_from_slice(&piece.quality);
        for mapping in &piece.path.mappings {
            let fold = match merged.path.mappings.last() {
                Some(prev) => {
                    let prev_end = prev.position.offset + prev.from_len();
                    prev.position.node == mapping.position.node
                        && prev.position.is_reverse == mapping.position.is_reverse
                        && mapping.position.offset == prev_end
                        && mapping.position.offset > 0
                }
                None => false,
            };
            if fold {
                let prev = merged.path.mappings.last_mut().unwrap();
                prev.edits.extend(mapping.edits.iter().cloned());
            } else {
                merged.path.mappings.push(mapping.clone());
            }
        }
    }
    // coalesce runs of adjacent match edits inside each mapping
    for mapping in &mut merged.path.mappings {
        let mut edits: Vec<Edit> = Vec::with_capacity(mapping.edits.len());
        for edit in mapping.edits.drain(..) {
            match edits.last_mut() {
                Some(last) if last.is_match() && edit.is_match() => {
                    last.from_len += edit.from_len;
                    last.to_len += edit.to_len;
                }
                _ => edits.push(edit),
            }
        }
        mapping.edits = edits;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(node: NodeId, offset: usize, edits: Vec<Edit>) -> Mapping {
        Mapping { position: Pos::new(node, offset, false), edits }
    }

    #[test]
    fn pos_flip_round_trips() {
        let p = Pos::new(7, 3, false);
        let q = p.flip(10);
        assert_eq!(q, Pos::new(7, 7, true));
        assert_eq!(q.flip(10), p);
    }

    #[test]
    fn edit_kinds() {
        assert!(Edit::matching(4).is_match());
        assert!(Edit::substitution("C").is_sub());
        assert!(Edit::insertion("GG").is_insertion());
        assert!(Edit::deletion(2).is_deletion());
        assert!(!Edit::deletion(2).is_match());
    }

    #[test]
    fn identity_counts_only_matches() {
        let mut aln = Alignment::from_sequence("r", "ACGTACGT");
        aln.path.mappings.push(mapping(
            1,
            0,
            vec![Edit::matching(6), Edit::substitution("C"), Edit::matching(1)],
        ));
        assert!((aln.compute_identity() - 7.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn softclips_and_overlap() {
        let mut a = Alignment::from_sequence("a", "ACGTACGTNN");
        a.path.mappings.push(mapping(1, 0, vec![Edit::matching(8), Edit::insertion("NN")]));
        assert_eq!(softclip_start(&a), 0);
        assert_eq!(softclip_end(&a), 2);
        assert_eq!(aligned_interval(&a), (0, 8));

        let mut b = Alignment::from_sequence("b", "ACGTACGTNN");
        b.path.mappings.push(mapping(1, 2, vec![Edit::insertion("AC"), Edit::matching(8)]));
        assert_eq!(softclip_start(&b), 2);
        assert_eq!(query_overlap(&a, &b), 6);
    }

    #[test]
    fn reverse_complement_alignment_flips_positions() {
        let mut aln = Alignment::from_sequence("r", "ACGT");
        aln.path.mappings.push(mapping(1, 2, vec![Edit::matching(4)]));
        let rc = reverse_complement_alignment(&aln, |_| 10);
        assert_eq!(rc.sequence, "ACGT");
        let m = &rc.path.mappings[0];
        assert_eq!(m.position, Pos::new(1, 4, true));
        assert!(m.edits[0].is_match());
        // flipping twice restores the original
        let back = reverse_complement_alignment(&rc, |_| 10);
        assert_eq!(back.path.mappings[0].position, Pos::new(1, 2, false));
    }

    #[test]
    fn strip_start_advances_offsets() {
        let mut aln = Alignment::from_sequence("r", "ACGTAC");
        aln.path.mappings.push(mapping(1, 0, vec![Edit::matching(6)]));
        let out = strip_from_start(&aln, 2);
        assert_eq!(out.sequence, "GTAC");
        assert_eq!(out.path.mappings[0].position.offset, 2);
        assert_eq!(out.path.to_len(), 4);
    }

    #[test]
    fn strip_end_trims_edits() {
        let mut aln = Alignment::from_sequence("r", "ACGTAC");
        aln.path.mappings.push(mapping(1, 0, vec![Edit::matching(4), Edit::substitution("GG")]));
        let out = strip_from_end(&aln, 3);
        assert_eq!(out.sequence, "ACG");
        assert_eq!(out.path.mappings[0].edits.len(), 1);
        assert_eq!(out.path.to_len(), 3);
    }

    #[test]
    fn merge_folds_same_node_continuations() {
        let mut a = Alignment::from_sequence("r", "ACGT");
        a.path.mappings.push(mapping(1, 0, vec![Edit::matching(4)]));
        let mut b = Alignment::from_sequence("r", "TTTT");
        b.path.mappings.push(mapping(1, 4, vec![Edit::matching(4)]));
        let merged = merge_alignments(&[a, b]);
        assert_eq!(merged.sequence, "ACGTTTTT");
        assert_eq!(merged.path.mappings.len(), 1);
        assert_eq!(merged.path.mappings[0].edits.len(), 1);
        assert_eq!(merged.path.mappings[0].from_len(), 8);
    }
}

//! Aligner selection and canonical rescoring.
//!
//! The mapper aligns through this façade so that quality-adjusted scoring,
//! graph-size clamping, and the scoring model stay in one place. Scores on
//! returned alignments always come from [`Aligners::score_alignment`], which
//! walks the path with the configured parameters and applies the full-length
//! bonus per un-soft-clipped read end.

use log::debug;

use crate::align::dp::{AlignMode, GraphAligner, Scoring};
use crate::index::graph::{GraphIndex, Subgraph};
use crate::model::{self, Alignment};

/// The regular and quality-adjusted aligners behind one dispatch point.
#[derive(Clone, Debug)]
pub struct Aligners {
    pub scoring: Scoring,
    /// Use the quality-adjusted variant whenever the read carries qualities.
    pub adjust_for_base_quality: bool,
    /// Reject subgraphs larger than this multiple of the read length.
    pub max_query_graph_ratio: f64,
}

impl Default for Aligners {
    fn default() -> Self {
        Aligners { scoring: Scoring::default(), adjust_for_base_quality: false, max_query_graph_ratio: 128.0 }
    }
}

impl Aligners {
    pub fn new(scoring: Scoring) -> Aligners {
        Aligners { scoring, ..Default::default() }
    }

    fn quality_adjusted(&self, quality: &[u8]) -> bool {
        self.adjust_for_base_quality && !quality.is_empty()
    }

    /// Align a read against a subgraph. Returns an unmapped alignment when
    /// the subgraph is oversized for the read.
    pub fn align_to_graph(
        &self,
        base: &Alignment,
        sub: &Subgraph,
        mode: AlignMode,
        xdrop: Option<i32>,
    ) -> Alignment {
        let mut out = base.clone();
        out.clear_alignment();
        if base.sequence.is_empty() || sub.is_empty() {
            return out;
        }
        let limit = (self.max_query_graph_ratio * base.sequence.len() as f64) as usize;
        if self.max_query_graph_ratio > 0.0 && sub.total_length() > limit {
            debug!(
                "rejecting alignment attempt: subgraph of {} bp against {} bp read",
                sub.total_length(),
                base.sequence.len()
            );
            return out;
        }
        let mut engine = GraphAligner::new(&self.scoring);
        engine.quality_adjusted = self.quality_adjusted(&base.quality);
        engine.xdrop = xdrop;
        let aligned = engine.align(&base.sequence, &base.quality, sub, mode);
        out.path = aligned.path;
        out.score = aligned.score;
        out.identity = out.compute_identity();
        out
    }

    /// Align the read or its reverse complement, flipping the result back
    /// onto the forward read. The returned score is canonical.
    pub fn align_maybe_flip(
        &self,
        base: &Alignment,
        graph: &GraphIndex,
        sub: &Subgraph,
        flip: bool,
    ) -> Alignment {
        let query = if flip {
            let mut rc = base.clone();
            rc.sequence = model::reverse_complement(&base.sequence);
            if !base.quality.is_empty() {
                rc.quality = base.quality.iter().rev().copied().collect();
            }
            rc
        } else {
            base.clone()
        };
        let mut aln = self.align_to_graph(&query, sub, AlignMode::Local, None);
        if flip {
            aln = model::reverse_complement_alignment(&aln, |id| sub.node_len(id));
            aln.name = base.name.clone();
        }
        aln.score = self.score_alignment(graph, &aln);
        aln.identity = aln.compute_identity();
        aln
    }

    /// Canonical score of an alignment path: matches and mismatches at the
    /// configured values, gaps affine, jumps between mappings charged as
    /// deletions of the graph distance, terminal insertions free, and the
    /// full-length bonus added per un-soft-clipped end.
    pub fn score_alignment(&self, graph: &GraphIndex, aln: &Alignment) -> i32 {
        if aln.path.is_empty() {
            return 0;
        }
        let quality_adjusted = self.quality_adjusted(&aln.quality);
        let s = &self.scoring;
        let mut score = 0i32;
        let mut read_offset = 0usize;
        let mappings = &aln.path.mappings;
        for (i, mapping) in mappings.iter().enumerate() {
            for (j, edit) in mapping.edits.iter().enumerate() {
                if edit.is_match() {
                    if quality_adjusted {
                        for k in 0..edit.to_len {
                            let q = aln.quality.get(read_offset + k).copied().unwrap_or(0);
                            score += s.quality_match(q);
                        }
                    } else {
                        score += edit.from_len as i32 * s.match_score;
                    }
                } else if edit.is_sub() {
                    score -= s.mismatch * edit.sequence.len() as i32;
                } else if edit.is_deletion() {
                    score -= s.gap_open + edit.from_len as i32 * s.gap_extend;
                } else if edit.is_insertion() {
                    let terminal = (i == 0 && j == 0)
                        || (i == mappings.len() - 1 && j == mapping.edits.len() - 1);
                    if !terminal {
                        score -= s.gap_open + edit.to_len as i32 * s.gap_extend;
                    }
                }
                read_offset += edit.to_len;
            }
            // charge any gap to the next mapping as a deletion
            if i + 1 < mappings.len() {
                let mut last_pos = mapping.position;
                last_pos.offset += mapping.from_len();
                let next_pos = mappings[i + 1].position;
                let maximum = aln.sequence.len().max(1);
                let mut dist = graph.graph_distance(last_pos, next_pos, maximum);
                if dist == maximum {
                    dist = graph.approx_distance(last_pos, next_pos).unsigned_abs() as usize;
                }
                if dist > 0 {
                    score -= s.gap_open + dist as i32 * s.gap_extend;
                }
            }
        }
        if model::softclip_start(aln) == 0 {
            score += s.full_length_bonus;
        }
        if model::softclip_end(aln) == 0 {
            score += s.full_length_bonus;
        }
        score.max(0)
    }

    /// The canonical score with the end bonuses taken back off.
    pub fn rescore_without_full_length_bonus(&self, graph: &GraphIndex, aln: &Alignment) -> i32 {
        let mut score = self.score_alignment(graph, aln);
        if model::softclip_start(aln) == 0 {
            score -= self.scoring.full_length_bonus;
        }
        if model::softclip_end(aln) == 0 {
            score -= self.scoring.full_length_bonus;
        }
        score.max(0)
    }

    /// Sanity-check the structural invariants of an alignment against the
    /// graph; used by tests and debug assertions.
    pub fn check_alignment(&self, graph: &GraphIndex, aln: &Alignment) -> Result<(), String> {
        let to_total: usize = aln.path.to_len();
        if !aln.path.is_empty() && to_total != aln.sequence.len() {
            return Err(format!(
                "path consumes {} read bases but the read has {}",
                to_total,
                aln.sequence.len()
            ));
        }
        for mapping in &aln.path.mappings {
            let node_len = graph.node_len(mapping.position.node);
            if mapping.position.offset + mapping.from_len() > node_len {
                return Err(format!(
                    "mapping at {} runs over node of {} bp",
                    mapping.position, node_len
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::Handle;
    use crate::model::{Edit, Mapping, Pos};

    fn graph() -> GraphIndex {
        let mut g = GraphIndex::new();
        g.add_node(1, "ACGTACGT");
        g.add_walk("ref", vec![Handle::forward(1)]);
        g.finalize();
        g
    }

    fn chain() -> GraphIndex {
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

    fn subgraph_of(g: &GraphIndex) -> Subgraph {
        let mut sub = Subgraph::new();
        for id in g.node_ids() {
            sub.add_node(id, g.node_seq(id).unwrap());
        }
        for id in g.node_ids() {
            for &(a, b) in g.edges_of(id) {
                sub.add_edge(a, b);
            }
        }
        sub
    }

    #[test]
    fn perfect_match_gets_both_bonuses() {
        let g = graph();
        let aligners = Aligners::default();
        let aln = aligners.align_maybe_flip(
            &Alignment::from_sequence("r", "ACGT"),
            &g,
            &subgraph_of(&g),
            false,
        );
        assert_eq!(aln.score, 4 + 2 * 5);
        assert!((aln.identity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn soft_clip_drops_one_bonus() {
        let g = graph();
        let aligners = Aligners::default();
        let aln = aligners.align_maybe_flip(
            &Alignment::from_sequence("r", "ACGTACGTNN"),
            &g,
            &subgraph_of(&g),
            false,
        );
        assert_eq!(aln.score, 8 + 5);
        assert!((aln.identity - 0.8).abs() < 1e-9);
    }

    #[test]
    fn jump_scored_as_deletion() {
        let g = chain();
        let aligners = Aligners::default();
        let mut aln = Alignment::from_sequence("r", "ACGTTTTT");
        aln.path.mappings.push(Mapping {
            position: Pos::new(1, 0, false),
            edits: vec![Edit::matching(4)],
        });
        aln.path.mappings.push(Mapping {
            position: Pos::new(3, 0, false),
            edits: vec![Edit::matching(4)],
        });
        // 8 matches + 2 bonuses - a 4 bp jump over node 2
        assert_eq!(aligners.score_alignment(&g, &aln), 8 + 10 - (6 + 4));
    }

    #[test]
    fn reverse_strand_scores_match_forward() {
        let g = graph();
        let aligners = Aligners::default();
        let sub = subgraph_of(&g);
        let fwd = aligners.align_maybe_flip(&Alignment::from_sequence("r", "ACGTACGT"), &g, &sub, false);
        let rev = aligners.align_maybe_flip(&Alignment::from_sequence("r", "ACGTACGT"), &g, &sub, true);
        assert_eq!(fwd.score, rev.score);
        assert!((fwd.identity - rev.identity).abs() < 1e-9);
    }

    #[test]
    fn oversized_subgraph_rejected() {
        let g = graph();
        let mut aligners = Aligners::default();
        aligners.max_query_graph_ratio = 1.0;
        let aln = aligners.align_to_graph(
            &Alignment::from_sequence("r", "ACG"),
            &subgraph_of(&g),
            AlignMode::Local,
            None,
        );
        assert!(!aln.is_mapped());
    }

    #[test]
    fn check_alignment_catches_overruns() {
        let g = graph();
        let aligners = Aligners::default();
        let mut aln = Alignment::from_sequence("r", "ACGT");
        aln.path.mappings.push(Mapping {
            position: Pos::new(1, 6, false),
            edits: vec![Edit::matching(4)],
        });
        assert!(aligners.check_alignment(&g, &aln).is_err());
    }
}

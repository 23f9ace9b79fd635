//! Affine-gap dynamic programming over a DAG-ordered subgraph.
//!
//! The matrix is laid out per node, with a boundary column that merges the
//! final columns of all forward-edge predecessors. Local, pinned-left, and
//! global modes share one fill; pinned mode supports X-drop pruning for
//! tail alignment.

use crate::index::graph::Subgraph;
use crate::model::{Alignment, Edit, Mapping, NodeId, Pos};

const NEG: i32 = i32::MIN / 4;

/// Alignment scoring parameters. Penalties are stored positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scoring {
    pub match_score: i32,
    pub mismatch: i32,
    pub gap_open: i32,
    pub gap_extend: i32,
    pub full_length_bonus: i32,
}

impl Default for Scoring {
    fn default() -> Self {
        Scoring { match_score: 1, mismatch: 4, gap_open: 6, gap_extend: 1, full_length_bonus: 5 }
    }
}

impl Scoring {
    /// The longest deletion that could still improve on a perfect match of
    /// `tail_len` bases within a read of `read_len` bases.
    pub fn longest_detectable_gap(&self, tail_len: usize, read_len: usize) -> usize {
        let budget = (read_len as i32 * self.match_score - self.gap_open).max(0);
        let by_score = (budget / self.gap_extend.max(1) + 1) as usize;
        by_score.min(read_len + tail_len)
    }

    /// Match reward for a base with phred quality `q`; low-quality bases are
    /// worth proportionally less.
    pub fn quality_match(&self, q: u8) -> i32 {
        let p_correct = 1.0 - 10f64.powf(-(q as f64) / 10.0);
        ((self.match_score as f64) * p_correct).round() as i32
    }

    /// Mismatch penalty for a base with phred quality `q`.
    pub fn quality_mismatch(&self, q: u8) -> i32 {
        let p_correct = 1.0 - 10f64.powf(-(q as f64) / 10.0);
        ((self.mismatch as f64) * p_correct).round() as i32
    }
}

/// How the DP is anchored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignMode {
    /// Best-scoring run anywhere; unaligned read ends are free.
    Local,
    /// The first read base is anchored to the start of the given node.
    PinnedLeft { root: NodeId },
    /// The whole read is aligned, optionally within a diagonal band.
    Global { band: Option<usize> },
}

/// DP engine over a subgraph. One instance per call site; holds no state
/// between alignments.
pub struct GraphAligner<'a> {
    pub scoring: &'a Scoring,
    pub quality_adjusted: bool,
    /// Prune pinned-mode cells scoring below `best - xdrop`.
    pub xdrop: Option<i32>,
}

// per-node DP storage
struct NodeMat {
    len: usize,
    h: Vec<i32>,
    e: Vec<i32>,
    f: Vec<i32>,
    dir: Vec<u8>,
    // boundary provenance, one entry per read row: order index of the
    // predecessor that fed H / E / F, or -1 for a start cell
    hpred: Vec<i32>,
    epred: Vec<i32>,
    fpred: Vec<i32>,
    // boundary H source: 0 = start, 1 = predecessor, 2 = boundary insertion
    bdir: Vec<u8>,
    // boundary F source: 0 = predecessor, 1 = open, 2 = extend
    bfdir: Vec<u8>,
    // min graph offset from a source node, for banding
    graph_offset: usize,
}

const H_STOP: u8 = 0;
const H_DIAG: u8 = 1;
const H_FROM_E: u8 = 2;
const H_FROM_F: u8 = 3;
const E_EXTEND: u8 = 1 << 2;
const F_EXTEND: u8 = 1 << 3;

impl<'a> GraphAligner<'a> {
    pub fn new(scoring: &'a Scoring) -> GraphAligner<'a> {
        GraphAligner { scoring, quality_adjusted: false, xdrop: None }
    }

    fn substitution_score(&self, graph_base: u8, read_base: u8, quality: Option<u8>) -> i32 {
        let matches = graph_base == read_base && graph_base != b'N';
        match (matches, self.quality_adjusted, quality) {
            (true, true, Some(q)) => self.scoring.quality_match(q),
            (true, _, _) => self.scoring.match_score,
            (false, true, Some(q)) => -self.scoring.quality_mismatch(q),
            (false, _, _) => -self.scoring.mismatch,
        }
    }

    /// Align `read` against the subgraph; returns an alignment whose path is
    /// in base-graph coordinates (forward strand). An empty path means
    /// nothing scored above zero.
    pub fn align(&self, read: &str, quality: &[u8], sub: &Subgraph, mode: AlignMode) -> Alignment {
        let mut out = Alignment::from_sequence("", read);
        out.quality = quality.to_vec();
        if read.is_empty() || sub.is_empty() {
            return out;
        }
        let order = sub.topological_order();
        let order_index: std::collections::HashMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let read_bytes = read.as_bytes();
        let m = read_bytes.len();
        let go = self.scoring.gap_open;
        let ge = self.scoring.gap_extend;
        let local = matches!(mode, AlignMode::Local);
        let band = match mode {
            AlignMode::Global { band } => band,
            _ => None,
        };

        let mut mats: Vec<NodeMat> = Vec::with_capacity(order.len());
        let mut best = NEG;
        let mut best_cell = (0usize, 0usize, 0usize); // (order idx, g, r)

        for (oi, &id) in order.iter().enumerate() {
            let seq = sub.nodes.get(&id).cloned().unwrap_or_default();
            let len = seq.len();
            let seq = seq.as_bytes();
            let preds: Vec<usize> = sub
                .forward_predecessors(id)
                .into_iter()
                .filter_map(|p| order_index.get(&p).copied())
                .filter(|&p| p < oi)
                .collect();
            let graph_offset = preds
                .iter()
                .map(|&p| mats[p].graph_offset + mats[p].len)
                .min()
                .unwrap_or(0);

            let cols = len + 1;
            let mut mat = NodeMat {
                len,
                h: vec![NEG; cols * (m + 1)],
                e: vec![NEG; cols * (m + 1)],
                f: vec![NEG; cols * (m + 1)],
                dir: vec![0; cols * (m + 1)],
                hpred: vec![-1; m + 1],
                epred: vec![-1; m + 1],
                fpred: vec![-1; m + 1],
                bdir: vec![H_STOP; m + 1],
                bfdir: vec![0; m + 1],
                graph_offset,
            };
            let idx = |g: usize, r: usize| g * (m + 1) + r;

            // boundary column: merge predecessors, then allow starts
            for r in 0..=m {
                let mut h0 = NEG;
                let mut e0 = NEG;
                let mut f0 = NEG;
                for &p in &preds {
                    let pm = &mats[p];
                    let pidx = pm.len * (m + 1) + r;
                    if pm.h[pidx] > h0 {
                        h0 = pm.h[pidx];
                        mat.hpred[r] = p as i32;
                        mat.bdir[r] = 1;
                    }
                    if pm.e[pidx] > e0 {
                        e0 = pm.e[pidx];
                        mat.epred[r] = p as i32;
                    }
                    if pm.f[pidx] > f0 {
                        f0 = pm.f[pidx];
                        mat.fpred[r] = p as i32;
                    }
                }
                // boundary insertions
                if r > 0 {
                    let open = mat.h[idx(0, r - 1)].saturating_sub(go + ge).max(NEG);
                    let extend = mat.f[idx(0, r - 1)].saturating_sub(ge).max(NEG);
                    if open > f0 || extend > f0 {
                        if extend >= open {
                            f0 = extend;
                            mat.bfdir[r] = 2;
                        } else {
                            f0 = open;
                            mat.bfdir[r] = 1;
                        }
                        mat.fpred[r] = -1;
                    }
                }
                if f0 > h0 {
                    h0 = f0;
                    mat.bdir[r] = 2;
                }
                // starts; in local mode a start at the first read base
                // carries the full-length bonus
                match mode {
                    AlignMode::Local => {
                        let floor = if r == 0 { self.scoring.full_length_bonus } else { 0 };
                        if h0 < floor {
                            h0 = floor;
                            mat.bdir[r] = H_STOP;
                        }
                    }
                    AlignMode::PinnedLeft { root } => {
                        if id == root && r == 0 && h0 < 0 {
                            h0 = 0;
                            mat.bdir[r] = H_STOP;
                        }
                    }
                    AlignMode::Global { .. } => {
                        if preds.is_empty() && r == 0 && h0 < 0 {
                            h0 = 0;
                            mat.bdir[r] = H_STOP;
                        }
                    }
                }
                mat.h[idx(0, r)] = h0;
                mat.e[idx(0, r)] = e0;
                mat.f[idx(0, r)] = f0;
            }

            for g in 1..=len {
                for r in 0..=m {
                    if let Some(b) = band {
                        let diag = graph_offset + g;
                        if diag.abs_diff(r) > b {
                            continue;
                        }
                    }
                    let mut dir = 0u8;
                    // deletion: consume a graph base
                    let e_open = mat.h[idx(g - 1, r)].saturating_sub(go + ge).max(NEG);
                    let e_extend = mat.e[idx(g - 1, r)].saturating_sub(ge).max(NEG);
                    let e = if e_extend > e_open {
                        dir |= E_EXTEND;
                        e_extend
                    } else {
                        e_open
                    };
                    // insertion: consume a read base
                    let f = if r > 0 {
                        let f_open = mat.h[idx(g, r - 1)].saturating_sub(go + ge).max(NEG);
                        let f_extend = mat.f[idx(g, r - 1)].saturating_sub(ge).max(NEG);
                        if f_extend > f_open {
                            dir |= F_EXTEND;
                            f_extend
                        } else {
                            f_open
                        }
                    } else {
                        NEG
                    };
                    let diag = if r > 0 {
                        let prev = mat.h[idx(g - 1, r - 1)];
                        if prev <= NEG / 2 {
                            NEG
                        } else {
                            let q = quality.get(r - 1).copied();
                            let mut step = self.substitution_score(seq[g - 1], read_bytes[r - 1], q);
                            if local && r == m {
                                // reaching the final read base un-clipped
                                step += self.scoring.full_length_bonus;
                            }
                            prev + step
                        }
                    } else {
                        NEG
                    };
                    let mut h = NEG;
                    let mut hsrc = H_STOP;
                    if diag > h {
                        h = diag;
                        hsrc = H_DIAG;
                    }
                    if e > h {
                        h = e;
                        hsrc = H_FROM_E;
                    }
                    if f > h {
                        h = f;
                        hsrc = H_FROM_F;
                    }
                    if local {
                        let floor = if r == 0 { self.scoring.full_length_bonus } else { 0 };
                        if h < floor {
                            h = floor;
                            hsrc = H_STOP;
                        }
                    }
                    if let Some(x) = self.xdrop {
                        if best > NEG && h < best - x {
                            h = NEG;
                            hsrc = H_STOP;
                        }
                    }
                    mat.e[idx(g, r)] = e;
                    mat.f[idx(g, r)] = f;
                    mat.h[idx(g, r)] = h;
                    mat.dir[idx(g, r)] = hsrc | dir;
                    let end_ok = match mode {
                        // a local end must consume at least one read base
                        AlignMode::Local => r > 0,
                        AlignMode::PinnedLeft { .. } => true,
                        AlignMode::Global { .. } => r == m,
                    };
                    if end_ok && h > best {
                        best = h;
                        best_cell = (oi, g, r);
                    }
                }
            }
            mats.push(mat);
        }

        if best <= 0 {
            return out;
        }

        // traceback
        #[derive(Clone, Copy, PartialEq)]
        enum St {
            H,
            E,
            F,
        }
        #[derive(Clone, Copy)]
        enum Op {
            Diag,
            Del,
            Ins,
        }
        let (mut oi, mut g, mut r) = best_cell;
        let r_end = r;
        let mut ops: Vec<(usize, Op)> = Vec::new(); // (order idx, op)
        let mut state = St::H;
        loop {
            let mat = &mats[oi];
            let idx = |g: usize, r: usize| g * (m + 1) + r;
            if g == 0 {
                // boundary handling
                match state {
                    St::H => match mat.bdir[r] {
                        0 => break, // start
                        1 => {
                            let p = mat.hpred[r] as usize;
                            oi = p;
                            g = mats[p].len;
                            continue;
                        }
                        _ => {
                            state = St::F;
                            continue;
                        }
                    },
                    St::E => {
                        let p = mat.epred[r] as usize;
                        oi = p;
                        g = mats[p].len;
                        continue;
                    }
                    St::F => match mat.bfdir[r] {
                        0 => {
                            let p = mat.fpred[r] as usize;
                            oi = p;
                            g = mats[p].len;
                            continue;
                        }
                        1 => {
                            ops.push((oi, Op::Ins));
                            r -= 1;
                            state = St::H;
                            continue;
                        }
                        _ => {
                            ops.push((oi, Op::Ins));
                            r -= 1;
                            continue;
                        }
                    },
                }
            }
            let dir = mat.dir[idx(g, r)];
            match state {
                St::H => match dir & 0b11 {
                    H_DIAG => {
                        ops.push((oi, Op::Diag));
                        g -= 1;
                        r -= 1;
                    }
                    H_FROM_E => state = St::E,
                    H_FROM_F => state = St::F,
                    _ => break, // local start
                },
                St::E => {
                    ops.push((oi, Op::Del));
                    let extend = dir & E_EXTEND != 0;
                    g -= 1;
                    if !extend {
                        state = St::H;
                    }
                }
                St::F => {
                    ops.push((oi, Op::Ins));
                    let extend = dir & F_EXTEND != 0;
                    r -= 1;
                    if !extend {
                        state = St::H;
                    }
                }
            }
        }
        ops.reverse();
        let r_start = r;
        let g_start = g;
        let oi_start = oi;

        // assemble mappings
        let mut mappings: Vec<Mapping> = Vec::new();
        let mut read_at = r_start;
        let mut node_at: Option<(usize, usize)> = None; // (order idx, graph offset within node)
        let push_mapping = |mappings: &mut Vec<Mapping>, oi: usize, offset: usize| {
            mappings.push(Mapping {
                position: Pos::new(order[oi], offset, false),
                edits: Vec::new(),
            });
        };
        if !ops.is_empty() {
            push_mapping(&mut mappings, oi_start, g_start);
            node_at = Some((oi_start, g_start));
        }
        if r_start > 0 {
            // leading soft clip
            if let Some(first) = mappings.first_mut() {
                first.edits.push(Edit::insertion(&read[..r_start]));
            }
        }
        for &(op_oi, op) in &ops {
            match node_at {
                Some((cur, _)) if cur == op_oi => {}
                _ => {
                    push_mapping(&mut mappings, op_oi, 0);
                    node_at = Some((op_oi, 0));
                }
            }
            let mapping = mappings.last_mut().unwrap();
            let node_seq = sub.nodes.get(&order[op_oi]).map(|s| s.as_bytes()).unwrap_or(&[]);
            let (_, off) = node_at.unwrap();
            match op {
                Op::Diag => {
                    let graph_base = node_seq[off];
                    let read_base = read_bytes[read_at];
                    if graph_base == read_base && graph_base != b'N' {
                        match mapping.edits.last_mut() {
                            Some(e) if e.is_match() => {
                                e.from_len += 1;
                                e.to_len += 1;
                            }
                            _ => mapping.edits.push(Edit::matching(1)),
                        }
                    } else {
                        let ch = read_base as char;
                        match mapping.edits.last_mut() {
                            Some(e) if e.is_sub() => {
                                e.from_len += 1;
                                e.to_len += 1;
                                e.sequence.push(ch);
                            }
                            _ => mapping.edits.push(Edit::substitution(&ch.to_string())),
                        }
                    }
                    node_at = Some((op_oi, off + 1));
                    read_at += 1;
                }
                Op::Del => {
                    match mapping.edits.last_mut() {
                        Some(e) if e.is_deletion() => e.from_len += 1,
                        _ => mapping.edits.push(Edit::deletion(1)),
                    }
                    node_at = Some((op_oi, off + 1));
                }
                Op::Ins => {
                    let ch = read_bytes[read_at] as char;
                    match mapping.edits.last_mut() {
                        Some(e) if e.is_insertion() => {
                            e.to_len += 1;
                            e.sequence.push(ch);
                        }
                        _ => mapping.edits.push(Edit::insertion(&ch.to_string())),
                    }
                    read_at += 1;
                }
            }
        }
        if r_end < m {
            // trailing soft clip
            if let Some(last) = mappings.last_mut() {
                last.edits.push(Edit::insertion(&read[r_end..]));
            }
        }
        out.path.mappings = mappings;
        out.score = best;
        out.identity = out.compute_identity();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::{Handle, Subgraph};

    fn single(seq: &str) -> Subgraph {
        let mut sub = Subgraph::new();
        sub.add_node(1, seq);
        sub
    }

    fn chain() -> Subgraph {
        let mut sub = Subgraph::new();
        sub.add_node(1, "ACGT");
        sub.add_node(2, "GGGG");
        sub.add_node(3, "TTTT");
        sub.add_edge(Handle::forward(1), Handle::forward(2));
        sub.add_edge(Handle::forward(2), Handle::forward(3));
        sub
    }

    #[test]
    fn exact_local_match() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("ACGT", &[], &single("ACGTACGT"), AlignMode::Local);
        assert_eq!(aln.score, 4 + 10);
        assert_eq!(aln.path.mappings.len(), 1);
        let mapping = &aln.path.mappings[0];
        assert_eq!(mapping.position, Pos::new(1, 0, false));
        assert_eq!(mapping.edits, vec![Edit::matching(4)]);
    }

    #[test]
    fn crosses_node_boundaries() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("ACGTGGGGTTTT", &[], &chain(), AlignMode::Local);
        assert_eq!(aln.score, 12 + 10);
        assert_eq!(aln.path.mappings.len(), 3);
        for mapping in &aln.path.mappings {
            assert_eq!(mapping.edits, vec![Edit::matching(4)]);
        }
        assert_eq!(aln.path.mappings[0].position, Pos::new(1, 0, false));
        assert_eq!(aln.path.mappings[1].position, Pos::new(2, 0, false));
    }

    #[test]
    fn substitution_in_the_middle() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("ACGTACCT", &[], &single("ACGTACGT"), AlignMode::Local);
        assert_eq!(aln.score, 7 - 4 + 10);
        let edits = &aln.path.mappings[0].edits;
        assert_eq!(
            edits,
            &vec![Edit::matching(6), Edit::substitution("C"), Edit::matching(1)]
        );
        assert!((aln.identity - 7.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn trailing_bases_soft_clip() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("ACGTACGTNN", &[], &single("ACGTACGT"), AlignMode::Local);
        assert_eq!(aln.score, 8 + 5);
        let edits = &aln.path.mappings[0].edits;
        assert_eq!(edits.len(), 2);
        assert!(edits[0].is_match());
        assert!(edits[1].is_insertion());
        assert_eq!(edits[1].to_len, 2);
        assert!((aln.identity - 0.8).abs() < 1e-9);
    }

    #[test]
    fn deletion_spans_missing_base() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        // target has a T between the arms that the read lacks; both arms are
        // long enough that paying the gap beats clipping one off
        let target = "ATCGGATTACAGTCCATGGTTCAGA";
        let read = "ATCGGATTACAGCCATGGTTCAGA";
        let aln = aligner.align(read, &[], &single(target), AlignMode::Local);
        assert_eq!(aln.score, 24 - (6 + 1) + 10);
        assert_eq!(aln.path.from_len(), 25);
        let dels: usize = aln
            .path
            .mappings
            .iter()
            .flat_map(|m| m.edits.iter())
            .filter(|e| e.is_deletion())
            .map(|e| e.from_len)
            .sum();
        assert_eq!(dels, 1);
    }

    #[test]
    fn insertion_in_read() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let target = "ATCGGATTACAGCCATGGTTCAGA";
        let read = "ATCGGATTACAGTCCATGGTTCAGA";
        let aln = aligner.align(read, &[], &single(target), AlignMode::Local);
        assert_eq!(aln.score, 24 - (6 + 1) + 10);
        let ins: usize = aln
            .path
            .mappings
            .iter()
            .flat_map(|m| m.edits.iter())
            .filter(|e| e.is_insertion())
            .map(|e| e.to_len)
            .sum();
        assert_eq!(ins, 1);
        assert_eq!(aln.path.to_len(), 25);
    }

    #[test]
    fn pinned_left_anchors_the_start() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("GTAC", &[], &single("ACGTACGT"), AlignMode::PinnedLeft { root: 1 });
        // forced to start at node offset 0, so the best is a clipped or
        // mismatched prefix rather than the interior exact match
        assert!(aln.score < 4);
    }

    #[test]
    fn pinned_partial_tail() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("GGGGAA", &[], &single("GGGG"), AlignMode::PinnedLeft { root: 1 });
        assert_eq!(aln.score, 4);
        let edits = &aln.path.mappings[0].edits;
        assert!(edits[0].is_match());
        assert!(edits.last().unwrap().is_insertion());
        assert_eq!(edits.last().unwrap().to_len, 2);
    }

    #[test]
    fn global_aligns_whole_read() {
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("ACGTGGGGTTTT", &[], &chain(), AlignMode::Global { band: Some(16) });
        assert_eq!(aln.score, 12);
        assert_eq!(aln.path.to_len(), 12);
    }

    #[test]
    fn quality_adjusted_discounts_low_quality() {
        let scoring = Scoring::default();
        let mut aligner = GraphAligner::new(&scoring);
        aligner.quality_adjusted = true;
        let high = aligner.align("ACGT", &[40, 40, 40, 40], &single("ACGTACGT"), AlignMode::Local);
        let low = aligner.align("ACGT", &[2, 2, 2, 2], &single("ACGTACGT"), AlignMode::Local);
        assert!(high.score > low.score);
        assert_eq!(high.score, 4 + 10);
    }

    #[test]
    fn branching_graph_picks_matching_allele() {
        let mut sub = Subgraph::new();
        sub.add_node(1, "ACGT");
        sub.add_node(2, "C");
        sub.add_node(3, "T");
        sub.add_node(4, "ACGT");
        sub.add_edge(Handle::forward(1), Handle::forward(2));
        sub.add_edge(Handle::forward(1), Handle::forward(3));
        sub.add_edge(Handle::forward(2), Handle::forward(4));
        sub.add_edge(Handle::forward(3), Handle::forward(4));
        let scoring = Scoring::default();
        let aligner = GraphAligner::new(&scoring);
        let aln = aligner.align("ACGTTACGT", &[], &sub, AlignMode::Local);
        assert_eq!(aln.score, 9 + 10);
        let through: Vec<NodeId> = aln.path.mappings.iter().map(|m| m.position.node).collect();
        assert_eq!(through, vec![1, 3, 4]);
    }
}

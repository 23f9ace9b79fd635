//! A chain model over seed instances.
//!
//! Every (MEM, graph position) pair becomes a vertex. Vertices near one
//! another in approximate linear coordinates are wired with transition
//! weights, the model is relaxed like a DAG, and repeated traceback with
//! edge masking yields the top-K non-overlapping chains.

use std::collections::{BTreeMap, HashSet};

use log::trace;

use crate::index::graph::GraphIndex;
use crate::seed::finder::Mem;

#[derive(Clone, Debug)]
pub struct ChainVertex {
    pub mem: Mem,
    pub weight: f64,
    pub score: f64,
    pub prev: Option<usize>,
    pub approx_position: i64,
    // (partner, weight); a masked edge has its partner cleared
    next_cost: Vec<(Option<usize>, f64)>,
    prev_cost: Vec<(Option<usize>, f64)>,
}

pub struct ChainModel {
    pub verts: Vec<ChainVertex>,
    redundant: HashSet<usize>,
}

impl ChainModel {
    /// Build the model over one or two fragments of seeds.
    ///
    /// `transition` scores an ordered pair of single-position MEMs and
    /// returns `f64::NEG_INFINITY` for a forbidden transition.
    pub fn new<F>(
        fragments: &[Vec<Mem>],
        graph: &GraphIndex,
        transition: F,
        band_width: i64,
        position_depth: usize,
        max_connections: usize,
    ) -> ChainModel
    where
        F: Fn(&Mem, &Mem) -> f64,
    {
        let mut verts: Vec<ChainVertex> = Vec::new();
        for (frag_idx, fragment) in fragments.iter().enumerate() {
            for mem in fragment {
                for &pos in &mem.positions {
                    let mut single = mem.clone();
                    single.positions = vec![pos];
                    single.fragment = frag_idx as u8 + 1;
                    verts.push(ChainVertex {
                        weight: single.len() as f64,
                        score: 0.0,
                        prev: None,
                        approx_position: graph.approx_position(pos),
                        mem: single,
                        next_cost: Vec::new(),
                        prev_cost: Vec::new(),
                    });
                }
            }
        }

        // bucket by approximate position, keeping the most specific hits;
        // hits trimmed by the depth cap leave the model entirely
        let mut redundant: HashSet<usize> = HashSet::new();
        let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, v) in verts.iter().enumerate() {
            buckets.entry(v.approx_position).or_default().push(i);
        }
        for bucket in buckets.values_mut() {
            bucket.sort_by_key(|&i| verts[i].mem.match_count);
            for &dropped in bucket.iter().skip(position_depth) {
                redundant.insert(dropped);
            }
            bucket.truncate(position_depth);
        }

        // redundancy: a vertex extended by another on the same read/graph
        // diagonal is merged into it
        let positions: Vec<i64> = buckets.keys().copied().collect();
        // forward pass
        for (pi, &p) in positions.iter().enumerate() {
            for &i in &buckets[&p] {
                if redundant.contains(&i) {
                    continue;
                }
                for &q in positions[pi + 1..].iter().take_while(|&&q| q - p < band_width) {
                    for &j in &buckets[&q] {
                        if i == j || redundant.contains(&j) {
                            continue;
                        }
                        let (vi_begin, vi_end, vi_frag) =
                            (verts[i].mem.begin, verts[i].mem.end, verts[i].mem.fragment);
                        let (vj_begin, vj_end, vj_frag) =
                            (verts[j].mem.begin, verts[j].mem.end, verts[j].mem.fragment);
                        let overlaps = vi_frag == vj_frag
                            && !(vi_end <= vj_begin || vj_end <= vi_begin);
                        if overlaps
                            && vj_begin >= vi_begin
                            && (vj_begin - vi_begin) as i64 == q - p
                        {
                            verts[i].mem.end = vj_end.max(vi_end);
                            verts[i].weight = verts[i].mem.len() as f64;
                            redundant.insert(j);
                        }
                    }
                }
            }
        }
        // reverse pass: absorb into the leftward vertex any pair the forward
        // ordering missed
        for (pi, &p) in positions.iter().enumerate().rev() {
            for &i in &buckets[&p] {
                if redundant.contains(&i) {
                    continue;
                }
                for &q in positions[..pi].iter().rev().take_while(|&&q| p - q < band_width) {
                    for &j in &buckets[&q] {
                        if i == j || redundant.contains(&j) {
                            continue;
                        }
                        let (vi_begin, vi_end, vi_frag) =
                            (verts[i].mem.begin, verts[i].mem.end, verts[i].mem.fragment);
                        let (vj_begin, vj_end, vj_frag) =
                            (verts[j].mem.begin, verts[j].mem.end, verts[j].mem.fragment);
                        let overlaps = vi_frag == vj_frag
                            && !(vi_end <= vj_begin || vj_end <= vi_begin);
                        if overlaps
                            && vi_begin >= vj_begin
                            && (vi_begin - vj_begin) as i64 == p - q
                        {
                            verts[j].mem.end = vi_end.max(vj_end);
                            verts[j].weight = verts[j].mem.len() as f64;
                            redundant.insert(i);
                        }
                    }
                }
            }
        }

        // wire transitions within the positional band
        for (pi, &p) in positions.iter().enumerate() {
            let from_bucket = buckets[&p].clone();
            for &i in &from_bucket {
                if redundant.contains(&i) {
                    continue;
                }
                for &q in positions[pi + 1..].iter().take_while(|&&q| q - p < band_width) {
                    let to_bucket = buckets[&q].clone();
                    for &j in &to_bucket {
                        if redundant.contains(&j) {
                            continue;
                        }
                        if verts[i].next_cost.len() >= max_connections
                            || verts[j].prev_cost.len() >= max_connections
                        {
                            continue;
                        }
                        let (vi, vj) = (&verts[i].mem, &verts[j].mem);
                        if vi.fragment < vj.fragment
                            || (vi.fragment == vj.fragment && vi.begin < vj.begin)
                        {
                            let weight = transition(vi, vj);
                            if weight > f64::NEG_INFINITY {
                                verts[i].next_cost.push((Some(j), weight));
                                verts[j].prev_cost.push((Some(i), weight));
                            }
                        } else if vi.fragment > vj.fragment
                            || (vi.fragment == vj.fragment && vi.begin > vj.begin)
                        {
                            let weight = transition(vj, vi);
                            if weight > f64::NEG_INFINITY {
                                verts[j].next_cost.push((Some(i), weight));
                                verts[i].prev_cost.push((Some(j), weight));
                            }
                        }
                    }
                }
            }
        }

        trace!(
            "chain model: {} vertices, {} redundant",
            verts.len(),
            redundant.len()
        );
        ChainModel { verts, redundant }
    }

    fn clear_scores(&mut self) {
        for v in &mut self.verts {
            v.score = 0.0;
            v.prev = None;
        }
    }

    fn score(&mut self, exclude: &HashSet<usize>) {
        for i in 0..self.verts.len() {
            if exclude.contains(&i) || self.redundant.contains(&i) {
                continue;
            }
            let weight = self.verts[i].weight;
            let mut best = weight;
            let mut best_prev = None;
            for &(partner, edge_weight) in &self.verts[i].prev_cost {
                let p = match partner {
                    Some(p) => p,
                    None => continue, // masked out
                };
                if exclude.contains(&p) || self.redundant.contains(&p) {
                    continue;
                }
                let proposal = weight + edge_weight + self.verts[p].score;
                if proposal > best {
                    best = proposal;
                    best_prev = Some(p);
                }
            }
            self.verts[i].score = best;
            self.verts[i].prev = best_prev;
        }
    }

    fn max_vertex(&self, exclude: &HashSet<usize>) -> Option<usize> {
        let mut best: Option<usize> = None;
        for i in 0..self.verts.len() {
            if exclude.contains(&i) || self.redundant.contains(&i) {
                continue;
            }
            if best.map(|b| self.verts[i].score > self.verts[b].score).unwrap_or(true) {
                best = Some(i);
            }
        }
        best
    }

    /// Trace out up to `alt_alns` chains in strictly descending score order,
    /// masking consumed edges between iterations. Paired mode refuses
    /// singleton traces and also masks cross-fragment edges that touch the
    /// emitted chain.
    pub fn traceback(&mut self, alt_alns: usize, paired: bool) -> Vec<Vec<Mem>> {
        let mut traces: Vec<Vec<Mem>> = Vec::new();
        let mut exclude: HashSet<usize> = HashSet::new();
        for _ in 0..alt_alns {
            self.clear_scores();
            self.score(&exclude);
            let vertex = match self.max_vertex(&exclude) {
                Some(v) if self.verts[v].score > 0.0 => v,
                _ => break,
            };
            let mut vertex_trace = vec![vertex];
            while let Some(prev) = self.verts[*vertex_trace.last().unwrap()].prev {
                vertex_trace.push(prev);
            }
            if paired && vertex_trace.len() == 1 {
                exclude.insert(vertex_trace[0]);
                continue;
            }
            let chain_members: HashSet<usize> = if paired {
                vertex_trace.iter().copied().collect()
            } else {
                HashSet::new()
            };
            vertex_trace.reverse(); // now in read order
            let mut mem_trace = Vec::with_capacity(vertex_trace.len());
            for (ti, &vi) in vertex_trace.iter().enumerate() {
                if !paired {
                    exclude.insert(vi);
                }
                if ti > 0 {
                    let prev_vertex = vertex_trace[ti - 1];
                    let fragment = self.verts[vi].mem.fragment;
                    let masks: Vec<usize> = self.verts[vi]
                        .prev_cost
                        .iter()
                        .enumerate()
                        .filter_map(|(ei, &(partner, _))| {
                            let p = partner?;
                            let used = p == prev_vertex;
                            let cross = paired
                                && self.verts[p].mem.fragment != fragment
                                && chain_members.contains(&p);
                            (used || cross).then_some(ei)
                        })
                        .collect();
                    for ei in masks {
                        self.verts[vi].prev_cost[ei].0 = None;
                    }
                }
                mem_trace.push(self.verts[vi].mem.clone());
            }
            traces.push(mem_trace);
        }
        traces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::fm::SaRange;
    use crate::index::graph::{GraphIndex, Handle};
    use crate::model::Pos;

    fn graph(len: usize) -> GraphIndex {
        let mut g = GraphIndex::new();
        let mut handles = Vec::new();
        for i in 0..len {
            g.add_node(i as i64 + 1, "ACGTACGTAC");
            handles.push(Handle::forward(i as i64 + 1));
            if i > 0 {
                g.add_edge(Handle::forward(i as i64), Handle::forward(i as i64 + 1));
            }
        }
        g.add_walk("ref", handles);
        g.finalize();
        g
    }

    fn mem(begin: usize, end: usize, positions: &[Pos], count: usize) -> Mem {
        Mem {
            begin,
            end,
            range: SaRange::empty(),
            positions: positions.to_vec(),
            match_count: count,
            fragment: 0,
            parents: Vec::new(),
        }
    }

    fn simple_transition(a: &Mem, b: &Mem) -> f64 {
        // reward read-colinear pairs, forbid others
        if b.begin >= a.begin { (a.len() + b.len()) as f64 } else { f64::NEG_INFINITY }
    }

    #[test]
    fn chains_colinear_seeds() {
        let g = graph(4);
        let mems = vec![
            mem(0, 10, &[Pos::new(1, 0, false)], 1),
            mem(10, 20, &[Pos::new(2, 0, false)], 1),
            mem(20, 30, &[Pos::new(3, 0, false)], 1),
        ];
        let mut model = ChainModel::new(&[mems], &g, simple_transition, 100, 16, 8);
        let traces = model.traceback(2, false);
        assert!(!traces.is_empty());
        assert_eq!(traces[0].len(), 3);
        // read order within the chain
        assert!(traces[0].windows(2).all(|w| w[0].begin <= w[1].begin));
    }

    #[test]
    fn traceback_scores_descend_and_edges_burn() {
        let g = graph(4);
        // two competing placements for the same read interval
        let mems = vec![mem(0, 10, &[Pos::new(1, 0, false), Pos::new(3, 0, false)], 2)];
        let mut model = ChainModel::new(&[mems], &g, simple_transition, 5, 16, 8);
        let traces = model.traceback(4, false);
        assert_eq!(traces.len(), 2);
        // each trace uses a distinct vertex
        let p0 = traces[0][0].positions[0];
        let p1 = traces[1][0].positions[0];
        assert_ne!(p0, p1);
    }

    #[test]
    fn position_depth_caps_buckets() {
        let g = graph(1);
        // many hits at the same approximate position; only the most specific
        // should survive
        let mems = vec![
            mem(0, 10, &[Pos::new(1, 0, false)], 5),
            mem(0, 8, &[Pos::new(1, 0, false)], 1),
        ];
        let mut model = ChainModel::new(&[mems], &g, simple_transition, 5, 1, 8);
        let traces = model.traceback(4, false);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0][0].match_count, 1);
    }

    #[test]
    fn redundant_diagonal_vertices_merge() {
        let g = graph(2);
        // same diagonal: read offset delta 5 equals graph delta 5
        let mems = vec![
            mem(0, 10, &[Pos::new(1, 0, false)], 1),
            mem(5, 15, &[Pos::new(1, 5, false)], 1),
        ];
        let mut model = ChainModel::new(&[mems], &g, simple_transition, 100, 16, 8);
        let traces = model.traceback(4, false);
        // merged into one long vertex covering [0, 15)
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].len(), 1);
        assert_eq!((traces[0][0].begin, traces[0][0].end), (0, 15));
    }

    #[test]
    fn paired_mode_skips_singletons() {
        let g = graph(4);
        let frag1 = vec![mem(0, 10, &[Pos::new(1, 0, false)], 1)];
        let frag2: Vec<Mem> = Vec::new();
        let mut model = ChainModel::new(&[frag1, frag2], &g, simple_transition, 100, 16, 8);
        let traces = model.traceback(4, true);
        assert!(traces.is_empty());
    }

    #[test]
    fn paired_chains_tag_fragments() {
        let g = graph(6);
        let frag1 = vec![mem(0, 10, &[Pos::new(1, 0, false)], 1)];
        let frag2 = vec![mem(0, 10, &[Pos::new(3, 0, false)], 1)];
        let transition = |a: &Mem, b: &Mem| {
            if a.fragment != b.fragment { 5.0 } else { simple_transition(a, b) }
        };
        let mut model = ChainModel::new(&[frag1, frag2], &g, transition, 1000, 16, 8);
        let traces = model.traceback(4, true);
        assert!(!traces.is_empty());
        let frags: Vec<u8> = traces[0].iter().map(|m| m.fragment).collect();
        assert_eq!(frags, vec![1, 2]);
    }
}

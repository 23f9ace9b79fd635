//! Paired-end mapping: three cooperating strategies plus mate rescue.
//!
//! `separate` maps each mate on its own and pairs by walking the score grid;
//! `crossed` scores the full product of candidates with a fragment-length
//! bonus; `simultaneous` chains both mates' seeds in one model with
//! cross-fragment edges. All three share the fragment bookkeeping: perfect
//! pairs feed the model, and pairs that cannot be resolved before the model
//! is learned go to a retry queue.

use std::collections::{BinaryHeap, HashSet};

use log::{debug, trace};

use crate::cache::CacheSet;
use crate::chain::ChainModel;
use crate::fragment::FragmentModel;
use crate::index::graph::Subgraph;
use crate::mapper::Mapper;
use crate::mapq::compute_paired_mapping_qualities;
use crate::model::{FragmentEntry, Alignment, Pos};
use crate::seed::cluster::{cluster_coverage, clusters_to_drop, compute_cluster_mapping_quality, mems_overlap_length};
use crate::seed::finder::{find_mems, Mem};
use crate::subgraph::{cached_graph_context, expand_context, id_range_subgraph};

// rescue fires only off a confidently mapped anchor against a poorly mapped
// candidate
const RESCUE_HANG_THRESHOLD: f64 = 0.9;
const RESCUE_RETRY_THRESHOLD: f64 = 0.7;

/// Result of mapping a pair: parallel candidate lists, where entries at the
/// same index form a pair and the first pair is primary.
#[derive(Clone, Debug, Default)]
pub struct PairedAlignments {
    pub first: Vec<Alignment>,
    pub second: Vec<Alignment>,
    /// The pair was deferred until a fragment model exists.
    pub queued_for_later: bool,
}

/// A fragment observation to be applied to the model after the batch.
#[derive(Clone, Copy, Debug)]
pub struct PendingSample {
    pub length: i64,
    pub aln1_is_rev: bool,
    pub aln2_is_rev: bool,
}

// ordering shim for the score-grid heap
#[derive(PartialEq, Eq)]
struct GridEntry {
    score: i32,
    at: (usize, usize),
}

impl Ord for GridEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.cmp(&other.score).then_with(|| other.at.cmp(&self.at))
    }
}

impl PartialOrd for GridEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Mapper {
    /// Map a pair of reads. Applies fragment-model updates and pushes
    /// unresolved pairs onto the retry queue.
    pub fn align_paired(
        &mut self,
        read1: &Alignment,
        read2: &Alignment,
        cache: &mut CacheSet,
    ) -> PairedAlignments {
        let (out, samples) = self.align_paired_with_model(read1, read2, false, false, cache);
        for sample in samples {
            self.fragment_model.record(sample.length, sample.aln1_is_rev, sample.aln2_is_rev);
        }
        if out.queued_for_later {
            self.pair_retry_queue.push((read1.clone(), read2.clone()));
        }
        out
    }

    /// Re-map the pairs that were deferred before the fragment model was
    /// learned. The retried pairs never queue again.
    pub fn drain_pair_retry_queue(&mut self, cache: &mut CacheSet) -> Vec<PairedAlignments> {
        let queued = std::mem::take(&mut self.pair_retry_queue);
        debug!("retrying {} deferred pairs", queued.len());
        let mut out = Vec::with_capacity(queued.len());
        for (read1, read2) in queued {
            // retried pairs do not feed the model again
            let (result, _) = self.align_paired_with_model(&read1, &read2, false, true, cache);
            out.push(result);
        }
        out
    }

    /// Strategy dispatch against a frozen view of the fragment model; safe
    /// to call from parallel workers between model updates.
    pub fn align_paired_with_model(
        &self,
        read1: &Alignment,
        read2: &Alignment,
        only_top_scoring_pair: bool,
        retrying: bool,
        cache: &mut CacheSet,
    ) -> (PairedAlignments, Vec<PendingSample>) {
        let model = &self.fragment_model;
        let mut result = if self.opts.mem_chaining && read1.sequence.len() < self.opts.band_width {
            if self.opts.simultaneous_pair_alignment {
                self.align_paired_simultaneous(read1, read2, model, only_top_scoring_pair, cache)
            } else {
                self.align_paired_crossed(read1, read2, model, only_top_scoring_pair, cache)
            }
        } else {
            self.align_paired_separate(read1, read2, model, only_top_scoring_pair, cache)
        };
        let samples = self.finish_pair(&mut result, read1, read2, model, retrying);
        (result, samples)
    }

    // ---- shared postlude -------------------------------------------------

    // attach fragment records, decide model samples and deferral, fill in
    // unmapped mates, and wire the mate links
    fn finish_pair(
        &self,
        results: &mut PairedAlignments,
        read1: &Alignment,
        read2: &Alignment,
        model: &FragmentModel,
        retrying: bool,
    ) -> Vec<PendingSample> {
        if results.first.len() > self.opts.max_multimaps {
            results.first.truncate(self.opts.max_multimaps);
        }
        if results.second.len() > self.opts.max_multimaps {
            results.second.truncate(self.opts.max_multimaps);
        }
        let mut samples = Vec::new();
        let mut imperfect_pair = false;
        let n = results.first.len().min(results.second.len());
        for i in 0..n {
            if retrying {
                break;
            }
            let lengths = self.per_path_fragment_lengths(&results.first[i], &results.second[i]);
            for (path_name, length) in lengths {
                let entry = FragmentEntry { path_name: path_name.clone(), length };
                results.first[i].fragment.push(entry.clone());
                results.second[i].fragment.push(entry);
                let cap = if model.is_learned() { model.fragment_size } else { self.opts.fragment_max };
                if results.first.len() == 1
                    && results.second.len() == 1
                    && results.first[0].identity > self.opts.perfect_pair_identity_threshold
                    && results.second[0].identity > self.opts.perfect_pair_identity_threshold
                    && length.abs() < cap
                {
                    let rev1 = results.first[0]
                        .path
                        .start_position()
                        .map(|p| p.is_reverse)
                        .unwrap_or(false);
                    let rev2 = results.second[0]
                        .path
                        .start_position()
                        .map(|p| p.is_reverse)
                        .unwrap_or(false);
                    samples.push(PendingSample { length, aln1_is_rev: rev1, aln2_is_rev: rev2 });
                } else if !model.is_learned() {
                    imperfect_pair = true;
                }
            }
        }
        if !retrying && imperfect_pair && self.opts.fragment_max > 0 {
            results.first.clear();
            results.second.clear();
            results.queued_for_later = true;
            samples.clear();
        }
        if results.first.is_empty() {
            let mut unmapped = read1.clone();
            unmapped.clear_alignment();
            results.first.push(unmapped);
        }
        if results.second.is_empty() {
            let mut unmapped = read2.clone();
            unmapped.clear_alignment();
            results.second.push(unmapped);
        }
        for aln in &mut results.first {
            aln.name = read1.name.clone();
            aln.fragment_next = Some(read2.name.clone());
        }
        for aln in &mut results.second {
            aln.name = read2.name.clone();
            aln.fragment_prev = Some(read1.name.clone());
        }
        samples
    }

    // signed fragment length per reference path both mates touch
    fn per_path_fragment_lengths(&self, aln1: &Alignment, aln2: &Alignment) -> Vec<(String, i64)> {
        let pos1 = self.alignment_mean_path_positions(aln1, false);
        let pos2 = self.alignment_mean_path_positions(aln2, false);
        let mut out = Vec::new();
        for (name, mean1) in &pos1 {
            if let Some(mean2) = pos2.get(name) {
                out.push((name.clone(), (*mean2 - *mean1).round() as i64));
            }
        }
        out.sort();
        out
    }

    // ---- mate rescue -----------------------------------------------------

    /// Realign the weaker mate near the likely position implied by the
    /// stronger one. Returns whether a mate was replaced.
    pub(crate) fn pair_rescue(
        &self,
        mate1: &mut Alignment,
        mate2: &mut Alignment,
        model: &FragmentModel,
        cache: &mut CacheSet,
    ) -> bool {
        if !model.is_learned() || self.cancel.tripped() {
            return false;
        }
        let (rescue_second, anchor) = if mate1.identity > mate2.identity
            && mate1.identity > RESCUE_HANG_THRESHOLD
            && mate2.identity < RESCUE_RETRY_THRESHOLD
        {
            (true, mate1.clone())
        } else if mate2.identity > mate1.identity
            && mate2.identity > RESCUE_HANG_THRESHOLD
            && mate1.identity < RESCUE_RETRY_THRESHOLD
        {
            (false, mate2.clone())
        } else {
            return false;
        };
        let mate_pos = match self.likely_mate_position(&anchor, rescue_second) {
            Some(pos) => pos,
            None => return false,
        };
        trace!("rescuing mate of {} around {}", anchor.name, mate_pos);
        let candidate_len = if rescue_second { mate2.sequence.len() } else { mate1.sequence.len() };
        let window = if model.cached_mean <= 0.0 {
            self.opts.fragment_max
        } else {
            ((model.cached_stdev * 6.0) as i64 + candidate_len as i64).max(4 * candidate_len as i64)
        };
        let mut sub = Subgraph::new();
        cached_graph_context(&self.graph, &mut sub, mate_pos, window / 2, cache, &self.cancel);
        let flipped = mate_pos.flip(self.graph.node_len(mate_pos.node));
        cached_graph_context(&self.graph, &mut sub, flipped, window / 2, cache, &self.cancel);
        sub.remove_orphan_edges();
        if sub.is_empty() {
            return false;
        }
        let anchor_rev = anchor
            .path
            .start_position()
            .map(|p| p.is_reverse)
            .unwrap_or(false);
        // expected mate strand given the learned relative orientation
        let flip = if model.cached_orientation { anchor_rev } else { !anchor_rev };
        let target = if rescue_second { &mut *mate2 } else { &mut *mate1 };
        let candidate = self.aligners.align_maybe_flip(target, &self.graph, &sub, flip);
        if candidate.score > target.score {
            *target = candidate;
            true
        } else {
            false
        }
    }

    /// Align a mate within an id window around an anchored alignment,
    /// trying both relative orientations.
    pub(crate) fn align_mate_in_window(
        &self,
        anchor: &Alignment,
        mate: &Alignment,
        pair_window: i64,
    ) -> Alignment {
        let ids: Vec<i64> = anchor
            .path
            .mappings
            .iter()
            .map(|m| m.position.node)
            .collect();
        let (lo, hi) = match (ids.iter().min(), ids.iter().max()) {
            (Some(&lo), Some(&hi)) => (lo, hi),
            _ => {
                let mut unmapped = mate.clone();
                unmapped.clear_alignment();
                return unmapped;
            }
        };
        let mut sub = id_range_subgraph(
            &self.graph,
            (lo - pair_window).max(self.graph.min_node_id()),
            hi + pair_window,
            self.opts.context_depth,
        );
        expand_context(&self.graph, &mut sub, 1);
        sub.remove_orphan_edges();
        let same = self.aligners.align_maybe_flip(mate, &self.graph, &sub, false);
        let opposite = self.aligners.align_maybe_flip(mate, &self.graph, &sub, true);
        if same.score >= opposite.score { same } else { opposite }
    }

    // pairable seeds: those with a hit within the fragment bound of some hit
    // of the other read
    fn resolve_paired_mems(&self, mems1: &[Mem], mems2: &[Mem], bound: i64) -> (Vec<Mem>, Vec<Mem>) {
        let coords = |mems: &[Mem]| -> Vec<i64> {
            let mut v: Vec<i64> = mems
                .iter()
                .flat_map(|m| m.positions.iter().map(|&p| self.graph.approx_position(p)))
                .collect();
            v.sort_unstable();
            v
        };
        let coords1 = coords(mems1);
        let coords2 = coords(mems2);
        let near = |coords: &[i64], at: i64| -> bool {
            let idx = coords.partition_point(|&c| c < at - bound);
            coords.get(idx).map(|&c| c <= at + bound).unwrap_or(false)
        };
        let filter = |mems: &[Mem], other: &[i64]| -> Vec<Mem> {
            mems.iter()
                .filter(|m| {
                    m.positions
                        .iter()
                        .any(|&p| near(other, self.graph.approx_position(p)))
                })
                .cloned()
                .collect()
        };
        (filter(mems1, &coords2), filter(mems2, &coords1))
    }

    // ---- strategy 1: separate-then-pair ----------------------------------

    fn align_paired_separate(
        &self,
        read1: &Alignment,
        read2: &Alignment,
        model: &FragmentModel,
        only_top_scoring_pair: bool,
        cache: &mut CacheSet,
    ) -> PairedAlignments {
        let cfg = self.opts.clone();
        let mems1 = find_mems(
            &self.suffix,
            &read1.sequence,
            &self.seed_config_for_pairing(),
        )
        .unwrap_or_default();
        let mems2 = find_mems(
            &self.suffix,
            &read2.sequence,
            &self.seed_config_for_pairing(),
        )
        .unwrap_or_default();
        // with a learned model, constrain the seeds to pairable ones
        let (pairable1, pairable2) = if model.is_learned() {
            self.resolve_paired_mems(&mems1, &mems2, model.fragment_size)
        } else {
            (mems1, mems2)
        };
        let mut mq1 = 0.0;
        let mut mq2 = 0.0;
        let mut alignments1 = self.align_multi_internal(
            false, read1, 0, 0, 0, 0, cfg.extra_multimaps, Some(&pairable1), &mut mq1, cache,
        );
        let mut alignments2 = self.align_multi_internal(
            false, read2, 0, 0, 0, 0, cfg.extra_multimaps, Some(&pairable2), &mut mq2, cache,
        );
        let best1 = alignments1.iter().map(|a| a.score).max().unwrap_or(0);
        let best2 = alignments2.iter().map(|a| a.score).max().unwrap_or(0);

        // rescue a fully unmapped side off the mapped one
        let can_rescue = model.is_learned();
        if can_rescue && best1 == 0 && best2 != 0 {
            alignments1 = self.rescue_all(&alignments2, read1, cfg.pair_window, cfg.always_rescue);
        } else if can_rescue && best2 == 0 && best1 != 0 {
            alignments2 = self.rescue_all(&alignments1, read2, cfg.pair_window, cfg.always_rescue);
        } else if cfg.always_rescue {
            let extra2 = self.rescue_all(&alignments1, read2, cfg.pair_window, true);
            let extra1 = self.rescue_all(&alignments2, read1, cfg.pair_window, true);
            append_novel(&mut alignments1, extra1);
            append_novel(&mut alignments2, extra2);
        }
        alignments1.sort_by(|a, b| b.score.cmp(&a.score));
        alignments2.sort_by(|a, b| b.score.cmp(&a.score));

        let mut results = PairedAlignments::default();
        if model.is_learned() && !alignments1.is_empty() && !alignments2.is_empty() {
            // walk the score-sum grid from the corner, emitting consistent
            // pairs in decreasing order
            let pos1: Vec<_> = alignments1
                .iter()
                .map(|a| self.alignment_mean_path_positions(a, false))
                .collect();
            let pos2: Vec<_> = alignments2
                .iter()
                .map(|a| self.alignment_mean_path_positions(a, false))
                .collect();
            let want = self.opts.max_multimaps.max(2);
            let mut heap: BinaryHeap<GridEntry> = BinaryHeap::new();
            let mut considered: HashSet<(usize, usize)> = HashSet::new();
            heap.push(GridEntry { score: alignments1[0].score + alignments2[0].score, at: (0, 0) });
            considered.insert((0, 0));
            while let Some(GridEntry { at: (i, j), .. }) = heap.pop() {
                if results.first.len() >= want {
                    break;
                }
                if self.alignments_consistent(&pos1[i], &pos2[j], model.fragment_size) {
                    results.first.push(alignments1[i].clone());
                    results.second.push(alignments2[j].clone());
                }
                let down = (i + 1, j);
                if down.0 < alignments1.len() && considered.insert(down) {
                    heap.push(GridEntry {
                        score: alignments1[down.0].score + alignments2[down.1].score,
                        at: down,
                    });
                }
                let right = (i, j + 1);
                if right.1 < alignments2.len() && considered.insert(right) {
                    heap.push(GridEntry {
                        score: alignments1[right.0].score + alignments2[right.1].score,
                        at: right,
                    });
                }
            }
            compute_paired_mapping_qualities(
                &mut results.first,
                &mut results.second,
                &self.aligners.scoring,
                self.opts.mapping_quality_method,
                self.opts.max_mapping_quality,
                self.opts.mq_overlap,
                mq1 + mq2,
                self.opts.use_cluster_mq,
            );
            mark_pairs(&mut results, read1, read2);
            if only_top_scoring_pair
                && !results.first.is_empty()
                && (results.first[0].score < alignments1[0].score
                    || results.second[0].score < alignments2[0].score)
            {
                results.first.clear();
                results.second.clear();
            }
        } else {
            results.first = alignments1;
            results.second = alignments2;
            compute_paired_mapping_qualities(
                &mut results.first,
                &mut results.second,
                &self.aligners.scoring,
                self.opts.mapping_quality_method,
                self.opts.max_mapping_quality,
                self.opts.mq_overlap,
                mq1 + mq2,
                self.opts.use_cluster_mq,
            );
            mark_pairs(&mut results, read1, read2);
        }
        results
    }

    fn seed_config_for_pairing(&self) -> crate::seed::finder::SeedConfig {
        crate::seed::finder::SeedConfig {
            max_mem_length: self.opts.max_mem_length,
            min_mem_length: self.opts.min_mem_length,
            reseed_length: self.opts.mem_reseed_length,
            fast_reseed: self.opts.fast_reseed,
            hit_max: self.opts.hit_max,
        }
    }

    fn rescue_all(
        &self,
        anchors: &[Alignment],
        mate: &Alignment,
        pair_window: i64,
        all: bool,
    ) -> Vec<Alignment> {
        let mut out: Vec<Alignment> = Vec::new();
        for anchor in anchors {
            if self.cancel.tripped() {
                break;
            }
            if !anchor.is_mapped() {
                continue;
            }
            let rescued = self.align_mate_in_window(anchor, mate, pair_window);
            if !out.iter().any(|a| a.path == rescued.path) {
                out.push(rescued);
            }
            if !all {
                break;
            }
        }
        out
    }

    // ---- strategy 2: crossed pairs ---------------------------------------

    fn align_paired_crossed(
        &self,
        read1: &Alignment,
        read2: &Alignment,
        model: &FragmentModel,
        only_top_scoring_pair: bool,
        cache: &mut CacheSet,
    ) -> PairedAlignments {
        let mut mq1 = 0.0;
        let mut mq2 = 0.0;
        let mut alignments1 = self.align_multi_internal(
            false, read1, 0, 0, 0, 0, self.opts.extra_multimaps, None, &mut mq1, cache,
        );
        let mut alignments2 = self.align_multi_internal(
            false, read2, 0, 0, 0, 0, self.opts.extra_multimaps, None, &mut mq2, cache,
        );
        // an unmapped sentinel on each side lets a lone mapping survive
        let mut sentinel1 = read1.clone();
        sentinel1.clear_alignment();
        let mut sentinel2 = read2.clone();
        sentinel2.clear_alignment();
        alignments1.push(sentinel1);
        alignments2.push(sentinel2);

        let mut pairs: Vec<(f64, Alignment, Alignment)> = Vec::new();
        for a1 in &alignments1 {
            for a2 in &alignments2 {
                if !a1.is_mapped() && !a2.is_mapped() {
                    continue;
                }
                let mut bonus = 0.0;
                if a1.is_mapped() && a2.is_mapped() {
                    let dist = self.approx_fragment_length(a1, a2).abs();
                    if model.is_learned() {
                        if dist < model.fragment_size {
                            bonus = model.pdf(dist as f64) / model.pdf(model.cached_mean);
                        }
                    } else if dist > 0 && dist < self.opts.fragment_max {
                        bonus = 1.0;
                    }
                }
                pairs.push((bonus, a1.clone(), a2.clone()));
            }
        }
        pairs.sort_by(|x, y| {
            y.0.partial_cmp(&x.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (y.1.score + y.2.score).cmp(&(x.1.score + x.2.score)))
        });
        // dedup by both start positions; pairs with both mates unmapped were
        // never emitted, so the sentinel cannot collapse real candidates
        let mut seen: HashSet<(Option<Pos>, Option<Pos>)> = HashSet::new();
        let mut results = PairedAlignments::default();
        for (_, a1, a2) in pairs {
            let key = (a1.path.start_position(), a2.path.start_position());
            if !seen.insert(key) {
                continue;
            }
            results.first.push(a1);
            results.second.push(a2);
            if results.first.len() >= self.opts.max_multimaps.max(2) {
                break;
            }
        }
        // rescue against the learned model
        if model.is_learned() {
            let mut rescued = false;
            for i in 0..results.first.len().min(self.opts.mate_rescues.max(1)) {
                if self.cancel.tripped() {
                    break;
                }
                let (a1, a2) = results.pair_mut(i);
                rescued |= self.pair_rescue(a1, a2, model, cache);
            }
            if rescued {
                results.sort_pairs_by_score();
            }
        }
        compute_paired_mapping_qualities(
            &mut results.first,
            &mut results.second,
            &self.aligners.scoring,
            self.opts.mapping_quality_method,
            self.opts.max_mapping_quality,
            self.opts.mq_overlap,
            mq1 + mq2,
            self.opts.use_cluster_mq,
        );
        mark_pairs(&mut results, read1, read2);
        if only_top_scoring_pair
            && !results.first.is_empty()
            && (results.first[0].score < alignments1[0].score
                || results.second[0].score < alignments2[0].score)
        {
            results.first.clear();
            results.second.clear();
        }
        results
    }

    // ---- strategy 3: simultaneous chain model ----------------------------

    fn align_paired_simultaneous(
        &self,
        read1: &Alignment,
        read2: &Alignment,
        model: &FragmentModel,
        only_top_scoring_pair: bool,
        cache: &mut CacheSet,
    ) -> PairedAlignments {
        let total_multimaps = self.opts.max_multimaps + self.opts.extra_multimaps;
        let mems1 = find_mems(&self.suffix, &read1.sequence, &self.seed_config_for_pairing())
            .unwrap_or_default();
        let mems2 = find_mems(&self.suffix, &read2.sequence, &self.seed_config_for_pairing())
            .unwrap_or_default();
        let scoring = self.aligners.scoring;
        let match_score = scoring.match_score as f64;
        let gap_open = scoring.gap_open as f64;
        let gap_extend = scoring.gap_extend as f64;
        let fragment_max = self.opts.fragment_max;
        // seed starts sit up to a read length beyond the inner fragment ends
        let pair_slack = (read1.sequence.len() + read2.sequence.len()) as i64;
        let transition = |m1: &Mem, m2: &Mem| -> f64 {
            let p1 = m1.positions[0];
            let p2 = m2.positions[0];
            let approx_dist = self.graph.approx_distance(p1, p2);
            if m1.fragment < m2.fragment {
                // across the fragment boundary; coincident mates are not a
                // fragment at all
                let dist = approx_dist.abs();
                if dist == 0 || dist >= fragment_max {
                    return f64::NEG_INFINITY;
                }
                if model.is_learned() {
                    let orientation_ok = if model.cached_orientation {
                        p1.is_reverse == p2.is_reverse
                    } else {
                        p1.is_reverse != p2.is_reverse
                    };
                    if !orientation_ok || dist > model.fragment_size + pair_slack {
                        f64::NEG_INFINITY
                    } else {
                        model.pdf(dist as f64) / model.pdf(model.cached_mean)
                    }
                } else {
                    1.0 / dist as f64
                }
            } else if m1.fragment > m2.fragment {
                // no going backwards across fragments
                f64::NEG_INFINITY
            } else {
                let max_length = 2 * (m1.len() + m2.len()) as i64;
                let dist = approx_dist.abs();
                if dist > max_length {
                    return f64::NEG_INFINITY;
                }
                if p1.is_reverse != p2.is_reverse {
                    return f64::NEG_INFINITY;
                }
                let unique_coverage = (m1.len() + m2.len() - mems_overlap_length(m1, m2)) as f64;
                let uniqueness = 2.0 / (m1.match_count + m2.match_count) as f64;
                let jump = ((m2.begin as i64 - m1.begin as i64) - dist).abs() as f64;
                if jump > 0.0 {
                    unique_coverage * match_score * uniqueness - (gap_open + jump * gap_extend)
                } else {
                    unique_coverage * match_score * uniqueness
                }
            }
        };
        let band = (read1.sequence.len() + read2.sequence.len()).max(if model.is_learned() {
            model.fragment_size as usize
        } else {
            self.opts.fragment_max as usize
        }) as i64;
        let mut chain_model = ChainModel::new(
            &[mems1, mems2],
            &self.graph,
            transition,
            band,
            self.opts.chain_position_depth,
            self.opts.chain_max_connections,
        );
        let clusters = chain_model.traceback(total_multimaps, true);

        // split each chain by fragment
        let mut clusters1: Vec<Vec<Mem>> = Vec::with_capacity(clusters.len());
        let mut clusters2: Vec<Vec<Mem>> = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            let mut c1 = Vec::new();
            let mut c2 = Vec::new();
            for mem in cluster {
                if mem.fragment <= 1 {
                    c1.push(mem.clone());
                } else {
                    c2.push(mem.clone());
                }
            }
            clusters1.push(c1);
            clusters2.push(c2);
        }
        let to_drop1 = clusters_to_drop(&clusters1, self.opts.drop_chain);
        let to_drop2 = clusters_to_drop(&clusters2, self.opts.drop_chain);
        let mut pairs: Vec<(Alignment, Alignment)> = Vec::new();
        for i in 0..clusters1.len() {
            if self.cancel.tripped() {
                break;
            }
            let drop1 = clusters1[i].is_empty() || to_drop1.contains(&i);
            let drop2 = clusters2[i].is_empty() || to_drop2.contains(&i);
            if drop1 && drop2 {
                continue;
            }
            if pairs.len() > total_multimaps {
                break;
            }
            if self.opts.min_cluster_length > 0
                && cluster_coverage(&clusters1[i]) + cluster_coverage(&clusters2[i])
                    < self.opts.min_cluster_length
                && pairs.len() > 1
            {
                continue;
            }
            let aln1 = if clusters1[i].is_empty() {
                let mut unmapped = read1.clone();
                unmapped.clear_alignment();
                unmapped
            } else {
                self.align_cluster(read1, &clusters1[i], cache)
            };
            let aln2 = if clusters2[i].is_empty() {
                let mut unmapped = read2.clone();
                unmapped.clear_alignment();
                unmapped
            } else {
                self.align_cluster(read2, &clusters2[i], cache)
            };
            pairs.push((aln1, aln2));
        }

        // nothing chained as a pair: fall back to independent mapping and
        // let rescue repair the weaker side
        if pairs.is_empty() && model.is_learned() {
            let mut mq = 0.0;
            let aln1 = self
                .align_multi_internal(false, read1, 0, 0, 0, 0, 0, None, &mut mq, cache)
                .into_iter()
                .next()
                .unwrap_or_else(|| {
                    let mut unmapped = read1.clone();
                    unmapped.clear_alignment();
                    unmapped
                });
            let aln2 = self
                .align_multi_internal(false, read2, 0, 0, 0, 0, 0, None, &mut mq, cache)
                .into_iter()
                .next()
                .unwrap_or_else(|| {
                    let mut unmapped = read2.clone();
                    unmapped.clear_alignment();
                    unmapped
                });
            if aln1.is_mapped() || aln2.is_mapped() {
                pairs.push((aln1, aln2));
            }
        }

        let sort_and_dedup = |pairs: &mut Vec<(Alignment, Alignment)>| {
            pairs.sort_by(|x, y| {
                let bonus = |p: &(Alignment, Alignment)| -> f64 {
                    if model.is_learned() && p.0.is_mapped() && p.1.is_mapped() {
                        let dist = self.approx_fragment_length(&p.0, &p.1).abs();
                        model.pdf(dist as f64) * model.cached_mean
                    } else {
                        0.0
                    }
                };
                let sx = (x.0.score + x.1.score) as f64 + bonus(x);
                let sy = (y.0.score + y.1.score) as f64 + bonus(y);
                sy.partial_cmp(&sx).unwrap_or(std::cmp::Ordering::Equal)
            });
            pairs.dedup_by(|a, b| {
                let mut same = true;
                if a.0.is_mapped() && b.0.is_mapped() {
                    same &= a.0.path.start_position() == b.0.path.start_position();
                }
                if a.1.is_mapped() && b.1.is_mapped() {
                    same &= a.1.path.start_position() == b.1.path.start_position();
                }
                let either = (a.0.is_mapped() && b.0.is_mapped()) || (a.1.is_mapped() && b.1.is_mapped());
                same && either
            });
        };
        sort_and_dedup(&mut pairs);
        if model.is_learned() {
            let mut rescued = false;
            for (j, pair) in pairs.iter_mut().enumerate() {
                if j >= self.opts.mate_rescues.max(1) || self.cancel.tripped() {
                    break;
                }
                rescued |= self.pair_rescue(&mut pair.0, &mut pair.1, model, cache);
            }
            if rescued {
                sort_and_dedup(&mut pairs);
            }
        }
        let cluster_mq = if self.opts.use_cluster_mq {
            compute_cluster_mapping_quality(
                &clusters,
                read1.sequence.len() + read2.sequence.len(),
                f64::from(self.opts.max_cluster_mapping_quality),
            )
        } else {
            0.0
        };
        let mut results = PairedAlignments::default();
        let best1 = pairs.iter().map(|p| p.0.score).max().unwrap_or(0);
        let best2 = pairs.iter().map(|p| p.1.score).max().unwrap_or(0);
        for (a1, a2) in pairs {
            results.first.push(a1);
            results.second.push(a2);
        }
        compute_paired_mapping_qualities(
            &mut results.first,
            &mut results.second,
            &self.aligners.scoring,
            self.opts.mapping_quality_method,
            self.opts.max_mapping_quality,
            self.opts.mq_overlap,
            cluster_mq,
            self.opts.use_cluster_mq,
        );
        mark_pairs(&mut results, read1, read2);
        if only_top_scoring_pair
            && !results.first.is_empty()
            && (results.first[0].score < best1 || results.second[0].score < best2)
        {
            results.first.clear();
            results.second.clear();
        }
        results
    }
}

impl PairedAlignments {
    fn pair_mut(&mut self, i: usize) -> (&mut Alignment, &mut Alignment) {
        (&mut self.first[i], &mut self.second[i])
    }

    fn sort_pairs_by_score(&mut self) {
        let mut indexed: Vec<(i32, usize)> = self
            .first
            .iter()
            .zip(self.second.iter())
            .enumerate()
            .map(|(i, (a, b))| (a.score + b.score, i))
            .collect();
        indexed.sort_by(|a, b| b.0.cmp(&a.0));
        let first = std::mem::take(&mut self.first);
        let second = std::mem::take(&mut self.second);
        for &(_, i) in &indexed {
            self.first.push(first[i].clone());
            self.second.push(second[i].clone());
        }
    }
}

fn append_novel(existing: &mut Vec<Alignment>, extra: Vec<Alignment>) {
    for aln in extra {
        if !existing.iter().any(|a| a.path == aln.path) {
            existing.push(aln);
        }
    }
}

fn mark_pairs(results: &mut PairedAlignments, read1: &Alignment, read2: &Alignment) {
    let n = results.first.len().min(results.second.len());
    results.first.truncate(n);
    results.second.truncate(n);
    for i in 0..n {
        results.first[i].fragment_next = Some(read2.name.clone());
        results.first[i].is_secondary = i > 0;
        results.second[i].fragment_prev = Some(read1.name.clone());
        results.second[i].is_secondary = i > 0;
    }
}

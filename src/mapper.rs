//! The mapper: seed, cluster, align, score.
//!
//! A `Mapper` borrows read-only indexes and owns the knobs. Worker threads
//! pass their own [`CacheSet`] into every entry point; the only mutable
//! per-instance state (the fragment model and the pair retry queue) is
//! confined to the paired-end layer.

use std::sync::Arc;

use log::{trace, warn};

use crate::align::dp::Scoring;
use crate::align::extend::extend_seed;
use crate::align::facade::Aligners;
use crate::banded::align_banded;
use crate::cache::CacheSet;
use crate::cancel::CancelToken;
use crate::chain::ChainModel;
use crate::fragment::FragmentModel;
use crate::index::fm::SuffixIndex;
use crate::index::graph::{GraphIndex, Subgraph};
use crate::index::paths::PathPositions;
use crate::mapq::compute_mapping_qualities;
use crate::model::{softclip_end, softclip_start, Alignment, NodeId, Pos};
use crate::seed::cluster::{
    cluster_coverage, clusters_to_drop, compute_cluster_mapping_quality, id_clusters,
    mems_overlap_length,
};
use crate::seed::finder::{find_mems, Mem, SeedConfig};
use crate::subgraph::{cluster_subgraph, expand_context, id_range_subgraph};

/// Everything the mapper can be told to do differently.
#[derive(Clone, Debug)]
pub struct MapperOpts {
    // multimapping
    pub max_multimaps: usize,
    /// Extras retained during mapping-quality estimation only.
    pub extra_multimaps: usize,

    // seeding
    pub min_mem_length: usize,
    pub max_mem_length: usize,
    pub mem_reseed_length: usize,
    pub fast_reseed: bool,
    pub hit_max: usize,
    /// Legacy clusterer skips MEMs with more hits than this; 0 is unlimited.
    pub hit_size_threshold: usize,
    pub kmer_sensitivity_step: usize,
    pub max_attempts: usize,

    // clustering
    pub cluster_min: usize,
    pub min_cluster_length: usize,
    pub thread_extension: i64,
    pub max_thread_gap: i64,
    pub context_depth: usize,
    pub drop_chain: f64,

    // subgraph bounds and soft clips
    pub softclip_threshold: usize,
    pub max_softclip_iterations: usize,
    pub max_target_factor: usize,
    pub max_query_graph_ratio: f64,

    // banded split alignment
    pub band_width: usize,

    // acceptance
    pub accept_identity: f64,
    pub min_identity: f64,
    pub target_score_per_bp: f64,
    pub greedy_accept: bool,
    pub prefer_forward: bool,

    // mapping quality
    pub mq_overlap: f64,
    pub mapping_quality_method: MappingQualityMethod,
    pub max_mapping_quality: i32,
    pub max_cluster_mapping_quality: i32,
    pub use_cluster_mq: bool,

    // pairing
    pub fragment_max: i64,
    pub fragment_sigma: f64,
    pub fragment_length_cache_size: usize,
    pub fragment_length_estimate_interval: usize,
    pub perfect_pair_identity_threshold: f64,
    pub mate_rescues: usize,
    pub always_rescue: bool,
    pub pair_window: i64,

    // scoring
    pub alignment_match: i32,
    pub alignment_mismatch: i32,
    pub alignment_gap_open: i32,
    pub alignment_gap_extension: i32,
    pub full_length_alignment_bonus: i32,
    pub adjust_alignments_for_base_quality: bool,

    // strategy switches
    pub mem_chaining: bool,
    pub simultaneous_pair_alignment: bool,
    pub smooth_alignments: bool,

    // chain model shape
    pub chain_position_depth: usize,
    pub chain_max_connections: usize,

    // workers
    pub alignment_threads: usize,
    pub cache_size: usize,
}

impl Default for MapperOpts {
    fn default() -> Self {
        MapperOpts {
            max_multimaps: 1,
            extra_multimaps: 4,
            min_mem_length: 1,
            max_mem_length: 0,
            mem_reseed_length: 0,
            fast_reseed: true,
            hit_max: 100,
            hit_size_threshold: 0,
            kmer_sensitivity_step: 5,
            max_attempts: 7,
            cluster_min: 1,
            min_cluster_length: 0,
            thread_extension: 10,
            max_thread_gap: 30,
            context_depth: 3,
            drop_chain: 0.45,
            softclip_threshold: 4,
            max_softclip_iterations: 10,
            max_target_factor: 128,
            max_query_graph_ratio: 128.0,
            band_width: 1000,
            accept_identity: 0.75,
            min_identity: 0.0,
            target_score_per_bp: 0.0,
            greedy_accept: false,
            prefer_forward: false,
            mq_overlap: 0.5,
            mapping_quality_method: MappingQualityMethod::Approx,
            max_mapping_quality: 60,
            max_cluster_mapping_quality: 1024,
            use_cluster_mq: false,
            fragment_max: 10_000,
            fragment_sigma: 10.0,
            fragment_length_cache_size: 1000,
            fragment_length_estimate_interval: 10,
            perfect_pair_identity_threshold: 0.95,
            mate_rescues: 50,
            always_rescue: false,
            pair_window: 64,
            alignment_match: 1,
            alignment_mismatch: 4,
            alignment_gap_open: 6,
            alignment_gap_extension: 1,
            full_length_alignment_bonus: 5,
            adjust_alignments_for_base_quality: false,
            mem_chaining: true,
            simultaneous_pair_alignment: true,
            smooth_alignments: true,
            chain_position_depth: 8,
            chain_max_connections: 32,
            alignment_threads: 1,
            cache_size: 4096,
        }
    }
}

pub use crate::mapq::MappingQualityMethod;

/// The read-to-graph mapper.
pub struct Mapper {
    pub graph: Arc<GraphIndex>,
    pub suffix: Arc<SuffixIndex>,
    pub paths: Arc<PathPositions>,
    pub opts: MapperOpts,
    pub aligners: Aligners,
    pub cancel: CancelToken,
    pub(crate) fragment_model: FragmentModel,
    pub(crate) pair_retry_queue: Vec<(Alignment, Alignment)>,
}

impl Mapper {
    /// Build a mapper over the given indexes; misconfiguration is an error,
    /// never a panic.
    pub fn new(
        graph: Arc<GraphIndex>,
        suffix: Arc<SuffixIndex>,
        paths: Arc<PathPositions>,
        opts: MapperOpts,
    ) -> Result<Mapper, String> {
        if graph.node_count() == 0 {
            return Err("a sequence graph is required for mapping".to_string());
        }
        if suffix.size() <= 1 {
            return Err("a suffix index over the graph is required to query seeds".to_string());
        }
        if opts.mem_reseed_length > 0 && opts.min_mem_length > opts.mem_reseed_length {
            return Err(format!(
                "minimum MEM length {} cannot exceed reseed length {}",
                opts.min_mem_length, opts.mem_reseed_length
            ));
        }
        if opts.band_width == 0 {
            return Err("band width must be positive".to_string());
        }
        let scoring = Scoring {
            match_score: opts.alignment_match,
            mismatch: opts.alignment_mismatch,
            gap_open: opts.alignment_gap_open,
            gap_extend: opts.alignment_gap_extension,
            full_length_bonus: opts.full_length_alignment_bonus,
        };
        let aligners = Aligners {
            scoring,
            adjust_for_base_quality: opts.adjust_alignments_for_base_quality,
            max_query_graph_ratio: opts.max_query_graph_ratio,
        };
        let fragment_model = FragmentModel::new(
            opts.fragment_length_cache_size,
            opts.fragment_length_estimate_interval,
            opts.fragment_sigma,
        );
        Ok(Mapper {
            graph,
            suffix,
            paths,
            opts,
            aligners,
            cancel: CancelToken::none(),
            fragment_model,
            pair_retry_queue: Vec::new(),
        })
    }

    pub fn fragment_model(&self) -> &FragmentModel {
        &self.fragment_model
    }

    pub fn fragment_model_mut(&mut self) -> &mut FragmentModel {
        &mut self.fragment_model
    }

    /// Defer a pair until the fragment model has been learned.
    pub fn queue_pair_for_retry(&mut self, read1: Alignment, read2: Alignment) {
        self.pair_retry_queue.push((read1, read2));
    }

    pub fn retry_queue_len(&self) -> usize {
        self.pair_retry_queue.len()
    }

    fn seed_config(&self, min_mem_length: usize, max_mem_length: usize) -> SeedConfig {
        SeedConfig {
            max_mem_length: if max_mem_length > 0 { max_mem_length } else { self.opts.max_mem_length },
            min_mem_length,
            reseed_length: self.opts.mem_reseed_length,
            fast_reseed: self.opts.fast_reseed,
            hit_max: self.opts.hit_max,
        }
    }

    /// The highest-scoring alignment, or an unmapped alignment with empty
    /// path and zero score. `kmer_size` (when nonzero) overrides the initial
    /// seed length; `band_width` (when nonzero) overrides the banded-split
    /// trigger.
    pub fn align_single(
        &self,
        read: &Alignment,
        kmer_size: usize,
        stride: usize,
        max_mem_length: usize,
        band_width: usize,
        cache: &mut CacheSet,
    ) -> Alignment {
        let mut best = self
            .align_multi(read, kmer_size, stride, max_mem_length, band_width, cache)
            .into_iter()
            .next()
            .unwrap_or_else(|| {
                let mut unmapped = read.clone();
                unmapped.clear_alignment();
                unmapped
            });
        best.is_secondary = false;
        best
    }

    /// Up to `max_multimaps` alignments sorted by descending score, primary
    /// first.
    pub fn align_multi(
        &self,
        read: &Alignment,
        kmer_size: usize,
        stride: usize,
        max_mem_length: usize,
        band_width: usize,
        cache: &mut CacheSet,
    ) -> Vec<Alignment> {
        let mut cluster_mq = 0.0;
        self.align_multi_internal(
            true,
            read,
            kmer_size,
            stride,
            max_mem_length,
            band_width,
            self.opts.extra_multimaps,
            None,
            &mut cluster_mq,
            cache,
        )
    }

    /// The full single-read pipeline. Paired strategies call in here with
    /// pre-restricted seeds and quality computation deferred.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn align_multi_internal(
        &self,
        compute_unpaired_quality: bool,
        read: &Alignment,
        kmer_size: usize,
        stride: usize,
        max_mem_length: usize,
        band_width: usize,
        additional_multimaps: usize,
        restricted_mems: Option<&[Mem]>,
        cluster_mq: &mut f64,
        cache: &mut CacheSet,
    ) -> Vec<Alignment> {
        let band_width = if band_width > 0 { band_width } else { self.opts.band_width };
        if read.sequence.is_empty() {
            let mut unmapped = read.clone();
            unmapped.clear_alignment();
            return vec![unmapped];
        }
        // long reads go through the split aligner
        if read.sequence.len() > band_width {
            let parallel = self.opts.alignment_threads > 1;
            let banded = align_banded(
                &self.graph,
                &self.aligners,
                read,
                band_width,
                self.opts.max_multimaps,
                self.opts.min_identity,
                parallel,
                &|band: &Alignment| {
                    let mut band_cache = CacheSet::new(self.opts.cache_size);
                    let mut mq = 0.0;
                    self.align_multi_internal(
                        false,
                        band,
                        kmer_size,
                        stride,
                        max_mem_length,
                        band_width,
                        self.opts.extra_multimaps,
                        None,
                        &mut mq,
                        &mut band_cache,
                    )
                },
            );
            return vec![banded];
        }

        // retry with shorter seeds while nothing clears the identity bar
        let additional_for_quality = if additional_multimaps == 0
            && self.opts.max_multimaps == 1
            && self.opts.mapping_quality_method != MappingQualityMethod::None
        {
            1
        } else {
            additional_multimaps
        };
        let mut seed_length = if kmer_size > 0 { kmer_size } else { self.opts.min_mem_length };
        let mut alignments: Vec<Alignment> = Vec::new();
        for attempt in 0..self.opts.max_attempts.max(1) {
            if self.cancel.tripped() {
                break;
            }
            let owned_mems;
            let mems: &[Mem] = match restricted_mems {
                Some(mems) if attempt == 0 => mems,
                _ => {
                    let cfg = self.seed_config(seed_length, max_mem_length);
                    owned_mems = match find_mems(&self.suffix, &read.sequence, &cfg) {
                        Ok(mems) => mems,
                        Err(err) => {
                            warn!("seeding failed for {}: {}", read.name, err);
                            Vec::new()
                        }
                    };
                    &owned_mems
                }
            };
            alignments = if self.opts.mem_chaining {
                self.mems_pos_clusters_to_alignments(read, mems, additional_for_quality, cluster_mq, cache)
            } else {
                self.mems_id_clusters_to_alignments(read, mems, additional_for_quality, stride)
            };
            let acceptable = alignments
                .iter()
                .any(|a| a.is_mapped() && a.identity >= self.opts.min_identity);
            if acceptable {
                break;
            }
            if seed_length <= self.opts.kmer_sensitivity_step {
                break;
            }
            seed_length -= self.opts.kmer_sensitivity_step;
            trace!("retrying {} at seed length {}", read.name, seed_length);
        }

        let mut alignments = self.score_sort_and_deduplicate(alignments, read);
        if compute_unpaired_quality {
            compute_mapping_qualities(
                &mut alignments,
                &self.aligners.scoring,
                self.opts.mapping_quality_method,
                self.opts.max_mapping_quality,
                self.opts.mq_overlap,
                *cluster_mq,
                self.opts.use_cluster_mq,
            );
            self.filter_and_process_multimaps(&mut alignments, 0);
        } else {
            self.filter_and_process_multimaps(&mut alignments, additional_multimaps);
        }
        debug_assert!(alignments
            .iter()
            .all(|a| self.aligners.check_alignment(&self.graph, a).is_ok()));
        alignments
    }

    // forward-strand projection of the first mapping's start, so that a
    // placement and its strand flip deduplicate against each other
    fn canonical_start(&self, aln: &Alignment) -> Option<(NodeId, usize)> {
        let mapping = aln.path.mappings.first()?;
        let pos = mapping.position;
        if pos.is_reverse {
            let len = self.graph.node_len(pos.node);
            Some((pos.node, len.saturating_sub(pos.offset + mapping.from_len())))
        } else {
            Some((pos.node, pos.offset))
        }
    }

    /// Sort by descending score (more edit operations win ties) and drop
    /// exact repeats of the same score and starting span.
    pub(crate) fn score_sort_and_deduplicate(
        &self,
        mut alns: Vec<Alignment>,
        original: &Alignment,
    ) -> Vec<Alignment> {
        if alns.is_empty() {
            let mut unmapped = original.clone();
            unmapped.clear_alignment();
            return vec![unmapped];
        }
        alns.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.edit_count().cmp(&a.edit_count()))
        });
        alns.dedup_by(|a, b| {
            a.score == b.score
                && (a.score == 0 || self.canonical_start(a) == self.canonical_start(b))
        });
        alns
    }

    pub(crate) fn filter_and_process_multimaps(
        &self,
        alns: &mut Vec<Alignment>,
        additional_multimaps: usize,
    ) {
        let total = self.opts.max_multimaps + additional_multimaps;
        if alns.len() > total {
            alns.truncate(total);
        }
        for (i, aln) in alns.iter_mut().enumerate() {
            aln.is_secondary = i > 0;
        }
    }

    // transition weight for chaining seeds of a single read
    fn single_read_transition(&self, read_len: usize) -> impl Fn(&Mem, &Mem) -> f64 + '_ {
        let match_score = self.aligners.scoring.match_score as f64;
        let gap_open = self.aligners.scoring.gap_open as f64;
        let gap_extend = self.aligners.scoring.gap_extend as f64;
        let max_length = read_len as i64;
        move |m1: &Mem, m2: &Mem| -> f64 {
            let p1 = m1.positions[0];
            let p2 = m2.positions[0];
            let approx_dist = self.graph.approx_distance(p1, p2).abs();
            if approx_dist > max_length {
                return f64::NEG_INFINITY;
            }
            if p1.is_reverse != p2.is_reverse {
                // inversions are not chained
                return f64::NEG_INFINITY;
            }
            let unique_coverage = (m1.len() + m2.len() - mems_overlap_length(m1, m2)) as f64;
            let uniqueness = 2.0 / (m1.match_count + m2.match_count) as f64;
            let jump = ((m2.begin as i64 - m1.begin as i64) - approx_dist).abs() as f64;
            if jump > 0.0 {
                unique_coverage * match_score * uniqueness - (gap_open + jump * gap_extend)
            } else {
                unique_coverage * match_score * uniqueness
            }
        }
    }

    /// Chain-model clustering and alignment of the resulting MEM chains.
    pub(crate) fn mems_pos_clusters_to_alignments(
        &self,
        read: &Alignment,
        mems: &[Mem],
        additional_multimaps: usize,
        cluster_mq: &mut f64,
        cache: &mut CacheSet,
    ) -> Vec<Alignment> {
        let total_multimaps = self.opts.max_multimaps + additional_multimaps;
        let transition = self.single_read_transition(read.sequence.len());
        let mut model = ChainModel::new(
            &[mems.to_vec()],
            &self.graph,
            transition,
            read.sequence.len().max(1) as i64,
            self.opts.chain_position_depth,
            self.opts.chain_max_connections,
        );
        let clusters = model.traceback(total_multimaps, false);
        if self.opts.use_cluster_mq {
            *cluster_mq = compute_cluster_mapping_quality(
                &clusters,
                read.sequence.len(),
                f64::from(self.opts.max_cluster_mapping_quality),
            );
        }
        let to_drop = clusters_to_drop(&clusters, self.opts.drop_chain);
        let mut alns: Vec<Alignment> = Vec::new();
        let mut multimaps = 0;
        for (i, cluster) in clusters.iter().enumerate() {
            if self.cancel.tripped() {
                break;
            }
            if to_drop.contains(&i) {
                continue;
            }
            multimaps += 1;
            if multimaps > total_multimaps {
                break;
            }
            if self.opts.min_cluster_length > 0
                && cluster_coverage(cluster) < self.opts.min_cluster_length
                && alns.len() > 1
            {
                continue;
            }
            let candidate = self.align_cluster(read, cluster, cache);
            if candidate.identity > self.opts.min_identity {
                let accept = self.opts.greedy_accept
                    && candidate.identity >= self.opts.accept_identity
                    && (self.opts.target_score_per_bp <= 0.0
                        || candidate.score as f64
                            >= self.opts.target_score_per_bp * read.sequence.len() as f64);
                alns.push(candidate);
                if accept {
                    break;
                }
            }
        }
        alns
    }

    /// Align a read against the subgraph around one chain of seeds.
    pub(crate) fn align_cluster(&self, read: &Alignment, cluster: &[Mem], cache: &mut CacheSet) -> Alignment {
        let mut count_fwd = 0usize;
        let mut count_rev = 0usize;
        for mem in cluster {
            if let Some(pos) = mem.positions.first() {
                if pos.is_reverse {
                    count_rev += 1;
                } else {
                    count_fwd += 1;
                }
            }
        }
        let sub = cluster_subgraph(&self.graph, &read.sequence, cluster, cache, &self.cancel);
        if sub.is_empty() {
            let mut unmapped = read.clone();
            unmapped.clear_alignment();
            return unmapped;
        }
        let mut aln_fwd = Alignment::default();
        let mut aln_rev = Alignment::default();
        if count_fwd > 0 {
            aln_fwd = self.aligners.align_maybe_flip(read, &self.graph, &sub, false);
        }
        if count_rev > 0 {
            aln_rev = self.aligners.align_maybe_flip(read, &self.graph, &sub, true);
        }
        let mut best = if aln_fwd.score + aln_rev.score == 0 {
            let mut unmapped = read.clone();
            unmapped.clear_alignment();
            return unmapped;
        } else if aln_rev.score > aln_fwd.score {
            aln_rev
        } else {
            aln_fwd
        };
        self.resolve_softclips(&mut best, sub);
        if self.opts.smooth_alignments {
            best = self.try_tail_smoothing(read, cluster, best);
        }
        best
    }

    // Soft-clip-driven re-extraction: grow the subgraph toward the clipped
    // end and realign until the clip is tolerable and the score stops
    // improving.
    pub(crate) fn resolve_softclips(&self, aln: &mut Alignment, mut sub: Subgraph) {
        if aln.path.is_empty() {
            return;
        }
        let flip = aln
            .path
            .start_position()
            .map(|p| p.is_reverse)
            .unwrap_or(false);
        let mut sc_start = softclip_start(aln);
        let mut sc_end = softclip_end(aln);
        let mut last_score = aln.score;
        let max_target_length = self.opts.max_target_factor * aln.sequence.len();
        let avg_node = self.graph.average_node_length().max(1.0);
        let mut iteration = 0;
        while iteration < self.opts.max_softclip_iterations
            && (sc_start > self.opts.softclip_threshold || sc_end > self.opts.softclip_threshold)
        {
            iteration += 1;
            let steps = self
                .opts
                .context_depth
                .max(((sc_start + sc_end) as f64 / avg_node) as usize);
            expand_context(&self.graph, &mut sub, steps);
            sub.remove_orphan_edges();
            if self.opts.max_target_factor > 0 && sub.total_length() > max_target_length {
                break;
            }
            let candidate = self.aligners.align_maybe_flip(aln, &self.graph, &sub, flip);
            if candidate.score <= last_score {
                // not improving; a wider window will not help
                break;
            }
            last_score = candidate.score;
            sc_start = softclip_start(&candidate);
            sc_end = softclip_end(&candidate);
            *aln = candidate;
        }
    }

    // When a clipped alignment has a walkable exact seed, try splicing tails
    // along the haplotype walks instead and keep whichever scores better.
    fn try_tail_smoothing(&self, read: &Alignment, cluster: &[Mem], best: Alignment) -> Alignment {
        let clipped = softclip_start(&best) + softclip_end(&best);
        if clipped <= self.opts.softclip_threshold {
            return best;
        }
        let anchor = cluster
            .iter()
            .filter(|m| !m.positions.is_empty())
            .max_by_key(|m| m.len());
        let anchor = match anchor {
            Some(anchor) => anchor,
            None => return best,
        };
        let ext = match extend_seed(
            &self.graph,
            &read.sequence,
            anchor.begin,
            anchor.end,
            anchor.positions[0],
            self.aligners.scoring.match_score,
        ) {
            Some(ext) => ext,
            None => return best,
        };
        match crate::tail::align_tails(&self.graph, &self.aligners, read, &ext, &self.cancel) {
            Some(mut stitched) => {
                stitched.score = self.aligners.score_alignment(&self.graph, &stitched);
                stitched.identity = stitched.compute_identity();
                if stitched.score > best.score {
                    trace!("tail smoothing improved {} from {} to {}", read.name, best.score, stitched.score);
                    stitched
                } else {
                    best
                }
            }
            None => best,
        }
    }

    /// Legacy clusterer: group hits by node-id locality and align each
    /// cluster's id-range subgraph in the orientation its hits suggest.
    pub(crate) fn mems_id_clusters_to_alignments(
        &self,
        read: &Alignment,
        mems: &[Mem],
        additional_multimaps: usize,
        _stride: usize,
    ) -> Vec<Alignment> {
        let total_multimaps = self.opts.max_multimaps + additional_multimaps;
        let usable: Vec<Mem> = mems
            .iter()
            .filter(|m| {
                self.opts.hit_size_threshold == 0 || m.match_count <= self.opts.hit_size_threshold
            })
            .cloned()
            .collect();
        // strand tallies per node
        let mut fwd_nodes: std::collections::HashMap<NodeId, usize> = Default::default();
        let mut rev_nodes: std::collections::HashMap<NodeId, usize> = Default::default();
        for mem in &usable {
            for pos in &mem.positions {
                if pos.is_reverse {
                    *rev_nodes.entry(pos.node).or_default() += 1;
                } else {
                    *fwd_nodes.entry(pos.node).or_default() += 1;
                }
            }
        }
        let clusters = id_clusters(&usable, self.opts.thread_extension, self.opts.max_thread_gap);
        let max_target_length = self.opts.max_target_factor * read.sequence.len();
        let mut alns: Vec<Alignment> = Vec::new();
        let mut attempts = 0usize;
        for cluster in &clusters {
            if self.cancel.tripped() {
                break;
            }
            if cluster.ids.len() < self.opts.cluster_min {
                continue;
            }
            attempts += 1;
            if attempts > self.opts.max_attempts.max(total_multimaps) {
                break;
            }
            let lo = *cluster.ids.first().unwrap();
            let hi = *cluster.ids.last().unwrap();
            let sub = id_range_subgraph(&self.graph, lo, hi, self.opts.context_depth);
            if self.opts.max_target_factor > 0 && sub.total_length() > max_target_length {
                continue;
            }
            let fwd_hits: usize = cluster.ids.iter().filter_map(|id| fwd_nodes.get(id)).sum();
            let rev_hits: usize = cluster.ids.iter().filter_map(|id| rev_nodes.get(id)).sum();
            for (hits, flip) in [(fwd_hits, false), (rev_hits, true)] {
                if hits == 0 {
                    continue;
                }
                if self.opts.prefer_forward && flip && !alns.is_empty() {
                    if let Some(best_fwd) = alns.iter().map(|a| a.identity).reduce(f64::max) {
                        if best_fwd >= self.opts.accept_identity {
                            continue;
                        }
                    }
                }
                let mut aln = self.aligners.align_maybe_flip(read, &self.graph, &sub, flip);
                self.resolve_softclips(&mut aln, sub.clone());
                let accepted = self.opts.greedy_accept && aln.identity >= self.opts.accept_identity;
                alns.push(aln);
                if accepted && attempts >= total_multimaps {
                    return alns;
                }
            }
        }
        alns
    }

    /// Approximate linear coordinate of an alignment's start.
    pub(crate) fn approx_alignment_position(&self, aln: &Alignment) -> i64 {
        aln.path
            .start_position()
            .map(|p| self.graph.approx_position(p))
            .unwrap_or(-1)
    }

    /// Signed approximate fragment length between two alignments.
    pub(crate) fn approx_fragment_length(&self, aln1: &Alignment, aln2: &Alignment) -> i64 {
        let p1 = self.approx_alignment_position(aln1);
        let p2 = self.approx_alignment_position(aln2);
        if p1 < 0 || p2 < 0 {
            return i64::MAX / 4;
        }
        p2 - p1
    }

    /// Mean per-path positions of an alignment, for pair consistency checks.
    pub(crate) fn alignment_mean_path_positions(
        &self,
        aln: &Alignment,
        first_hit_only: bool,
    ) -> std::collections::HashMap<String, f64> {
        self.paths
            .alignment_mean_positions(aln, first_hit_only, |id| self.graph.node_len(id))
    }

    /// Whether two mates' path positions are compatible with one fragment.
    pub(crate) fn alignments_consistent(
        &self,
        pos1: &std::collections::HashMap<String, f64>,
        pos2: &std::collections::HashMap<String, f64>,
        fragment_size_bound: i64,
    ) -> bool {
        for (name, mean1) in pos1 {
            if let Some(mean2) = pos2.get(name) {
                if (mean1 - mean2).abs() < fragment_size_bound as f64 {
                    return true;
                }
            }
        }
        false
    }

    /// The node likely to hold the mate of an anchored alignment, following
    /// the learned orientation and direction.
    pub(crate) fn likely_mate_position(&self, aln: &Alignment, _is_first_mate: bool) -> Option<Pos> {
        let start = aln.path.start_position()?;
        let aln_pos = self.approx_alignment_position(aln);
        if aln_pos < 0 {
            return None;
        }
        let delta = self.fragment_model.cached_mean as i64;
        let forward = self.fragment_model.cached_direction;
        let target_coord = if forward == !start.is_reverse { aln_pos + delta } else { aln_pos - delta };
        let target = self.graph.node_approximately_at(target_coord);
        let is_reverse = if self.fragment_model.cached_orientation {
            start.is_reverse
        } else {
            !start.is_reverse
        };
        Some(Pos::new(target, 0, is_reverse))
    }

    /// Debug helper mirroring the structural checks in release asserts.
    pub fn check_alignment(&self, aln: &Alignment) -> Result<(), String> {
        self.aligners.check_alignment(&self.graph, aln)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::Handle;

    fn build_mapper(nodes: &[(NodeId, &str)], edges: &[(NodeId, NodeId)], opts: MapperOpts) -> Mapper {
        let mut g = GraphIndex::new();
        for &(id, seq) in nodes {
            g.add_node(id, seq);
        }
        for &(a, b) in edges {
            g.add_edge(Handle::forward(a), Handle::forward(b));
        }
        let walk: Vec<Handle> = {
            let mut ids: Vec<NodeId> = nodes.iter().map(|&(id, _)| id).collect();
            ids.sort_unstable();
            ids.into_iter().map(Handle::forward).collect()
        };
        g.add_walk("ref", walk);
        g.finalize();
        let graph = Arc::new(g);
        let suffix = Arc::new(SuffixIndex::build(&graph));
        let paths = Arc::new(PathPositions::build(&graph));
        Mapper::new(graph, suffix, paths, opts).unwrap()
    }

    #[test]
    fn empty_graph_is_a_config_error() {
        let g = Arc::new(GraphIndex::new());
        let suffix = Arc::new(SuffixIndex::build(&g));
        let paths = Arc::new(PathPositions::build(&g));
        assert!(Mapper::new(g, suffix, paths, MapperOpts::default()).is_err());
    }

    #[test]
    fn bad_reseed_is_a_config_error() {
        let mut g = GraphIndex::new();
        g.add_node(1, "ACGT");
        g.finalize();
        let graph = Arc::new(g);
        let suffix = Arc::new(SuffixIndex::build(&graph));
        let paths = Arc::new(PathPositions::build(&graph));
        let opts = MapperOpts { min_mem_length: 10, mem_reseed_length: 5, ..Default::default() };
        assert!(Mapper::new(graph, suffix, paths, opts).is_err());
    }

    #[test]
    fn empty_read_returns_unmapped() {
        let mapper = build_mapper(&[(1, "ACGTACGT")], &[], MapperOpts::default());
        let mut cache = CacheSet::default();
        let aln = mapper.align_single(&Alignment::from_sequence("e", ""), 0, 0, 0, 0, &mut cache);
        assert!(!aln.is_mapped());
        assert_eq!(aln.score, 0);
        assert_eq!(aln.mapping_quality, 0);
    }

    #[test]
    fn exact_read_maps_with_full_bonus() {
        let mapper = build_mapper(&[(1, "ACGTACGT")], &[], MapperOpts::default());
        let mut cache = CacheSet::default();
        let aln = mapper.align_single(&Alignment::from_sequence("r", "ACGT"), 0, 0, 0, 0, &mut cache);
        assert_eq!(aln.score, 4 + 10);
        assert!((aln.identity - 1.0).abs() < 1e-9);
        assert_eq!(aln.mapping_quality, 60);
        assert_eq!(aln.path.mappings.len(), 1);
        assert_eq!(aln.path.mappings[0].position, Pos::new(1, 0, false));
        assert!(!aln.is_secondary);
    }

    #[test]
    fn multi_results_descend_and_mark_secondaries() {
        let opts = MapperOpts { max_multimaps: 4, ..Default::default() };
        let mapper = build_mapper(
            &[(1, "ACGGTTGACA"), (2, "TTGGCCAACT"), (3, "ACGGTTGACA")],
            &[(1, 2), (2, 3)],
            opts,
        );
        let mut cache = CacheSet::default();
        let alns = mapper.align_multi(&Alignment::from_sequence("r", "ACGGTTGACA"), 0, 0, 0, 0, &mut cache);
        assert!(!alns.is_empty());
        assert!(!alns[0].is_secondary);
        for pair in alns.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for aln in alns.iter().skip(1) {
            assert!(aln.is_secondary);
        }
        // ambiguous placement: two identical nodes
        assert_eq!(alns[0].mapping_quality, 0);
    }

    #[test]
    fn substitution_read_keeps_identity() {
        let mapper = build_mapper(&[(1, "ACGTACGT")], &[], MapperOpts::default());
        let mut cache = CacheSet::default();
        let aln = mapper.align_single(&Alignment::from_sequence("r", "ACGTACCT"), 0, 0, 0, 0, &mut cache);
        assert_eq!(aln.score, 7 - 4 + 10);
        assert!((aln.identity - 7.0 / 8.0).abs() < 1e-9);
        let edits = &aln.path.mappings[0].edits;
        assert_eq!(edits.len(), 3);
        assert!(edits[1].is_sub());
    }

    #[test]
    fn legacy_clusterer_still_maps() {
        let opts = MapperOpts { mem_chaining: false, ..Default::default() };
        let mapper = build_mapper(
            &[(1, "ACGT"), (2, "GGGG"), (3, "TTTT")],
            &[(1, 2), (2, 3)],
            opts,
        );
        let mut cache = CacheSet::default();
        let aln =
            mapper.align_single(&Alignment::from_sequence("r", "ACGTGGGGTTTT"), 0, 0, 0, 0, &mut cache);
        assert_eq!(aln.score, 12 + 10);
        assert!((aln.identity - 1.0).abs() < 1e-9);
        assert_eq!(aln.path.mappings.len(), 3);
    }

    #[test]
    fn cancellation_returns_unmapped_not_panic() {
        use std::sync::atomic::AtomicBool;
        let mut mapper = build_mapper(&[(1, "ACGTACGT")], &[], MapperOpts::default());
        mapper.cancel = CancelToken::new(Arc::new(AtomicBool::new(true)));
        let mut cache = CacheSet::default();
        let aln = mapper.align_single(&Alignment::from_sequence("r", "ACGT"), 0, 0, 0, 0, &mut cache);
        assert_eq!(aln.sequence, "ACGT");
        assert!(!aln.is_mapped());
    }
}

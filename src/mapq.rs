//! Phred-scaled mapping quality from alternative alignment scores.
//!
//! The approximate method scales the gap between the two best scores; the
//! exact method softmaxes the whole score list. Alignments that overlap the
//! primary on the query beyond `mq_overlap` are counted into a separate
//! bucket that divides the final quality, and an ambiguous clustering stage
//! can cap it further.

use crate::align::dp::Scoring;
use crate::model::{query_overlap, Alignment};

/// How mapping quality is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingQualityMethod {
    Approx,
    Exact,
    None,
}

// natural log of the DNA alphabet size, the per-score-unit information
// content for a match-score-normalized model
fn log_base(scoring: &Scoring) -> f64 {
    (4.0f64).ln() / scoring.match_score.max(1) as f64
}

fn quality_scale(scoring: &Scoring) -> f64 {
    10.0 / std::f64::consts::LN_10 * log_base(scoring)
}

/// Number of alternates whose query overlap with the primary exceeds the
/// given fraction of the read length.
pub fn sub_overlaps_of_first_aln(alns: &[Alignment], overlap_fraction: f64) -> usize {
    let first = match alns.first() {
        Some(first) => first,
        None => return 0,
    };
    let seq_len = first.sequence.len().max(1);
    alns.iter()
        .skip(1)
        .filter(|aln| query_overlap(first, aln) as f64 / seq_len as f64 >= overlap_fraction)
        .count()
}

/// Mapping quality from a descending score list.
pub fn mapping_quality(
    scores: &[i32],
    scoring: &Scoring,
    method: MappingQualityMethod,
    max_mapping_quality: i32,
    cluster_mq: f64,
    use_cluster_mq: bool,
    sub_overlaps: usize,
) -> i32 {
    if scores.is_empty() || scores[0] <= 0 || method == MappingQualityMethod::None {
        return 0;
    }
    let mut mq = match method {
        MappingQualityMethod::Approx => {
            let second = scores.get(1).copied().unwrap_or(0).max(0);
            quality_scale(scoring) * (scores[0] - second) as f64
        }
        MappingQualityMethod::Exact => {
            let lb = log_base(scoring);
            let top = scores[0] as f64;
            let mut total = 0.0;
            for &s in scores {
                total += (lb * (s as f64 - top)).exp();
            }
            let p_best = 1.0 / total;
            if p_best >= 1.0 {
                f64::from(max_mapping_quality)
            } else {
                -10.0 * (1.0 - p_best).log10()
            }
        }
        MappingQualityMethod::None => unreachable!(),
    };
    if use_cluster_mq {
        mq = mq.min(cluster_mq);
    }
    if sub_overlaps > 0 {
        mq /= (sub_overlaps + 1) as f64;
    }
    mq.round().clamp(0.0, f64::from(max_mapping_quality)) as i32
}

/// Set qualities on a descending-score alignment list; the primary gets the
/// estimate and the alternates zero.
pub fn compute_mapping_qualities(
    alns: &mut [Alignment],
    scoring: &Scoring,
    method: MappingQualityMethod,
    max_mapping_quality: i32,
    mq_overlap: f64,
    cluster_mq: f64,
    use_cluster_mq: bool,
) {
    if alns.is_empty() {
        return;
    }
    let sub_overlaps = sub_overlaps_of_first_aln(alns, mq_overlap);
    let scores: Vec<i32> = alns.iter().map(|a| a.score).collect();
    let mq = mapping_quality(
        &scores,
        scoring,
        method,
        max_mapping_quality,
        cluster_mq,
        use_cluster_mq,
        sub_overlaps,
    );
    for (i, aln) in alns.iter_mut().enumerate() {
        aln.mapping_quality = if i == 0 && aln.is_mapped() { mq } else { 0 };
    }
}

/// Paired variant: qualities from the pairwise score sums, applied to both
/// mates of the primary pair.
#[allow(clippy::too_many_arguments)]
pub fn compute_paired_mapping_qualities(
    first: &mut [Alignment],
    second: &mut [Alignment],
    scoring: &Scoring,
    method: MappingQualityMethod,
    max_mapping_quality: i32,
    mq_overlap: f64,
    cluster_mq: f64,
    use_cluster_mq: bool,
) {
    if first.is_empty() || second.is_empty() {
        return;
    }
    let sub_overlaps =
        sub_overlaps_of_first_aln(first, mq_overlap) + sub_overlaps_of_first_aln(second, mq_overlap);
    let n = first.len().min(second.len());
    let sums: Vec<i32> = (0..n).map(|i| first[i].score + second[i].score).collect();
    let mq = mapping_quality(
        &sums,
        scoring,
        method,
        max_mapping_quality,
        cluster_mq,
        use_cluster_mq,
        sub_overlaps,
    );
    for (i, aln) in first.iter_mut().enumerate() {
        aln.mapping_quality = if i == 0 && aln.is_mapped() { mq } else { 0 };
    }
    for (i, aln) in second.iter_mut().enumerate() {
        aln.mapping_quality = if i == 0 && aln.is_mapped() { mq } else { 0 };
    }
}

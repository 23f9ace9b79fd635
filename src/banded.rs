//! Banded split alignment for reads longer than the band width.
//!
//! The read is cut into half-overlapping segments, each segment is aligned
//! on its own (optionally multi-mapping), overlaps are trimmed, and the
//! best concatenation is resolved by dynamic programming over segment
//! boundaries keyed on position adjacency.

use log::{debug, trace};
use rayon::prelude::*;

use crate::align::facade::Aligners;
use crate::index::graph::GraphIndex;
use crate::model::{
    merge_alignments, strip_from_end, strip_from_start, Alignment, Edit, Pos,
};
use crate::subgraph::positions_context;

/// One segment of the read plus how much to trim from each side after
/// alignment.
#[derive(Clone, Debug)]
struct Band {
    alignment: Alignment,
    strip_front: usize,
    strip_back: usize,
}

/// Cut the read into `2 * div - 1` half-overlapping segments.
fn make_bands(read: &Alignment, band_width: usize) -> (Vec<Band>, usize) {
    let len = read.sequence.len();
    let mut band_width = band_width;
    if band_width % 4 != 0 {
        band_width = band_width - band_width % 4 + 4;
    }
    let mut div = 2usize;
    while len / div > band_width {
        div += 1;
    }
    let mut segment = len / div;
    if segment % 4 != 0 {
        segment = segment - segment % 4 + 4;
    }
    let to_align = div * 2 - 1;
    let mut bands: Vec<Band> = Vec::with_capacity(to_align);
    let slice = |from: usize, to: usize| -> Alignment {
        let to = to.min(len);
        let mut piece = Alignment::from_sequence(&read.name, &read.sequence[from..to]);
        if !read.quality.is_empty() {
            piece.quality = read.quality[from..to.min(read.quality.len())].to_vec();
        }
        piece
    };
    for i in 0..div {
        let off = i * segment;
        let mut addl = 0usize;
        let even = if i + 1 == div {
            // keep the final segment full length
            let last_off = len.saturating_sub(segment);
            if off > last_off {
                addl = off - last_off;
                slice(last_off, len)
            } else {
                slice(off, len)
            }
        } else {
            slice(off, off + segment)
        };
        bands.push(Band {
            alignment: even,
            strip_front: if i == 0 { 0 } else { segment / 4 + addl },
            strip_back: if i + 1 == div { 0 } else { segment / 4 },
        });
        if i + 1 != div {
            let odd = slice(off + segment / 2, off + segment / 2 + segment);
            let shortfall = segment.saturating_sub(odd.sequence.len());
            bands.push(Band {
                alignment: odd,
                strip_front: segment / 4,
                strip_back: (segment / 4).saturating_sub(shortfall),
            });
        }
    }
    (bands, segment)
}

// last consumed base of an alignment's path
fn path_last_position(aln: &Alignment) -> Option<Pos> {
    let end = aln.path.end_position()?;
    if end.offset == 0 {
        return None;
    }
    Some(Pos::new(end.node, end.offset - 1, end.is_reverse))
}

fn adjacent_positions(graph: &GraphIndex, a: Pos, b: Pos) -> bool {
    if a.node == b.node && a.is_reverse == b.is_reverse && a.offset + 1 == b.offset {
        return true;
    }
    let context = positions_context(graph, a.node, b.node);
    context.adjacent(a, b)
}

/// Resolve the best-scoring traversal of per-band multi-mappings. Each band
/// carries its candidates plus a zero-score unmapped sentinel.
fn resolve_banded_multi(graph: &GraphIndex, multi: &[Vec<Alignment>]) -> Vec<Alignment> {
    // (accumulated score, candidate index, parent candidate index)
    let mut scores: Vec<Vec<(i32, usize, usize)>> = Vec::with_capacity(multi.len());
    scores.push(multi[0].iter().enumerate().map(|(j, a)| (a.score, j, 0)).collect());
    for i in 1..multi.len() {
        let prev = &scores[i - 1];
        let mut best_idx = 0;
        let mut unmapped_idx = 0;
        for (j, entry) in prev.iter().enumerate() {
            if entry.0 > prev[best_idx].0 {
                best_idx = j;
            }
            if entry.0 == 0 || multi[i - 1][entry.1].path.is_empty() {
                unmapped_idx = j;
            }
        }
        let mut row: Vec<(i32, usize, usize)> = Vec::with_capacity(multi[i].len());
        for (j, aln) in multi[i].iter().enumerate() {
            if aln.score == 0 || aln.path.is_empty() {
                row.push((prev[best_idx].0, j, best_idx));
                continue;
            }
            let curr_start = aln.path.start_position().unwrap();
            let mut best_candidate: Option<(i32, usize)> = None;
            for (k, &(prev_score, prev_j, _)) in prev.iter().enumerate() {
                let old = &multi[i - 1][prev_j];
                if old.score == 0 || old.path.is_empty() {
                    continue;
                }
                if let Some(prev_end) = path_last_position(old) {
                    if adjacent_positions(graph, prev_end, curr_start)
                        && best_candidate.map(|(s, _)| prev_score > s).unwrap_or(true)
                    {
                        best_candidate = Some((prev_score, k));
                    }
                }
            }
            match best_candidate {
                Some((score, k)) => row.push((score + aln.score, j, k)),
                None => {
                    // no adjacent predecessor: inherit the best mapped
                    // previous score, or the unmapped sentinel
                    let fallback = if multi[i - 1][prev[best_idx].1].path.is_empty() {
                        unmapped_idx
                    } else {
                        best_idx
                    };
                    row.push((prev[fallback].0, j, fallback));
                }
            }
        }
        scores.push(row);
    }
    // walk back from the best final entry
    let last = scores.len() - 1;
    let mut at = (0..scores[last].len())
        .max_by_key(|&j| scores[last][j].0)
        .unwrap_or(0);
    let mut chosen: Vec<Alignment> = vec![Alignment::default(); multi.len()];
    for i in (0..scores.len()).rev() {
        let (_, j, parent) = scores[i][at];
        chosen[i] = multi[i][j].clone();
        at = parent;
    }
    chosen
}

/// Align a long read by splitting it into bands. `align_band` maps one
/// segment and returns its candidates in descending score order.
pub fn align_banded(
    graph: &GraphIndex,
    aligners: &Aligners,
    read: &Alignment,
    band_width: usize,
    max_multimaps: usize,
    min_identity: f64,
    parallel: bool,
    align_band: &(dyn Fn(&Alignment) -> Vec<Alignment> + Sync),
) -> Alignment {
    debug!("banded alignment of {} bp at band width {}", read.sequence.len(), band_width);
    let (bands, segment) = make_bands(read, band_width);
    trace!("{} bands of segment size {}", bands.len(), segment);

    let do_band = |band: &Band| -> Vec<Alignment> {
        let mut candidates = align_band(&band.alignment);
        if max_multimaps <= 1 {
            candidates.truncate(1);
        }
        // always include an unaligned fallback
        let mut sentinel = band.alignment.clone();
        sentinel.clear_alignment();
        candidates.push(sentinel);
        for aln in candidates.iter_mut() {
            if aln.identity < min_identity && aln.is_mapped() {
                // treat as unmapped
                *aln = band.alignment.clone();
                aln.clear_alignment();
            }
            *aln = strip_from_start(aln, band.strip_front);
            *aln = strip_from_end(aln, band.strip_back);
        }
        candidates
    };

    let multi: Vec<Vec<Alignment>> = if parallel {
        bands.par_iter().map(do_band).collect()
    } else {
        bands.iter().map(do_band).collect()
    };

    let resolved = resolve_banded_multi(graph, &multi);

    // merge, folding unmapped stretches into neighboring mappings as
    // insertions so the read remains fully accounted for
    let mut pieces: Vec<Alignment> = Vec::new();
    let mut pending = String::new();
    for aln in resolved {
        if aln.path.is_empty() || aln.score == 0 {
            pending.push_str(&aln.sequence);
            continue;
        }
        let mut piece = aln.clone();
        if !pending.is_empty() {
            let first = piece.path.mappings.first_mut().unwrap();
            first.edits.insert(0, Edit::insertion(&pending));
            let mut seq = std::mem::take(&mut pending);
            seq.push_str(&piece.sequence);
            piece.sequence = seq;
        }
        pieces.push(piece);
    }
    if !pending.is_empty() {
        match pieces.last_mut() {
            Some(last) => {
                last.path.mappings.last_mut().unwrap().edits.push(Edit::insertion(&pending));
                last.sequence.push_str(&pending);
            }
            None => {
                // nothing mapped at all
                let mut unmapped = read.clone();
                unmapped.clear_alignment();
                return unmapped;
            }
        }
    }
    let mut merged = merge_alignments(&pieces);
    merged.name = read.name.clone();
    merged.sequence = read.sequence.clone();
    merged.quality = read.quality.clone();
    merged.score = aligners.score_alignment(graph, &merged);
    merged.identity = merged.compute_identity();
    merged
}

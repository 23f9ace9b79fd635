//! Maximal exact match discovery by backward search.
//!
//! The finder walks the read right to left, LF-extending a suffix-index
//! range. When the range dies, the match length limit is hit, or an
//! ambiguous base appears, the current match is emitted and the search jumps
//! to the suffix-tree parent to continue with a shorter match. Long matches
//! are optionally reseeded with strictly more frequent sub-MEMs.

use std::collections::HashSet;

use log::trace;

use crate::index::fm::{SaRange, SuffixIndex};
use crate::model::Pos;

/// A maximal exact match of a read interval against the index.
#[derive(Clone, Debug)]
pub struct Mem {
    /// Half-open read interval.
    pub begin: usize,
    pub end: usize,
    pub range: SaRange,
    /// Graph positions, filled only when `match_count` is under the hit cap.
    pub positions: Vec<Pos>,
    /// Total occurrences in the index; for sub-MEMs, occurrences independent
    /// of every containing parent.
    pub match_count: usize,
    /// 1 or 2 for paired reads, 0 otherwise.
    pub fragment: u8,
    /// Indices of MEMs that properly contain this sub-MEM.
    pub parents: Vec<usize>,
}

impl Mem {
    fn new(begin: usize, end: usize, range: SaRange) -> Mem {
        Mem { begin, end, range, positions: Vec::new(), match_count: 0, fragment: 0, parents: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub fn sequence<'a>(&self, read: &'a str) -> &'a str {
        &read[self.begin..self.end]
    }

    pub fn is_sub_mem(&self) -> bool {
        !self.parents.is_empty()
    }
}

/// Seed finder thresholds.
#[derive(Clone, Copy, Debug)]
pub struct SeedConfig {
    /// Upper bound on MEM length; 0 leaves the index order in charge.
    pub max_mem_length: usize,
    pub min_mem_length: usize,
    /// Reseed MEMs at least this long; 0 disables reseeding.
    pub reseed_length: usize,
    /// Windowed probe discovery instead of the exhaustive scan.
    pub fast_reseed: bool,
    /// Skip hit filling for MEMs with more occurrences than this; 0 is
    /// unlimited.
    pub hit_max: usize,
}

impl Default for SeedConfig {
    fn default() -> Self {
        SeedConfig { max_mem_length: 0, min_mem_length: 1, reseed_length: 0, fast_reseed: true, hit_max: 100 }
    }
}

/// Find the read's MEMs (and sub-MEMs where reseeding applies), returned in
/// read order.
pub fn find_mems(index: &SuffixIndex, read: &str, cfg: &SeedConfig) -> Result<Vec<Mem>, String> {
    if cfg.reseed_length > 0 && cfg.min_mem_length > cfg.reseed_length {
        return Err(format!(
            "minimum MEM length {} cannot exceed reseed length {}",
            cfg.min_mem_length, cfg.reseed_length
        ));
    }
    let bytes = read.as_bytes();
    let n = bytes.len();
    let full = index.full_range();
    let mut mems: Vec<Mem> = Vec::new();
    let mut sub_mems: Vec<Mem> = Vec::new();

    if n == 0 {
        // an empty sequence matches the entire index
        mems.push(Mem::new(0, 0, full));
        return Ok(mems);
    }

    let order = index.order();
    let max_len = if cfg.max_mem_length > 0 { cfg.max_mem_length.min(order) } else { order };

    let mut cursor: isize = n as isize - 1;
    let mut match_end = n;
    let mut range = full;
    let mut prev_iter_jumped_lcp = false;

    while cursor >= 0 {
        let at = cursor as usize;
        let sym = index.char2comp(bytes[at]);
        if sym == 0 {
            // ambiguity breaks the match outright
            let begin = at + 1;
            let mem_len = match_end - begin;
            if mem_len >= cfg.min_mem_length {
                mems.push(Mem::new(begin, match_end, range));
                maybe_reseed(index, read, &mems, at, mem_len, cfg, &mut sub_mems);
            }
            match_end = at;
            range = full;
            cursor -= 1;
            prev_iter_jumped_lcp = false;
            continue;
        }
        let last_range = range;
        range = index.lf(range, sym);
        let would_be = match_end - at;
        if range.is_empty() || would_be > max_len {
            if at + 1 == match_end {
                // a single mismatching character; restart past it so the
                // parent jump cannot spin in place
                let begin = at + 1;
                if match_end - begin >= cfg.min_mem_length {
                    mems.push(Mem::new(begin, match_end, last_range));
                }
                match_end = at;
                range = full;
                cursor -= 1;
                prev_iter_jumped_lcp = false;
            } else {
                let begin = at + 1;
                let mem_len = match_end - begin;
                if mem_len >= cfg.min_mem_length && !prev_iter_jumped_lcp {
                    mems.push(Mem::new(begin, match_end, last_range));
                }
                let (parent_range, lcp) = index.parent(last_range);
                let new_end = begin + lcp;
                if mem_len >= cfg.min_mem_length && !prev_iter_jumped_lcp {
                    maybe_reseed(index, read, &mems, new_end, mem_len, cfg, &mut sub_mems);
                }
                match_end = new_end;
                range = parent_range;
                prev_iter_jumped_lcp = true;
            }
        } else {
            prev_iter_jumped_lcp = false;
            cursor -= 1;
        }
    }
    // leftover match reaching the start of the read
    if match_end >= cfg.min_mem_length {
        mems.push(Mem::new(0, match_end, range));
        maybe_reseed(index, read, &mems, 0, match_end, cfg, &mut sub_mems);
    }

    // fill counts and hits
    for mem in &mut mems {
        mem.match_count = index.count(mem.range);
        if mem.match_count > 0 && (cfg.hit_max == 0 || mem.match_count <= cfg.hit_max) {
            mem.positions = index.locate(mem.range);
        }
    }
    if cfg.reseed_length > 0 && !sub_mems.is_empty() {
        fill_sub_mem_hits(index, &mems, &mut sub_mems, cfg.hit_max);
        mems.append(&mut sub_mems);
    }

    mems.sort_by(|a, b| (a.begin, a.end).cmp(&(b.begin, b.end)));
    trace!("found {} seeds over {} bp", mems.len(), n);
    Ok(mems)
}

fn maybe_reseed(
    index: &SuffixIndex,
    read: &str,
    mems: &[Mem],
    next_mem_end: usize,
    mem_len: usize,
    cfg: &SeedConfig,
    sub_mems: &mut Vec<Mem>,
) {
    if cfg.reseed_length == 0 || mem_len < cfg.reseed_length {
        return;
    }
    if cfg.fast_reseed {
        let min_sub = cfg.min_mem_length.max(mem_len / 2);
        find_sub_mems_fast(index, read, mems, next_mem_end, min_sub, sub_mems);
    } else {
        find_sub_mems(index, read, mems, next_mem_end, cfg.min_mem_length, sub_mems);
    }
}

// Exhaustive sub-MEM search: the same backward walk as the SMEM loop, but
// constrained to the parent MEM and to counts strictly above the parent's.
fn find_sub_mems(
    index: &SuffixIndex,
    read: &str,
    mems: &[Mem],
    next_mem_end: usize,
    min_mem_length: usize,
    sub_mems_out: &mut Vec<Mem>,
) {
    let bytes = read.as_bytes();
    let mem = mems.last().expect("sub-MEM search needs an anchor MEM");
    let parent_idx = mems.len() - 1;
    let parent_count = index.count(mem.range);

    let mut cursor: isize = mem.end as isize - 1;
    let mut sub_mem_end = mem.end;
    let mut range = index.full_range();
    let mut prev_iter_jumped_lcp = false;

    while cursor >= mem.begin as isize && sub_mem_end > next_mem_end {
        let at = cursor as usize;
        let last_range = range;
        range = index.lf(range, index.char2comp(bytes[at]));
        if index.count(range) <= parent_count {
            // no hits beyond the parent's; the previous interval was maximal
            let sub_mem_begin = at + 1;
            if sub_mem_end - sub_mem_begin >= min_mem_length && !prev_iter_jumped_lcp {
                push_sub_mem(mems, parent_idx, sub_mem_begin, sub_mem_end, last_range, sub_mems_out);
            }
            let (parent_range, lcp) = index.parent(last_range);
            sub_mem_end = sub_mem_begin + lcp;
            range = parent_range;
            prev_iter_jumped_lcp = true;
        } else {
            cursor -= 1;
            prev_iter_jumped_lcp = false;
        }
    }
    if sub_mem_end > next_mem_end
        && sub_mem_end - mem.begin >= min_mem_length
        && !prev_iter_jumped_lcp
    {
        push_sub_mem(mems, parent_idx, mem.begin, sub_mem_end, range, sub_mems_out);
    }
}

// Windowed probe search: slide a minimum-length probe through the parent,
// and when the probe is strictly more frequent than the parent, binary
// search for the longest extension that stays more frequent.
fn find_sub_mems_fast(
    index: &SuffixIndex,
    read: &str,
    mems: &[Mem],
    next_mem_end: usize,
    min_sub_mem_length: usize,
    sub_mems_out: &mut Vec<Mem>,
) {
    let bytes = read.as_bytes();
    let mem = mems.last().expect("sub-MEM search needs an anchor MEM");
    let parent_idx = mems.len() - 1;
    let parent_count = index.count(mem.range);

    let mut probe_end = mem.begin + min_sub_mem_length;
    if probe_end <= next_mem_end {
        probe_end = next_mem_end + 1;
    }
    while probe_end <= mem.end {
        let mut probe_begin = probe_end - min_sub_mem_length;
        let mut cursor: isize = probe_end as isize - 1;
        let mut range = index.full_range();
        let mut more_frequent = true;
        while cursor >= probe_begin as isize {
            range = index.lf(range, index.char2comp(bytes[cursor as usize]));
            if index.count(range) <= parent_count {
                more_frequent = false;
                break;
            }
            cursor -= 1;
        }
        if more_frequent {
            if probe_end == next_mem_end + 1 {
                // the probe was pushed right of the natural window, so walk
                // it back left as far as it stays more frequent
                while cursor >= mem.begin as isize {
                    let last_range = range;
                    range = index.lf(range, index.char2comp(bytes[cursor as usize]));
                    if index.count(range) <= parent_count {
                        range = last_range;
                        break;
                    }
                    cursor -= 1;
                }
                probe_begin = (cursor + 1) as usize;
            }
            // binary search the rightmost end that is still more frequent
            let mut left = probe_end;
            let mut right = mem.end;
            let mut sub_mem_range = range;
            while right > left {
                let middle = left + (right - left + 1) / 2;
                let mut range = index.full_range();
                let mut independent = true;
                let mut c: isize = middle as isize - 1;
                while c >= probe_begin as isize {
                    range = index.lf(range, index.char2comp(bytes[c as usize]));
                    if index.count(range) <= parent_count {
                        independent = false;
                        break;
                    }
                    c -= 1;
                }
                if independent {
                    left = middle;
                    sub_mem_range = range;
                } else {
                    right = middle - 1;
                }
            }
            push_sub_mem(mems, parent_idx, probe_begin, left, sub_mem_range, sub_mems_out);
            probe_end = left + 1;
        } else {
            probe_end = (cursor + min_sub_mem_length as isize + 1) as usize;
        }
    }
}

fn push_sub_mem(
    mems: &[Mem],
    parent_idx: usize,
    begin: usize,
    end: usize,
    range: SaRange,
    sub_mems_out: &mut Vec<Mem>,
) {
    let mut sub = Mem::new(begin, end, range);
    sub.parents.push(parent_idx);
    // earlier emitted MEMs lie to the right of the anchor; any whose begin is
    // at or left of ours also contains this sub-MEM
    for i in (0..parent_idx).rev() {
        if begin >= mems[i].begin {
            sub.parents.push(i);
        } else {
            break;
        }
    }
    sub_mems_out.push(sub);
}

// Counts for sub-MEMs exclude every containing parent's hits, and their
// position lists skip occurrences that coincide with a parent occurrence.
fn fill_sub_mem_hits(index: &SuffixIndex, mems: &[Mem], sub_mems: &mut [Mem], hit_max: usize) {
    for sub in sub_mems.iter_mut() {
        let total = index.count(sub.range);
        let mut independent = total;
        for &p in &sub.parents {
            independent = independent.saturating_sub(mems[p].match_count);
        }
        sub.match_count = independent;
        if independent == 0 || (hit_max != 0 && independent > hit_max) {
            continue;
        }
        // offsets of parent occurrences, shifted to where this sub-MEM
        // falls inside the parent
        let mut covered: HashSet<(usize, usize)> = HashSet::new();
        for &p in &sub.parents {
            let parent = &mems[p];
            let delta = sub.begin - parent.begin;
            for (thread, offset) in index.locate_offsets(parent.range) {
                covered.insert((thread, offset + delta));
            }
        }
        let mut positions: Vec<Pos> = index
            .locate_offsets(sub.range)
            .into_iter()
            .filter(|key| !covered.contains(key))
            .filter_map(|(thread, offset)| index.offset_to_position(thread, offset))
            .collect();
        positions.sort();
        positions.dedup();
        sub.positions = positions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::graph::{GraphIndex, Handle};

    fn indexed(seq: &str) -> SuffixIndex {
        let mut g = GraphIndex::new();
        g.add_node(1, seq);
        g.add_walk("ref", vec![Handle::forward(1)]);
        g.finalize();
        SuffixIndex::build(&g)
    }

    #[test]
    fn whole_read_is_one_mem() {
        let index = indexed("ACGGTGCATTTGAC");
        let cfg = SeedConfig::default();
        let mems = find_mems(&index, "GGTGCAT", &cfg).unwrap();
        assert_eq!(mems.len(), 1);
        assert_eq!((mems[0].begin, mems[0].end), (0, 7));
        assert_eq!(mems[0].match_count, 1);
        assert_eq!(mems[0].positions, vec![Pos::new(1, 2, false)]);
    }

    #[test]
    fn mismatch_splits_the_read() {
        let index = indexed("ACGGTGCATTTGAC");
        let cfg = SeedConfig { min_mem_length: 3, ..Default::default() };
        // read = prefix of the reference with a foreign block in the middle
        let mems = find_mems(&index, "ACGGTGCCCCATTTG", &cfg).unwrap();
        assert!(mems.len() >= 2);
        assert!(mems.iter().any(|m| m.begin == 0));
        assert!(mems.iter().all(|m| m.len() >= 3));
        // read order
        for pair in mems.windows(2) {
            assert!(pair[0].begin <= pair[1].begin);
        }
    }

    #[test]
    fn ambiguous_base_breaks_matches() {
        let index = indexed("ACGGTGCATTTGAC");
        let cfg = SeedConfig { min_mem_length: 2, ..Default::default() };
        let mems = find_mems(&index, "GGTGNCATT", &cfg).unwrap();
        // the N can appear inside no MEM
        for mem in &mems {
            assert!(!"GGTGNCATT"[mem.begin..mem.end].contains('N'));
        }
    }

    #[test]
    fn empty_read_matches_everything() {
        let index = indexed("ACGT");
        let mems = find_mems(&index, "", &SeedConfig::default()).unwrap();
        assert_eq!(mems.len(), 1);
        assert_eq!(mems[0].range, index.full_range());
    }

    #[test]
    fn bad_reseed_config_is_rejected() {
        let index = indexed("ACGT");
        let cfg = SeedConfig { min_mem_length: 10, reseed_length: 5, ..Default::default() };
        assert!(find_mems(&index, "ACGT", &cfg).is_err());
    }

    #[test]
    fn hit_cap_suppresses_position_filling() {
        let index = indexed("ACACACACACACAC");
        let cfg = SeedConfig { min_mem_length: 2, hit_max: 2, ..Default::default() };
        let mems = find_mems(&index, "ACAC", &cfg).unwrap();
        for mem in &mems {
            if mem.match_count > 2 {
                assert!(mem.positions.is_empty());
            } else if mem.match_count > 0 {
                assert_eq!(mem.positions.len().min(mem.match_count), mem.positions.len());
            }
        }
    }

    #[test]
    fn sub_mems_are_more_frequent_than_parents() {
        // parent-unique region containing a repeated core
        let reference = "TTGACCACGTACGTGGATCCAAGGACGTACGTCCTTGG";
        let index = indexed(reference);
        let cfg = SeedConfig {
            min_mem_length: 4,
            reseed_length: 8,
            fast_reseed: true,
            hit_max: 0,
            ..Default::default()
        };
        // matches reference[5..17] exactly, including one ACGTACGT copy
        let read = "CACGTACGTGGA";
        let mems = find_mems(&index, read, &cfg).unwrap();
        let parents: Vec<&Mem> = mems.iter().filter(|m| !m.is_sub_mem()).collect();
        let subs: Vec<&Mem> = mems.iter().filter(|m| m.is_sub_mem()).collect();
        assert_eq!(parents.len(), 1);
        assert!(!subs.is_empty());
        for sub in &subs {
            // independent occurrences only
            assert!(sub.match_count >= 1);
            for &pos in &sub.positions {
                // none of the surviving positions coincide with the parent hit
                assert!(parents[0].positions.iter().all(|&p| p != pos));
            }
            assert!(sub.begin >= parents[0].begin && sub.end <= parents[0].end);
        }
    }

    #[test]
    fn slow_reseed_also_finds_sub_mems() {
        let reference = "TTGACCACGTACGTGGATCCAAGGACGTACGTCCTTGG";
        let index = indexed(reference);
        let cfg = SeedConfig {
            min_mem_length: 4,
            reseed_length: 8,
            fast_reseed: false,
            hit_max: 0,
            ..Default::default()
        };
        let read = "CACGTACGTGGA";
        let mems = find_mems(&index, read, &cfg).unwrap();
        assert!(mems.iter().any(|m| m.is_sub_mem()));
    }
}

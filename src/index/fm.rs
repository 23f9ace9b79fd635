//! FM index over the graph's indexed walks.
//!
//! Both strands of every walk are concatenated with sentinels and indexed
//! with a plain suffix-array sort. The index answers the queries the seed
//! finder needs: LF steps for backward search, range counts, locate to graph
//! positions, and the suffix-tree parent operation backed by an LCP array.

use log::debug;

use crate::index::graph::{GraphIndex, Handle};
use crate::model::{reverse_complement, Pos};

/// Number of symbols: sentinel plus A/C/G/T.
const SIGMA: usize = 5;

/// An inclusive suffix-array interval; empty when `hi < lo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaRange {
    pub lo: usize,
    pub hi: usize,
}

impl SaRange {
    pub fn empty() -> SaRange {
        SaRange { lo: 1, hi: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.hi < self.lo
    }

    pub fn len(&self) -> usize {
        if self.is_empty() { 0 } else { self.hi - self.lo + 1 }
    }
}

// One indexed strand of one walk.
#[derive(Clone, Debug)]
struct Thread {
    // oriented node visits in text order
    steps: Vec<Handle>,
    // prefix sums of node lengths, one entry per step plus the total
    step_starts: Vec<usize>,
    len: usize,
}

impl Thread {
    // map a thread offset to a graph position
    fn position_at(&self, offset: usize) -> Option<Pos> {
        if offset >= self.len {
            return None;
        }
        let step = match self.step_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let handle = self.steps[step];
        Some(Pos { node: handle.node, offset: offset - self.step_starts[step], is_reverse: handle.is_reverse })
    }
}

/// The suffix index consumed by the seed finder.
pub struct SuffixIndex {
    text: Vec<u8>,
    sa: Vec<u32>,
    lcp: Vec<u32>,
    counts: [usize; SIGMA + 1],
    // cumulative symbol occurrences in the BWT, one row per prefix length
    occ: Vec<[u32; SIGMA]>,
    threads: Vec<Thread>,
    thread_starts: Vec<usize>,
    order: usize,
}

impl SuffixIndex {
    /// Build the index over the graph's walks. A graph without walks indexes
    /// each node on its own, forward strand plus reverse complement.
    pub fn build(graph: &GraphIndex) -> SuffixIndex {
        let mut strands: Vec<Vec<Handle>> = Vec::new();
        if graph.walks().is_empty() {
            for id in graph.node_ids() {
                strands.push(vec![Handle::forward(id)]);
            }
        } else {
            for walk in graph.walks() {
                strands.push(walk.handles.clone());
            }
        }
        // add the reverse strand of every walk
        let reverse_strands: Vec<Vec<Handle>> = strands
            .iter()
            .map(|handles| handles.iter().rev().map(|h| h.flip()).collect())
            .collect();
        strands.extend(reverse_strands);

        let mut text: Vec<u8> = Vec::new();
        let mut threads: Vec<Thread> = Vec::new();
        let mut thread_starts: Vec<usize> = Vec::new();
        let mut order = 0usize;
        for handles in strands {
            let mut seq = String::new();
            let mut step_starts = Vec::with_capacity(handles.len() + 1);
            for handle in &handles {
                step_starts.push(seq.len());
                let node_seq = graph.node_seq(handle.node).unwrap_or("");
                if handle.is_reverse {
                    seq.push_str(&reverse_complement(node_seq));
                } else {
                    seq.push_str(node_seq);
                }
            }
            step_starts.push(seq.len());
            order = order.max(seq.len());
            thread_starts.push(text.len());
            for byte in seq.bytes() {
                text.push(encode(byte));
            }
            text.push(0);
            threads.push(Thread { steps: handles, step_starts, len: seq.len() });
        }
        if text.is_empty() {
            text.push(0);
        }

        let sa = build_suffix_array(&text);
        let lcp = build_lcp(&text, &sa);

        let mut counts = [0usize; SIGMA + 1];
        for &c in &text {
            counts[c as usize + 1] += 1;
        }
        for i in 1..=SIGMA {
            counts[i] += counts[i - 1];
        }

        // BWT occurrence table, full resolution
        let n = text.len();
        let mut occ = Vec::with_capacity(n + 1);
        let mut row = [0u32; SIGMA];
        occ.push(row);
        for i in 0..n {
            let prev = if sa[i] == 0 { n - 1 } else { sa[i] as usize - 1 };
            row[text[prev] as usize] += 1;
            occ.push(row);
        }

        debug!("suffix index built over {} threads, {} bp of text", threads.len(), n);
        SuffixIndex { text, sa, lcp, counts, occ, threads, thread_starts, order }
    }

    /// Total length of the indexed text.
    pub fn size(&self) -> usize {
        self.text.len()
    }

    /// Longest match the index can report.
    pub fn order(&self) -> usize {
        self.order
    }

    /// The range matching the empty string.
    pub fn full_range(&self) -> SaRange {
        SaRange { lo: 0, hi: self.text.len() - 1 }
    }

    /// Map a base to its search symbol; anything outside A/C/G/T becomes the
    /// ambiguity symbol 0, which never matches.
    pub fn char2comp(&self, byte: u8) -> u8 {
        encode(byte)
    }

    /// One step of backward search: prepend symbol `c` to the pattern.
    pub fn lf(&self, range: SaRange, c: u8) -> SaRange {
        if c == 0 || c as usize >= SIGMA || range.is_empty() {
            return SaRange::empty();
        }
        let base = self.counts[c as usize];
        let lo = base + self.occ[range.lo][c as usize] as usize;
        let hi_count = self.occ[range.hi + 1][c as usize] as usize;
        if hi_count == 0 {
            return SaRange::empty();
        }
        SaRange { lo, hi: base + hi_count - 1 }
    }

    /// Number of occurrences in a range.
    pub fn count(&self, range: SaRange) -> usize {
        range.len()
    }

    /// Graph positions of every occurrence in the range, deduplicated.
    pub fn locate(&self, range: SaRange) -> Vec<Pos> {
        let mut out: Vec<Pos> = self
            .locate_offsets(range)
            .into_iter()
            .filter_map(|(thread, offset)| self.threads[thread].position_at(offset))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Map a raw (thread, offset) coordinate to a graph position.
    pub fn offset_to_position(&self, thread: usize, offset: usize) -> Option<Pos> {
        self.threads.get(thread)?.position_at(offset)
    }

    /// Raw (thread, thread offset) coordinates of every occurrence.
    pub fn locate_offsets(&self, range: SaRange) -> Vec<(usize, usize)> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(range.len());
        for i in range.lo..=range.hi {
            let at = self.sa[i] as usize;
            let thread = match self.thread_starts.binary_search(&at) {
                Ok(t) => t,
                Err(t) => t - 1,
            };
            let offset = at - self.thread_starts[thread];
            if offset < self.threads[thread].len {
                out.push((thread, offset));
            }
        }
        out
    }

    /// Suffix-tree parent of a range: the smallest strictly containing
    /// interval, together with its string depth.
    pub fn parent(&self, range: SaRange) -> (SaRange, usize) {
        let n = self.sa.len();
        if range.is_empty() || (range.lo == 0 && range.hi == n - 1) {
            return (self.full_range(), 0);
        }
        let left = if range.lo > 0 { self.lcp[range.lo] as usize } else { 0 };
        let right = if range.hi + 1 < n { self.lcp[range.hi + 1] as usize } else { 0 };
        let depth = left.max(right);
        if depth == 0 {
            return (self.full_range(), 0);
        }
        let mut lo = range.lo;
        let mut hi = range.hi;
        while lo > 0 && self.lcp[lo] as usize >= depth {
            lo -= 1;
        }
        while hi + 1 < n && self.lcp[hi + 1] as usize >= depth {
            hi += 1;
        }
        (SaRange { lo, hi }, depth)
    }
}

fn encode(byte: u8) -> u8 {
    match byte {
        b'A' | b'a' => 1,
        b'C' | b'c' => 2,
        b'G' | b'g' => 3,
        b'T' | b't' => 4,
        _ => 0,
    }
}

fn build_suffix_array(text: &[u8]) -> Vec<u32> {
    let mut sa: Vec<u32> = (0..text.len() as u32).collect();
    sa.sort_unstable_by(|&a, &b| text[a as usize..].cmp(&text[b as usize..]));
    sa
}

// Kasai's algorithm: lcp[i] is the longest common prefix of the suffixes at
// sa[i-1] and sa[i].
fn build_lcp(text: &[u8], sa: &[u32]) -> Vec<u32> {
    let n = text.len();
    let mut rank = vec![0u32; n];
    for (i, &s) in sa.iter().enumerate() {
        rank[s as usize] = i as u32;
    }
    let mut lcp = vec![0u32; n];
    let mut h = 0usize;
    for i in 0..n {
        let r = rank[i] as usize;
        if r > 0 {
            let j = sa[r - 1] as usize;
            while i + h < n && j + h < n && text[i + h] == text[j + h] && text[i + h] != 0 {
                h += 1;
            }
            lcp[r] = h as u32;
            h = h.saturating_sub(1);
        } else {
            h = 0;
        }
    }
    lcp
}

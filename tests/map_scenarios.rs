//! End-to-end single-read mapping scenarios on small graphs.

use std::sync::Arc;

use panmap::cache::CacheSet;
use panmap::index::fm::SuffixIndex;
use panmap::index::graph::{GraphIndex, Handle};
use panmap::index::paths::PathPositions;
use panmap::mapper::{Mapper, MapperOpts};
use panmap::model::{reverse_complement, softclip_end, softclip_start, Alignment, Pos};

fn build_mapper(nodes: &[(i64, &str)], edges: &[(i64, i64)], opts: MapperOpts) -> Mapper {
    let mut g = GraphIndex::new();
    for &(id, seq) in nodes {
        g.add_node(id, seq);
    }
    for &(a, b) in edges {
        g.add_edge(Handle::forward(a), Handle::forward(b));
    }
    let mut ids: Vec<i64> = nodes.iter().map(|&(id, _)| id).collect();
    ids.sort_unstable();
    g.add_walk("ref", ids.into_iter().map(Handle::forward).collect());
    g.finalize();
    let graph = Arc::new(g);
    let suffix = Arc::new(SuffixIndex::build(&graph));
    let paths = Arc::new(PathPositions::build(&graph));
    Mapper::new(graph, suffix, paths, opts).unwrap()
}

fn check_structure(mapper: &Mapper, aln: &Alignment) {
    if aln.is_mapped() {
        assert_eq!(aln.path.to_len(), aln.sequence.len(), "path must consume the whole read");
    }
    mapper.check_alignment(aln).unwrap();
    // identity is matches over read length
    assert!((aln.identity - aln.compute_identity()).abs() < 1e-9);
}

#[test]
fn single_node_exact_read() {
    let mapper = build_mapper(&[(1, "ACGTACGT")], &[], MapperOpts::default());
    let mut cache = CacheSet::default();
    let aln = mapper.align_single(&Alignment::from_sequence("s1", "ACGT"), 0, 0, 0, 0, &mut cache);
    assert_eq!(aln.path.mappings.len(), 1);
    assert_eq!(aln.path.mappings[0].position, Pos::new(1, 0, false));
    assert_eq!(aln.path.mappings[0].edits.len(), 1);
    assert!(aln.path.mappings[0].edits[0].is_match());
    assert_eq!(aln.score, 4 + 2 * 5);
    assert!((aln.identity - 1.0).abs() < 1e-9);
    assert_eq!(aln.mapping_quality, 60);
    check_structure(&mapper, &aln);
}

#[test]
fn read_spans_three_nodes() {
    let mapper = build_mapper(
        &[(1, "ACGT"), (2, "GGGG"), (3, "TTTT")],
        &[(1, 2), (2, 3)],
        MapperOpts::default(),
    );
    let mut cache = CacheSet::default();
    let aln = mapper.align_single(
        &Alignment::from_sequence("s2", "ACGTGGGGTTTT"),
        0,
        0,
        0,
        0,
        &mut cache,
    );
    assert_eq!(aln.path.mappings.len(), 3);
    for mapping in &aln.path.mappings {
        assert_eq!(mapping.edits.len(), 1);
        assert!(mapping.edits[0].is_match());
    }
    assert_eq!(aln.score, 12 + 10);
    assert!((aln.identity - 1.0).abs() < 1e-9);
    check_structure(&mapper, &aln);
}

#[test]
fn single_substitution() {
    let mapper = build_mapper(&[(1, "ACGTACGT")], &[], MapperOpts::default());
    let mut cache = CacheSet::default();
    let aln = mapper.align_single(&Alignment::from_sequence("s3", "ACGTACCT"), 0, 0, 0, 0, &mut cache);
    let edits = &aln.path.mappings[0].edits;
    assert_eq!(edits.len(), 3);
    assert!(edits[0].is_match() && edits[0].to_len == 6);
    assert!(edits[1].is_sub() && edits[1].sequence == "C");
    assert!(edits[2].is_match() && edits[2].to_len == 1);
    assert_eq!(aln.score, 7 - 4 + 10);
    assert!((aln.identity - 7.0 / 8.0).abs() < 1e-9);
    check_structure(&mapper, &aln);
}

#[test]
fn trailing_ambiguous_bases_soft_clip() {
    let mapper = build_mapper(&[(1, "ACGTACGT")], &[], MapperOpts::default());
    let mut cache = CacheSet::default();
    let aln =
        mapper.align_single(&Alignment::from_sequence("s4", "ACGTACGTNN"), 0, 0, 0, 0, &mut cache);
    assert_eq!(softclip_start(&aln), 0);
    assert_eq!(softclip_end(&aln), 2);
    // only the un-clipped left end earns the bonus
    assert_eq!(aln.score, 8 + 5);
    assert!((aln.identity - 0.8).abs() < 1e-9);
    check_structure(&mapper, &aln);
}

#[test]
fn reverse_complement_read_scores_identically() {
    let mapper = build_mapper(
        &[(1, "ACGGT"), (2, "GCATT"), (3, "TGACC")],
        &[(1, 2), (2, 3)],
        MapperOpts::default(),
    );
    let mut cache = CacheSet::default();
    let read = "GGTGCATTTG";
    let fwd = mapper.align_single(&Alignment::from_sequence("f", read), 0, 0, 0, 0, &mut cache);
    let rev = mapper.align_single(
        &Alignment::from_sequence("r", &reverse_complement(read)),
        0,
        0,
        0,
        0,
        &mut cache,
    );
    assert!(fwd.is_mapped() && rev.is_mapped());
    assert_eq!(fwd.score, rev.score);
    assert!((fwd.identity - rev.identity).abs() < 1e-9);
    // the reverse read maps to the same span on the other strand
    let fwd_nodes: Vec<i64> = fwd.path.mappings.iter().map(|m| m.position.node).collect();
    let mut rev_nodes: Vec<i64> = rev.path.mappings.iter().map(|m| m.position.node).collect();
    rev_nodes.reverse();
    assert_eq!(fwd_nodes, rev_nodes);
    check_structure(&mapper, &fwd);
    check_structure(&mapper, &rev);
}

#[test]
fn multimaps_are_sorted_and_flagged() {
    let opts = MapperOpts { max_multimaps: 4, ..Default::default() };
    let mapper = build_mapper(
        &[(1, "ACGGTTGACA"), (2, "TTGGCCAACT"), (3, "ACGGTTGACA")],
        &[(1, 2), (2, 3)],
        opts,
    );
    let mut cache = CacheSet::default();
    let alns = mapper.align_multi(&Alignment::from_sequence("m", "ACGGTTGACA"), 0, 0, 0, 0, &mut cache);
    assert!(!alns.is_empty());
    assert!(!alns[0].is_secondary);
    for (i, aln) in alns.iter().enumerate() {
        assert_eq!(aln.is_secondary, i > 0);
        check_structure(&mapper, aln);
    }
    for pair in alns.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn read_absent_from_graph_is_unmapped() {
    let mapper = build_mapper(&[(1, "AAAAAAAAAA")], &[], MapperOpts::default());
    let mut cache = CacheSet::default();
    let aln = mapper.align_single(&Alignment::from_sequence("x", "CGCGCGCG"), 0, 0, 0, 0, &mut cache);
    assert!(!aln.is_mapped());
    assert_eq!(aln.score, 0);
    assert_eq!(aln.mapping_quality, 0);
    assert_eq!(aln.identity, 0.0);
    assert_eq!(aln.sequence, "CGCGCGCG");
}

#[test]
fn variant_bubble_picks_the_matching_allele() {
    // SNP bubble: node 2 carries C, node 3 carries T
    let mut g = GraphIndex::new();
    g.add_node(1, "ACGTA");
    g.add_node(2, "C");
    g.add_node(3, "T");
    g.add_node(4, "GGATC");
    g.add_edge(Handle::forward(1), Handle::forward(2));
    g.add_edge(Handle::forward(1), Handle::forward(3));
    g.add_edge(Handle::forward(2), Handle::forward(4));
    g.add_edge(Handle::forward(3), Handle::forward(4));
    g.add_walk(
        "alpha",
        vec![Handle::forward(1), Handle::forward(2), Handle::forward(4)],
    );
    g.add_walk(
        "beta",
        vec![Handle::forward(1), Handle::forward(3), Handle::forward(4)],
    );
    g.finalize();
    let graph = Arc::new(g);
    let suffix = Arc::new(SuffixIndex::build(&graph));
    let paths = Arc::new(PathPositions::build(&graph));
    let mapper = Mapper::new(graph, suffix, paths, MapperOpts::default()).unwrap();
    let mut cache = CacheSet::default();

    let on_t = mapper.align_single(&Alignment::from_sequence("t", "ACGTATGGATC"), 0, 0, 0, 0, &mut cache);
    assert_eq!(on_t.score, 11 + 10);
    assert!(on_t.path.mappings.iter().any(|m| m.position.node == 3));
    assert!((on_t.identity - 1.0).abs() < 1e-9);

    let on_c = mapper.align_single(&Alignment::from_sequence("c", "ACGTACGGATC"), 0, 0, 0, 0, &mut cache);
    assert_eq!(on_c.score, 11 + 10);
    assert!(on_c.path.mappings.iter().any(|m| m.position.node == 2));
    check_structure(&mapper, &on_c);
}

#[test]
fn banded_split_reassembles_long_reads() {
    // a 4096 bp pseudo-random linear graph of 64 bp nodes
    let mut state = 0x9e3779b97f4a7c15u64;
    let mut seq = String::new();
    let mut g = GraphIndex::new();
    let mut handles = Vec::new();
    for i in 0..64 {
        let mut node_seq = String::with_capacity(64);
        for _ in 0..64 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            node_seq.push(match (state >> 33) % 4 {
                0 => 'A',
                1 => 'C',
                2 => 'G',
                _ => 'T',
            });
        }
        seq.push_str(&node_seq);
        g.add_node(i + 1, &node_seq);
        handles.push(Handle::forward(i + 1));
        if i > 0 {
            g.add_edge(Handle::forward(i), Handle::forward(i + 1));
        }
    }
    g.add_walk("ref", handles);
    g.finalize();
    let graph = Arc::new(g);
    let suffix = Arc::new(SuffixIndex::build(&graph));
    let paths = Arc::new(PathPositions::build(&graph));
    let mapper = Mapper::new(graph, suffix, paths, MapperOpts::default()).unwrap();
    let mut cache = CacheSet::default();

    let aln = mapper.align_single(&Alignment::from_sequence("long", &seq), 0, 0, 0, 256, &mut cache);
    assert_eq!(aln.path.to_len(), 4096);
    assert_eq!(aln.score, 4096 + 10);
    assert!((aln.identity - 1.0).abs() < 1e-9);
    check_structure(&mapper, &aln);
}

#[test]
fn quality_strings_survive_mapping() {
    let opts = MapperOpts { adjust_alignments_for_base_quality: true, ..Default::default() };
    let mapper = build_mapper(&[(1, "ACGTACGT")], &[], opts);
    let mut cache = CacheSet::default();
    let mut read = Alignment::from_sequence("q", "ACGTACGT");
    read.quality = vec![40; 8];
    let aln = mapper.align_single(&read, 0, 0, 0, 0, &mut cache);
    assert!(aln.is_mapped());
    assert_eq!(aln.quality, vec![40; 8]);
    assert!((aln.identity - 1.0).abs() < 1e-9);
}

//! End-to-end paired mapping: fragment model learning, deferral, rescue.

use std::sync::Arc;

use panmap::cache::CacheSet;
use panmap::index::fm::SuffixIndex;
use panmap::index::graph::{GraphIndex, Handle};
use panmap::index::paths::PathPositions;
use panmap::mapper::{Mapper, MapperOpts};
use panmap::model::{reverse_complement, Alignment};

// two copies of a distinctive 20 bp block separated by 300 bp of linear path
fn paired_graph() -> GraphIndex {
    let block = "AAAAACCCCCGGGGGTTTTT";
    let mut spacer = String::new();
    let mut state = 0x51f15eedu64;
    for _ in 0..300 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        spacer.push(match (state >> 33) % 4 {
            0 => 'A',
            1 => 'C',
            2 => 'G',
            _ => 'T',
        });
    }
    let mut g = GraphIndex::new();
    g.add_node(1, block);
    g.add_node(2, &spacer);
    g.add_node(3, block);
    g.add_edge(Handle::forward(1), Handle::forward(2));
    g.add_edge(Handle::forward(2), Handle::forward(3));
    g.add_walk("ref", vec![Handle::forward(1), Handle::forward(2), Handle::forward(3)]);
    g.finalize();
    g
}

fn build_mapper(opts: MapperOpts) -> Mapper {
    let graph = Arc::new(paired_graph());
    let suffix = Arc::new(SuffixIndex::build(&graph));
    let paths = Arc::new(PathPositions::build(&graph));
    Mapper::new(graph, suffix, paths, opts).unwrap()
}

// mates 10 bp apart on opposite strands within one block copy
fn perfect_pair() -> (Alignment, Alignment) {
    let read1 = Alignment::from_sequence("frag/1", "AAAAACCCCC");
    let read2 = Alignment::from_sequence("frag/2", &reverse_complement("GGGGGTTTTT"));
    (read1, read2)
}

#[test]
fn pair_lists_are_parallel_with_mate_links() {
    let mut mapper = build_mapper(MapperOpts::default());
    let mut cache = CacheSet::default();
    let (read1, read2) = perfect_pair();
    let out = mapper.align_paired(&read1, &read2, &mut cache);
    assert_eq!(out.first.len(), out.second.len());
    assert!(!out.first.is_empty());
    for (i, aln) in out.first.iter().enumerate() {
        assert_eq!(aln.fragment_next.as_deref(), Some("frag/2"));
        assert_eq!(aln.is_secondary, i > 0);
    }
    for aln in &out.second {
        assert_eq!(aln.fragment_prev.as_deref(), Some("frag/1"));
    }
}

#[test]
fn repeated_perfect_pairs_learn_the_distribution() {
    let mut mapper = build_mapper(MapperOpts::default());
    let mut cache = CacheSet::default();
    let (read1, read2) = perfect_pair();
    for _ in 0..32 {
        let out = mapper.align_paired(&read1, &read2, &mut cache);
        assert!(!out.queued_for_later);
    }
    let model = mapper.fragment_model();
    assert!(model.is_learned());
    assert!((model.cached_mean - 10.0).abs() < 2.0, "mean was {}", model.cached_mean);
    // the pair was constructed on opposite strands
    assert!(!model.cached_orientation);
    // fragment_size tracks mean + sigma * stdev
    let expect = model.cached_mean + 10.0 * model.cached_stdev;
    assert_eq!(model.fragment_size, expect.round() as i64);
}

#[test]
fn pairs_resolve_across_the_ambiguous_copies() {
    let mut mapper = build_mapper(MapperOpts::default());
    let mut cache = CacheSet::default();
    let (read1, read2) = perfect_pair();
    for _ in 0..16 {
        mapper.align_paired(&read1, &read2, &mut cache);
    }
    let out = mapper.align_paired(&read1, &read2, &mut cache);
    // both mates placed, in the same copy of the repeat
    let a1 = &out.first[0];
    let a2 = &out.second[0];
    assert!(a1.is_mapped() && a2.is_mapped());
    let n1 = a1.path.mappings[0].position.node;
    let n2 = a2.path.mappings[0].position.node;
    assert_eq!(n1, n2, "mates landed on different repeat copies");
    // fragment records carry the per-path length
    assert!(!a1.fragment.is_empty());
    assert_eq!(a1.fragment[0].path_name, "ref");
    assert!((a1.fragment[0].length.abs() - 10).abs() <= 2);
}

#[test]
fn imperfect_pair_defers_until_model_learned_then_rescues() {
    let mut mapper = build_mapper(MapperOpts::default());
    let mut cache = CacheSet::default();
    let (read1, read2) = perfect_pair();
    // a mate that cannot seed anywhere in the graph
    let broken = Alignment::from_sequence("frag/2", "GTGTGTGTAC");

    // before any model exists, the broken pair gets deferred
    let out = mapper.align_paired(&read1, &broken, &mut cache);
    assert!(out.queued_for_later);
    assert!(!out.first[0].is_mapped());
    assert_eq!(mapper.retry_queue_len(), 1);

    // learn the model from perfect pairs
    for _ in 0..32 {
        mapper.align_paired(&read1, &read2, &mut cache);
    }
    assert!(mapper.fragment_model().is_learned());

    // draining the queue re-resolves the deferred pair without re-queueing
    let retried = mapper.drain_pair_retry_queue(&mut cache);
    assert_eq!(retried.len(), 1);
    assert!(!retried[0].queued_for_later);
    assert_eq!(mapper.retry_queue_len(), 0);
    assert!(retried[0].first[0].is_mapped());

    // and new imperfect pairs are rescued inline rather than deferred
    let out = mapper.align_paired(&read1, &broken, &mut cache);
    assert!(!out.queued_for_later);
    assert!(out.first[0].is_mapped());
}

#[test]
fn paired_mapping_quality_is_shared_by_the_pair() {
    let mut mapper = build_mapper(MapperOpts::default());
    let mut cache = CacheSet::default();
    let (read1, read2) = perfect_pair();
    for _ in 0..16 {
        mapper.align_paired(&read1, &read2, &mut cache);
    }
    let out = mapper.align_paired(&read1, &read2, &mut cache);
    if out.first[0].is_mapped() && out.second[0].is_mapped() {
        assert_eq!(out.first[0].mapping_quality, out.second[0].mapping_quality);
    }
}

#[test]
fn crossed_strategy_produces_linked_pairs() {
    let opts = MapperOpts { simultaneous_pair_alignment: false, ..Default::default() };
    let mut mapper = build_mapper(opts);
    let mut cache = CacheSet::default();
    let (read1, read2) = perfect_pair();
    let out = mapper.align_paired(&read1, &read2, &mut cache);
    assert_eq!(out.first.len(), out.second.len());
    assert!(!out.first.is_empty());
    for aln in &out.first {
        assert_eq!(aln.fragment_next.as_deref(), Some("frag/2"));
    }
}

#[test]
fn separate_strategy_handles_unchained_pairing() {
    let opts = MapperOpts { mem_chaining: false, ..Default::default() };
    let mut mapper = build_mapper(opts);
    let mut cache = CacheSet::default();
    let (read1, read2) = perfect_pair();
    let out = mapper.align_paired(&read1, &read2, &mut cache);
    assert_eq!(out.first.len(), out.second.len());
    assert!(!out.first.is_empty());
    assert!(out.first[0].is_mapped());
}

//! Seed clustering by graph locality, and shared cluster scoring rules.
//!
//! The legacy clusterer groups node ids whose sorted neighbors are within
//! `thread_extension` of one another and ranks clusters by the number of
//! distinct read offsets they cover. The overlap and drop rules here are
//! shared with the chain-model path.

use std::collections::HashSet;

use crate::model::NodeId;
use crate::seed::finder::Mem;

/// Number of distinct read offsets covered by any MEM in the cluster.
pub fn cluster_coverage(cluster: &[Mem]) -> usize {
    let mut seen: HashSet<usize> = HashSet::new();
    for mem in cluster {
        for at in mem.begin..mem.end {
            seen.insert(at);
        }
    }
    seen.len()
}

/// MEMs overlap when they are on the same fragment and their read intervals
/// are not disjoint.
pub fn mems_overlap(a: &Mem, b: &Mem) -> bool {
    a.fragment == b.fragment && !(a.end <= b.begin || b.end <= a.begin)
}

pub fn mems_overlap_length(a: &Mem, b: &Mem) -> usize {
    if !mems_overlap(a, b) {
        return 0;
    }
    if a.begin < b.begin {
        if a.end < b.end { b.end - a.begin } else { a.len() }
    } else if b.end < a.end {
        a.end - b.begin
    } else {
        b.len()
    }
}

pub fn clusters_overlap(a: &[Mem], b: &[Mem]) -> bool {
    a.iter().any(|m1| b.iter().any(|m2| mems_overlap(m1, m2)))
}

/// Indices of clusters whose coverage falls below `drop_chain` of the best
/// overlapping longer cluster.
pub fn clusters_to_drop(clusters: &[Vec<Mem>], drop_chain: f64) -> HashSet<usize> {
    let mut to_drop = HashSet::new();
    if drop_chain <= 0.0 {
        return to_drop;
    }
    let coverage: Vec<usize> = clusters.iter().map(|c| cluster_coverage(c)).collect();
    for i in 0..clusters.len() {
        let mut longest = coverage[i];
        let mut found = false;
        for j in (0..i).rev() {
            if clusters_overlap(&clusters[i], &clusters[j]) && coverage[j] > longest {
                longest = coverage[j];
                found = true;
            }
        }
        if found && (coverage[i] as f64) < drop_chain * longest as f64 {
            to_drop.insert(i);
        }
    }
    to_drop
}

pub fn prob_to_phred(prob: f64) -> f64 {
    if prob <= 0.0 {
        return f64::INFINITY;
    }
    -10.0 * prob.log10()
}

/// Phred-scaled confidence that the best cluster is the right one, from the
/// weight gap between the two best clusters. Weights divide each MEM's
/// non-shared coverage by its hit count, so specific seeds dominate.
pub fn compute_cluster_mapping_quality(
    clusters: &[Vec<Mem>],
    read_length: usize,
    max_cluster_mapping_quality: f64,
) -> f64 {
    if clusters.is_empty() {
        return 0.0;
    }
    if clusters.len() == 1 {
        return max_cluster_mapping_quality;
    }
    let mut weights: Vec<f64> = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let mut weight = 0.0;
        for (i, mem) in cluster.iter().enumerate() {
            let mut shared = 0usize;
            if i > 0 {
                let prev = &cluster[i - 1];
                if prev.fragment == mem.fragment && prev.end > mem.begin {
                    shared += prev.end - mem.begin;
                }
            }
            if i + 1 < cluster.len() {
                let next = &cluster[i + 1];
                if next.fragment == mem.fragment && mem.end > next.begin {
                    shared += mem.end - next.begin;
                }
            }
            if mem.match_count > 0 {
                weight += ((mem.len() as f64 - shared as f64 / 2.0) / read_length as f64)
                    / mem.match_count as f64;
            }
        }
        weights.push(weight);
    }
    weights.sort_by(|a, b| b.partial_cmp(a).unwrap());
    if weights[0] == 0.0 {
        return 0.0;
    }
    let mut max_count = 0;
    while max_count < weights.len() && weights[max_count] == weights[0] {
        max_count += 1;
    }
    let best_chance = if max_count > 1 { prob_to_phred(1.0 - 1.0 / max_count as f64) } else { 0.0 };
    max_cluster_mapping_quality.min(best_chance.max(prob_to_phred(weights[1] / weights[0])))
}

/// A legacy id-range cluster, scored by query coverage.
#[derive(Clone, Debug)]
pub struct IdCluster {
    pub ids: Vec<NodeId>,
    pub coverage: usize,
    pub mem_count: usize,
}

/// Group seed hits by node id so that adjacent ids in sorted order differ by
/// at most `thread_extension`, merge groups separated by at most
/// `max_thread_gap`, then rank clusters by query coverage (descending),
/// breaking ties toward fewer MEMs.
pub fn id_clusters(mems: &[Mem], thread_extension: i64, max_thread_gap: i64) -> Vec<IdCluster> {
    let mut ids: Vec<NodeId> = mems
        .iter()
        .flat_map(|m| m.positions.iter().map(|p| p.node))
        .collect();
    ids.sort_unstable();
    ids.dedup();

    let mut groups: Vec<Vec<NodeId>> = Vec::new();
    for id in ids {
        match groups.last_mut() {
            Some(group) if id - *group.last().unwrap() <= thread_extension => group.push(id),
            _ => groups.push(vec![id]),
        }
    }
    // second pass: close small gaps between neighboring groups
    if max_thread_gap > thread_extension {
        let mut merged: Vec<Vec<NodeId>> = Vec::with_capacity(groups.len());
        for group in groups {
            match merged.last_mut() {
                Some(prev) if group[0] - *prev.last().unwrap() <= max_thread_gap => {
                    prev.extend(group);
                }
                _ => merged.push(group),
            }
        }
        groups = merged;
    }

    let mut clusters: Vec<IdCluster> = groups
        .into_iter()
        .map(|ids| {
            let members: Vec<&Mem> = mems
                .iter()
                .filter(|m| m.positions.iter().any(|p| ids.binary_search(&p.node).is_ok()))
                .collect();
            let mut covered: HashSet<usize> = HashSet::new();
            for mem in &members {
                for at in mem.begin..mem.end {
                    covered.insert(at);
                }
            }
            IdCluster { ids, coverage: covered.len(), mem_count: members.len() }
        })
        .collect();
    clusters.sort_by(|a, b| b.coverage.cmp(&a.coverage).then(a.mem_count.cmp(&b.mem_count)));
    clusters
}

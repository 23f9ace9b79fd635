//! Seed generation and clustering.
//!
//! `finder` produces maximal exact matches from the suffix index; `cluster`
//! groups them by graph locality and carries the shared cluster scoring
//! utilities.

pub mod cluster;
pub mod finder;

pub use cluster::{cluster_coverage, clusters_overlap, clusters_to_drop, mems_overlap, mems_overlap_length};
pub use finder::{find_mems, Mem, SeedConfig};

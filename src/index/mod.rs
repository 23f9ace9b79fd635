//! Read-only indexes consumed by the mapper: the graph itself, the FM index
//! over its indexed walks, and per-path node position lookups.

pub mod fm;
pub mod graph;
pub mod paths;

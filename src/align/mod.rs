//! Alignment against extracted subgraphs.
//!
//! `dp` holds the affine-gap dynamic programming core, `extend` the gapless
//! walker used for exact seed extension, and `facade` the aligner selection
//! and canonical rescoring logic.

pub mod dp;
pub mod extend;
pub mod facade;

pub use dp::{AlignMode, GraphAligner, Scoring};
pub use extend::{walk_match, GaplessExtension};
pub use facade::Aligners;

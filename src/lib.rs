pub mod align;
pub mod banded;
pub mod cache;
pub mod cancel;
pub mod chain;
pub mod fragment;
pub mod index;
pub mod mapper;
pub mod mapq;
pub mod model;
pub mod paired;
pub mod seed;
pub mod subgraph;
pub mod tail;

pub use cache::CacheSet;
pub use index::fm::SuffixIndex;
pub use index::graph::{GraphIndex, Handle};
pub use mapper::{Mapper, MapperOpts, MappingQualityMethod};
pub use model::{Alignment, Edit, Mapping, Pos};

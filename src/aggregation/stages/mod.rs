//! Individual pipeline stage executors, driven post-pass over in-memory
//! `Vec<Document>` batches fetched through the storage boundary.

pub mod add_fields;
pub mod bucket;
pub mod bucket_auto;
pub mod count;
pub mod densify;
pub mod facet;
pub mod fill;
pub mod geo_near;
pub mod group;
pub mod limit;
pub mod lookup;
pub mod match_stage;
pub mod merge;
pub mod olap;
pub mod out;
pub mod project;
pub mod rank_fusion;
pub mod redact;
pub mod replace_root;
pub mod sample;
pub mod score_fusion;
pub mod search;
pub mod set;
pub mod set_window_fields;
pub mod skip;
pub mod sort;
pub mod sort_by_count;
pub mod union_with;
pub mod unset;
pub mod unwind;
pub mod vector_search;

pub use densify::DensifySpec;
pub use fill::FillSpec;
pub use geo_near::{GeoJSONPoint, GeoNearSpec};
pub use merge::{MergeInto, MergeOn, MergeSpec, WhenMatched, WhenNotMatched};
pub use olap::OlapSpec;
pub use rank_fusion::RankFusionSpec;
pub use score_fusion::ScoreFusionSpec;
pub use search::SearchSpec;
pub use set_window_fields::SetWindowFieldsSpec;
pub use vector_search::VectorSearchSpec;

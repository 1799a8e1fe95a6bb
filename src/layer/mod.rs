//! Delta and image layers
//!
//! - Delta layers: immutable, sequence-range-bounded batches of records
//! - Image layers: full reachable state at one sequence
//!
//! Each layer has a metadata row, a content blob and a membership filter.
//! Delta layers are also indexed by sequence interval in the coverage table.

mod blob;
mod catalog;
pub mod coverage;
mod flush;
mod meta;

pub use blob::{blob_key, decode_blob_key, read_blob, stage_delete_blob, write_blob, BlobKind};
pub use catalog::LayerCatalog;
pub use flush::FlushReport;
pub(crate) use flush::{flush, load_flushed_through};
pub use meta::{DeltaLayerMeta, ImageLayerMeta, LayerBuildParams, LayerId, LayerOrigin};

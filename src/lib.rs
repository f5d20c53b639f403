//! Curation of annotated video frames before training: near-duplicate
//! removal by perceptual hash, consensus merging of annotations from several
//! sources, and fetching exports from a CVAT server.

pub mod archive;
pub mod config;
pub mod dataset;
pub mod dedup;
pub mod download;
pub mod error;
pub mod formats;
pub mod hash;
pub mod history;
pub mod merge;
pub mod pipeline;

pub use dataset::{Annotation, BBox, Category, Dataset, Item, MediaRef};
pub use error::{CurateError, Result};

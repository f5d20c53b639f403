use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::download::TransferError;
use crate::formats::FormatError;
use crate::hash::HashError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for curation runs.
#[derive(Debug, Error)]
pub enum CurateError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Unrecognized dataset format for {path} (candidates: {matches:?})")]
    FormatDetection {
        path: PathBuf,
        matches: Vec<&'static str>,
    },

    #[error("No annotated frames found in {path}")]
    EmptySource { path: PathBuf },

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Hash computation error: {0}")]
    Hash(#[from] HashError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CurateError> = std::result::Result<T, E>;

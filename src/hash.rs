//! Perceptual frame hashes and their Hamming distance.

use crate::dataset::Item;
use image::ImageReader;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("No hash known for item {0}")]
    Missing(u64),
}

/// Fixed-length bit vector with a Hamming distance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameHash {
    bits: Box<[u8]>,
}

impl FrameHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bits: bytes.into() }
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_bytes(&value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn bit_len(&self) -> u32 {
        self.bits.len() as u32 * 8
    }

    /// Number of differing bits. Bytes past the shorter hash count as fully
    /// differing, so the result stays within `[0, max bit_len]`.
    pub fn distance(&self, other: &FrameHash) -> u32 {
        let common: u32 = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        let tail = self.bits.len().abs_diff(other.bits.len()) as u32 * 8;
        common + tail
    }
}

impl fmt::Display for FrameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.bits.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Computes a hash for an item's frame. Must be pure: the same item always
/// hashes the same, so hashes may be computed concurrently.
pub trait FrameHasher: Sync {
    fn hash(&self, item: &Item) -> Result<FrameHash, HashError>;
}

/// DCT mean hash (pHash) of the decoded frame, 8x8 = 64 bits by default.
pub struct PerceptualHasher {
    hasher: Hasher,
}

impl PerceptualHasher {
    pub fn new() -> Self {
        Self::with_size(8)
    }

    pub fn with_size(side: u32) -> Self {
        let hasher = HasherConfig::new()
            .hash_size(side, side)
            .hash_alg(HashAlg::Mean)
            .preproc_dct()
            .to_hasher();
        Self { hasher }
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHasher for PerceptualHasher {
    fn hash(&self, item: &Item) -> Result<FrameHash, HashError> {
        let path = &item.media.path;
        let img = ImageReader::open(path)
            .map_err(|source| HashError::Open {
                path: path.clone(),
                source,
            })?
            .with_guessed_format()
            .map_err(|source| HashError::Open {
                path: path.clone(),
                source,
            })?
            .decode()
            .map_err(|source| HashError::Decode {
                path: path.clone(),
                source,
            })?;
        let hash = self.hasher.hash_image(&img);
        Ok(FrameHash::from_bytes(hash.as_bytes()))
    }
}

//! On-disk dataset layouts.
//!
//! Every layout implements [`DatasetFormat`], which reads a directory into
//! the canonical [`Dataset`](crate::dataset::Dataset) and writes one back:
//!
//! - **Datumaro**: `annotations/<subset>.json`, optional `.datumaro/` marker
//! - **COCO**: `annotations/instances_<subset>.json`
//! - **YOLO 1.1**: `obj.names`, `obj.data`, `obj_train_data/*.txt`
//! - **Pascal VOC**: `Annotations/*.xml`, `JPEGImages/`, `ImageSets/Main/`
//!
//! The [`FormatRegistry`] holds all built-in layouts and decides which one a
//! directory is in.

mod coco;
mod common;
mod datumaro;
mod voc;
mod yolo;

pub use coco::CocoFormat;
pub use datumaro::DatumaroFormat;
pub use voc::VocFormat;
pub use yolo::YoloFormat;

use crate::config::ConfigError;
use crate::dataset::{Dataset, DatasetError};
use crate::error::{CurateError, Result};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("XML error in {path}: {message}")]
    Xml { path: PathBuf, message: String },

    #[error("Invalid data in {path}: {message}")]
    InvalidData { path: PathBuf, message: String },

    #[error("Missing required file: {0}")]
    MissingFile(PathBuf),

    #[error("Failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

impl FormatError {
    pub(crate) fn invalid(path: &Path, message: impl Into<String>) -> Self {
        FormatError::InvalidData {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Copy media files into the output layout instead of referencing them.
    pub save_media: bool,
}

impl ExportOptions {
    pub fn with_media(save_media: bool) -> Self {
        Self { save_media }
    }
}

/// Reader and writer for one on-disk layout.
pub trait DatasetFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap structural check; does not parse annotation files.
    fn detect(&self, path: &Path) -> bool;

    fn import(&self, path: &Path) -> Result<Dataset, FormatError>;

    /// Whether an export can only be imported again with its media copied
    /// alongside.
    fn needs_media(&self) -> bool {
        false
    }

    fn export(&self, dataset: &Dataset, path: &Path, options: &ExportOptions)
    -> Result<(), FormatError>;
}

pub struct FormatRegistry {
    formats: Vec<Box<dyn DatasetFormat>>,
}

impl FormatRegistry {
    pub fn builtin() -> Self {
        Self {
            formats: vec![
                Box::new(DatumaroFormat),
                Box::new(CocoFormat),
                Box::new(YoloFormat),
                Box::new(VocFormat),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.name()).collect()
    }

    pub fn by_name(&self, name: &str) -> Result<&dyn DatasetFormat, ConfigError> {
        let wanted = match name.trim().to_lowercase().as_str() {
            "pascal" | "pascal_voc" | "pascal voc" => "voc".to_string(),
            "yolo1.1" | "yolo 1.1" => "yolo".to_string(),
            other => other.to_string(),
        };
        self.formats
            .iter()
            .find(|f| f.name() == wanted)
            .map(|f| f.as_ref())
            .ok_or_else(|| ConfigError::UnknownFormat(name.to_string()))
    }

    /// Exactly one layout must claim `path`. A `.datumaro/` marker settles
    /// it outright.
    pub fn detect(&self, path: &Path) -> Result<&dyn DatasetFormat> {
        if DatumaroFormat::has_marker(path) {
            return Ok(self.by_name(DatumaroFormat::NAME)?);
        }

        let matches: Vec<&dyn DatasetFormat> = self
            .formats
            .iter()
            .filter(|f| f.detect(path))
            .map(|f| f.as_ref())
            .collect();

        match matches.as_slice() {
            [only] => {
                log::debug!("Detected {} layout in {}", only.name(), path.display());
                Ok(*only)
            }
            _ => Err(CurateError::FormatDetection {
                path: path.to_path_buf(),
                matches: matches.iter().map(|f| f.name()).collect(),
            }),
        }
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Media directories left empty by exports without media confuse path
/// resolution on import; remove them. Non-empty directories are kept.
pub fn fixup_media_dirs(root: &Path) {
    for name in ["images", "video"] {
        let dir = root.join(name);
        let empty = std::fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            match std::fs::remove_dir(&dir) {
                Ok(()) => log::debug!("Removed empty media directory {}", dir.display()),
                Err(e) => log::warn!("Could not remove {}: {}", dir.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample() -> Dataset {
        dataset(
            &["car", "person"],
            vec![
                frame(0, vec![boxed(0, 10.0, 10.0, 30.0, 20.0)]),
                frame(1, vec![boxed(1, 5.0, 5.0, 10.0, 40.0), boxed(0, 50.0, 50.0, 20.0, 20.0)]),
            ],
        )
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = FormatRegistry::builtin();
        assert_eq!(registry.names(), vec!["datumaro", "coco", "yolo", "voc"]);
        assert_eq!(registry.by_name("COCO").unwrap().name(), "coco");
        assert_eq!(registry.by_name("pascal").unwrap().name(), "voc");
        assert_eq!(
            registry.by_name("labelme").err(),
            Some(ConfigError::UnknownFormat("labelme".to_string()))
        );
    }

    #[test]
    fn test_detect_each_exported_layout() {
        let registry = FormatRegistry::builtin();
        for name in registry.names() {
            let temp_dir = TempDir::new().unwrap();
            let format = registry.by_name(name).unwrap();
            format
                .export(&sample(), temp_dir.path(), &ExportOptions::default())
                .unwrap();
            assert_eq!(registry.detect(temp_dir.path()).unwrap().name(), name);
        }
    }

    #[test]
    fn test_detect_unknown_layout_fails() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "nothing here").unwrap();
        let err = FormatRegistry::builtin().detect(temp_dir.path()).err().unwrap();
        assert!(matches!(err, CurateError::FormatDetection { matches: ref found, .. } if found.is_empty()));
    }

    #[test]
    fn test_detect_ambiguous_layout_fails() {
        let temp_dir = TempDir::new().unwrap();
        let registry = FormatRegistry::builtin();
        let opts = ExportOptions::default();
        registry.by_name("yolo").unwrap().export(&sample(), temp_dir.path(), &opts).unwrap();
        registry.by_name("voc").unwrap().export(&sample(), temp_dir.path(), &opts).unwrap();

        match registry.detect(temp_dir.path()) {
            Err(CurateError::FormatDetection { matches, .. }) => {
                assert_eq!(matches, vec!["yolo", "voc"]);
            }
            other => panic!("expected detection failure, got {:?}", other.map(|f| f.name())),
        }
    }

    #[test]
    fn test_datumaro_marker_wins() {
        let temp_dir = TempDir::new().unwrap();
        let registry = FormatRegistry::builtin();
        let opts = ExportOptions::default();
        registry.by_name("datumaro").unwrap().export(&sample(), temp_dir.path(), &opts).unwrap();
        registry.by_name("yolo").unwrap().export(&sample(), temp_dir.path(), &opts).unwrap();
        assert!(registry.detect(temp_dir.path()).is_err());

        fs::create_dir(temp_dir.path().join(".datumaro")).unwrap();
        assert_eq!(registry.detect(temp_dir.path()).unwrap().name(), "datumaro");
    }

    #[test]
    fn test_fixup_removes_only_empty_media_dirs() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("images")).unwrap();
        fs::create_dir(temp_dir.path().join("video")).unwrap();
        fs::write(temp_dir.path().join("video").join("clip.mp4"), b"x").unwrap();

        fixup_media_dirs(temp_dir.path());
        assert!(!temp_dir.path().join("images").exists());
        assert!(temp_dir.path().join("video").exists());
    }
}

//! File helpers shared by the format adapters.

use super::FormatError;
use crate::dataset::Item;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff"];

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FormatError + '_ {
    move |source| FormatError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn read_string(path: &Path) -> Result<String, FormatError> {
    if !path.exists() {
        return Err(FormatError::MissingFile(path.to_path_buf()));
    }
    fs::read_to_string(path).map_err(io_error(path))
}

pub fn write_string(path: &Path, content: &str) -> Result<(), FormatError> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, content).map_err(io_error(path))
}

pub fn create_dir(path: &Path) -> Result<(), FormatError> {
    fs::create_dir_all(path).map_err(io_error(path))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, FormatError> {
    let content = read_string(path)?;
    serde_json::from_str(&content).map_err(|source| FormatError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FormatError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| FormatError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_string(path, &json)
}

/// Sorted regular files directly under `dir` whose name satisfies `keep`.
pub fn list_files(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>, FormatError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && keep(path))
        .collect();
    files.sort();
    Ok(files)
}

pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
}

pub fn is_image(path: &Path) -> bool {
    IMAGE_EXTENSIONS.iter().any(|ext| has_extension(path, ext))
}

pub fn image_size(path: &Path) -> Result<(u32, u32), FormatError> {
    image::image_dimensions(path).map_err(|source| FormatError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy the item's media into `dir` when requested and return the file name
/// the annotation files should reference.
pub fn place_media(item: &Item, dir: &Path, save_media: bool) -> Result<String, FormatError> {
    let file_name = item.media.file_name();
    if save_media {
        if item.media.exists() {
            create_dir(dir)?;
            let target = dir.join(&file_name);
            if target != item.media.path {
                fs::copy(&item.media.path, &target).map_err(io_error(&target))?;
            }
        } else {
            log::warn!(
                "Media for item {} not found at {}, skipping copy",
                item.id,
                item.media.path.display()
            );
        }
    }
    Ok(file_name)
}

//! Canonical, format-independent dataset model.
//!
//! Every other component reads and writes [`Dataset`]s only. Format adapters
//! translate on-disk layouts into this model and back.

mod bbox;
pub mod filter;

pub use bbox::BBox;
pub use filter::{FilterConfig, FilterOutcome, filter_empty_frames};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DatasetError {
    #[error("Duplicate item id: {0}")]
    DuplicateItemId(u64),

    #[error("Duplicate category name: {0}")]
    DuplicateCategory(String),

    #[error("Item {item} references unknown label {label_id}")]
    UnknownLabel { item: u64, label_id: u32 },

    #[error("Item {item} has a box outside its {width}x{height} frame")]
    BoxOutOfBounds { item: u64, width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u32,
    pub name: String,
}

impl Category {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub label_id: u32,
    pub bbox: BBox,
    pub occluded: bool,
    pub group_id: Option<u32>,
    /// Score in `[0, 1]`; human annotations default to `1.0`.
    pub confidence: f64,
    /// Index of the contributing source during a multi-source merge.
    pub source_id: Option<usize>,
}

impl Annotation {
    pub fn new(label_id: u32, bbox: BBox) -> Self {
        Self {
            label_id,
            bbox,
            occluded: false,
            group_id: None,
            confidence: 1.0,
            source_id: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn occluded(mut self, occluded: bool) -> Self {
        self.occluded = occluded;
        self
    }

    pub fn with_group(mut self, group_id: Option<u32>) -> Self {
        self.group_id = group_id;
        self
    }
}

/// Handle to the image data behind an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef {
    pub path: PathBuf,
}

impl MediaRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Stable cross-source identity of the frame: the file stem.
    pub fn frame_key(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.frame_key())
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub media: MediaRef,
    pub width: u32,
    pub height: u32,
    pub annotations: Vec<Annotation>,
}

impl Item {
    pub fn new(id: u64, media: MediaRef, width: u32, height: u32) -> Self {
        Self {
            id,
            media,
            width,
            height,
            annotations: Vec::new(),
        }
    }

    pub fn with_annotations(mut self, annotations: Vec<Annotation>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }
}

/// Categories plus an ordered sequence of items with unique ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    categories: Vec<Category>,
    items: Vec<Item>,
    ids: HashSet<u64>,
    next_id: u64,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(categories: Vec<Category>) -> Result<Self, DatasetError> {
        let mut dataset = Self::new();
        for category in categories {
            if dataset.category_by_name(&category.name).is_some() {
                return Err(DatasetError::DuplicateCategory(category.name));
            }
            dataset.categories.push(category);
        }
        Ok(dataset)
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn category(&self, id: u32) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn category_by_name(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// Return the id for `name`, defining a new category when needed.
    pub fn ensure_category(&mut self, name: &str) -> u32 {
        if let Some(category) = self.category_by_name(name) {
            return category.id;
        }
        let id = self
            .categories
            .iter()
            .map(|c| c.id + 1)
            .max()
            .unwrap_or(0);
        self.categories.push(Category::new(id, name));
        id
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_id(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    /// One past the largest item id, `0` for an empty dataset.
    pub fn next_item_id(&self) -> u64 {
        self.next_id
    }

    pub fn push_item(&mut self, item: Item) -> Result<(), DatasetError> {
        if !self.ids.insert(item.id) {
            return Err(DatasetError::DuplicateItemId(item.id));
        }
        self.next_id = self.next_id.max(item.id.saturating_add(1));
        self.items.push(item);
        Ok(())
    }

    fn rebuild_ids(&mut self) {
        self.ids = self.items.iter().map(|item| item.id).collect();
        self.next_id = self.ids.iter().map(|id| id.saturating_add(1)).max().unwrap_or(0);
    }

    /// Keep items matching `keep`, preserving order.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Item) -> bool,
    {
        self.items.retain(|item| keep(item));
        self.rebuild_ids();
    }

    /// Mutable access to every item's annotation list. Ids stay untouchable.
    pub fn annotations_mut(&mut self) -> impl Iterator<Item = &mut Vec<Annotation>> {
        self.items.iter_mut().map(|item| &mut item.annotations)
    }

    /// Rewrite ids to `start, start + 1, ...` in current order.
    /// Returns the number of items renumbered.
    pub fn reindex(&mut self, start: u64) -> u64 {
        for (offset, item) in self.items.iter_mut().enumerate() {
            item.id = start + offset as u64;
        }
        self.rebuild_ids();
        self.items.len() as u64
    }

    pub fn total_annotations(&self) -> usize {
        self.items.iter().map(|item| item.annotations.len()).sum()
    }

    /// Check the model invariants, reporting the first violation.
    pub fn validate(&self) -> Result<(), DatasetError> {
        let mut seen = HashSet::new();
        for item in &self.items {
            if !seen.insert(item.id) {
                return Err(DatasetError::DuplicateItemId(item.id));
            }
            for ann in &item.annotations {
                if self.category(ann.label_id).is_none() {
                    return Err(DatasetError::UnknownLabel {
                        item: item.id,
                        label_id: ann.label_id,
                    });
                }
                if !ann.bbox.fits_within(item.width, item.height) {
                    return Err(DatasetError::BoxOutOfBounds {
                        item: item.id,
                        width: item.width,
                        height: item.height,
                    });
                }
            }
        }
        Ok(())
    }

    /// Root directory shared by all media files, if any.
    pub fn media_root(&self) -> Option<&Path> {
        self.items.first().and_then(|item| item.media.path.parent())
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Item;
    type IntoIter = std::slice::Iter<'a, Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_push_rejects_duplicate_ids() {
        let mut ds = dataset(&["car"], vec![frame(1, vec![])]);
        let err = ds.push_item(frame(1, vec![])).unwrap_err();
        assert_eq!(err, DatasetError::DuplicateItemId(1));
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn test_reindex_preserves_order() {
        let mut ds = dataset(
            &["car"],
            vec![frame(40, vec![]), frame(7, vec![]), frame(19, vec![])],
        );
        let count = ds.reindex(100);
        assert_eq!(count, 3);

        let ids: Vec<u64> = ds.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![100, 101, 102]);

        let keys: Vec<String> = ds.iter().map(|i| i.media.frame_key()).collect();
        assert_eq!(keys, vec!["frame_000040", "frame_000007", "frame_000019"]);

        // ids set follows the rewrite
        assert!(ds.contains_id(101));
        assert!(!ds.contains_id(40));
        assert!(ds.push_item(frame(102, vec![])).is_err());
    }

    #[test]
    fn test_retain_updates_id_set() {
        let mut ds = dataset(&["car"], vec![frame(1, vec![]), frame(2, vec![])]);
        ds.retain(|item| item.id != 1);
        assert_eq!(ds.len(), 1);
        assert!(ds.push_item(frame(1, vec![])).is_ok());
    }

    #[test]
    fn test_next_item_id_tracks_pushes_and_rewrites() {
        let mut ds = Dataset::new();
        assert_eq!(ds.next_item_id(), 0);
        ds.push_item(frame(7, vec![])).unwrap();
        ds.push_item(frame(3, vec![])).unwrap();
        assert_eq!(ds.next_item_id(), 8);

        ds.retain(|item| item.id != 7);
        assert_eq!(ds.next_item_id(), 4);

        ds.reindex(20);
        assert_eq!(ds.next_item_id(), 21);
    }

    #[test]
    fn test_ensure_category_reuses_names() {
        let mut ds = dataset(&["car", "person"], vec![]);
        assert_eq!(ds.ensure_category("person"), 1);
        assert_eq!(ds.ensure_category("bike"), 2);
        assert_eq!(ds.categories().len(), 3);
    }

    #[test]
    fn test_duplicate_category_names_rejected() {
        let err = Dataset::with_categories(vec![Category::new(0, "a"), Category::new(1, "a")])
            .unwrap_err();
        assert_eq!(err, DatasetError::DuplicateCategory("a".to_string()));
    }

    #[test]
    fn test_validate_detects_unknown_label_and_out_of_bounds() {
        let ds = dataset(&["car"], vec![frame(0, vec![boxed(3, 0.0, 0.0, 5.0, 5.0)])]);
        assert_eq!(
            ds.validate(),
            Err(DatasetError::UnknownLabel { item: 0, label_id: 3 })
        );

        let ds = dataset(&["car"], vec![frame(0, vec![boxed(0, 90.0, 0.0, 20.0, 5.0)])]);
        assert!(matches!(
            ds.validate(),
            Err(DatasetError::BoxOutOfBounds { item: 0, .. })
        ));

        let ds = dataset(&["car"], vec![frame(0, vec![boxed(0, 10.0, 10.0, 5.0, 5.0)])]);
        assert!(ds.validate().is_ok());
    }

    #[test]
    fn test_frame_key_uses_file_stem() {
        let media = MediaRef::new("/data/task_1/images/frame_000012.png");
        assert_eq!(media.frame_key(), "frame_000012");
        assert_eq!(media.file_name(), "frame_000012.png");
    }
}

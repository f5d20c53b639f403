//! Datumaro layout.
//!
//! ```text
//! <root>/
//!   .datumaro/                 optional project marker
//!   annotations/<subset>.json
//!   images/<subset>/...        optional media
//! ```
//!
//! Items carry `image.path` and `image.size = [h, w]`; the numeric item id
//! lives in `attr.frame`. Only `bbox` annotations are read, everything else
//! is skipped.

use super::common::{create_dir, has_extension, image_size, list_files, place_media, read_json, write_json};
use super::{DatasetFormat, ExportOptions, FormatError};
use crate::dataset::{Annotation, BBox, Dataset, DatasetError, Item, MediaRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_SUBSET: &str = "default";

#[derive(Debug, Clone, Copy, Default)]
pub struct DatumaroFormat;

impl DatumaroFormat {
    pub const NAME: &'static str = "datumaro";

    pub fn has_marker(path: &Path) -> bool {
        path.join(".datumaro").is_dir()
    }

    fn resolve_media(root: &Path, subset: &str, entry: &DatumaroItem) -> PathBuf {
        let Some(image) = &entry.image else {
            return root.join("images").join(&entry.id);
        };
        let path = Path::new(&image.path);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let nested = root.join("images").join(subset).join(path);
        if nested.exists() {
            nested
        } else {
            root.join("images").join(path)
        }
    }
}

impl DatasetFormat for DatumaroFormat {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn detect(&self, path: &Path) -> bool {
        if Self::has_marker(path) {
            return true;
        }
        list_files(&path.join("annotations"), |p| {
            has_extension(p, "json")
                && !p
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("instances_"))
        })
        .is_ok_and(|files| !files.is_empty())
    }

    fn import(&self, root: &Path) -> Result<Dataset, FormatError> {
        let annotations_dir = root.join("annotations");
        if !annotations_dir.is_dir() {
            return Err(FormatError::MissingFile(annotations_dir));
        }

        let mut dataset = Dataset::new();
        let mut skipped = 0usize;

        for file in list_files(&annotations_dir, |p| has_extension(p, "json"))? {
            let subset = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| DEFAULT_SUBSET.to_string());
            let document: DatumaroDocument = read_json(&file)?;

            let labels: Vec<u32> = document
                .categories
                .label
                .labels
                .iter()
                .map(|label| dataset.ensure_category(&label.name))
                .collect();

            for entry in &document.items {
                let media = Self::resolve_media(root, &subset, entry);
                let (width, height) = match entry.image.as_ref().and_then(|i| i.size) {
                    Some([h, w]) => (w, h),
                    None => image_size(&media)?,
                };

                let id = entry
                    .attr
                    .get("frame")
                    .and_then(Value::as_u64)
                    .filter(|id| !dataset.contains_id(*id))
                    .unwrap_or_else(|| dataset.next_item_id());

                let mut annotations = Vec::new();
                for ann in &entry.annotations {
                    let (Some(bbox), "bbox") = (ann.bbox, ann.kind.as_str()) else {
                        skipped += 1;
                        continue;
                    };
                    let label_index = ann.label_id.unwrap_or(0) as usize;
                    let label_id = *labels.get(label_index).ok_or_else(|| {
                        FormatError::invalid(
                            &file,
                            format!("item '{}' uses undefined label {}", entry.id, label_index),
                        )
                    })?;

                    let mut annotation =
                        Annotation::new(label_id, BBox::new(bbox[0], bbox[1], bbox[2], bbox[3]).clamp_to(width, height))
                            .occluded(ann.attributes.get("occluded").and_then(Value::as_bool).unwrap_or(false))
                            .with_group((ann.group > 0).then_some(ann.group));
                    if let Some(score) = ann.attributes.get("score").and_then(Value::as_f64) {
                        annotation = annotation.with_confidence(score);
                    }
                    annotations.push(annotation);
                }

                dataset.push_item(
                    Item::new(id, MediaRef::new(media), width, height).with_annotations(annotations),
                )?;
            }
        }

        if skipped > 0 {
            log::debug!("Skipped {} non-box annotation(s) in {}", skipped, root.display());
        }
        Ok(dataset)
    }

    fn export(&self, dataset: &Dataset, root: &Path, options: &ExportOptions) -> Result<(), FormatError> {
        let images_dir = root.join("images").join(DEFAULT_SUBSET);
        let label_index: HashMap<u32, u64> = dataset
            .categories()
            .iter()
            .enumerate()
            .map(|(index, c)| (c.id, index as u64))
            .collect();

        let mut document = DatumaroDocument {
            info: Map::new(),
            categories: DatumaroCategories {
                label: DatumaroLabelCategory {
                    labels: dataset
                        .categories()
                        .iter()
                        .map(|c| DatumaroLabel {
                            name: c.name.clone(),
                            parent: String::new(),
                            attributes: Vec::new(),
                        })
                        .collect(),
                    attributes: vec!["occluded".to_string()],
                },
            },
            items: Vec::with_capacity(dataset.len()),
        };

        for item in dataset {
            let path = if options.save_media {
                place_media(item, &images_dir, true)?
            } else {
                item.media.path.to_string_lossy().into_owned()
            };

            let mut annotations = Vec::with_capacity(item.annotations.len());
            for (index, ann) in item.annotations.iter().enumerate() {
                let label_id = *label_index.get(&ann.label_id).ok_or(DatasetError::UnknownLabel {
                    item: item.id,
                    label_id: ann.label_id,
                })?;
                let mut attributes = Map::new();
                attributes.insert("occluded".to_string(), Value::Bool(ann.occluded));
                if ann.confidence < 1.0 {
                    attributes.insert("score".to_string(), Value::from(ann.confidence));
                }
                annotations.push(DatumaroAnnotation {
                    id: index as u64,
                    kind: "bbox".to_string(),
                    attributes,
                    group: ann.group_id.unwrap_or(0),
                    label_id: Some(label_id as u32),
                    z_order: 0,
                    bbox: Some(ann.bbox.to_array()),
                });
            }

            let mut attr = Map::new();
            attr.insert("frame".to_string(), Value::from(item.id));
            document.items.push(DatumaroItem {
                id: item.media.frame_key(),
                annotations,
                attr,
                image: Some(DatumaroImage {
                    path,
                    size: Some([item.height, item.width]),
                }),
            });
        }

        create_dir(root)?;
        write_json(&root.join("annotations").join(format!("{DEFAULT_SUBSET}.json")), &document)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DatumaroDocument {
    #[serde(default)]
    info: Map<String, Value>,
    #[serde(default)]
    categories: DatumaroCategories,
    #[serde(default)]
    items: Vec<DatumaroItem>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatumaroCategories {
    #[serde(default)]
    label: DatumaroLabelCategory,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatumaroLabelCategory {
    #[serde(default)]
    labels: Vec<DatumaroLabel>,
    #[serde(default)]
    attributes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatumaroLabel {
    name: String,
    #[serde(default)]
    parent: String,
    #[serde(default)]
    attributes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatumaroItem {
    id: String,
    #[serde(default)]
    annotations: Vec<DatumaroAnnotation>,
    #[serde(default)]
    attr: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<DatumaroImage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatumaroImage {
    path: String,
    /// `[height, width]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<[u32; 2]>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatumaroAnnotation {
    #[serde(default)]
    id: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Map<String, Value>,
    #[serde(default)]
    group: u32,
    #[serde(default)]
    label_id: Option<u32>,
    #[serde(default)]
    z_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bbox: Option<[f64; 4]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::*;
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use tempfile::TempDir;

    const CVAT_EXPORT: &str = r#"{
      "info": {},
      "categories": {
        "label": {
          "labels": [
            {"name": "car", "parent": "", "attributes": []},
            {"name": "person", "parent": "", "attributes": []}
          ],
          "attributes": ["occluded"]
        },
        "points": {"items": []}
      },
      "items": [
        {
          "id": "frame_000000",
          "annotations": [
            {"id": 0, "type": "bbox", "attributes": {"occluded": true}, "group": 0,
             "label_id": 1, "z_order": 0, "bbox": [10.0, 20.0, 30.0, 40.0]},
            {"id": 1, "type": "polygon", "attributes": {}, "group": 0,
             "label_id": 0, "z_order": 0, "points": [1.0, 1.0, 5.0, 1.0, 5.0, 5.0]},
            {"id": 2, "type": "bbox", "attributes": {"occluded": false, "score": 0.4}, "group": 3,
             "label_id": 0, "z_order": 0, "bbox": [90.0, 90.0, 30.0, 30.0]}
          ],
          "attr": {"frame": 7},
          "image": {"path": "frame_000000.jpg", "size": [100, 120]}
        },
        {
          "id": "frame_000001",
          "annotations": [],
          "attr": {"frame": 8},
          "image": {"path": "frame_000001.jpg", "size": [100, 120]}
        }
      ]
    }"#;

    #[test]
    fn test_import_cvat_export() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("annotations")).unwrap();
        fs::write(temp_dir.path().join("annotations/default.json"), CVAT_EXPORT).unwrap();

        let dataset = DatumaroFormat.import(temp_dir.path()).unwrap();
        assert_eq!(dataset.categories().len(), 2);
        assert_eq!(dataset.len(), 2);

        let item = &dataset.items()[0];
        assert_eq!(item.id, 7);
        assert_eq!((item.width, item.height), (120, 100));
        assert_eq!(item.media.frame_key(), "frame_000000");
        assert_eq!(item.annotations.len(), 2);

        let person = &item.annotations[0];
        assert_eq!(dataset.category(person.label_id).unwrap().name, "person");
        assert!(person.occluded);
        assert_eq!(person.confidence, 1.0);

        // clamped into the 120x100 frame
        let car = &item.annotations[1];
        assert_eq!(car.bbox, BBox::new(90.0, 90.0, 30.0, 10.0));
        assert_eq!(car.confidence, 0.4);
        assert_eq!(car.group_id, Some(3));
        assert!(dataset.validate().is_ok());
    }

    #[test]
    fn test_export_then_import_keeps_annotations() {
        let temp_dir = TempDir::new().unwrap();
        let original = dataset(
            &["car", "person"],
            vec![
                frame(
                    3,
                    vec![
                        boxed(1, 1.0, 2.0, 3.0, 4.0).occluded(true).with_group(Some(2)),
                        boxed(0, 10.0, 10.0, 5.0, 5.0).with_confidence(0.5),
                    ],
                ),
                frame(9, vec![]),
            ],
        );
        DatumaroFormat
            .export(&original, temp_dir.path(), &ExportOptions::default())
            .unwrap();
        let imported = DatumaroFormat.import(temp_dir.path()).unwrap();

        assert_eq!(imported.categories(), original.categories());
        let ids: Vec<u64> = imported.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![3, 9]);
        assert_eq!(imported.items()[0].annotations, original.items()[0].annotations);
    }

    #[test]
    fn test_export_with_media_copies_images() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("frame_000004.png");
        ImageBuffer::from_fn(8, 6, |_, _| Rgb([10u8, 20, 30]))
            .save(&image_path)
            .unwrap();
        let mut ds = dataset(&["car"], vec![]);
        ds.push_item(Item::new(4, MediaRef::new(&image_path), 8, 6)).unwrap();

        let out = temp_dir.path().join("out");
        DatumaroFormat.export(&ds, &out, &ExportOptions::with_media(true)).unwrap();
        assert!(out.join("images/default/frame_000004.png").is_file());

        let imported = DatumaroFormat.import(&out).unwrap();
        assert_eq!(imported.items()[0].media.path, out.join("images/default/frame_000004.png"));
    }

    #[test]
    fn test_import_without_annotations_dir_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            DatumaroFormat.import(temp_dir.path()),
            Err(FormatError::MissingFile(_))
        ));
    }
}

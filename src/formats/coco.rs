//! COCO instances layout: `annotations/instances_<subset>.json` with media
//! under `images/`. Category ids are 1-based on disk.

use super::common::{create_dir, has_extension, list_files, place_media, read_json, write_json};
use super::{DatasetFormat, ExportOptions, FormatError};
use crate::dataset::{Annotation, BBox, Dataset, DatasetError, Item, MediaRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct CocoFormat;

fn is_instances_file(path: &Path) -> bool {
    has_extension(path, "json")
        && path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("instances_"))
}

impl DatasetFormat for CocoFormat {
    fn name(&self) -> &'static str {
        "coco"
    }

    fn detect(&self, path: &Path) -> bool {
        list_files(&path.join("annotations"), is_instances_file).is_ok_and(|f| !f.is_empty())
    }

    fn import(&self, root: &Path) -> Result<Dataset, FormatError> {
        let annotations_dir = root.join("annotations");
        if !annotations_dir.is_dir() {
            return Err(FormatError::MissingFile(annotations_dir));
        }

        let mut dataset = Dataset::new();
        for file in list_files(&annotations_dir, is_instances_file)? {
            let document: CocoDocument = read_json(&file)?;

            let labels: HashMap<i64, u32> = document
                .categories
                .iter()
                .map(|c| (c.id, dataset.ensure_category(&c.name)))
                .collect();

            let mut per_image: HashMap<i64, Vec<Annotation>> = HashMap::new();
            for ann in &document.annotations {
                let label_id = *labels.get(&ann.category_id).ok_or_else(|| {
                    FormatError::invalid(&file, format!("annotation {} uses undefined category {}", ann.id, ann.category_id))
                })?;
                let [x, y, w, h] = ann.bbox;
                let mut annotation = Annotation::new(label_id, BBox::new(x, y, w, h))
                    .occluded(ann.attributes.get("occluded").and_then(Value::as_bool).unwrap_or(false))
                    .with_group((ann.group > 0).then_some(ann.group));
                if let Some(score) = ann.score {
                    annotation = annotation.with_confidence(score);
                }
                per_image.entry(ann.image_id).or_default().push(annotation);
            }

            for image in &document.images {
                let (width, height) = (image.width, image.height);
                let annotations = per_image
                    .remove(&image.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|mut ann| {
                        ann.bbox = ann.bbox.clamp_to(width, height);
                        ann
                    })
                    .collect();
                let id = u64::try_from(image.id)
                    .ok()
                    .filter(|id| !dataset.contains_id(*id))
                    .unwrap_or_else(|| dataset.next_item_id());
                let media = MediaRef::new(root.join("images").join(&image.file_name));
                dataset.push_item(Item::new(id, media, width, height).with_annotations(annotations))?;
            }

            if !per_image.is_empty() {
                log::warn!(
                    "{}: {} image id(s) referenced by annotations are not listed",
                    file.display(),
                    per_image.len()
                );
            }
        }
        Ok(dataset)
    }

    fn export(&self, dataset: &Dataset, root: &Path, options: &ExportOptions) -> Result<(), FormatError> {
        let images_dir = root.join("images");
        let category_ids: HashMap<u32, i64> = dataset
            .categories()
            .iter()
            .enumerate()
            .map(|(index, c)| (c.id, index as i64 + 1))
            .collect();

        let mut document = CocoDocument {
            licenses: vec![CocoLicense {
                id: 0,
                name: String::new(),
                url: String::new(),
            }],
            info: Map::new(),
            categories: dataset
                .categories()
                .iter()
                .enumerate()
                .map(|(index, c)| CocoCategory {
                    id: index as i64 + 1,
                    name: c.name.clone(),
                    supercategory: String::new(),
                })
                .collect(),
            images: Vec::with_capacity(dataset.len()),
            annotations: Vec::new(),
        };

        for item in dataset {
            let file_name = place_media(item, &images_dir, options.save_media)?;
            let image_id = item.id as i64;
            document.images.push(CocoImage {
                id: image_id,
                width: item.width,
                height: item.height,
                file_name,
            });

            for ann in &item.annotations {
                let category_id = *category_ids.get(&ann.label_id).ok_or(DatasetError::UnknownLabel {
                    item: item.id,
                    label_id: ann.label_id,
                })?;
                let mut attributes = Map::new();
                attributes.insert("occluded".to_string(), Value::Bool(ann.occluded));
                document.annotations.push(CocoAnnotation {
                    id: document.annotations.len() as i64 + 1,
                    image_id,
                    category_id,
                    segmentation: Value::Array(Vec::new()),
                    area: ann.bbox.area(),
                    bbox: ann.bbox.to_array(),
                    iscrowd: 0,
                    attributes,
                    group: ann.group_id.unwrap_or(0),
                    score: (ann.confidence < 1.0).then_some(ann.confidence),
                });
            }
        }

        create_dir(root)?;
        write_json(&root.join("annotations").join("instances_default.json"), &document)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CocoDocument {
    #[serde(default)]
    licenses: Vec<CocoLicense>,
    #[serde(default)]
    info: Map<String, Value>,
    #[serde(default)]
    categories: Vec<CocoCategory>,
    #[serde(default)]
    images: Vec<CocoImage>,
    #[serde(default)]
    annotations: Vec<CocoAnnotation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CocoLicense {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CocoCategory {
    id: i64,
    name: String,
    #[serde(default)]
    supercategory: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CocoImage {
    id: i64,
    width: u32,
    height: u32,
    file_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CocoAnnotation {
    id: i64,
    image_id: i64,
    category_id: i64,
    #[serde(default)]
    segmentation: Value,
    #[serde(default)]
    area: f64,
    bbox: [f64; 4],
    #[serde(default)]
    iscrowd: u8,
    #[serde(default)]
    attributes: Map<String, Value>,
    #[serde(default)]
    group: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::*;
    use std::fs;
    use tempfile::TempDir;

    const CVAT_EXPORT: &str = r#"{
      "licenses": [{"name": "", "id": 0, "url": ""}],
      "info": {"contributor": "", "date_created": "", "description": "", "url": "", "version": "", "year": ""},
      "categories": [
        {"id": 1, "name": "car", "supercategory": ""},
        {"id": 2, "name": "person", "supercategory": ""}
      ],
      "images": [
        {"id": 1, "width": 640, "height": 480, "file_name": "frame_000000.jpg", "license": 0},
        {"id": 2, "width": 640, "height": 480, "file_name": "frame_000001.jpg", "license": 0}
      ],
      "annotations": [
        {"id": 1, "image_id": 2, "category_id": 2, "segmentation": [], "area": 600.0,
         "bbox": [100.0, 100.0, 20.0, 30.0], "iscrowd": 0, "attributes": {"occluded": true}},
        {"id": 2, "image_id": 2, "category_id": 1, "segmentation": [], "area": 100.0,
         "bbox": [630.0, 470.0, 20.0, 20.0], "iscrowd": 0, "attributes": {"occluded": false}, "score": 0.75}
      ]
    }"#;

    #[test]
    fn test_import_cvat_export() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("annotations")).unwrap();
        fs::write(temp_dir.path().join("annotations/instances_default.json"), CVAT_EXPORT).unwrap();

        let dataset = CocoFormat.import(temp_dir.path()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.items()[0].is_empty());

        let item = &dataset.items()[1];
        assert_eq!(item.id, 2);
        assert_eq!(item.media.path, temp_dir.path().join("images/frame_000001.jpg"));
        assert_eq!(dataset.category(item.annotations[0].label_id).unwrap().name, "person");
        assert!(item.annotations[0].occluded);
        assert_eq!(item.annotations[1].bbox, BBox::new(630.0, 470.0, 10.0, 10.0));
        assert_eq!(item.annotations[1].confidence, 0.75);
        assert!(dataset.validate().is_ok());
    }

    #[test]
    fn test_export_uses_one_based_categories() {
        let temp_dir = TempDir::new().unwrap();
        let ds = dataset(&["car", "person"], vec![frame(5, vec![boxed(1, 1.0, 1.0, 4.0, 4.0)])]);
        CocoFormat.export(&ds, temp_dir.path(), &ExportOptions::default()).unwrap();

        let written: Value = serde_json::from_str(
            &fs::read_to_string(temp_dir.path().join("annotations/instances_default.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(written["categories"][0]["id"], 1);
        assert_eq!(written["annotations"][0]["category_id"], 2);
        assert_eq!(written["annotations"][0]["area"], 16.0);

        let imported = CocoFormat.import(temp_dir.path()).unwrap();
        assert_eq!(imported.categories(), ds.categories());
        assert_eq!(imported.items()[0].id, 5);
        assert_eq!(imported.items()[0].annotations, ds.items()[0].annotations);
    }
}

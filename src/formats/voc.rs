//! Pascal VOC layout.
//!
//! ```text
//! <root>/
//!   Annotations/<stem>.xml
//!   JPEGImages/<image>
//!   ImageSets/Main/default.txt   item stems, one per line
//!   labelmap.txt                 "<name>:<color>:<parts>:<actions>"
//! ```

use super::common::{has_extension, image_size, list_files, place_media, read_string, write_string};
use super::{DatasetFormat, ExportOptions, FormatError};
use crate::dataset::{Annotation, BBox, Dataset, DatasetError, Item, MediaRef};
use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};
use std::path::Path;

const LABELMAP_HEADER: &str = "# label:color_rgb:parts:actions";

#[derive(Debug, Clone, Copy, Default)]
pub struct VocFormat;

impl VocFormat {
    /// Item stems in listing order, falling back to the annotation files.
    fn item_stems(root: &Path) -> Result<Vec<String>, FormatError> {
        let sets_dir = root.join("ImageSets").join("Main");
        let listings = if sets_dir.is_dir() {
            list_files(&sets_dir, |p| has_extension(p, "txt"))?
        } else {
            Vec::new()
        };

        let mut stems = Vec::new();
        if listings.is_empty() {
            for file in list_files(&root.join("Annotations"), |p| has_extension(p, "xml"))? {
                if let Some(stem) = file.file_stem() {
                    stems.push(stem.to_string_lossy().into_owned());
                }
            }
        } else {
            for listing in listings {
                for line in read_string(&listing)?.lines() {
                    let stem = line.split_whitespace().next().unwrap_or_default();
                    if !stem.is_empty() && !stems.iter().any(|s| s == stem) {
                        stems.push(stem.to_string());
                    }
                }
            }
        }
        Ok(stems)
    }

    fn read_labelmap(root: &Path, dataset: &mut Dataset) -> Result<(), FormatError> {
        let path = root.join("labelmap.txt");
        if !path.is_file() {
            return Ok(());
        }
        for line in read_string(&path)?.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let name = line.split(':').next().unwrap_or_default();
            if !name.is_empty() {
                dataset.ensure_category(name);
            }
        }
        Ok(())
    }
}

impl DatasetFormat for VocFormat {
    fn name(&self) -> &'static str {
        "voc"
    }

    fn detect(&self, path: &Path) -> bool {
        path.join("Annotations").is_dir()
    }

    fn import(&self, root: &Path) -> Result<Dataset, FormatError> {
        let mut dataset = Dataset::new();
        Self::read_labelmap(root, &mut dataset)?;

        for (index, stem) in Self::item_stems(root)?.into_iter().enumerate() {
            let xml_path = root.join("Annotations").join(format!("{stem}.xml"));
            let document: VocAnnotation = from_str(&read_string(&xml_path)?).map_err(|e| FormatError::Xml {
                path: xml_path.clone(),
                message: e.to_string(),
            })?;

            let file_name = if document.filename.is_empty() {
                format!("{stem}.jpg")
            } else {
                document.filename.clone()
            };
            let media = root.join("JPEGImages").join(&file_name);
            let (width, height) = match &document.size {
                Some(size) if size.width > 0 && size.height > 0 => (size.width, size.height),
                _ => image_size(&media)?,
            };

            let annotations = document
                .objects
                .iter()
                .map(|object| {
                    let b = &object.bndbox;
                    let label_id = dataset.ensure_category(&object.name);
                    Annotation::new(
                        label_id,
                        BBox::from_corners(b.xmin, b.ymin, b.xmax, b.ymax).clamp_to(width, height),
                    )
                    .occluded(object.occluded > 0)
                })
                .collect();

            dataset.push_item(
                Item::new(index as u64, MediaRef::new(media), width, height).with_annotations(annotations),
            )?;
        }
        Ok(dataset)
    }

    fn export(&self, dataset: &Dataset, root: &Path, options: &ExportOptions) -> Result<(), FormatError> {
        let images_dir = root.join("JPEGImages");
        let annotations_dir = root.join("Annotations");

        let mut labelmap = format!("{LABELMAP_HEADER}\n");
        for category in dataset.categories() {
            labelmap.push_str(&format!("{}:::\n", category.name));
        }
        write_string(&root.join("labelmap.txt"), &labelmap)?;

        let mut stems = String::new();
        for item in dataset {
            let filename = place_media(item, &images_dir, options.save_media)?;
            let stem = item.media.frame_key();

            let mut objects = Vec::with_capacity(item.annotations.len());
            for ann in &item.annotations {
                let category = dataset.category(ann.label_id).ok_or(DatasetError::UnknownLabel {
                    item: item.id,
                    label_id: ann.label_id,
                })?;
                objects.push(VocObject {
                    name: category.name.clone(),
                    pose: default_pose(),
                    truncated: 0,
                    difficult: 0,
                    occluded: u8::from(ann.occluded),
                    bndbox: VocBndbox {
                        xmin: ann.bbox.x,
                        ymin: ann.bbox.y,
                        xmax: ann.bbox.x2(),
                        ymax: ann.bbox.y2(),
                    },
                });
            }

            let document = VocAnnotation {
                folder: String::new(),
                filename,
                size: Some(VocSize {
                    width: item.width,
                    height: item.height,
                    depth: 3,
                }),
                objects,
            };
            let xml_path = annotations_dir.join(format!("{stem}.xml"));
            let xml = to_string(&document).map_err(|e| FormatError::Xml {
                path: xml_path.clone(),
                message: e.to_string(),
            })?;
            write_string(&xml_path, &format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{xml}\n"))?;

            stems.push_str(&stem);
            stems.push('\n');
        }

        write_string(&root.join("ImageSets").join("Main").join("default.txt"), &stems)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "annotation")]
struct VocAnnotation {
    #[serde(default)]
    folder: String,
    #[serde(default)]
    filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<VocSize>,
    #[serde(rename = "object", default)]
    objects: Vec<VocObject>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VocSize {
    width: u32,
    height: u32,
    #[serde(default)]
    depth: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct VocObject {
    name: String,
    #[serde(default = "default_pose")]
    pose: String,
    #[serde(default)]
    truncated: u8,
    #[serde(default)]
    difficult: u8,
    #[serde(default)]
    occluded: u8,
    bndbox: VocBndbox,
}

#[derive(Debug, Serialize, Deserialize)]
struct VocBndbox {
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

fn default_pose() -> String {
    "Unspecified".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::*;
    use std::fs;
    use tempfile::TempDir;

    const CVAT_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?><annotation><folder></folder><filename>frame_000000.jpg</filename><source><database>Unknown</database></source><size><height>480</height><width>640</width><depth>3</depth></size><segmented>0</segmented><object><name>person</name><occluded>1</occluded><bndbox><xmin>100.5</xmin><ymin>150.0</ymin><xmax>300.5</xmax><ymax>250.0</ymax></bndbox><truncated>0</truncated><difficult>0</difficult></object><object><name>car</name><occluded>0</occluded><bndbox><xmin>600.0</xmin><ymin>400.0</ymin><xmax>700.0</xmax><ymax>500.0</ymax></bndbox><truncated>0</truncated><difficult>0</difficult></object></annotation>"#;

    #[test]
    fn test_import_cvat_export() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("Annotations")).unwrap();
        fs::create_dir_all(root.join("ImageSets/Main")).unwrap();
        fs::write(root.join("Annotations/frame_000000.xml"), CVAT_XML).unwrap();
        fs::write(root.join("ImageSets/Main/default.txt"), "frame_000000\n").unwrap();
        fs::write(root.join("labelmap.txt"), "# label:color_rgb:parts:actions\ncar:250,50,83::\nperson:51,221,255::\n").unwrap();

        let dataset = VocFormat.import(root).unwrap();
        let names: Vec<&str> = dataset.categories().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["car", "person"]);

        let item = &dataset.items()[0];
        assert_eq!((item.width, item.height), (640, 480));
        assert_eq!(item.media.path, root.join("JPEGImages/frame_000000.jpg"));
        assert_eq!(item.annotations[0].label_id, 1);
        assert!(item.annotations[0].occluded);
        assert_eq!(item.annotations[0].bbox, BBox::new(100.5, 150.0, 200.0, 100.0));
        // clamped to the frame
        assert_eq!(item.annotations[1].bbox, BBox::new(600.0, 400.0, 40.0, 80.0));
    }

    #[test]
    fn test_export_then_import() {
        let temp_dir = TempDir::new().unwrap();
        let original = dataset(
            &["car", "person"],
            vec![
                frame(0, vec![boxed(1, 10.0, 20.0, 30.0, 40.0).occluded(true)]),
                frame(1, vec![]),
            ],
        );
        VocFormat.export(&original, temp_dir.path(), &ExportOptions::default()).unwrap();
        assert!(temp_dir.path().join("Annotations/frame_000001.xml").is_file());
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("ImageSets/Main/default.txt")).unwrap(),
            "frame_000000\nframe_000001\n"
        );

        let imported = VocFormat.import(temp_dir.path()).unwrap();
        assert_eq!(imported.categories(), original.categories());
        assert_eq!(imported.len(), 2);
        assert_eq!(imported.items()[0].annotations, original.items()[0].annotations);
        assert!(imported.items()[1].is_empty());
    }
}

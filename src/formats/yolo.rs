//! YOLO 1.1 layout as exported by CVAT.
//!
//! ```text
//! <root>/
//!   obj.names                  one class name per line
//!   obj.data                   darknet metadata
//!   train.txt                  data/obj_train_data/<image> per line
//!   obj_train_data/<stem>.txt  "<class> <xc> <yc> <w> <h>", normalized
//! ```
//!
//! Frame sizes are not stored in the annotations, so they are read from the
//! images themselves.

use super::common::{image_size, is_image, place_media, read_string, write_string};
use super::{DatasetFormat, ExportOptions, FormatError};
use crate::dataset::{Annotation, BBox, Dataset, DatasetError, Item, MediaRef};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const DATA_DIR: &str = "obj_train_data";

#[derive(Debug, Clone, Copy, Default)]
pub struct YoloFormat;

impl YoloFormat {
    fn image_paths(root: &Path) -> Result<Vec<PathBuf>, FormatError> {
        let listing = root.join("train.txt");
        if listing.is_file() {
            return Ok(read_string(&listing)?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| root.join(line.strip_prefix("data/").unwrap_or(line)))
                .collect());
        }

        Ok(WalkDir::new(root.join(DATA_DIR))
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.is_file() && is_image(path))
            .collect())
    }

    fn parse_line(line: &str, width: u32, height: u32) -> Option<(usize, BBox)> {
        let mut fields = line.split_whitespace();
        let class = fields.next()?.parse::<usize>().ok()?;
        let mut values = [0.0f64; 4];
        for value in values.iter_mut() {
            *value = fields.next()?.parse().ok()?;
        }
        let [xc, yc, w, h] = values;
        let (fw, fh) = (width as f64, height as f64);
        let bbox = BBox::new((xc - w / 2.0) * fw, (yc - h / 2.0) * fh, w * fw, h * fh);
        Some((class, bbox.clamp_to(width, height)))
    }
}

impl DatasetFormat for YoloFormat {
    fn name(&self) -> &'static str {
        "yolo"
    }

    fn detect(&self, path: &Path) -> bool {
        path.join("obj.names").is_file() && path.join("obj.data").is_file()
    }

    /// Frame sizes are read back from the images.
    fn needs_media(&self) -> bool {
        true
    }

    fn import(&self, root: &Path) -> Result<Dataset, FormatError> {
        let mut dataset = Dataset::new();
        let labels: Vec<u32> = read_string(&root.join("obj.names"))?
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| dataset.ensure_category(name))
            .collect();

        for (index, image_path) in Self::image_paths(root)?.into_iter().enumerate() {
            let (width, height) = image_size(&image_path)?;
            let label_file = image_path.with_extension("txt");

            let mut annotations = Vec::new();
            if label_file.is_file() {
                for (number, line) in read_string(&label_file)?.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let (class, bbox) = Self::parse_line(line, width, height).ok_or_else(|| {
                        FormatError::invalid(&label_file, format!("malformed line {}: '{}'", number + 1, line))
                    })?;
                    let label_id = *labels.get(class).ok_or_else(|| {
                        FormatError::invalid(&label_file, format!("class {} not in obj.names", class))
                    })?;
                    annotations.push(Annotation::new(label_id, bbox));
                }
            }

            dataset.push_item(
                Item::new(index as u64, MediaRef::new(image_path), width, height)
                    .with_annotations(annotations),
            )?;
        }
        Ok(dataset)
    }

    fn export(&self, dataset: &Dataset, root: &Path, options: &ExportOptions) -> Result<(), FormatError> {
        let data_dir = root.join(DATA_DIR);
        let class_index: HashMap<u32, usize> = dataset
            .categories()
            .iter()
            .enumerate()
            .map(|(index, c)| (c.id, index))
            .collect();

        let names: Vec<&str> = dataset.categories().iter().map(|c| c.name.as_str()).collect();
        write_string(&root.join("obj.names"), &(names.join("\n") + "\n"))?;
        write_string(
            &root.join("obj.data"),
            &format!(
                "classes = {}\ntrain = data/train.txt\nnames = data/obj.names\nbackup = backup/\n",
                names.len()
            ),
        )?;

        let mut listing = String::new();
        for item in dataset {
            if item.width == 0 || item.height == 0 {
                return Err(FormatError::invalid(
                    &item.media.path,
                    format!("item {} has no frame size", item.id),
                ));
            }
            let file_name = place_media(item, &data_dir, options.save_media)?;
            let _ = writeln!(listing, "data/{DATA_DIR}/{file_name}");

            let (fw, fh) = (item.width as f64, item.height as f64);
            let mut lines = String::new();
            for ann in &item.annotations {
                let class = class_index.get(&ann.label_id).ok_or(DatasetError::UnknownLabel {
                    item: item.id,
                    label_id: ann.label_id,
                })?;
                let b = &ann.bbox;
                let _ = writeln!(
                    lines,
                    "{} {:.6} {:.6} {:.6} {:.6}",
                    class,
                    (b.x + b.w / 2.0) / fw,
                    (b.y + b.h / 2.0) / fh,
                    b.w / fw,
                    b.h / fh
                );
            }
            write_string(&data_dir.join(format!("{}.txt", item.media.frame_key())), &lines)?;
        }
        write_string(&root.join("train.txt"), &listing)
    }
}

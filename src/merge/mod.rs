//! Combining several datasets into one.
//!
//! [`IntersectMerge`] builds a consensus from independently annotated copies
//! of the same frames. [`accumulate`] concatenates datasets whose item ids
//! are already disjoint.

mod categories;
mod cluster;

pub use categories::CategoryUnion;
pub use cluster::{UnionFind, cluster, resolve, support};

use crate::config::{self, ConfigError};
use crate::dataset::{Annotation, Dataset, DatasetError, Item};
use crate::error::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_PAIRWISE_DIST: f64 = 0.25;
pub const DEFAULT_QUORUM: usize = 0;
pub const DEFAULT_OUTPUT_CONF_THRESH: f64 = 0.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Largest `1 - IoU` at which two boxes are considered the same object.
    pub pairwise_dist: f64,
    /// Minimum number of distinct sources behind a cluster; `0` disables the check.
    pub quorum: usize,
    pub output_conf_thresh: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            pairwise_dist: DEFAULT_PAIRWISE_DIST,
            quorum: DEFAULT_QUORUM,
            output_conf_thresh: DEFAULT_OUTPUT_CONF_THRESH,
        }
    }
}

impl MergeConfig {
    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_pairwise_dist(mut self, pairwise_dist: f64) -> Self {
        self.pairwise_dist = pairwise_dist;
        self
    }

    pub fn with_output_conf_thresh(mut self, output_conf_thresh: f64) -> Self {
        self.output_conf_thresh = output_conf_thresh;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        config::validate_unit_interval(self.pairwise_dist, ConfigError::InvalidDistance)?;
        config::validate_unit_interval(self.output_conf_thresh, ConfigError::InvalidConfidence)?;
        Ok(())
    }
}

/// Consensus merge of datasets that annotate the same frames.
#[derive(Debug, Clone)]
pub struct IntersectMerge {
    config: MergeConfig,
}

impl IntersectMerge {
    pub fn new(config: MergeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Produce a new dataset with one vote-resolved annotation per accepted
    /// cluster. Inputs are left untouched.
    pub fn merge(&self, sources: &[Dataset]) -> Result<Dataset> {
        let union = CategoryUnion::build(sources);
        let aligned = align(sources);

        let items = aligned
            .par_iter()
            .enumerate()
            .map(|(id, members)| self.merge_item(id as u64, members, &union))
            .collect::<std::result::Result<Vec<_>, DatasetError>>()?;

        let mut output = Dataset::with_categories(union.categories().to_vec())?;
        for item in items {
            output.push_item(item)?;
        }

        log::info!(
            "Merged {} source(s) into {} item(s) with {} annotation(s)",
            sources.len(),
            output.len(),
            output.total_annotations()
        );
        Ok(output)
    }

    fn merge_item(
        &self,
        id: u64,
        members: &[(usize, &Item)],
        union: &CategoryUnion,
    ) -> std::result::Result<Item, DatasetError> {
        let (_, first) = members[0];
        let mut pooled = Vec::new();
        for (source, item) in members {
            for ann in &item.annotations {
                let mut ann = remap(ann, *source, item.id, union)?;
                ann.source_id = Some(*source);
                pooled.push(ann);
            }
        }

        let mut annotations = Vec::new();
        for group in cluster(&pooled, self.config.pairwise_dist) {
            let members: Vec<&Annotation> = group.iter().map(|i| &pooled[*i]).collect();
            let voters = support(&members);
            if voters < self.config.quorum {
                log::debug!(
                    "Item {}: cluster of {} box(es) from {} source(s) below quorum {}",
                    first.media.frame_key(),
                    members.len(),
                    voters,
                    self.config.quorum
                );
                continue;
            }
            match resolve(&members) {
                Some(ann) if ann.confidence >= self.config.output_conf_thresh => {
                    annotations.push(ann)
                }
                _ => {}
            }
        }

        Ok(Item::new(id, first.media.clone(), first.width, first.height)
            .with_annotations(annotations))
    }
}

/// Group items of all sources by frame key, in first-seen order.
fn align(sources: &[Dataset]) -> Vec<Vec<(usize, &Item)>> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut aligned: Vec<Vec<(usize, &Item)>> = Vec::new();
    for (source, dataset) in sources.iter().enumerate() {
        for item in dataset {
            let slot = *slots.entry(item.media.frame_key()).or_insert_with(|| {
                aligned.push(Vec::new());
                aligned.len() - 1
            });
            aligned[slot].push((source, item));
        }
    }
    aligned
}

fn remap(
    ann: &Annotation,
    source: usize,
    item: u64,
    union: &CategoryUnion,
) -> std::result::Result<Annotation, DatasetError> {
    let label_id = union
        .map(source, ann.label_id)
        .ok_or(DatasetError::UnknownLabel {
            item,
            label_id: ann.label_id,
        })?;
    Ok(Annotation {
        label_id,
        ..ann.clone()
    })
}

/// Concatenate datasets with disjoint item ids, unioning categories by name.
pub fn accumulate(sources: &[Dataset]) -> Result<Dataset> {
    let union = CategoryUnion::build(sources);
    let mut output = Dataset::with_categories(union.categories().to_vec())?;

    for (source, dataset) in sources.iter().enumerate() {
        for item in dataset {
            let annotations = item
                .annotations
                .iter()
                .map(|ann| remap(ann, source, item.id, &union))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            output.push_item(Item {
                annotations,
                ..item.clone()
            })?;
        }
    }

    log::info!(
        "Accumulated {} source(s) into {} item(s)",
        sources.len(),
        output.len()
    );
    Ok(output)
}

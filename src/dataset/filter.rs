use super::Dataset;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Prune boxes with zero width or height.
    pub drop_degenerate: bool,
    /// Prune occluded boxes before judging a frame empty.
    pub drop_occluded: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            drop_degenerate: true,
            drop_occluded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub dataset: Dataset,
    pub pruned_annotations: usize,
    pub removed_items: usize,
}

impl FilterOutcome {
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }
}

/// Prune unusable annotations and drop every frame left without any.
pub fn filter_empty_frames(mut dataset: Dataset, config: &FilterConfig) -> FilterOutcome {
    let mut pruned_annotations = 0;
    for annotations in dataset.annotations_mut() {
        let before = annotations.len();
        annotations.retain(|ann| {
            !(config.drop_degenerate && ann.bbox.is_degenerate())
                && !(config.drop_occluded && ann.occluded)
        });
        pruned_annotations += before - annotations.len();
    }

    let before = dataset.len();
    dataset.retain(|item| !item.is_empty());
    let removed_items = before - dataset.len();

    log::debug!(
        "Filtered {} empty frame(s), pruned {} annotation(s)",
        removed_items,
        pruned_annotations
    );

    FilterOutcome {
        dataset,
        pruned_annotations,
        removed_items,
    }
}

//! Multi-source preparation and merge runs.
//!
//! Each input goes through detection, import, empty-frame filtering and
//! reindexing before the prepared sources are merged by consensus or
//! accumulated. All intermediate files live in a [`ScratchSpace`] owned by
//! the [`Orchestrator`], which removes them when the orchestrator is dropped.

mod scratch;

pub use scratch::ScratchSpace;

use crate::archive;
use crate::dataset::{Dataset, FilterConfig, filter_empty_frames};
use crate::error::{CurateError, Result};
use crate::formats::{DatasetFormat, DatumaroFormat, ExportOptions, FormatRegistry, fixup_media_dirs};
use crate::merge::{self, IntersectMerge, MergeConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStage {
    Imported,
    Filtered,
    Reindexed,
    ReadyToMerge,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Several sources were combined into one output.
    Merged,
    /// A single-dataset command finished.
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub path: PathBuf,
    pub format: String,
    pub stage: SourceStage,
    pub imported_items: usize,
    pub removed_items: usize,
    pub pruned_annotations: usize,
    /// Ids assigned by reindexing.
    pub id_range: Option<Range<u64>>,
}

impl SourceReport {
    fn new(path: &Path, format: &str, imported_items: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            format: format.to_string(),
            stage: SourceStage::Imported,
            imported_items,
            removed_items: 0,
            pruned_annotations: 0,
            id_range: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// `None` skips empty-frame filtering.
    pub filter: Option<FilterConfig>,
    /// Keep scratch files and write per-stage snapshots.
    pub debug: bool,
}

impl PipelineOptions {
    pub fn filtered(filter: FilterConfig) -> Self {
        Self {
            filter: Some(filter),
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Sources that made it through preparation, with a report for every input.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSources {
    pub datasets: Vec<Dataset>,
    pub reports: Vec<SourceReport>,
}

impl PreparedSources {
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.stage == SourceStage::Skipped)
            .count()
    }

    pub fn total_items(&self) -> usize {
        self.datasets.iter().map(Dataset::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeMode {
    Consensus(MergeConfig),
    Accumulate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub dataset: Dataset,
    pub sources: Vec<SourceReport>,
}

pub struct Orchestrator {
    registry: FormatRegistry,
    options: PipelineOptions,
    scratch: ScratchSpace,
}

impl Orchestrator {
    pub fn new(options: PipelineOptions) -> Result<Self> {
        let scratch = ScratchSpace::new(options.debug)?;
        Ok(Self::with_scratch(options, scratch))
    }

    pub fn with_scratch(options: PipelineOptions, scratch: ScratchSpace) -> Self {
        Self {
            registry: FormatRegistry::builtin(),
            options,
            scratch,
        }
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    /// Detect and import one dataset directory or zip archive.
    pub fn import(&self, path: &Path) -> Result<(Dataset, &'static str)> {
        let root = if archive::is_archive(path) {
            let dest = self.scratch.allocate(&stem_of(path))?;
            archive::extract(path, &dest)?;
            dest
        } else {
            // media paths resolve against the root, keep them valid from any cwd
            fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
        };

        let format = self.registry.detect(&root)?;
        if format.name() == DatumaroFormat::NAME {
            fixup_media_dirs(&root);
        }
        let dataset = format.import(&root)?;
        log::info!(
            "Imported {} item(s) from {} ({})",
            dataset.len(),
            path.display(),
            format.name()
        );
        Ok((dataset, format.name()))
    }

    /// Import, filter and reindex every source in order. Reindexing hands
    /// out consecutive id ranges across sources. Sources left empty are
    /// skipped; any other failure aborts.
    pub fn prepare(&self, paths: &[PathBuf]) -> Result<PreparedSources> {
        let mut datasets = Vec::with_capacity(paths.len());
        let mut reports = Vec::with_capacity(paths.len());
        let mut next_id = 0u64;

        for path in paths {
            let (mut dataset, format) = self.import(path)?;
            let mut report = SourceReport::new(path, format, dataset.len());

            if let Some(filter) = &self.options.filter {
                let outcome = filter_empty_frames(dataset, filter);
                report.removed_items = outcome.removed_items;
                report.pruned_annotations = outcome.pruned_annotations;
                report.stage = SourceStage::Filtered;
                dataset = outcome.dataset;
                self.snapshot(path, "filtered", &dataset)?;
            }

            if dataset.is_empty() {
                let err = CurateError::EmptySource { path: path.clone() };
                log::warn!("{err}, skipping");
                report.stage = SourceStage::Skipped;
                reports.push(report);
                continue;
            }

            let count = dataset.reindex(next_id);
            report.id_range = Some(next_id..next_id + count);
            report.stage = SourceStage::Reindexed;
            next_id += count;
            self.snapshot(path, "reindexed", &dataset)?;

            report.stage = SourceStage::ReadyToMerge;
            datasets.push(dataset);
            reports.push(report);
        }

        Ok(PreparedSources { datasets, reports })
    }

    pub fn consensus(&self, prepared: &PreparedSources, config: MergeConfig) -> Result<Dataset> {
        IntersectMerge::new(config)?.merge(&prepared.datasets)
    }

    pub fn accumulate(&self, prepared: &PreparedSources) -> Result<Dataset> {
        merge::accumulate(&prepared.datasets)
    }

    pub fn run(&self, paths: &[PathBuf], mode: &MergeMode) -> Result<RunSummary> {
        let prepared = self.prepare(paths)?;
        log::info!(
            "{} of {} source(s) ready to merge ({} item(s))",
            prepared.len(),
            paths.len(),
            prepared.total_items()
        );
        let dataset = match mode {
            MergeMode::Consensus(config) => self.consensus(&prepared, config.clone())?,
            MergeMode::Accumulate => self.accumulate(&prepared)?,
        };
        Ok(RunSummary {
            dataset,
            sources: prepared.reports,
        })
    }

    /// Write `dataset` to `output` with `format`. Media is copied when asked,
    /// when the format cannot be read back without it, or when it was
    /// extracted into scratch space, which goes away with the orchestrator.
    /// Returns whether media was copied.
    pub fn write_output(
        &self,
        format: &dyn DatasetFormat,
        dataset: &Dataset,
        output: &Path,
        save_media: bool,
    ) -> Result<bool> {
        let in_scratch = dataset
            .iter()
            .any(|item| item.media.path.starts_with(self.scratch.root()));
        let copy = save_media || in_scratch || format.needs_media();
        if copy && !save_media {
            log::info!(
                "Copying media into {} ({})",
                output.display(),
                if in_scratch {
                    "extracted from an archive"
                } else {
                    "required by the format"
                }
            );
        }
        format.export(dataset, output, &ExportOptions::with_media(copy))?;
        Ok(copy)
    }

    fn snapshot(&self, source: &Path, stage: &str, dataset: &Dataset) -> Result<()> {
        if !self.options.debug {
            return Ok(());
        }
        let dir = self.scratch.allocate(&format!("{}.{stage}", stem_of(source)))?;
        DatumaroFormat.export(dataset, &dir, &ExportOptions::default())?;
        log::debug!("Wrote {stage} snapshot to {}", dir.display());
        Ok(())
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string())
}

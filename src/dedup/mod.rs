//! Near-duplicate frame removal.
//!
//! Frames are hashed up front on the rayon pool, then scanned strictly in
//! input order: each frame is compared against a strategy-dependent subset of
//! the hashes kept so far and dropped when any comparison falls below the
//! threshold.

mod strategy;

pub use strategy::{CheckStrategy, DedupMethod, Exhaustive, RandomSample, Sequential};

use crate::config::{self, ConfigError};
use crate::dataset::Dataset;
use crate::error::Result;
use crate::hash::{FrameHash, FrameHasher};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEFAULT_THRESHOLD: i64 = 10;
pub const DEFAULT_RATIO: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    pub method: DedupMethod,
    /// Frames closer than this Hamming distance are duplicates.
    pub threshold: i64,
    /// Share of kept frames sampled by the random method.
    pub ratio: f64,
    /// Seed for the random method; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            method: DedupMethod::Sequential,
            threshold: DEFAULT_THRESHOLD,
            ratio: DEFAULT_RATIO,
            seed: None,
        }
    }
}

impl DedupConfig {
    pub fn new(method: DedupMethod, threshold: i64) -> Self {
        Self {
            method,
            threshold,
            ..Self::default()
        }
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Returns the threshold as an unsigned distance once all values check out.
    pub fn validate(&self) -> Result<u32, ConfigError> {
        config::validate_ratio(self.ratio)?;
        config::validate_threshold(self.threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    /// Dropped; `distance` is the smallest distance among checked hashes.
    Duplicate { distance: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub dataset: Dataset,
    /// Ids of dropped items, in input order.
    pub removed: Vec<u64>,
}

impl DedupOutcome {
    pub fn kept(&self) -> usize {
        self.dataset.len()
    }

    pub fn duplicates(&self) -> usize {
        self.removed.len()
    }
}

/// Stateful keep/drop scan over an ordered sequence of frame hashes.
pub struct DuplicateSelector {
    strategy: Box<dyn CheckStrategy>,
    threshold: u32,
    kept: Vec<FrameHash>,
}

impl DuplicateSelector {
    pub fn new(config: &DedupConfig) -> Result<Self, ConfigError> {
        let threshold = config.validate()?;
        Ok(Self {
            strategy: config.method.build(config.ratio, config.seed),
            threshold,
            kept: Vec::new(),
        })
    }

    pub fn method_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn kept_hashes(&self) -> &[FrameHash] {
        &self.kept
    }

    /// Decide on the next frame in order. Kept hashes join the reference set.
    pub fn consider(&mut self, hash: FrameHash) -> Decision {
        let closest = self
            .strategy
            .check_set(&self.kept)
            .into_iter()
            .map(|check| hash.distance(check))
            .min();

        match closest {
            Some(distance) if distance < self.threshold => Decision::Duplicate { distance },
            _ => {
                self.kept.push(hash);
                Decision::Keep
            }
        }
    }

    /// Hash every item (in parallel) and scan them in order, returning the
    /// surviving subsequence as a new dataset. `on_hashed` fires once per item.
    pub fn run<H, F>(mut self, dataset: &Dataset, hasher: &H, on_hashed: F) -> Result<DedupOutcome>
    where
        H: FrameHasher + ?Sized,
        F: Fn() + Sync,
    {
        let hashes: Vec<FrameHash> = dataset
            .items()
            .par_iter()
            .map(|item| {
                let hash = hasher.hash(item);
                on_hashed();
                hash
            })
            .collect::<std::result::Result<_, _>>()?;

        let mut output = Dataset::with_categories(dataset.categories().to_vec())?;
        let mut removed = Vec::new();

        for (item, hash) in dataset.iter().zip(hashes) {
            match self.consider(hash) {
                Decision::Keep => output.push_item(item.clone())?,
                Decision::Duplicate { distance } => {
                    log::debug!(
                        "Dropping item {} ({}): distance {} below {}",
                        item.id,
                        item.media.file_name(),
                        distance,
                        self.threshold
                    );
                    removed.push(item.id);
                }
            }
        }

        log::info!(
            "{} dedup kept {} of {} item(s)",
            self.method_name(),
            output.len(),
            dataset.len()
        );

        Ok(DedupOutcome {
            dataset: output,
            removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Item;
    use crate::dataset::test_support::*;
    use crate::hash::HashError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hashes looked up by item id.
    struct FixedHasher(HashMap<u64, FrameHash>);

    impl FixedHasher {
        fn new(values: &[u64]) -> (Self, Dataset) {
            let map = values
                .iter()
                .enumerate()
                .map(|(id, v)| (id as u64, FrameHash::from_u64(*v)))
                .collect();
            let items = (0..values.len() as u64).map(|id| frame(id, vec![])).collect();
            (Self(map), dataset(&["car"], items))
        }
    }

    impl FrameHasher for FixedHasher {
        fn hash(&self, item: &Item) -> std::result::Result<FrameHash, HashError> {
            self.0.get(&item.id).cloned().ok_or(HashError::Missing(item.id))
        }
    }

    /// `n` low bits set: distance `n` from the zero hash.
    fn bits(n: u32) -> u64 {
        if n == 64 { u64::MAX } else { (1u64 << n) - 1 }
    }

    fn kept_ids(values: &[u64], config: &DedupConfig) -> Vec<u64> {
        let (hasher, ds) = FixedHasher::new(values);
        let outcome = DuplicateSelector::new(config)
            .unwrap()
            .run(&ds, &hasher, || {})
            .unwrap();
        outcome.dataset.iter().map(|i| i.id).collect()
    }

    /// Groups of identical hashes, each group far from the others.
    fn clustered() -> Vec<u64> {
        let groups = [0u64, bits(20), bits(20) << 40, u64::MAX];
        [0, 0, 1, 1, 1, 0, 2, 3, 3, 2, 1, 0, 3]
            .iter()
            .map(|g| groups[*g])
            .collect()
    }

    #[test]
    fn test_sequential_scenario() {
        let values = [0, bits(3), bits(3), bits(20)];
        let config = DedupConfig::new(DedupMethod::Sequential, 5);
        assert_eq!(kept_ids(&values, &config), vec![0, 3]);
    }

    #[test]
    fn test_sequential_compares_with_last_kept_not_last_seen() {
        // item 2 is 4 bits from dropped item 1 but 8 bits from kept item 0
        let values = [0, bits(4), bits(8)];
        let config = DedupConfig::new(DedupMethod::Sequential, 5);
        assert_eq!(kept_ids(&values, &config), vec![0, 2]);
    }

    #[test]
    fn test_zero_threshold_keeps_everything() {
        let values = [0, 0, 0, bits(1), bits(1)];
        for method in DedupMethod::ALL {
            let config = DedupConfig::new(method, 0).with_ratio(1.0).with_seed(3);
            assert_eq!(kept_ids(&values, &config).len(), values.len(), "{method}");
        }
    }

    #[test]
    fn test_sequential_keeps_at_least_as_many_as_exhaustive() {
        let values = [0, bits(16), 0, bits(16), bits(15)];
        let seq = kept_ids(&values, &DedupConfig::new(DedupMethod::Sequential, 5));
        let exh = kept_ids(&values, &DedupConfig::new(DedupMethod::Exhaustive, 5));
        assert_eq!(seq, vec![0, 1, 2, 3]);
        assert_eq!(exh, vec![0, 1]);

        let values = clustered();
        let seq = kept_ids(&values, &DedupConfig::new(DedupMethod::Sequential, 5));
        let exh = kept_ids(&values, &DedupConfig::new(DedupMethod::Exhaustive, 5));
        assert!(seq.len() >= exh.len());
        assert_eq!(exh.len(), 4);
    }

    #[test]
    fn test_exhaustive_survivors_pairwise_distinct() {
        let values = clustered();
        let config = DedupConfig::new(DedupMethod::Exhaustive, 5);
        let kept = kept_ids(&values, &config);
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                let ha = FrameHash::from_u64(values[*a as usize]);
                let hb = FrameHash::from_u64(values[*b as usize]);
                assert!(ha.distance(&hb) >= 5);
            }
        }
    }

    #[test]
    fn test_deterministic_methods_repeat() {
        let values = clustered();
        for method in [DedupMethod::Sequential, DedupMethod::Exhaustive] {
            let config = DedupConfig::new(method, 5);
            assert_eq!(kept_ids(&values, &config), kept_ids(&values, &config));
        }
    }

    #[test]
    fn test_random_between_exhaustive_and_input() {
        let values = clustered();
        let exhaustive = kept_ids(&values, &DedupConfig::new(DedupMethod::Exhaustive, 5)).len();
        for seed in 0..20 {
            let config = DedupConfig::new(DedupMethod::Random, 5)
                .with_ratio(0.5)
                .with_seed(seed);
            let kept = kept_ids(&values, &config).len();
            assert!(kept >= exhaustive && kept <= values.len(), "seed {seed}: {kept}");
        }
    }

    #[test]
    fn test_random_full_ratio_matches_exhaustive() {
        let values = clustered();
        let exhaustive = kept_ids(&values, &DedupConfig::new(DedupMethod::Exhaustive, 5));
        let random = kept_ids(
            &values,
            &DedupConfig::new(DedupMethod::Random, 5).with_ratio(1.0).with_seed(9),
        );
        assert_eq!(random, exhaustive);
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let bad_ratio = DedupConfig::new(DedupMethod::Random, 5).with_ratio(0.0);
        assert_eq!(
            DuplicateSelector::new(&bad_ratio).err(),
            Some(ConfigError::InvalidRatio(0.0))
        );

        let bad_ratio = DedupConfig::new(DedupMethod::Random, 5).with_ratio(1.01);
        assert!(DuplicateSelector::new(&bad_ratio).is_err());

        let negative = DedupConfig::new(DedupMethod::Sequential, -1);
        assert_eq!(
            DuplicateSelector::new(&negative).err(),
            Some(ConfigError::NegativeThreshold(-1))
        );
    }

    #[test]
    fn test_outcome_reports_removed_ids_and_progress() {
        let values = [0, 0, bits(30), bits(30)];
        let (hasher, ds) = FixedHasher::new(&values);
        let hashed = AtomicUsize::new(0);
        let outcome = DuplicateSelector::new(&DedupConfig::new(DedupMethod::Exhaustive, 5))
            .unwrap()
            .run(&ds, &hasher, || {
                hashed.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(outcome.removed, vec![1, 3]);
        assert_eq!(outcome.kept(), 2);
        assert_eq!(outcome.duplicates(), 2);
        assert_eq!(hashed.load(Ordering::Relaxed), 4);
        assert_eq!(outcome.dataset.categories(), ds.categories());
        // input untouched
        assert_eq!(ds.len(), 4);
    }

    #[test]
    fn test_hash_failure_propagates() {
        let (hasher, mut ds) = FixedHasher::new(&[0, 0]);
        ds.push_item(frame(99, vec![])).unwrap();
        let result = DuplicateSelector::new(&DedupConfig::default())
            .unwrap()
            .run(&ds, &hasher, || {});
        assert!(matches!(
            result,
            Err(crate::error::CurateError::Hash(HashError::Missing(99)))
        ));
    }
}

//! Registry of comparison strategies for the duplicate selector.

use crate::config::ConfigError;
use crate::hash::FrameHash;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chooses which previously kept hashes a new frame is compared against.
pub trait CheckStrategy: Send {
    fn name(&self) -> &'static str;

    fn check_set<'a>(&mut self, kept: &'a [FrameHash]) -> Vec<&'a FrameHash>;
}

/// Compare against the most recently kept frame only.
pub struct Sequential;

impl CheckStrategy for Sequential {
    fn name(&self) -> &'static str {
        DedupMethod::Sequential.name()
    }

    fn check_set<'a>(&mut self, kept: &'a [FrameHash]) -> Vec<&'a FrameHash> {
        kept.last().into_iter().collect()
    }
}

/// Compare against every kept frame.
pub struct Exhaustive;

impl CheckStrategy for Exhaustive {
    fn name(&self) -> &'static str {
        DedupMethod::Exhaustive.name()
    }

    fn check_set<'a>(&mut self, kept: &'a [FrameHash]) -> Vec<&'a FrameHash> {
        kept.iter().collect()
    }
}

/// Compare against `floor(kept * ratio)` kept frames sampled without replacement.
pub struct RandomSample {
    ratio: f64,
    rng: StdRng,
}

impl RandomSample {
    pub fn new(ratio: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { ratio, rng }
    }

    pub fn sample_size(&self, kept: usize) -> usize {
        ((kept as f64) * self.ratio).floor() as usize
    }
}

impl CheckStrategy for RandomSample {
    fn name(&self) -> &'static str {
        DedupMethod::Random.name()
    }

    fn check_set<'a>(&mut self, kept: &'a [FrameHash]) -> Vec<&'a FrameHash> {
        let amount = self.sample_size(kept.len());
        kept.choose_multiple(&mut self.rng, amount).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupMethod {
    #[default]
    Sequential,
    Random,
    Exhaustive,
}

impl DedupMethod {
    pub const ALL: [DedupMethod; 3] = [
        DedupMethod::Sequential,
        DedupMethod::Random,
        DedupMethod::Exhaustive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DedupMethod::Sequential => "sequential",
            DedupMethod::Random => "random",
            DedupMethod::Exhaustive => "exhaustive",
        }
    }

    /// Look a method up by name; the numeric effort levels `1..=3` are aliases.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        let name = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|method| method.name() == name)
            .or(match name.as_str() {
                "1" => Some(DedupMethod::Sequential),
                "2" => Some(DedupMethod::Random),
                "3" => Some(DedupMethod::Exhaustive),
                _ => None,
            })
            .ok_or(ConfigError::UnknownMethod(name))
    }

    pub fn build(self, ratio: f64, seed: Option<u64>) -> Box<dyn CheckStrategy> {
        match self {
            DedupMethod::Sequential => Box::new(Sequential),
            DedupMethod::Random => Box::new(RandomSample::new(ratio, seed)),
            DedupMethod::Exhaustive => Box::new(Exhaustive),
        }
    }
}

impl fmt::Display for DedupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DedupMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: u64) -> Vec<FrameHash> {
        (0..n).map(FrameHash::from_u64).collect()
    }

    #[test]
    fn test_lookup_by_name_and_level() {
        assert_eq!(DedupMethod::from_name("random"), Ok(DedupMethod::Random));
        assert_eq!(DedupMethod::from_name("Exhaustive"), Ok(DedupMethod::Exhaustive));
        assert_eq!(DedupMethod::from_name("1"), Ok(DedupMethod::Sequential));
        assert_eq!(DedupMethod::from_name("3"), Ok(DedupMethod::Exhaustive));
        assert_eq!(
            DedupMethod::from_name("fuzzy"),
            Err(ConfigError::UnknownMethod("fuzzy".to_string()))
        );
    }

    #[test]
    fn test_registry_names_round_trip() {
        for method in DedupMethod::ALL {
            let strategy = method.build(0.5, Some(1));
            assert_eq!(strategy.name(), method.name());
            assert_eq!(method.name().parse::<DedupMethod>(), Ok(method));
        }
    }

    #[test]
    fn test_sequential_checks_last_only() {
        let kept = hashes(4);
        let mut strategy = Sequential;
        assert_eq!(strategy.check_set(&kept), vec![&kept[3]]);
        assert!(strategy.check_set(&[]).is_empty());
    }

    #[test]
    fn test_exhaustive_checks_everything() {
        let kept = hashes(5);
        assert_eq!(Exhaustive.check_set(&kept).len(), 5);
    }

    #[test]
    fn test_random_sample_size_and_uniqueness() {
        let kept = hashes(10);
        let mut strategy = RandomSample::new(0.7, Some(42));
        let sample = strategy.check_set(&kept);
        assert_eq!(sample.len(), 7);

        let mut seen: Vec<_> = sample.iter().map(|h| h.to_string()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);

        // floor(1 * 0.7) == 0
        assert!(strategy.check_set(&kept[..1]).is_empty());
    }
}

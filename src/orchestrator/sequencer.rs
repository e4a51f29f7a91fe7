//! Spec ordering and sharding.
//!
//! Before dispatch the specs of a run are ordered so the slowest and
//! most likely failing files start first:
//!
//! | Priority | Rule |
//! |----------|------|
//! | 1 | files that failed last time |
//! | 2 | longer cached duration |
//! | 3 | bigger file (for files without a cached duration) |
//!
//! With `sequence.shuffle` the order is replaced by a shuffle, seeded when
//! `sequence.seed` is set.
//!
//! # Example
//!
//! ```
//! use vigil::orchestrator::sequencer::Shard;
//!
//! let shard: Shard = "2/3".parse().unwrap();
//! assert_eq!((shard.index, shard.count), (2, 3));
//! assert!("0/3".parse::<Shard>().is_err());
//! ```

use std::cmp::Ordering;
use std::path::Path;
use std::str::FromStr;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::thread_rng;
use sha2::{Digest, Sha256};

use crate::cache::{ResultsCache, StatsCache, cache_key};
use crate::config::SequenceConfig;
use crate::project::Spec;

/// Orders specs using the results and stats caches.
pub struct Sequencer<'a> {
    results: &'a ResultsCache,
    stats: &'a StatsCache,
    workspace_root: &'a Path,
    shuffle: bool,
    seed: Option<u64>,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        results: &'a ResultsCache,
        stats: &'a StatsCache,
        workspace_root: &'a Path,
        config: &SequenceConfig,
    ) -> Self {
        Self {
            results,
            stats,
            workspace_root,
            shuffle: config.shuffle,
            seed: config.seed,
        }
    }

    fn key(&self, spec: &Spec) -> String {
        let relative = spec.path.strip_prefix(self.workspace_root).unwrap_or(&spec.path);
        cache_key(spec.project_name(), relative)
    }

    /// Returns `specs` in execution order.
    pub fn sort(&self, mut specs: Vec<Spec>) -> Vec<Spec> {
        if self.shuffle {
            match self.seed {
                Some(seed) => specs.shuffle(&mut StdRng::seed_from_u64(seed)),
                None => specs.shuffle(&mut thread_rng()),
            }
            return specs;
        }

        let mut keyed: Vec<_> = specs
            .into_iter()
            .map(|spec| {
                let key = self.key(&spec);
                let cached = self.results.get(&key).copied();
                let size = self.stats.get(&key).map(|s| s.size).unwrap_or_default();
                (spec, cached, size)
            })
            .collect();

        keyed.sort_by(|(_, a, a_size), (_, b, b_size)| {
            let a_failed = a.is_some_and(|r| r.failed);
            let b_failed = b.is_some_and(|r| r.failed);
            if a_failed != b_failed {
                return if a_failed { Ordering::Less } else { Ordering::Greater };
            }
            match (a, b) {
                (Some(a), Some(b)) => b.duration.total_cmp(&a.duration),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => b_size.cmp(a_size),
            }
        });

        keyed.into_iter().map(|(spec, _, _)| spec).collect()
    }
}

/// One slice of a sharded run, `index` counting from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub count: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid shard {0:?}: expected <index>/<count> with 1 <= index <= count")]
pub struct InvalidShard(String);

impl FromStr for Shard {
    type Err = InvalidShard;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidShard(s.to_string());
        let (index, count) = s.split_once('/').ok_or_else(invalid)?;
        let index: usize = index.trim().parse().map_err(|_| invalid())?;
        let count: usize = count.trim().parse().map_err(|_| invalid())?;
        if index == 0 || count == 0 || index > count {
            return Err(invalid());
        }
        Ok(Shard { index, count })
    }
}

impl Shard {
    /// Keeps this shard's slice of `specs`.
    ///
    /// Specs are sorted by the SHA-256 of their path first, so every machine
    /// computes the same slices regardless of discovery order.
    pub fn apply(&self, specs: Vec<Spec>) -> Vec<Spec> {
        let mut hashed: Vec<_> = specs
            .into_iter()
            .map(|spec| {
                let digest = Sha256::digest(spec.path.to_string_lossy().as_bytes()).to_vec();
                (digest, spec)
            })
            .collect();
        hashed.sort_by(|(a, _), (b, _)| a.cmp(b));

        let size = hashed.len().div_ceil(self.count);
        let start = size * (self.index - 1);
        hashed
            .into_iter()
            .skip(start)
            .take(size)
            .map(|(_, spec)| spec)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileStats, SuiteResult};
    use crate::pool::testing::project;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn specs(names: &[&str]) -> Vec<Spec> {
        let project = project("unit");
        names
            .iter()
            .map(|n| Spec::new(project.clone(), PathBuf::from("/work").join(n)))
            .collect()
    }

    fn names(specs: &[Spec]) -> Vec<String> {
        specs
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_failed_then_slowest_then_biggest() {
        let mut results = ResultsCache::default();
        results.insert(
            "unit:fast.test.ts".into(),
            SuiteResult {
                duration: 10.0,
                failed: false,
            },
        );
        results.insert(
            "unit:slow.test.ts".into(),
            SuiteResult {
                duration: 500.0,
                failed: false,
            },
        );
        results.insert(
            "unit:broken.test.ts".into(),
            SuiteResult {
                duration: 1.0,
                failed: true,
            },
        );
        let mut stats = StatsCache::default();
        stats.insert("unit:big.test.ts".into(), FileStats { size: 9000 });
        stats.insert("unit:small.test.ts".into(), FileStats { size: 10 });

        let sequencer = Sequencer::new(&results, &stats, Path::new("/work"), &SequenceConfig::default());
        let sorted = sequencer.sort(specs(&[
            "small.test.ts",
            "fast.test.ts",
            "big.test.ts",
            "slow.test.ts",
            "broken.test.ts",
        ]));
        assert_eq!(
            names(&sorted),
            vec!["broken.test.ts", "slow.test.ts", "fast.test.ts", "big.test.ts", "small.test.ts"]
        );
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let results = ResultsCache::default();
        let stats = StatsCache::default();
        let config = SequenceConfig {
            shuffle: true,
            seed: Some(7),
        };
        let files: Vec<String> = (0..20).map(|i| format!("{i}.test.ts")).collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();

        let a = Sequencer::new(&results, &stats, Path::new("/work"), &config).sort(specs(&refs));
        let b = Sequencer::new(&results, &stats, Path::new("/work"), &config).sort(specs(&refs));
        assert_eq!(names(&a), names(&b));
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn test_shards_partition_specs() {
        let files: Vec<String> = (0..10).map(|i| format!("{i}.test.ts")).collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();

        let mut seen = HashSet::new();
        for index in 1..=3 {
            let shard = Shard { index, count: 3 };
            let slice = shard.apply(specs(&refs));
            assert!(slice.len() <= 4);
            for spec in slice {
                assert!(seen.insert(spec.path));
            }
        }
        assert_eq!(seen.len(), 10);

        let mut reversed = refs.clone();
        reversed.reverse();
        let shard = Shard { index: 2, count: 3 };
        assert_eq!(names(&shard.apply(specs(&refs))), names(&shard.apply(specs(&reversed))));
    }

    #[test]
    fn test_parse_shard() {
        assert_eq!("1/2".parse::<Shard>().unwrap(), Shard { index: 1, count: 2 });
        assert!("3/2".parse::<Shard>().is_err());
        assert!("a/b".parse::<Shard>().is_err());
        assert!("1".parse::<Shard>().is_err());
    }
}

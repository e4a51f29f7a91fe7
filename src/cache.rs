//! Results and file statistics caches.
//!
//! Both caches are advisory: they bias the order in which specs are
//! dispatched and can be deleted at any time. The results cache is stored in
//! `{cache_dir}/results.json`:
//!
//! ```json
//! {
//!   "version": "0.4.0",
//!   "results": [
//!     ["unit:src/math.test.ts", { "duration": 12.5, "failed": false }]
//!   ]
//! }
//! ```
//!
//! Keys are `"{project}:{path relative to the workspace root}"`. A file
//! written by a version older than [`MIN_SUPPORTED_VERSION`] is ignored.
//!
//! # Example
//!
//! ```no_run
//! use vigil::cache::{ResultsCache, SuiteResult, cache_key};
//! use std::path::Path;
//!
//! let cache_dir = Path::new("/path/to/project/.vigil");
//! let mut cache = ResultsCache::load(cache_dir);
//!
//! let key = cache_key("unit", Path::new("src/math.test.ts"));
//! cache.insert(key, SuiteResult { duration: 12.5, failed: false });
//!
//! cache.save(cache_dir).unwrap();
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Version written into new cache files.
pub const CACHE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Oldest cache format still understood.
pub const MIN_SUPPORTED_VERSION: &str = "0.3.0";

const RESULTS_FILE: &str = "results.json";

/// Builds a cache key from a project name and a workspace-relative path.
pub fn cache_key(project_name: &str, relative: &Path) -> String {
    format!("{}:{}", project_name, relative.to_string_lossy())
}

/// Last known outcome of a file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    /// Duration in milliseconds.
    pub duration: f64,

    pub failed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultsFile {
    version: String,
    results: Vec<(String, SuiteResult)>,
}

/// Cache of per-file durations and failures.
#[derive(Debug, Clone, Default)]
pub struct ResultsCache {
    results: HashMap<String, SuiteResult>,
}

impl ResultsCache {
    /// Loads the cache from `{cache_dir}/results.json`.
    ///
    /// Missing, unreadable, malformed and outdated files all produce an
    /// empty cache.
    pub fn load(cache_dir: &Path) -> Self {
        let cache_path = cache_dir.join(RESULTS_FILE);

        tracing::debug!("Loading results cache from: {}", cache_path.display());

        if !cache_path.exists() {
            tracing::debug!("Cache file does not exist, returning empty cache");
            return Self::default();
        }

        let contents = match fs::read_to_string(&cache_path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!("Failed to read results cache, returning empty cache: {}", e);
                return Self::default();
            }
        };

        match serde_json::from_str::<ResultsFile>(&contents) {
            Ok(file) if is_supported(&file.version) => {
                tracing::debug!("Loaded {} cached results", file.results.len());
                Self {
                    results: file.results.into_iter().collect(),
                }
            }
            Ok(file) => {
                tracing::debug!(
                    "Ignoring results cache written by version {} (minimum {})",
                    file.version,
                    MIN_SUPPORTED_VERSION
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to parse results cache, returning empty cache: {}", e);
                Self::default()
            }
        }
    }

    /// Writes the cache to `{cache_dir}/results.json`, creating the
    /// directory if needed.
    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        let cache_path = cache_dir.join(RESULTS_FILE);

        tracing::debug!("Saving results cache to: {}", cache_path.display());

        fs::create_dir_all(cache_dir).context("Failed to create cache directory")?;

        let mut results: Vec<_> = self.results.iter().map(|(k, v)| (k.clone(), *v)).collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        let file = ResultsFile {
            version: CACHE_VERSION.to_string(),
            results,
        };
        let contents = serde_json::to_string(&file).context("Failed to serialize results cache")?;

        fs::write(&cache_path, contents).context("Failed to write results cache")?;

        tracing::debug!("Saved {} cached results", self.results.len());

        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&SuiteResult> {
        self.results.get(key)
    }

    pub fn insert(&mut self, key: String, result: SuiteResult) {
        self.results.insert(key, result);
    }

    /// Records the outcome of files that ran.
    ///
    /// `results` holds `(project, workspace-relative path, duration, failed)`.
    /// Negative durations are stored as zero.
    pub fn update_results<I>(&mut self, results: I)
    where
        I: IntoIterator<Item = (String, PathBuf, f64, bool)>,
    {
        for (project, relative, duration, failed) in results {
            let duration = if duration.is_finite() && duration > 0.0 {
                duration
            } else {
                0.0
            };
            self.results
                .insert(cache_key(&project, &relative), SuiteResult { duration, failed });
        }
    }

    /// Removes the entries of `relative` for every project.
    pub fn remove_path(&mut self, relative: &Path) {
        let suffix = format!(":{}", relative.to_string_lossy());
        self.results.retain(|key, _| !key.ends_with(&suffix));
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<(String, SuiteResult)> {
        let mut entries: Vec<_> = self.results.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

fn is_supported(version: &str) -> bool {
    match (parse_version(version), parse_version(MIN_SUPPORTED_VERSION)) {
        (Some(found), Some(minimum)) => found >= minimum,
        _ => false,
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    Some((major, minor, patch))
}

/// Size of a test file at the start of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub size: u64,
}

/// In-memory cache of file sizes. Used to order specs without cached
/// durations.
#[derive(Debug, Clone, Default)]
pub struct StatsCache {
    stats: HashMap<String, FileStats>,
}

impl StatsCache {
    pub fn get(&self, key: &str) -> Option<FileStats> {
        self.stats.get(key).copied()
    }

    pub fn insert(&mut self, key: String, stats: FileStats) {
        self.stats.insert(key, stats);
    }

    /// Reads the size of every `(project, absolute path)` pair. Files that
    /// cannot be read are skipped.
    pub async fn populate<'a, I>(&mut self, workspace_root: &Path, files: I)
    where
        I: IntoIterator<Item = (&'a str, &'a Path)>,
    {
        for (project, path) in files {
            match tokio::fs::metadata(path).await {
                Ok(metadata) => {
                    let relative = path.strip_prefix(workspace_root).unwrap_or(path);
                    self.stats.insert(
                        cache_key(project, relative),
                        FileStats {
                            size: metadata.len(),
                        },
                    );
                }
                Err(e) => {
                    tracing::debug!("Failed to stat {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Removes the entries of `relative` for every project.
    pub fn remove_path(&mut self, relative: &Path) {
        let suffix = format!(":{}", relative.to_string_lossy());
        self.stats.retain(|key, _| !key.ends_with(&suffix));
    }
}

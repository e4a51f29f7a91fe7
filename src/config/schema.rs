//! Configuration schema definitions for vigil.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every field carries a serde default so that an
//! empty file is a valid configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── VigilConfig            - Core settings (pool, workers, bail, teardown)
//! ├── ProjectConfig[]        - One entry per project scope
//! │   ├── include / exclude  - Test file globs
//! │   ├── environment        - Default environment + glob overrides
//! │   ├── pool               - Default pool + glob overrides
//! │   ├── transform_mode     - web / ssr glob tables
//! │   ├── typecheck          - Typecheck-only files
//! │   └── browser            - Browser mode
//! ├── PoolsConfig            - Worker commands for process-backed pools
//! ├── WatchConfig            - Debounce, force-rerun and trigger patterns
//! └── CacheConfig            - Results cache location
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Root configuration structure for vigil.
///
/// # TOML Structure
///
/// ```toml
/// [vigil]
/// pool = "forks"
/// max_workers = 4
///
/// [[projects]]
/// name = "unit"
/// include = ["src/**/*.test.ts"]
/// environment = "node"
///
/// [pools.forks]
/// command = "node ./vigil-worker.mjs"
/// ```
///
/// # Example
///
/// ```
/// use vigil::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [vigil]
///     max_workers = 2
///
///     [[projects]]
///     name = "unit"
/// "#).unwrap();
/// assert_eq!(config.vigil.max_workers, Some(2));
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core vigil settings.
    #[serde(default)]
    pub vigil: VigilConfig,

    /// Project scopes. When empty, a single unnamed project rooted at
    /// [`VigilConfig::root`] is used.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    /// Worker commands for process-backed pools.
    #[serde(default)]
    pub pools: PoolsConfig,

    /// Watch mode settings.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Results cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Returns the configured projects, or a single default project when
    /// none are configured.
    pub fn resolved_projects(&self) -> Vec<ProjectConfig> {
        if self.projects.is_empty() {
            vec![ProjectConfig::default()]
        } else {
            self.projects.clone()
        }
    }
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `root` | `"."` |
/// | `pool` | `forks` |
/// | `max_workers` | derived from CPU count |
/// | `file_parallelism` | true |
/// | `bail` | 0 (never) |
/// | `teardown_timeout_ms` | 10000 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VigilConfig {
    /// Workspace root. Project roots and cache paths are relative to it.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Pool used when neither a glob override nor a project pool applies.
    #[serde(default)]
    pub pool: PoolName,

    /// Maximum number of concurrent workers per pool.
    ///
    /// Default: CPU count minus one, or half the CPU count in watch mode.
    pub max_workers: Option<usize>,

    /// Number of idle workers kept alive between runs.
    pub min_workers: Option<usize>,

    /// Run test files in parallel. When false every pool uses one worker.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub file_parallelism: bool,

    /// Cancel the run after this many failed tests. 0 disables bailing.
    #[serde(default)]
    pub bail: usize,

    /// Exit successfully when no test files are found.
    #[serde(default)]
    pub pass_with_no_tests: bool,

    /// Time allowed for a worker or global teardown to finish.
    ///
    /// Default: 10000
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout_ms: u64,

    /// Memory limit after which vm-isolated workers are recycled.
    ///
    /// See [`MemoryLimit`] for accepted forms. Default: `1 / max_workers`
    /// of total system memory.
    pub memory_limit: Option<MemoryLimit>,

    /// Values handed to every worker as `provided_context`.
    #[serde(default)]
    pub provide: HashMap<String, serde_json::Value>,

    /// Spec ordering options.
    #[serde(default)]
    pub sequence: SequenceConfig,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            pool: PoolName::default(),
            max_workers: None,
            min_workers: None,
            file_parallelism: true,
            bail: 0,
            pass_with_no_tests: false,
            teardown_timeout_ms: default_teardown_timeout(),
            memory_limit: None,
            provide: HashMap::new(),
            sequence: SequenceConfig::default(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_teardown_timeout() -> u64 {
    10_000
}

/// Spec ordering options.
///
/// ```toml
/// [vigil.sequence]
/// shuffle = true
/// seed = 42
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SequenceConfig {
    /// Shuffle specs instead of ordering them by cached results.
    #[serde(default)]
    pub shuffle: bool,

    /// Seed for the shuffle. A fixed seed gives a reproducible order.
    pub seed: Option<u64>,
}

/// Name of a pool driver.
///
/// Built-in names are `forks`, `threads`, `vm-threads`, `vm-forks`,
/// `browser` and `typecheck`. Any other name selects a custom pool
/// registered on the orchestrator under that name.
///
/// # Example
///
/// ```
/// use vigil::config::PoolName;
///
/// assert_eq!("vm-forks".parse::<PoolName>().unwrap(), PoolName::VmForks);
/// assert_eq!("mine".parse::<PoolName>().unwrap(), PoolName::Custom("mine".into()));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum PoolName {
    #[default]
    Forks,
    Threads,
    VmThreads,
    VmForks,
    Browser,
    Typecheck,
    Custom(String),
}

impl PoolName {
    pub fn as_str(&self) -> &str {
        match self {
            PoolName::Forks => "forks",
            PoolName::Threads => "threads",
            PoolName::VmThreads => "vm-threads",
            PoolName::VmForks => "vm-forks",
            PoolName::Browser => "browser",
            PoolName::Typecheck => "typecheck",
            PoolName::Custom(name) => name,
        }
    }
}

impl FromStr for PoolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = match s.trim() {
            "" => return Err("pool name cannot be empty".to_string()),
            "forks" => PoolName::Forks,
            "threads" => PoolName::Threads,
            "vm-threads" | "vmThreads" => PoolName::VmThreads,
            "vm-forks" | "vmForks" => PoolName::VmForks,
            "browser" => PoolName::Browser,
            "typecheck" => PoolName::Typecheck,
            other => PoolName::Custom(other.to_string()),
        };
        Ok(name)
    }
}

impl TryFrom<String> for PoolName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PoolName> for String {
    fn from(value: PoolName) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory limit for recycling vm-isolated workers.
///
/// Accepted forms:
///
/// | Value | Meaning |
/// |-------|---------|
/// | `0.25` | Fraction of total memory (values `<= 1`) |
/// | `536870912` | Bytes |
/// | `"50%"` | Percentage of total memory |
/// | `"512MB"`, `"2GiB"`, `"300kb"` | Bytes with a unit |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Number(f64),
    Text(String),
}

/// Configuration of a single project scope.
///
/// # Example
///
/// ```toml
/// [[projects]]
/// name = "dom"
/// root = "packages/web"
/// include = ["test/**/*.test.ts"]
/// environment = "jsdom"
/// isolate = false
/// global_setup = ["./scripts/start-db.sh"]
/// global_teardown = ["./scripts/stop-db.sh"]
///
/// [[projects.environment_match_globs]]
/// glob = "test/server/**"
/// environment = "node"
///
/// [[projects.pool_match_globs]]
/// glob = "test/native/**"
/// pool = "forks"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    /// Project name. Used as the first half of every cache key.
    #[serde(default)]
    pub name: String,

    /// Project root, relative to the workspace root.
    pub root: Option<PathBuf>,

    /// Globs selecting test files, relative to the project root.
    #[serde(default = "default_include")]
    pub include: Vec<String>,

    /// Globs removed from the include set.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Globs selecting source files that may contain in-source tests.
    #[serde(default)]
    pub include_source: Vec<String>,

    /// Default execution environment.
    ///
    /// Default: `node`
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Ordered glob-to-environment overrides. The first match wins.
    #[serde(default)]
    pub environment_match_globs: Vec<EnvironmentGlob>,

    /// Pool for this project. Falls back to [`VigilConfig::pool`].
    pub pool: Option<PoolName>,

    /// Glob-to-pool overrides. The most specific matching glob wins.
    #[serde(default)]
    pub pool_match_globs: Vec<PoolGlob>,

    /// Transform mode glob tables.
    #[serde(default)]
    pub transform_mode: TransformModeConfig,

    /// Run every file in a fresh worker.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub isolate: bool,

    /// Run all files of this project sequentially inside one worker.
    #[serde(default)]
    pub single_worker: bool,

    /// Shell commands run once before the first run touching this project.
    #[serde(default)]
    pub global_setup: Vec<String>,

    /// Shell commands run after the run (or at close in watch mode).
    #[serde(default)]
    pub global_teardown: Vec<String>,

    /// Typecheck settings.
    #[serde(default)]
    pub typecheck: TypecheckConfig,

    /// Browser mode settings.
    #[serde(default)]
    pub browser: BrowserConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            root: None,
            include: default_include(),
            exclude: default_exclude(),
            include_source: Vec::new(),
            environment: default_environment(),
            environment_match_globs: Vec::new(),
            pool: None,
            pool_match_globs: Vec::new(),
            transform_mode: TransformModeConfig::default(),
            isolate: true,
            single_worker: false,
            global_setup: Vec::new(),
            global_teardown: Vec::new(),
            typecheck: TypecheckConfig::default(),
            browser: BrowserConfig::default(),
        }
    }
}

fn default_include() -> Vec<String> {
    vec!["**/*.{test,spec}.{js,mjs,cjs,ts,mts,cts,jsx,tsx}".to_string()]
}

fn default_exclude() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/dist/**".to_string(),
        "**/.git/**".to_string(),
    ]
}

fn default_environment() -> String {
    "node".to_string()
}

/// A glob-to-environment rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentGlob {
    pub glob: String,
    pub environment: String,
}

/// A glob-to-pool rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolGlob {
    pub glob: String,
    pub pool: PoolName,
}

/// Globs assigning a transform mode to files.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransformModeConfig {
    #[serde(default)]
    pub web: Vec<String>,
    #[serde(default)]
    pub ssr: Vec<String>,
}

/// Typecheck settings for a project.
///
/// When enabled, files matching `include` run in the typecheck pool. With
/// `only`, every test file of the project does.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TypecheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub only: bool,

    #[serde(default = "default_typecheck_include")]
    pub include: Vec<String>,
}

impl Default for TypecheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            only: false,
            include: default_typecheck_include(),
        }
    }
}

fn default_typecheck_include() -> Vec<String> {
    vec!["**/*.{test,spec}-d.{ts,mts,cts,tsx}".to_string()]
}

/// Browser mode settings for a project.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Browser provider name handed to the worker (e.g. `playwright`).
    pub provider: Option<String>,
}

/// Worker commands for process-backed pools.
///
/// ```toml
/// [pools.forks]
/// command = "node ./vigil-worker.mjs"
///
/// [pools.typecheck]
/// command = "node ./vigil-typecheck.mjs"
///
/// [pools.forks.env]
/// NODE_OPTIONS = "--enable-source-maps"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PoolsConfig {
    #[serde(default)]
    pub forks: WorkerCommandConfig,

    #[serde(default, rename = "vm-forks", alias = "vm_forks")]
    pub vm_forks: WorkerCommandConfig,

    #[serde(default)]
    pub browser: WorkerCommandConfig,

    #[serde(default)]
    pub typecheck: WorkerCommandConfig,
}

/// Command used to spawn one worker process.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkerCommandConfig {
    /// Shell-style command line, split with shell quoting rules.
    pub command: Option<String>,

    /// Extra environment variables for the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Watch mode settings.
///
/// ```toml
/// [watch]
/// debounce_ms = 100
/// force_rerun_triggers = ["**/vigil.toml", "**/package.json"]
///
/// [[watch.trigger_patterns]]
/// glob = "fixtures/**/*.json"
/// tests = ["test/fixtures.test.ts"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    /// Quiet period collapsing bursts of file events into one rerun.
    ///
    /// Default: 100
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Changing a file matching one of these globs reruns every test file.
    #[serde(default = "default_force_rerun_triggers")]
    pub force_rerun_triggers: Vec<String>,

    /// Files mapped to the tests they should trigger.
    #[serde(default)]
    pub trigger_patterns: Vec<TriggerPattern>,

    /// Paths never reported by the file watcher.
    #[serde(default = "default_watch_ignore")]
    pub ignore: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            force_rerun_triggers: default_force_rerun_triggers(),
            trigger_patterns: Vec::new(),
            ignore: default_watch_ignore(),
        }
    }
}

fn default_debounce() -> u64 {
    100
}

fn default_force_rerun_triggers() -> Vec<String> {
    vec!["**/package.json".to_string(), "**/vigil.toml".to_string()]
}

fn default_watch_ignore() -> Vec<String> {
    vec!["**/node_modules/**".to_string(), "**/.git/**".to_string()]
}

/// Maps files matching `glob` to test files, relative to the workspace root.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerPattern {
    pub glob: String,
    pub tests: Vec<PathBuf>,
}

/// Results cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Whether results are read and written at all.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory, relative to the workspace root.
    ///
    /// Default: `.vigil`
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".vigil")
}

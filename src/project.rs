//! Projects and the specs they own.
//!
//! A [`Project`] is a named configuration scope: its own include/exclude
//! globs, environment and pool rules, and isolation settings. A [`Spec`] is
//! the unit of discovery, a `(project, absolute file path)` pair. The same
//! file may appear once per project that claims it.
//!
//! # Discovery
//!
//! [`Project::glob_test_files`] walks the project root with `walkdir` and
//! keeps files matched by the include globs (or by the in-source globs when
//! the file contains the in-source marker) and not matched by the exclude
//! globs. Matching is always done on the path relative to the project root.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::config::{ConfigError, PoolName, ProjectConfig};

/// Marker a source file must contain to be treated as an in-source test file.
pub const IN_SOURCE_MARKER: &str = "import.meta.vigil";

/// A named configuration scope owning zero or more specs.
pub struct Project {
    name: String,
    root: PathBuf,
    config: ProjectConfig,
    default_pool: PoolName,
    include: GlobSet,
    exclude: GlobSet,
    include_source: GlobSet,
    typecheck: GlobSet,
    web: GlobSet,
    ssr: GlobSet,
    environment_globs: Vec<(GlobMatcher, String)>,
    pool_globs: Vec<PoolRule>,
    test_files: Mutex<BTreeSet<PathBuf>>,
}

struct PoolRule {
    matcher: GlobMatcher,
    specificity: usize,
    pool: PoolName,
}

impl Project {
    /// Builds a project from its configuration.
    ///
    /// `workspace_root` must be absolute; the project root is resolved
    /// against it. `global_pool` is used when the project sets no pool.
    pub fn new(
        config: ProjectConfig,
        workspace_root: &Path,
        global_pool: &PoolName,
    ) -> Result<Self, ConfigError> {
        let root = match &config.root {
            Some(root) => normalize(&workspace_root.join(root)),
            None => normalize(workspace_root),
        };

        let include = build_set("include", &config.include)?;
        let exclude = build_set("exclude", &config.exclude)?;
        let include_source = build_set("include_source", &config.include_source)?;
        let typecheck = build_set("typecheck.include", &config.typecheck.include)?;
        let web = build_set("transform_mode.web", &config.transform_mode.web)?;
        let ssr = build_set("transform_mode.ssr", &config.transform_mode.ssr)?;

        let environment_globs = config
            .environment_match_globs
            .iter()
            .map(|rule| {
                Ok((
                    build_matcher("environment_match_globs", &rule.glob)?,
                    rule.environment.clone(),
                ))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let pool_globs = config
            .pool_match_globs
            .iter()
            .map(|rule| {
                Ok(PoolRule {
                    matcher: build_matcher("pool_match_globs", &rule.glob)?,
                    specificity: glob_specificity(&rule.glob),
                    pool: rule.pool.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let default_pool = config.pool.clone().unwrap_or_else(|| global_pool.clone());

        Ok(Self {
            name: config.name.clone(),
            root,
            config,
            default_pool,
            include,
            exclude,
            include_source,
            typecheck,
            web,
            ssr,
            environment_globs,
            pool_globs,
            test_files: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Returns `path` relative to the project root, or `None` when the path
    /// lies outside of it.
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    /// Whether `path` is a known test file, or matches the include globs.
    pub fn is_test_file(&self, path: &Path) -> bool {
        if self.lock_test_files().contains(path) {
            return true;
        }
        self.matches_include(path)
    }

    /// Whether `path` is a test file of this project, reading the content
    /// lazily for in-source test detection.
    pub fn matches_test_glob<F>(&self, path: &Path, content: F) -> bool
    where
        F: FnOnce() -> Option<String>,
    {
        let Some(relative) = self.relative(path) else {
            return false;
        };
        if self.exclude.is_match(relative) {
            return false;
        }
        if self.include.is_match(relative) {
            return true;
        }
        if self.include_source.is_match(relative) {
            return content().is_some_and(|c| c.contains(IN_SOURCE_MARKER));
        }
        false
    }

    /// Whether [`matches_test_glob`](Self::matches_test_glob) has to look
    /// at the content of `path` to decide.
    pub fn needs_source(&self, path: &Path) -> bool {
        self.relative(path).is_some_and(|relative| {
            !self.exclude.is_match(relative)
                && !self.include.is_match(relative)
                && self.include_source.is_match(relative)
        })
    }

    fn matches_include(&self, path: &Path) -> bool {
        self.relative(path)
            .is_some_and(|relative| self.include.is_match(relative) && !self.exclude.is_match(relative))
    }

    /// Records `path` as a test file of this project.
    pub fn mark_test_file(&self, path: &Path) {
        self.lock_test_files().insert(path.to_path_buf());
    }

    /// Forgets a previously discovered test file.
    pub fn remove_test_file(&self, path: &Path) -> bool {
        self.lock_test_files().remove(path)
    }

    /// Returns the known test files.
    pub fn test_files(&self) -> Vec<PathBuf> {
        self.lock_test_files().iter().cloned().collect()
    }

    fn lock_test_files(&self) -> std::sync::MutexGuard<'_, BTreeSet<PathBuf>> {
        self.test_files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Walks the project root and returns every matching test file.
    ///
    /// `filters` are substrings matched against the relative path; an empty
    /// slice keeps every file. Discovered files are remembered as known
    /// test files.
    pub async fn glob_test_files(self: &Arc<Self>, filters: &[String]) -> std::io::Result<Vec<PathBuf>> {
        let project = Arc::clone(self);
        let filters = filters.to_vec();
        let files = tokio::task::spawn_blocking(move || project.walk_test_files(&filters))
            .await
            .map_err(std::io::Error::other)??;

        {
            let mut known = self.lock_test_files();
            known.clear();
            known.extend(files.iter().cloned());
        }

        debug!(
            "Project {:?} matched {} test files under {}",
            self.name,
            files.len(),
            self.root.display()
        );
        Ok(files)
    }

    fn walk_test_files(&self, filters: &[String]) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let walker = walkdir::WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !entry.file_type().is_dir() || !self.is_excluded_dir(entry.path()));

        for entry in walker {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let matched = self.matches_test_glob(path, || std::fs::read_to_string(path).ok());
            if !matched {
                continue;
            }
            if !filters.is_empty() {
                let relative = self.relative(path).unwrap_or(path).to_string_lossy();
                if !filters.iter().any(|f| relative.contains(f.as_str())) {
                    continue;
                }
            }
            files.push(path.to_path_buf());
        }
        Ok(files)
    }

    // A directory is pruned when a file directly beneath it would be excluded.
    fn is_excluded_dir(&self, dir: &Path) -> bool {
        match self.relative(dir) {
            Some(relative) if !relative.as_os_str().is_empty() => {
                self.exclude.is_match(relative.join("__probe__"))
            }
            _ => false,
        }
    }

    /// First matching glob-to-environment override for `path`.
    pub fn environment_for(&self, path: &Path) -> Option<&str> {
        let relative = self.relative(path)?;
        self.environment_globs
            .iter()
            .find(|(matcher, _)| matcher.is_match(relative))
            .map(|(_, env)| env.as_str())
    }

    /// Whether the web or ssr transform glob table matches `path`.
    pub fn transform_mode_for(&self, path: &Path) -> Option<crate::environment::TransformMode> {
        let relative = self.relative(path)?;
        if self.web.is_match(relative) {
            Some(crate::environment::TransformMode::Web)
        } else if self.ssr.is_match(relative) {
            Some(crate::environment::TransformMode::Ssr)
        } else {
            None
        }
    }

    /// Selects the pool for `path`.
    ///
    /// Glob overrides are checked first; among matching globs the one with
    /// the most literal characters wins, ties going to the first listed.
    /// Then typecheck and browser modes, then the project default.
    pub fn pool_for(&self, path: &Path) -> PoolName {
        if let Some(relative) = self.relative(path) {
            let mut best: Option<&PoolRule> = None;
            for rule in &self.pool_globs {
                if !rule.matcher.is_match(relative) {
                    continue;
                }
                if best.is_none_or(|b| rule.specificity > b.specificity) {
                    best = Some(rule);
                }
            }
            if let Some(rule) = best {
                return rule.pool.clone();
            }

            let typecheck = &self.config.typecheck;
            if typecheck.enabled && (typecheck.only || self.typecheck.is_match(relative)) {
                return PoolName::Typecheck;
            }
        }

        if self.config.browser.enabled {
            return PoolName::Browser;
        }
        self.default_pool.clone()
    }

    /// Whether files of this project run one per fresh worker.
    pub fn is_isolated(&self) -> bool {
        self.config.isolate && !self.config.single_worker
    }
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("default_pool", &self.default_pool)
            .finish()
    }
}

/// A `(project, absolute file path)` pair to execute.
#[derive(Clone)]
pub struct Spec {
    pub project: Arc<Project>,
    pub path: PathBuf,
}

impl Spec {
    pub fn new(project: Arc<Project>, path: impl Into<PathBuf>) -> Self {
        Self {
            project,
            path: path.into(),
        }
    }

    pub fn project_name(&self) -> &str {
        self.project.name()
    }
}

impl PartialEq for Spec {
    fn eq(&self, other: &Self) -> bool {
        self.project.name() == other.project.name() && self.path == other.path
    }
}

impl Eq for Spec {}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spec({:?}, {})", self.project.name(), self.path.display())
    }
}

/// Builds one project per configuration entry, rejecting duplicate names.
pub fn build_projects(
    configs: Vec<ProjectConfig>,
    workspace_root: &Path,
    global_pool: &PoolName,
) -> Result<Vec<Arc<Project>>, ConfigError> {
    let mut seen = BTreeSet::new();
    let mut projects = Vec::with_capacity(configs.len());
    for config in configs {
        if !seen.insert(config.name.clone()) {
            return Err(ConfigError::DuplicateProject(config.name));
        }
        projects.push(Arc::new(Project::new(config, workspace_root, global_pool)?));
    }
    Ok(projects)
}

fn build_matcher(field: &str, pattern: &str) -> Result<GlobMatcher, ConfigError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| ConfigError::InvalidGlob {
            field: field.to_string(),
            pattern: pattern.to_string(),
            message: err.to_string(),
        })
}

/// Compiles `patterns` into one set. Used for every glob list in the config.
pub fn build_set(field: &str, patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|err| ConfigError::InvalidGlob {
                field: field.to_string(),
                pattern: pattern.to_string(),
                message: err.to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| ConfigError::InvalidGlob {
        field: field.to_string(),
        pattern: patterns.join(", "),
        message: err.to_string(),
    })
}

fn glob_specificity(pattern: &str) -> usize {
    pattern
        .chars()
        .filter(|c| !matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | ','))
        .count()
}

/// Lexically normalizes a path, resolving `.` and `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolGlob, TypecheckConfig};
    use tempfile::TempDir;

    fn project(config: ProjectConfig) -> Project {
        Project::new(config, Path::new("/work"), &PoolName::Forks).unwrap()
    }

    #[test]
    fn test_default_include_matches_test_files() {
        let p = project(ProjectConfig::default());
        assert!(p.is_test_file(Path::new("/work/src/math.test.ts")));
        assert!(p.is_test_file(Path::new("/work/a.spec.js")));
        assert!(!p.is_test_file(Path::new("/work/src/math.ts")));
        assert!(!p.is_test_file(Path::new("/work/node_modules/x/a.test.js")));
        assert!(!p.is_test_file(Path::new("/elsewhere/a.test.js")));
    }

    #[test]
    fn test_in_source_requires_marker() {
        let p = project(ProjectConfig {
            include_source: vec!["src/**/*.ts".to_string()],
            ..Default::default()
        });
        let path = Path::new("/work/src/lib.ts");
        assert!(p.matches_test_glob(path, || Some("if (import.meta.vigil) {}".to_string())));
        assert!(!p.matches_test_glob(path, || Some("export const a = 1".to_string())));
    }

    #[test]
    fn test_most_specific_pool_glob_wins() {
        let p = project(ProjectConfig {
            pool_match_globs: vec![
                PoolGlob {
                    glob: "test/**".to_string(),
                    pool: PoolName::Threads,
                },
                PoolGlob {
                    glob: "test/native/**".to_string(),
                    pool: PoolName::VmForks,
                },
            ],
            ..Default::default()
        });
        assert_eq!(p.pool_for(Path::new("/work/test/native/a.test.ts")), PoolName::VmForks);
        assert_eq!(p.pool_for(Path::new("/work/test/a.test.ts")), PoolName::Threads);
        assert_eq!(p.pool_for(Path::new("/work/src/a.test.ts")), PoolName::Forks);
    }

    #[test]
    fn test_typecheck_and_browser_pools() {
        let p = project(ProjectConfig {
            typecheck: TypecheckConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(p.pool_for(Path::new("/work/types.test-d.ts")), PoolName::Typecheck);
        assert_eq!(p.pool_for(Path::new("/work/a.test.ts")), PoolName::Forks);

        let mut config = ProjectConfig::default();
        config.browser.enabled = true;
        let p = project(config);
        assert_eq!(p.pool_for(Path::new("/work/a.test.ts")), PoolName::Browser);
    }

    #[test]
    fn test_invalid_glob_is_reported() {
        let result = Project::new(
            ProjectConfig {
                include: vec!["[".to_string()],
                ..Default::default()
            },
            Path::new("/work"),
            &PoolName::Forks,
        );
        assert!(matches!(result, Err(ConfigError::InvalidGlob { .. })));
    }

    #[test]
    fn test_duplicate_project_names_rejected() {
        let configs = vec![ProjectConfig::default(), ProjectConfig::default()];
        let result = build_projects(configs, Path::new("/work"), &PoolName::Forks);
        assert!(matches!(result, Err(ConfigError::DuplicateProject(_))));
    }

    #[tokio::test]
    async fn test_glob_test_files_walks_and_filters() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        std::fs::write(root.join("src/a.test.ts"), "").unwrap();
        std::fs::write(root.join("src/b.test.ts"), "").unwrap();
        std::fs::write(root.join("src/b.ts"), "").unwrap();
        std::fs::write(root.join("node_modules/dep/c.test.ts"), "").unwrap();

        let p = Arc::new(Project::new(ProjectConfig::default(), root, &PoolName::Forks).unwrap());
        let files = p.glob_test_files(&[]).await.unwrap();
        assert_eq!(files, vec![root.join("src/a.test.ts"), root.join("src/b.test.ts")]);
        assert_eq!(p.test_files().len(), 2);

        let files = p.glob_test_files(&["b.test".to_string()]).await.unwrap();
        assert_eq!(files, vec![root.join("src/b.test.ts")]);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }
}

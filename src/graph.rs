//! Reverse-import graph used by watch mode.
//!
//! Workers report `(importer, imports)` edges as they load modules. Each
//! project keeps an arena-backed [`ImportGraph`]: modules are addressed by
//! [`ModuleId`] indices, and every node knows the modules that import it.
//! Slots of removed modules are reused, so a long watch session that keeps
//! adding and deleting files does not grow the arena.
//! The watch loop only reads the graph through the [`ModuleGraph`] trait.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Index of a module in an [`ImportGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

/// Read access to a module graph.
pub trait ModuleGraph {
    /// Modules loaded from `path`. Empty when the graph never saw it.
    fn modules_by_file(&self, path: &Path) -> Vec<ModuleId>;

    /// Modules that import `module`.
    fn importers(&self, module: ModuleId) -> Vec<ModuleId>;

    /// File a module was loaded from.
    fn file(&self, module: ModuleId) -> Option<&Path>;
}

#[derive(Debug, Clone)]
struct ModuleNode {
    file: PathBuf,
    importers: BTreeSet<ModuleId>,
    imports: BTreeSet<ModuleId>,
}

/// Arena of modules with import and importer edges.
#[derive(Debug, Clone, Default)]
pub struct ImportGraph {
    nodes: Vec<Option<ModuleNode>>,
    free: Vec<ModuleId>,
    by_file: HashMap<PathBuf, ModuleId>,
}

impl ImportGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the module for `file`, creating it if needed.
    pub fn ensure(&mut self, file: &Path) -> ModuleId {
        if let Some(id) = self.by_file.get(file) {
            return *id;
        }
        let node = ModuleNode {
            file: file.to_path_buf(),
            importers: BTreeSet::new(),
            imports: BTreeSet::new(),
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                ModuleId(self.nodes.len() - 1)
            }
        };
        self.by_file.insert(file.to_path_buf(), id);
        id
    }

    fn node(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: ModuleId) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Replaces the imports of `importer` with `imports`.
    pub fn record_imports(&mut self, importer: &Path, imports: &[PathBuf]) {
        let from = self.ensure(importer);
        let previous = self
            .node_mut(from)
            .map(|node| std::mem::take(&mut node.imports))
            .unwrap_or_default();
        for old in previous {
            if let Some(node) = self.node_mut(old) {
                node.importers.remove(&from);
            }
        }
        for import in imports {
            let to = self.ensure(import);
            if let Some(node) = self.node_mut(from) {
                node.imports.insert(to);
            }
            if let Some(node) = self.node_mut(to) {
                node.importers.insert(from);
            }
        }
    }

    /// Drops `file` and its edges and frees its slot.
    pub fn remove_file(&mut self, file: &Path) {
        let Some(id) = self.by_file.remove(file) else {
            return;
        };
        let Some(node) = self.nodes[id.0].take() else {
            return;
        };
        for import in node.imports {
            if let Some(other) = self.node_mut(import) {
                other.importers.remove(&id);
            }
        }
        for importer in node.importers {
            if let Some(other) = self.node_mut(importer) {
                other.imports.remove(&id);
            }
        }
        self.free.push(id);
    }

    pub fn contains(&self, file: &Path) -> bool {
        self.by_file.contains_key(file)
    }

    pub fn len(&self) -> usize {
        self.by_file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }
}

impl ModuleGraph for ImportGraph {
    fn modules_by_file(&self, path: &Path) -> Vec<ModuleId> {
        self.by_file.get(path).copied().into_iter().collect()
    }

    fn importers(&self, module: ModuleId) -> Vec<ModuleId> {
        self.node(module)
            .map(|node| node.importers.iter().copied().collect())
            .unwrap_or_default()
    }

    fn file(&self, module: ModuleId) -> Option<&Path> {
        self.node(module).map(|node| node.file.as_path())
    }
}

/// One import graph per project, shared between RPC handlers and the
/// watch loop.
#[derive(Debug, Clone, Default)]
pub struct ProjectGraphs {
    inner: Arc<Mutex<HashMap<String, ImportGraph>>>,
}

impl ProjectGraphs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, HashMap<String, ImportGraph>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_imports(&self, project: &str, importer: &Path, imports: &[PathBuf]) {
        self.lock()
            .entry(project.to_string())
            .or_default()
            .record_imports(importer, imports);
    }

    /// Removes `file` from every project's graph.
    pub fn remove_file(&self, file: &Path) {
        for graph in self.lock().values_mut() {
            graph.remove_file(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(graph: &ImportGraph, ids: Vec<ModuleId>) -> Vec<PathBuf> {
        ids.into_iter()
            .filter_map(|id| graph.file(id).map(Path::to_path_buf))
            .collect()
    }

    #[test]
    fn test_importers_are_recorded() {
        let mut graph = ImportGraph::new();
        graph.record_imports(Path::new("/a.test.ts"), &[PathBuf::from("/util.ts")]);
        graph.record_imports(Path::new("/b.test.ts"), &[PathBuf::from("/util.ts")]);

        let util = graph.modules_by_file(Path::new("/util.ts"))[0];
        assert_eq!(
            files(&graph, graph.importers(util)),
            vec![PathBuf::from("/a.test.ts"), PathBuf::from("/b.test.ts")]
        );
        assert!(graph.modules_by_file(Path::new("/other.ts")).is_empty());
    }

    #[test]
    fn test_record_imports_replaces_edges() {
        let mut graph = ImportGraph::new();
        graph.record_imports(Path::new("/a.ts"), &[PathBuf::from("/b.ts")]);
        graph.record_imports(Path::new("/a.ts"), &[PathBuf::from("/c.ts")]);

        let b = graph.modules_by_file(Path::new("/b.ts"))[0];
        let c = graph.modules_by_file(Path::new("/c.ts"))[0];
        assert!(graph.importers(b).is_empty());
        assert_eq!(files(&graph, graph.importers(c)), vec![PathBuf::from("/a.ts")]);
    }

    #[test]
    fn test_remove_file_drops_edges() {
        let mut graph = ImportGraph::new();
        graph.record_imports(Path::new("/a.ts"), &[PathBuf::from("/b.ts")]);
        graph.remove_file(Path::new("/a.ts"));

        let b = graph.modules_by_file(Path::new("/b.ts"))[0];
        assert!(graph.importers(b).is_empty());
        assert!(!graph.contains(Path::new("/a.ts")));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_removed_slots_are_reused() {
        let mut graph = ImportGraph::new();
        graph.record_imports(Path::new("/a.test.ts"), &[PathBuf::from("/util.ts")]);

        for i in 0..100 {
            let scratch = PathBuf::from(format!("/scratch{i}.ts"));
            graph.record_imports(&scratch, &[PathBuf::from("/util.ts")]);
            graph.remove_file(&scratch);
        }

        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.len(), 2);
        let util = graph.modules_by_file(Path::new("/util.ts"))[0];
        assert_eq!(files(&graph, graph.importers(util)), vec![PathBuf::from("/a.test.ts")]);

        let stale = graph.modules_by_file(Path::new("/a.test.ts"))[0];
        graph.remove_file(Path::new("/a.test.ts"));
        assert!(graph.file(stale).is_none());
        assert!(graph.importers(util).is_empty());
    }

    #[test]
    fn test_project_graphs_are_separate() {
        let graphs = ProjectGraphs::new();
        graphs.record_imports("a", Path::new("/x.test.ts"), &[PathBuf::from("/y.ts")]);
        let lock = graphs.lock();
        assert!(lock["a"].contains(Path::new("/y.ts")));
        assert!(!lock.contains_key("b"));
    }
}

//! Execution environment classification and grouping.
//!
//! Every spec is classified into an [`EnvironmentDescriptor`] before it is
//! dispatched. The environment name is decided by, in order:
//!
//! | Source | Example |
//! |--------|---------|
//! | Inline directive | `// @vigil-environment jsdom` |
//! | First matching `environment_match_globs` rule | `glob = "test/dom/**"` |
//! | Project default | `environment = "node"` |
//!
//! Options are only set when the file carries an inline
//! `@vigil-environment-options {json}` directive. The transform mode comes
//! from the project's `transform_mode.web` / `transform_mode.ssr` tables and
//! is otherwise unset.
//!
//! Classification is a pure function of file content and configuration, so
//! it is safe to redo it on every change.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::project::Spec;

static ENVIRONMENT_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@vigil-environment\s+([\w-]+)").unwrap()
});

static OPTIONS_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@vigil-environment-options\s+(\{.*\})").unwrap()
});

/// Environments ordered from cheapest to most expensive to set up.
///
/// Batched drivers submit groups in this order; environments not listed here
/// follow in discovery order.
pub const ENVIRONMENT_PRIORITY: [&str; 4] = ["node", "jsdom", "happy-dom", "edge-runtime"];

/// How a file's modules are transformed before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformMode {
    Web,
    Ssr,
}

/// The runtime emulation a file needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_mode: Option<TransformMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl EnvironmentDescriptor {
    /// Grouping key for files sharing an environment configuration.
    ///
    /// Options are compared by their JSON text, `serde_json` keeps object
    /// keys sorted so equal options produce equal keys.
    pub fn options_key(&self) -> String {
        self.options
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "null".to_string())
    }
}

/// Errors produced while classifying a file.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid @vigil-environment-options in {path}: {source}")]
    InvalidOptions {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A spec with its environment resolved.
#[derive(Debug, Clone)]
pub struct ClassifiedSpec {
    pub spec: Spec,
    pub environment: EnvironmentDescriptor,
}

/// Classifies `spec` given the file's `content`.
pub fn classify(spec: &Spec, content: &str) -> Result<EnvironmentDescriptor, EnvironmentError> {
    let project = &spec.project;

    let name = ENVIRONMENT_DIRECTIVE
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| project.environment_for(&spec.path).map(str::to_string))
        .unwrap_or_else(|| project.config().environment.clone());

    let options = match OPTIONS_DIRECTIVE.captures(content).and_then(|caps| caps.get(1)) {
        Some(raw) => Some(serde_json::from_str::<Value>(raw.as_str()).map_err(|source| {
            EnvironmentError::InvalidOptions {
                path: spec.path.display().to_string(),
                source,
            }
        })?),
        None => None,
    };

    Ok(EnvironmentDescriptor {
        name,
        transform_mode: project.transform_mode_for(&spec.path),
        options,
    })
}

/// Reads `spec` from disk and classifies it.
pub async fn classify_spec(spec: &Spec) -> Result<ClassifiedSpec, EnvironmentError> {
    let content = tokio::fs::read_to_string(&spec.path)
        .await
        .map_err(|source| EnvironmentError::Read {
            path: spec.path.display().to_string(),
            source,
        })?;
    let environment = classify(spec, &content)?;
    Ok(ClassifiedSpec {
        spec: spec.clone(),
        environment,
    })
}

/// Groups specs by environment name.
///
/// Groups for environments in [`ENVIRONMENT_PRIORITY`] come first in that
/// order, followed by the remaining environments in the order they were
/// first seen. Specs keep their relative order inside a group.
pub fn group_by_environment(specs: Vec<ClassifiedSpec>) -> Vec<(String, Vec<ClassifiedSpec>)> {
    let mut groups: Vec<(String, Vec<ClassifiedSpec>)> = Vec::new();
    for spec in specs {
        match groups.iter_mut().find(|(name, _)| *name == spec.environment.name) {
            Some((_, group)) => group.push(spec),
            None => groups.push((spec.environment.name.clone(), vec![spec])),
        }
    }

    // Stable sort keeps discovery order among unlisted environments.
    groups.sort_by_key(|(name, _)| {
        ENVIRONMENT_PRIORITY
            .iter()
            .position(|p| p == name)
            .unwrap_or(ENVIRONMENT_PRIORITY.len())
    });
    groups
}

/// Splits one environment group by `(project, options)`.
pub fn split_by_options(specs: Vec<ClassifiedSpec>) -> Vec<Vec<ClassifiedSpec>> {
    let mut groups: Vec<((String, String), Vec<ClassifiedSpec>)> = Vec::new();
    for spec in specs {
        let key = (
            spec.spec.project_name().to_string(),
            spec.environment.options_key(),
        );
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(spec),
            None => groups.push((key, vec![spec])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

//! Workflow options and their loading.
//!
//! Options are plain serde structs with defaults for every field, so a YAML
//! file only needs to mention what it overrides:
//!
//! ```yaml
//! name: nightly-import
//! worker:
//!   thread_name_prefix: import
//!   stack_size: 4194304
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};

/// Options for one workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowOptions {
    /// Label used in log records and events.
    pub name: String,

    /// Worker thread settings.
    pub worker: WorkerOptions,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            name: "workflow".to_string(),
            worker: WorkerOptions::default(),
        }
    }
}

impl WorkflowOptions {
    /// Options with the given workflow name and default worker settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse options from a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Self::parse(content, Path::new("<inline>"))
    }

    /// Load options from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StepwiseError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        // An empty document means "all defaults"
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(content).map_err(|e| StepwiseError::ConfigParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Settings for the threads that run step bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Worker threads are named `<prefix>-<step name>`.
    pub thread_name_prefix: String,

    /// Stack size for worker threads (platform default if unset).
    pub stack_size: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            thread_name_prefix: "stepwise-worker".to_string(),
            stack_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sensible() {
        let options = WorkflowOptions::default();
        assert_eq!(options.name, "workflow");
        assert_eq!(options.worker.thread_name_prefix, "stepwise-worker");
        assert!(options.worker.stack_size.is_none());
    }

    #[test]
    fn named_keeps_worker_defaults() {
        let options = WorkflowOptions::named("import");
        assert_eq!(options.name, "import");
        assert_eq!(options.worker, WorkerOptions::default());
    }

    #[test]
    fn from_yaml_overrides_given_fields() {
        let options = WorkflowOptions::from_yaml(
            r#"
name: nightly
worker:
  stack_size: 65536
"#,
        )
        .unwrap();

        assert_eq!(options.name, "nightly");
        assert_eq!(options.worker.stack_size, Some(65536));
        assert_eq!(options.worker.thread_name_prefix, "stepwise-worker");
    }

    #[test]
    fn from_yaml_empty_document_is_default() {
        let options = WorkflowOptions::from_yaml("  \n").unwrap();
        assert_eq!(options, WorkflowOptions::default());
    }

    #[test]
    fn from_yaml_rejects_wrong_types() {
        let result = WorkflowOptions::from_yaml("worker:\n  stack_size: lots\n");
        assert!(matches!(
            result,
            Err(StepwiseError::ConfigParseError { .. })
        ));
    }

    #[test]
    fn load_reads_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("workflow.yml");
        fs::write(&path, "name: from-file\n").unwrap();

        let options = WorkflowOptions::load(&path).unwrap();
        assert_eq!(options.name, "from-file");
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.yml");

        let result = WorkflowOptions::load(&path);
        assert!(matches!(result, Err(StepwiseError::ConfigNotFound { .. })));
    }

    #[test]
    fn load_malformed_file_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.yml");
        fs::write(&path, "name: [unclosed\n").unwrap();

        match WorkflowOptions::load(&path) {
            Err(StepwiseError::ConfigParseError { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected ConfigParseError, got {:?}", other),
        }
    }
}

//! Envoy sidecar configuration document sources

use crate::error::{OperatorError, Result};
use std::path::{Path, PathBuf};

/// Default location of the Envoy configuration document
pub const DEFAULT_ENVOY_CONFIG_PATH: &str = "manifests/envoy.yaml";

/// Supplies the document stored in the sidecar ConfigMap
pub trait SidecarConfigSource: Send + Sync {
    fn load(&self) -> Result<String>;
}

/// Reads the document from disk on every call
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SidecarConfigSource for FileConfigSource {
    fn load(&self) -> Result<String> {
        std::fs::read_to_string(&self.path).map_err(|e| {
            OperatorError::SidecarConfig(format!("failed to read {}: {}", self.path.display(), e))
        })
    }
}

/// Serves a fixed in-memory document
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    document: String,
}

impl StaticConfigSource {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }
}

impl SidecarConfigSource for StaticConfigSource {
    fn load(&self) -> Result<String> {
        Ok(self.document.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_retryable() {
        let source = FileConfigSource::new("/nonexistent/envoy.yaml");
        let err = source.load().unwrap_err();
        assert!(matches!(err, OperatorError::SidecarConfig(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_file_source_reads_each_call() {
        let path = std::env::temp_dir().join(format!("book-operator-envoy-{}.yaml", std::process::id()));
        std::fs::write(&path, "admin: {}\n").unwrap();
        let source = FileConfigSource::new(&path);
        assert_eq!(source.load().unwrap(), "admin: {}\n");

        std::fs::write(&path, "admin: {}\nstatic_resources: {}\n").unwrap();
        assert!(source.load().unwrap().contains("static_resources"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_static_source() {
        assert_eq!(StaticConfigSource::new("doc").load().unwrap(), "doc");
    }
}

//! Pool discovery sources

use crate::core::{OrchestratorError, PoolId, Result};
use crate::pool::PoolConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A pool found by a [`DiscoverySource`]
///
/// Serialized as the `PoolConfig` fields plus an optional `id`; a descriptor
/// carrying an id keeps it across registrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    /// Stable identifier, if the pool was registered before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PoolId>,
    /// Pool configuration
    #[serde(flatten)]
    pub config: PoolConfig,
}

impl PoolDescriptor {
    /// Descriptor without an id
    pub fn new(config: PoolConfig) -> Self {
        Self { id: None, config }
    }

    /// Pin the pool id
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_id(mut self, id: PoolId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Where candidate pools come from
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Name used in reports and logs
    fn name(&self) -> &str;

    /// List the candidate descriptors
    async fn discover(&self) -> Result<Vec<PoolDescriptor>>;
}

/// One JSON descriptor per `*.json` file in a directory
///
/// Files are read in name order. A missing directory discovers nothing; a
/// file that does not parse is skipped with a warning.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    name: String,
}

impl DirectorySource {
    /// Source over `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = format!("dir:{}", dir.display());
        Self { dir, name }
    }

    /// Directory being scanned
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// File holding the descriptor for pool `name`
    pub fn file_for(&self, name: &str) -> PathBuf {
        let stem: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", stem))
    }

    /// Persist a descriptor, replacing any previous one for the same name
    pub async fn write_descriptor(&self, descriptor: &PoolDescriptor) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_error(&self.dir, e))?;
        let path = self.file_for(&descriptor.config.name);
        let body = serde_json::to_string_pretty(descriptor)
            .map_err(|e| OrchestratorError::discovery(&self.name, e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| self.io_error(&path, e))?;
        debug!(path = %path.display(), "descriptor written");
        Ok(path)
    }

    /// Delete the descriptor for pool `name`; `false` if there was none
    pub async fn remove_descriptor(&self, name: &str) -> Result<bool> {
        let path = self.file_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(&path, e)),
        }
    }

    fn io_error(&self, path: &Path, error: std::io::Error) -> OrchestratorError {
        OrchestratorError::discovery(&self.name, format!("{}: {}", path.display(), error))
    }
}

#[async_trait]
impl DiscoverySource for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<PoolDescriptor>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(&self.dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut descriptors = Vec::with_capacity(paths.len());
        for path in paths {
            let body = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| self.io_error(&path, e))?;
            match serde_json::from_str::<PoolDescriptor>(&body) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable pool descriptor")
                }
            }
        }
        Ok(descriptors)
    }
}

/// Fixed in-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    name: String,
    descriptors: Vec<PoolDescriptor>,
}

impl StaticSource {
    /// Catalog named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptors: Vec::new(),
        }
    }

    /// Add a descriptor
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_descriptor(mut self, descriptor: PoolDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

#[async_trait]
impl DiscoverySource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<PoolDescriptor>> {
        Ok(self.descriptors.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;

    #[tokio::test]
    async fn test_directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("pools"));
        assert!(source.discover().await.unwrap().is_empty());

        let id = PoolId::new();
        let first = PoolDescriptor::new(
            PoolConfig::new("beta", BackendType::Local)
                .with_workers(1, 2)
                .with_tag("gpu"),
        )
        .with_id(id);
        let second = PoolDescriptor::new(PoolConfig::new("alpha", BackendType::Local));
        source.write_descriptor(&first).await.unwrap();
        source.write_descriptor(&second).await.unwrap();

        let found = source.discover().await.unwrap();
        let names: Vec<&str> = found.iter().map(|d| d.config.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(found[1].id, Some(id));
        assert!(found[1].config.tags.contains("gpu"));

        assert!(source.remove_descriptor("alpha").await.unwrap());
        assert!(!source.remove_descriptor("alpha").await.unwrap());
        assert_eq!(source.discover().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(
            dir.path().join("ok.json"),
            r#"{"name": "ok", "backend_type": "local", "max_workers": 2}"#,
        )
        .unwrap();

        let found = DirectorySource::new(dir.path()).discover().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].config.max_workers, 2);
        assert_eq!(found[0].id, None);
    }

    #[test]
    fn test_file_names_are_sanitized() {
        let source = DirectorySource::new("/tmp/pools");
        assert_eq!(
            source.file_for("gpu/pool 1"),
            PathBuf::from("/tmp/pools/gpu_pool_1.json")
        );
    }
}

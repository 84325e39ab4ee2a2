//! Per-container cgroup access.
//!
//! Every container owns one cgroup subtree per subsystem, laid out as
//! `<root>/<subsystem>/instance-<id>/`. The manager is a typed accessor
//! over the control files in that subtree; creating and tearing down the
//! subtree itself is done by the isolation scripts.

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Capability to read and write a container's cgroup control files.
#[async_trait]
pub trait CgroupsManager: Send + Sync {
    /// Writes `value` to `<subsystem path>/<name>`.
    async fn set(&self, subsystem: &str, name: &str, value: &str) -> Result<()>;

    /// Reads `<subsystem path>/<name>`, trimmed of trailing whitespace.
    async fn get(&self, subsystem: &str, name: &str) -> Result<String>;

    /// Path of the container's subtree for one subsystem.
    fn subsystem_path(&self, subsystem: &str) -> PathBuf;
}

/// [`CgroupsManager`] over the real cgroup filesystem.
pub struct FsCgroupsManager {
    root: PathBuf,
    id: String,
}

impl FsCgroupsManager {
    /// Creates a manager for the container `id` under `root`.
    pub fn new(root: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            id: id.into(),
        }
    }

    /// The cgroup root this manager was created with.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CgroupsManager for FsCgroupsManager {
    async fn set(&self, subsystem: &str, name: &str, value: &str) -> Result<()> {
        let path = self.subsystem_path(subsystem).join(name);
        tokio::fs::write(&path, value).await?;
        Ok(())
    }

    async fn get(&self, subsystem: &str, name: &str) -> Result<String> {
        let path = self.subsystem_path(subsystem).join(name);
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(raw.trim_end().to_string())
    }

    fn subsystem_path(&self, subsystem: &str) -> PathBuf {
        self.root
            .join(subsystem)
            .join(format!("instance-{}", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_subsystem_path_layout() {
        let manager = FsCgroupsManager::new("/tmp/warden/cgroup", "abc123");
        assert_eq!(
            manager.subsystem_path("memory"),
            PathBuf::from("/tmp/warden/cgroup/memory/instance-abc123")
        );
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let root = TempDir::new().unwrap();
        let manager = FsCgroupsManager::new(root.path(), "some-id");

        std::fs::create_dir_all(manager.subsystem_path("memory")).unwrap();
        manager
            .set("memory", "memory.limit_in_bytes", "102400")
            .await
            .unwrap();

        let value = manager.get("memory", "memory.limit_in_bytes").await.unwrap();
        assert_eq!(value, "102400");
    }

    #[tokio::test]
    async fn test_get_trims_trailing_newline() {
        let root = TempDir::new().unwrap();
        let manager = FsCgroupsManager::new(root.path(), "some-id");

        let dir = manager.subsystem_path("cpuacct");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cpuacct.usage"), "42\n").unwrap();

        assert_eq!(manager.get("cpuacct", "cpuacct.usage").await.unwrap(), "42");
    }
}

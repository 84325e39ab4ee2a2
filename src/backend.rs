//! The handle-indexed container registry and top-level lifecycle.
//!
//! The backend is what the serving layer talks to: it owns the registry of
//! live containers by handle, drives startup (restore snapshots, then
//! prune orphans, in that order) and shutdown (cleanup and snapshot every
//! container), and delegates allocation to the pool.
//!
//! Snapshot files are the canonical record across restarts: a depot entry
//! with no snapshot is an orphan and gets pruned; a snapshot that fails to
//! decode or replay aborts startup.

use crate::container::Container;
use crate::error::{Error, Result};
use crate::pool::ContainerPool;
use crate::spec::{ContainerSpec, Properties};
use crate::system_info::SystemInfo;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Total host resources available to containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub memory_in_bytes: u64,
    pub disk_in_bytes: u64,
    pub max_containers: u64,
}

/// The container management backend for one host.
pub struct Backend {
    pool: Arc<ContainerPool>,
    system_info: Arc<dyn SystemInfo>,
    snapshots_path: Option<PathBuf>,
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl Backend {
    /// Creates a backend. With no snapshots path, state does not survive
    /// restarts and shutdown snapshots are skipped.
    pub fn new(
        pool: Arc<ContainerPool>,
        system_info: Arc<dyn SystemInfo>,
        snapshots_path: Option<PathBuf>,
    ) -> Self {
        Self {
            pool,
            system_info,
            snapshots_path,
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// One-time host preparation.
    pub async fn setup(&self) -> Result<()> {
        self.pool.setup().await
    }

    /// Brings the backend to a serving state.
    ///
    /// Restores every snapshot on disk, resets the snapshots directory,
    /// then prunes depot entries that no live container claims. Strictly
    /// ordered; callers must not accept requests until this returns.
    pub async fn start(&self) -> Result<()> {
        if let Some(path) = &self.snapshots_path {
            if tokio::fs::metadata(path).await.is_ok() {
                self.restore_snapshots(path).await?;
                tokio::fs::remove_dir_all(path).await?;
            }
            tokio::fs::create_dir_all(path).await?;
        }

        let keep: HashSet<String> = {
            let containers = self.containers.read().await;
            containers
                .values()
                .map(|container| container.id().to_string())
                .collect()
        };

        self.pool.prune(&keep).await
    }

    /// Creates, starts, and registers a container.
    pub async fn create(&self, spec: ContainerSpec) -> Result<Arc<Container>> {
        let container = self.pool.create(spec).await?;
        container.start().await?;

        self.containers
            .write()
            .await
            .insert(container.handle().to_string(), container.clone());

        Ok(container)
    }

    /// Destroys the container registered under `handle`.
    pub async fn destroy(&self, handle: &str) -> Result<()> {
        let container = {
            let containers = self.containers.read().await;
            containers
                .get(handle)
                .cloned()
                .ok_or_else(|| Error::UnknownHandle(handle.to_string()))?
        };

        self.pool.destroy(&container).await?;

        self.containers.write().await.remove(handle);
        Ok(())
    }

    /// Looks up a container by handle.
    pub async fn lookup(&self, handle: &str) -> Result<Arc<Container>> {
        self.containers
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::UnknownHandle(handle.to_string()))
    }

    /// All containers whose properties contain every pair in `filter`.
    pub async fn containers(&self, filter: &Properties) -> Vec<Arc<Container>> {
        self.containers
            .read()
            .await
            .values()
            .filter(|container| container.has_properties(filter))
            .cloned()
            .collect()
    }

    /// Total host capacity.
    pub fn capacity(&self) -> Result<Capacity> {
        Ok(Capacity {
            memory_in_bytes: self.system_info.total_memory()?,
            disk_in_bytes: self.system_info.total_disk()?,
            max_containers: self.pool.max_containers() as u64,
        })
    }

    /// Quiesces every container and persists its snapshot.
    ///
    /// Containers are not destroyed; their state is written so the next
    /// start can rebind them. Snapshot failures are logged, not fatal, so
    /// one bad container cannot block shutdown of the rest.
    pub async fn stop(&self) {
        let containers = self.containers.read().await;
        for container in containers.values() {
            container.cleanup().await;
            if let Err(err) = self.save_snapshot(container).await {
                warn!(handle = %container.handle(), %err, "failed to save snapshot");
            }
        }
    }

    async fn restore_snapshots(&self, path: &Path) -> Result<()> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();

        for snapshot_path in entries {
            info!(path = %snapshot_path.display(), "loading snapshot");

            let bytes = tokio::fs::read(&snapshot_path).await?;
            let container = self.pool.restore(&bytes).await?;

            self.containers
                .write()
                .await
                .insert(container.handle().to_string(), container);
        }

        Ok(())
    }

    async fn save_snapshot(&self, container: &Container) -> Result<()> {
        let Some(dir) = &self.snapshots_path else {
            return Ok(());
        };

        info!(id = %container.id(), "saving snapshot");

        let bytes = serde_json::to_vec(&container.snapshot())
            .map_err(|err| Error::FailedToSnapshot(Box::new(Error::Decode(err))))?;

        // Write-then-rename keeps a crash from leaving a torn snapshot
        // under the final name.
        let final_path = dir.join(container.handle());
        let tmp_path = dir.join(format!("{}.tmp", container.handle()));

        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|err| Error::FailedToSnapshot(Box::new(Error::Io(err))))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|err| Error::FailedToSnapshot(Box::new(Error::Io(err))))?;

        Ok(())
    }
}

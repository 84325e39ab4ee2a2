//! Traffic-shaping collaborator.
//!
//! Rate limiting lives in a per-container script:
//!
//! - `net_rate.sh` (no args): applies the rate, env `RATE`, `BURST`, `PATH`
//! - `net_rate.sh status`: prints `key value` lines `in_rate`, `in_burst`,
//!   `out_rate`, `out_burst`

use crate::command::{Command, CommandRunner};
use crate::constants::SCRIPT_PATH;
use crate::error::{Error, Result};
use crate::limits::{BandwidthLimits, BandwidthStat};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Capability to shape and inspect a container's network rate.
#[async_trait]
pub trait BandwidthManager: Send + Sync {
    /// Applies the given rate and burst.
    async fn set_limits(&self, limits: &BandwidthLimits) -> Result<()>;

    /// Reads the currently shaped rates.
    async fn get_stats(&self) -> Result<BandwidthStat>;
}

/// [`BandwidthManager`] backed by the container's `net_rate.sh` script.
pub struct ScriptBandwidthManager {
    script: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ScriptBandwidthManager {
    /// Creates a manager for the container rooted at `container_path`.
    pub fn new(container_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            script: container_path.into().join("net_rate.sh"),
            runner,
        }
    }
}

#[async_trait]
impl BandwidthManager for ScriptBandwidthManager {
    async fn set_limits(&self, limits: &BandwidthLimits) -> Result<()> {
        let command = Command::new(&self.script)
            .env("RATE", limits.rate_in_bytes_per_second.to_string())
            .env("BURST", limits.burst_rate_in_bytes_per_second.to_string())
            .env("PATH", SCRIPT_PATH);

        self.runner.run(command).await?;
        Ok(())
    }

    async fn get_stats(&self) -> Result<BandwidthStat> {
        let command = Command::new(&self.script)
            .arg("status")
            .env("PATH", SCRIPT_PATH);

        let stdout = self.runner.run(command).await?;
        let text = String::from_utf8_lossy(&stdout);

        let mut stat = BandwidthStat::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (key, value) = line
                .trim()
                .split_once(char::is_whitespace)
                .ok_or_else(|| Error::MalformedOutput {
                    origin: "net_rate.sh status".to_string(),
                    detail: line.to_string(),
                })?;
            let value: u64 = value.trim().parse().map_err(|_| Error::MalformedOutput {
                origin: "net_rate.sh status".to_string(),
                detail: line.to_string(),
            })?;

            match key {
                "in_rate" => stat.in_rate = value,
                "in_burst" => stat.in_burst = value,
                "out_rate" => stat.out_rate = value,
                "out_burst" => stat.out_burst = value,
                _ => {}
            }
        }

        Ok(stat)
    }
}

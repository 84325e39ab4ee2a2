//! Disk quota collaborator.
//!
//! Quota enforcement happens outside the core, in a script keyed on the
//! container's user ID. The manager resolves the limit record into the
//! soft/hard block and inode pairs the script understands:
//!
//! - `quota.sh set`: env `USER_UID`, `MOUNT_POINT`, `BLOCK_SOFT`,
//!   `BLOCK_HARD`, `INODE_SOFT`, `INODE_HARD`, `PATH`
//! - `quota.sh get`: env `USER_UID`, `MOUNT_POINT`; prints `key value`
//!   lines for the same four keys
//! - `quota.sh usage`: env `USER_UID`, `MOUNT_POINT`; prints `bytes_used`
//!   and `inodes_used` lines

use crate::command::{Command, CommandRunner};
use crate::constants::SCRIPT_PATH;
use crate::error::{Error, Result};
use crate::limits::{DiskLimits, DiskStat};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Filesystem block size the quota scripts account in.
const QUOTA_BLOCK_SIZE: u64 = 1024;

/// Capability to enforce and inspect per-user disk quotas.
#[async_trait]
pub trait QuotaManager: Send + Sync {
    /// Applies limits for the given user.
    async fn set_limits(&self, uid: u32, limits: &DiskLimits) -> Result<()>;

    /// Reads back the currently enforced limits.
    async fn get_limits(&self, uid: u32) -> Result<DiskLimits>;

    /// Reads current usage.
    async fn get_usage(&self, uid: u32) -> Result<DiskStat>;

    /// Mount point the quotas apply to.
    fn mount_point(&self) -> String;

    /// Whether quota enforcement is available on this host.
    fn is_enabled(&self) -> bool;
}

/// [`QuotaManager`] backed by the `quota.sh` script.
pub struct ScriptQuotaManager {
    script: PathBuf,
    mount_point: String,
    enabled: bool,
    runner: Arc<dyn CommandRunner>,
}

impl ScriptQuotaManager {
    /// Creates a manager invoking `<bin_path>/quota.sh` against the given
    /// depot mount point.
    pub fn new(
        bin_path: impl Into<PathBuf>,
        mount_point: impl Into<String>,
        enabled: bool,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            script: bin_path.into().join("quota.sh"),
            mount_point: mount_point.into(),
            enabled,
            runner,
        }
    }

    fn command(&self, action: &str, uid: u32) -> Command {
        Command::new(&self.script)
            .arg(action)
            .env("USER_UID", uid.to_string())
            .env("MOUNT_POINT", self.mount_point.clone())
            .env("PATH", SCRIPT_PATH)
    }

    async fn run_and_parse(&self, action: &str, uid: u32) -> Result<Vec<(String, u64)>> {
        let stdout = self.runner.run(self.command(action, uid)).await?;
        let text = String::from_utf8_lossy(&stdout);

        let mut pairs = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (key, value) = line
                .trim()
                .split_once(char::is_whitespace)
                .ok_or_else(|| Error::MalformedOutput {
                    origin: format!("quota.sh {action}"),
                    detail: line.to_string(),
                })?;
            let value = value.trim().parse().map_err(|_| Error::MalformedOutput {
                origin: format!("quota.sh {action}"),
                detail: line.to_string(),
            })?;
            pairs.push((key.to_string(), value));
        }

        Ok(pairs)
    }
}

/// Collapses a limit record to the soft/hard pairs the script enforces.
///
/// The aggregate `*_limit` fields win over individual soft/hard values,
/// and byte counts convert to blocks, rounding up.
fn resolve(limits: &DiskLimits) -> (u64, u64, u64, u64) {
    let to_blocks = |bytes: u64| bytes.div_ceil(QUOTA_BLOCK_SIZE);

    let mut block_soft = limits.block_soft;
    let mut block_hard = if limits.block != 0 {
        limits.block
    } else {
        limits.block_hard
    };
    if limits.block_limit != 0 {
        block_soft = limits.block_limit;
        block_hard = limits.block_limit;
    }

    if limits.byte_soft != 0 {
        block_soft = to_blocks(limits.byte_soft);
    }
    if limits.byte != 0 {
        block_hard = to_blocks(limits.byte);
    } else if limits.byte_hard != 0 {
        block_hard = to_blocks(limits.byte_hard);
    }
    if limits.byte_limit != 0 {
        block_soft = to_blocks(limits.byte_limit);
        block_hard = to_blocks(limits.byte_limit);
    }

    let mut inode_soft = limits.inode_soft;
    let mut inode_hard = if limits.inode != 0 {
        limits.inode
    } else {
        limits.inode_hard
    };
    if limits.inode_limit != 0 {
        inode_soft = limits.inode_limit;
        inode_hard = limits.inode_limit;
    }

    (block_soft, block_hard, inode_soft, inode_hard)
}

#[async_trait]
impl QuotaManager for ScriptQuotaManager {
    async fn set_limits(&self, uid: u32, limits: &DiskLimits) -> Result<()> {
        let (block_soft, block_hard, inode_soft, inode_hard) = resolve(limits);

        let command = self
            .command("set", uid)
            .env("BLOCK_SOFT", block_soft.to_string())
            .env("BLOCK_HARD", block_hard.to_string())
            .env("INODE_SOFT", inode_soft.to_string())
            .env("INODE_HARD", inode_hard.to_string());

        self.runner.run(command).await?;
        Ok(())
    }

    async fn get_limits(&self, uid: u32) -> Result<DiskLimits> {
        let mut limits = DiskLimits::default();
        for (key, value) in self.run_and_parse("get", uid).await? {
            match key.as_str() {
                "block_soft" => limits.block_soft = value,
                "block_hard" => limits.block_hard = value,
                "inode_soft" => limits.inode_soft = value,
                "inode_hard" => limits.inode_hard = value,
                _ => {}
            }
        }
        Ok(limits)
    }

    async fn get_usage(&self, uid: u32) -> Result<DiskStat> {
        let mut stat = DiskStat::default();
        for (key, value) in self.run_and_parse("usage", uid).await? {
            match key.as_str() {
                "bytes_used" => stat.bytes_used = value,
                "inodes_used" => stat.inodes_used = value,
                _ => {}
            }
        }
        Ok(stat)
    }

    fn mount_point(&self) -> String {
        self.mount_point.clone()
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

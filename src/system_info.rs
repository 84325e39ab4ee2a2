//! Host capacity queries.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Capability to report total host resources.
pub trait SystemInfo: Send + Sync {
    /// Total physical memory in bytes.
    fn total_memory(&self) -> Result<u64>;

    /// Total disk space of the depot filesystem in bytes.
    fn total_disk(&self) -> Result<u64>;
}

/// [`SystemInfo`] reading `/proc/meminfo` and `statvfs(2)`.
pub struct HostSystemInfo {
    disk_path: PathBuf,
}

impl HostSystemInfo {
    /// Creates a provider; disk capacity is measured at `disk_path`.
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
        }
    }

    fn parse_meminfo(contents: &str) -> Result<u64> {
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .map_err(|_| Error::MalformedOutput {
                        origin: "/proc/meminfo".to_string(),
                        detail: line.to_string(),
                    })?;
                return Ok(kb * 1024);
            }
        }

        Err(Error::MalformedOutput {
            origin: "/proc/meminfo".to_string(),
            detail: "no MemTotal line".to_string(),
        })
    }

    fn statvfs_total(path: &Path) -> Result<u64> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        Ok(stat.f_blocks as u64 * stat.f_frsize as u64)
    }
}

impl SystemInfo for HostSystemInfo {
    fn total_memory(&self) -> Result<u64> {
        let contents = std::fs::read_to_string("/proc/meminfo")?;
        Self::parse_meminfo(&contents)
    }

    fn total_disk(&self) -> Result<u64> {
        Self::statvfs_total(&self.disk_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let contents = "MemTotal:       16308856 kB\nMemFree:         1089296 kB\n";
        assert_eq!(
            HostSystemInfo::parse_meminfo(contents).unwrap(),
            16308856 * 1024
        );
    }

    #[test]
    fn test_parse_meminfo_without_total_errors() {
        assert!(HostSystemInfo::parse_meminfo("MemFree: 12 kB\n").is_err());
    }

    #[test]
    fn test_statvfs_on_root_reports_capacity() {
        let info = HostSystemInfo::new("/");
        assert!(info.total_disk().unwrap() > 0);
    }
}

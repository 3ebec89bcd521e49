use crate::error::{self, Result};
use crate::slot::Slot;
use log::info;
use snafu::{ensure, ResultExt};
use std::path::PathBuf;
use std::process::Command;

/// Boot-flag operations delegated to the external bootloader tool. Both
/// operations are idempotent: they write absolute flag values, so repeating
/// one is a no-op.
pub trait BootFlagClient {
    /// Makes `partition` the next boot target with a single boot try.
    fn set_next_boot(&self, partition: &str) -> Result<()>;

    /// Marks `partition` as successfully booted so the bootloader keeps it.
    fn mark_slot_good(&self, partition: &str) -> Result<()>;
}

/// `cgpt`-backed implementation of the boot-flag operations.
#[derive(Debug, Clone)]
pub struct CgptClient {
    cgpt: PathBuf,
}

impl CgptClient {
    pub fn new() -> Self {
        Self {
            cgpt: PathBuf::from("/usr/sbin/cgpt"),
        }
    }

    pub fn with_tool<P: Into<PathBuf>>(tool: P) -> Self {
        Self { cgpt: tool.into() }
    }

    fn run(&self, partition: &str, args: &[&str]) -> Result<()> {
        let (disk, number) = split_partition(partition)?;
        let output = Command::new(&self.cgpt)
            .arg("add")
            .arg("-i")
            .arg(number.to_string())
            .args(args)
            .arg(&disk)
            .output()
            .context(error::BootToolSpawnSnafu {
                command: &self.cgpt,
            })?;
        ensure!(
            output.status.success(),
            error::BootToolFailureSnafu {
                command: &self.cgpt,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        );
        Ok(())
    }
}

impl Default for CgptClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BootFlagClient for CgptClient {
    fn set_next_boot(&self, partition: &str) -> Result<()> {
        info!("Setting {} as the next boot target", partition);
        self.run(partition, &["-P", "2", "-T", "1", "-S", "0"])
    }

    fn mark_slot_good(&self, partition: &str) -> Result<()> {
        info!("Marking {} as successfully booted", partition);
        self.run(partition, &["-P", "2", "-T", "0", "-S", "1"])
    }
}

/// Splits a partition device path into its disk path and partition number.
/// Partition numbers are single-digit by the slot convention; NVMe-style
/// `pN` suffixes lose the separator along with the digit.
fn split_partition(partition: &str) -> Result<(String, u32)> {
    let number = Slot::from_partition_path(partition)?.partition_number();
    let mut disk = partition.to_string();
    disk.pop();
    if disk.ends_with('p')
        && disk
            .chars()
            .rev()
            .nth(1)
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
    {
        disk.pop();
    }
    ensure!(
        disk.len() > "/dev/".len(),
        error::NoDiskPrefixSnafu { device: partition }
    );
    Ok((disk, number))
}

#[cfg(test)]
mod tests {
    use super::split_partition;

    #[test]
    fn splits_sd_devices() {
        assert_eq!(
            split_partition("/dev/sda3").unwrap(),
            ("/dev/sda".to_string(), 3)
        );
        assert_eq!(
            split_partition("/dev/sda4").unwrap(),
            ("/dev/sda".to_string(), 4)
        );
    }

    #[test]
    fn splits_nvme_devices() {
        assert_eq!(
            split_partition("/dev/nvme0n1p3").unwrap(),
            ("/dev/nvme0n1".to_string(), 3)
        );
    }

    #[test]
    fn rejects_bare_disk() {
        assert!(split_partition("/dev/3").is_err());
        assert!(split_partition("/dev/sda7").is_err());
    }
}

use crate::error::{self, Result};
use crate::slot::Slot;
use snafu::ensure;
use std::path::{Path, PathBuf};

/// Derives the install (inactive) root partition from the booted one by
/// swapping the trailing partition number between 3 and 4.
pub fn install_device(boot_device: &str) -> Result<String> {
    ensure!(
        boot_device.starts_with("/dev/"),
        error::NotDevicePathSnafu {
            device: boot_device
        }
    );
    let slot = Slot::from_partition_path(boot_device)?;
    let mut install = boot_device.to_string();
    install.pop();
    install.push(match !slot {
        Slot::A => '3',
        Slot::B => '4',
    });
    Ok(install)
}

/// Returns the kernel image path matching a root partition, looking for the
/// CoreOS boot directory first and falling back to the Flatcar one.
pub fn kernel_path(partition_path: &str) -> Result<PathBuf> {
    kernel_path_under("/boot", partition_path)
}

/// Like [`kernel_path`], with the boot directory made explicit so tests can
/// point it at a fixture.
pub fn kernel_path_under<P: AsRef<Path>>(boot_dir: P, partition_path: &str) -> Result<PathBuf> {
    let slot = Slot::from_partition_path(partition_path)?;
    let boot_dir = boot_dir.as_ref();
    let coreos = boot_dir.join("coreos");
    let dir = if coreos.join("vmlinuz-a").exists() || coreos.join("vmlinuz-b").exists() {
        coreos
    } else {
        boot_dir.join("flatcar")
    };
    Ok(dir.join(format!("vmlinuz-{}", slot.letter())))
}

/// Returns the PCR policy archive path matching a root partition.
pub fn pcr_policy_path(partition_path: &str) -> Result<PathBuf> {
    let slot = Slot::from_partition_path(partition_path)?;
    Ok(PathBuf::from(format!(
        "/var/lib/update_engine/pcrs-{}.zip",
        slot.letter()
    )))
}

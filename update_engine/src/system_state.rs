//! The aggregate of durable and detected system facts an attempt needs:
//! prefs, payload state, the booted root device, and release identity.
//! Components borrow the pieces they need through their constructors; there
//! are no globals.

use crate::config::Config;
use crate::error::{self, Result};
use crate::keyvalue;
use crate::payload_state::PayloadState;
use crate::prefs::{Prefs, PrefsHandle};
use log::info;
use snafu::{OptionExt, ResultExt};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

const CMDLINE_PATH: &str = "/proc/cmdline";
const MOUNTS_PATH: &str = "/proc/mounts";
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Identity of the running release, read from the release file's
/// `KEY=VALUE` entries.
#[derive(Debug, Clone, Default)]
pub struct ReleaseInfo {
    pub version: String,
    pub board: String,
}

impl ReleaseInfo {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).context(error::ReleaseReadSnafu { path })?;
        let entries = keyvalue::parse_string(&raw);
        let version = entries
            .get("FLATCAR_RELEASE_VERSION")
            .or_else(|| entries.get("COREOS_RELEASE_VERSION"))
            .context(error::ReleaseVersionSnafu { path })?
            .clone();
        let board = entries
            .get("FLATCAR_RELEASE_BOARD")
            .or_else(|| entries.get("COREOS_RELEASE_BOARD"))
            .cloned()
            .unwrap_or_default();
        Ok(Self { version, board })
    }
}

pub struct SystemState {
    pub config: Config,
    pub prefs: PrefsHandle,
    pub payload_state: Rc<RefCell<PayloadState>>,
    /// The root partition the running system booted from.
    pub boot_device: String,
    /// Base directory the kernel images live under.
    pub boot_dir: PathBuf,
    /// Kernel boot identifier of the current boot.
    pub boot_id: String,
    pub release: ReleaseInfo,
    pub machine_id: String,
}

impl SystemState {
    pub fn initialize(config: Config) -> Result<Self> {
        let prefs = PrefsHandle::new(Prefs::open(&config.prefs_dir)?);
        let payload_state = Rc::new(RefCell::new(PayloadState::load(prefs.clone())));
        let release = ReleaseInfo::from_file(&config.release_file)?;
        let boot_device = boot_device()?;
        let boot_id = read_trimmed(BOOT_ID_PATH)?;
        let machine_id = read_trimmed(MACHINE_ID_PATH).unwrap_or_default();
        info!(
            "Running version {} on {}, booted from {}",
            release.version, release.board, boot_device
        );
        Ok(Self {
            config,
            prefs,
            payload_state,
            boot_device,
            boot_dir: PathBuf::from("/boot"),
            boot_id,
            release,
            machine_id,
        })
    }
}

fn read_trimmed(path: &str) -> Result<String> {
    Ok(fs::read_to_string(path)
        .context(error::ProcReadSnafu { path })?
        .trim()
        .to_string())
}

/// The booted root device: the kernel command line's `root=` parameter when
/// it names a device node, otherwise the device mounted at `/`.
fn boot_device() -> Result<String> {
    let cmdline = fs::read_to_string(CMDLINE_PATH).context(error::ProcReadSnafu {
        path: CMDLINE_PATH,
    })?;
    let mounts = fs::read_to_string(MOUNTS_PATH).context(error::ProcReadSnafu {
        path: MOUNTS_PATH,
    })?;
    boot_device_from(&cmdline, &mounts).context(error::BootDeviceSnafu)
}

fn boot_device_from(cmdline: &str, mounts: &str) -> Option<String> {
    for token in cmdline.split_whitespace() {
        if let Some(device) = token.strip_prefix("root=") {
            if device.starts_with("/dev/") {
                return Some(device.to_string());
            }
        }
    }
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        if mount_point == "/" && device.starts_with("/dev/") {
            return Some(device.to_string());
        }
    }
    None
}

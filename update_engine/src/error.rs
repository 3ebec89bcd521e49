#![allow(clippy::default_trait_access)]

use snafu::{Backtrace, Snafu};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to read config file {}: {}", path.display(), source))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse config file {}: {}", path.display(), source))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Logger setup error: {}", source))]
    Logger { source: log::SetLoggerError },

    #[snafu(display("Failed to create prefs directory {}: {}", path.display(), source))]
    PrefsDirCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Prefs key '{}' contains a path separator", key))]
    PrefsKey { key: String, backtrace: Backtrace },

    #[snafu(display("Failed to write prefs key '{}': {}", key, source))]
    PrefsWrite {
        key: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to persist prefs key '{}': {}", key, source))]
    PrefsPersist {
        key: String,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to remove prefs key '{}': {}", key, source))]
    PrefsRemove {
        key: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read release file {}: {}", path.display(), source))]
    ReleaseRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Release file {} has no version entry", path.display()))]
    ReleaseVersion { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Failed to determine the booted root device"))]
    BootDevice { backtrace: Backtrace },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    ProcRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to spawn {}: {}", command.display(), source))]
    SubprocessSpawn {
        command: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed waiting for {}: {}", command.display(), source))]
    SubprocessWait {
        command: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("{} did not exit within {} seconds", command.display(), seconds))]
    SubprocessTimeout {
        command: PathBuf,
        seconds: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("{} exited with {}: {}", command.display(), code, stderr))]
    SubprocessFailed {
        command: PathBuf,
        code: i32,
        stderr: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create mount point: {}", source))]
    MountPoint {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to mount {} at {}: {}", device, target.display(), source))]
    Mount {
        device: String,
        target: PathBuf,
        source: nix::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("New partition {} carries no postinstall tool", device))]
    PostinstallMissing { device: String, backtrace: Backtrace },

    #[snafu(display("Failed to write PCR policy {}: {}", path.display(), source))]
    PcrPolicyWrite {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to persist PCR policy {}: {}", path.display(), source))]
    PcrPolicyPersist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to set up signal handler: {}", source))]
    Signal {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to build async runtime: {}", source))]
    Runtime {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

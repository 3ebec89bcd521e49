use crate::error::{self, Result};
use serde::Deserialize;
use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/update_engine.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Update server endpoint the check requests go to.
    pub server_url: String,
    /// Base interval between update checks, in seconds.
    pub check_interval_secs: u64,
    /// Full width of the fuzz window applied around the base interval.
    pub interval_fuzz_secs: u64,
    /// Upper bound for exponential backoff after failed attempts.
    pub backoff_cap_secs: u64,
    /// Base for the fuzzed delay before the first check after startup.
    pub startup_delay_secs: u64,
    /// Hard timeout for the postinstall tool.
    pub postinstall_timeout_secs: u64,
    /// Optional PEM root certificate the server's TLS chain must descend
    /// from.
    pub pinned_certificate: Option<PathBuf>,
    /// Public key the payload signature must verify against.
    pub public_key_path: PathBuf,
    /// Where the prefs store lives.
    pub prefs_dir: PathBuf,
    /// The release file the current version is read from.
    pub release_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://public.update.flatcar-linux.net/v1/update/".to_string(),
            check_interval_secs: 45 * 60,
            interval_fuzz_secs: 10 * 60,
            backoff_cap_secs: 4 * 60 * 60,
            startup_delay_secs: 2 * 60,
            postinstall_timeout_secs: 5 * 60,
            pinned_certificate: None,
            public_key_path: PathBuf::from(update_payload::PUBLIC_KEY_PATH),
            prefs_dir: PathBuf::from("/var/lib/update_engine/prefs"),
            release_file: PathBuf::from("/usr/share/flatcar/release"),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).context(error::ConfigReadSnafu { path })?;
        toml::from_str(&raw).context(error::ConfigParseSnafu { path })
    }
}

//! Durable key-value store: one small file per key, written with an atomic
//! replace so a crash never leaves a half-written value.

use crate::error::{self, Result};
use log::warn;
use snafu::{ensure, ResultExt};
use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::NamedTempFile;

pub const BOOT_ID_KEY: &str = "boot-id";

#[derive(Debug)]
pub struct Prefs {
    dir: PathBuf,
}

impl Prefs {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context(error::PrefsDirCreateSnafu { path: &dir })?;
        Ok(Self { dir })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let bytes = self.get_blob(key)?;
        match String::from_utf8(bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Prefs key '{}' holds non-UTF-8 data, ignoring", key);
                None
            }
        }
    }

    pub fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.key_path(key).ok()?;
        fs::read(path).ok()
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.set_blob(key, value.as_bytes())
    }

    pub fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key)?;
        let mut temp =
            NamedTempFile::new_in(&self.dir).context(error::PrefsWriteSnafu { key })?;
        temp.write_all(value).context(error::PrefsWriteSnafu { key })?;
        temp.as_file()
            .sync_all()
            .context(error::PrefsWriteSnafu { key })?;
        temp.persist(path).context(error::PrefsPersistSnafu { key })?;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(error::PrefsRemoveSnafu { key }),
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        ensure!(
            !key.is_empty() && !key.contains(['/', '.']),
            error::PrefsKeySnafu { key }
        );
        Ok(self.dir.join(key))
    }
}

/// Shared handle to the process's prefs. The engine is single-threaded, so
/// borrows are transient and never contended.
#[derive(Clone, Debug)]
pub struct PrefsHandle(Rc<RefCell<Prefs>>);

impl PrefsHandle {
    pub fn new(prefs: Prefs) -> Self {
        Self(Rc::new(RefCell::new(prefs)))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.0.borrow().get(key)
    }

    pub fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        self.0.borrow().get_blob(key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.0.borrow_mut().set(key, value)
    }

    pub fn set_blob(&self, key: &str, value: &[u8]) -> Result<()> {
        self.0.borrow_mut().set_blob(key, value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.0.borrow_mut().remove(key)
    }
}

/// The payload processor persists its progress through this narrowed view.
impl update_payload::ProgressStore for PrefsHandle {
    fn get(&self, key: &str) -> Option<String> {
        PrefsHandle::get(self, key)
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        PrefsHandle::set(self, key, value).map_err(io::Error::other)
    }

    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        PrefsHandle::get_blob(self, key)
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> io::Result<()> {
        PrefsHandle::set_blob(self, key, value).map_err(io::Error::other)
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        PrefsHandle::remove(self, key).map_err(io::Error::other)
    }
}

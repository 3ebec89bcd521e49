//! Per-payload download state that outlives a single attempt: which URL of
//! the response's rotation to use and how many transport failures it has
//! seen.

use crate::error::Result;
use crate::prefs::PrefsHandle;
use log::info;
use update_payload::RESPONSE_HASH_KEY;

const URL_INDEX_KEY: &str = "payload-url-index";
const URL_FAILURE_COUNT_KEY: &str = "payload-url-failure-count";

#[derive(Debug)]
pub struct PayloadState {
    prefs: PrefsHandle,
    url_index: u32,
    url_failure_count: u32,
}

impl PayloadState {
    pub fn load(prefs: PrefsHandle) -> Self {
        let read = |key: &str| {
            prefs
                .get(key)
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(0)
        };
        Self {
            url_index: read(URL_INDEX_KEY),
            url_failure_count: read(URL_FAILURE_COUNT_KEY),
            prefs,
        }
    }

    pub fn url_index(&self) -> u32 {
        self.url_index
    }

    pub fn url_failure_count(&self) -> u32 {
        self.url_failure_count
    }

    /// Called with each usable server response. A response hash different
    /// from the one the rotation belongs to restarts the rotation.
    pub fn observe_response(&mut self, response_hash: &str) -> Result<()> {
        if self.prefs.get(RESPONSE_HASH_KEY).as_deref() != Some(response_hash)
            && (self.url_index != 0 || self.url_failure_count != 0)
        {
            info!("New payload offered, restarting URL rotation");
            self.clear()?;
        }
        Ok(())
    }

    /// Advances to the next URL after a transport or per-URL payload
    /// failure. The index deliberately runs past the end of the list; the
    /// response handler reports an exhausted rotation as a network failure
    /// so the scheduler backs off.
    pub fn advance_url(&mut self) -> Result<()> {
        self.url_index += 1;
        self.url_failure_count += 1;
        self.persist()
    }

    /// Forgets the rotation, either because the apply succeeded or because
    /// a new payload supersedes it.
    pub fn clear(&mut self) -> Result<()> {
        self.url_index = 0;
        self.url_failure_count = 0;
        self.prefs.remove(URL_INDEX_KEY)?;
        self.prefs.remove(URL_FAILURE_COUNT_KEY)?;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.prefs.set(URL_INDEX_KEY, &self.url_index.to_string())?;
        self.prefs
            .set(URL_FAILURE_COUNT_KEY, &self.url_failure_count.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::Prefs;
    use tempfile::TempDir;

    fn handle(dir: &TempDir) -> PrefsHandle {
        PrefsHandle::new(Prefs::open(dir.path()).unwrap())
    }

    #[test]
    fn survives_restart_via_prefs() {
        let dir = TempDir::new().unwrap();
        let prefs = handle(&dir);

        let mut state = PayloadState::load(prefs.clone());
        assert_eq!(state.url_index(), 0);
        state.advance_url().unwrap();
        state.advance_url().unwrap();

        let reloaded = PayloadState::load(prefs);
        assert_eq!(reloaded.url_index(), 2);
        assert_eq!(reloaded.url_failure_count(), 2);
    }

    #[test]
    fn new_response_hash_restarts_rotation() {
        let dir = TempDir::new().unwrap();
        let prefs = handle(&dir);
        prefs.set(RESPONSE_HASH_KEY, "old-hash").unwrap();

        let mut state = PayloadState::load(prefs.clone());
        state.advance_url().unwrap();

        state.observe_response("old-hash").unwrap();
        assert_eq!(state.url_index(), 1);

        state.observe_response("new-hash").unwrap();
        assert_eq!(state.url_index(), 0);
        assert_eq!(state.url_failure_count(), 0);
    }

    #[test]
    fn clear_removes_persisted_keys() {
        let dir = TempDir::new().unwrap();
        let prefs = handle(&dir);

        let mut state = PayloadState::load(prefs.clone());
        state.advance_url().unwrap();
        state.clear().unwrap();

        let reloaded = PayloadState::load(prefs);
        assert_eq!(reloaded.url_index(), 0);
        assert_eq!(reloaded.url_failure_count(), 0);
    }
}

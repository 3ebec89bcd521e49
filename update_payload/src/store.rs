use crate::{
    MANIFEST_KEY, NEXT_DATA_OFFSET_KEY, NEXT_OPERATION_KEY, RESPONSE_HASH_KEY, SHA256_CONTEXT_KEY,
    SIGNED_SHA256_CONTEXT_KEY,
};
use std::collections::BTreeMap;
use std::io;

/// The narrow prefs interface the processor persists its progress through.
/// The daemon implements this on its durable prefs store; tests use a
/// `BTreeMap`.
pub trait ProgressStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> io::Result<()>;
    fn get_blob(&self, key: &str) -> Option<Vec<u8>>;
    fn set_blob(&mut self, key: &str, value: &[u8]) -> io::Result<()>;
    fn remove(&mut self, key: &str) -> io::Result<()>;
}

impl ProgressStore for BTreeMap<String, Vec<u8>> {
    fn get(&self, key: &str) -> Option<String> {
        self.get_blob(key)
            .and_then(|v| String::from_utf8(v).ok())
    }

    fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.set_blob(key, value.as_bytes())
    }

    fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        BTreeMap::get(self, key).cloned()
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> io::Result<()> {
        self.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> io::Result<()> {
        BTreeMap::remove(self, key);
        Ok(())
    }
}

const UPDATE_STATE_KEYS: [&str; 5] = [
    NEXT_DATA_OFFSET_KEY,
    NEXT_OPERATION_KEY,
    SHA256_CONTEXT_KEY,
    SIGNED_SHA256_CONTEXT_KEY,
    MANIFEST_KEY,
];

/// Whether persisted progress belongs to `response_hash` and is complete
/// enough to resume from. Reading any update-state key with a mismatched
/// response hash forces a full restart.
pub fn can_resume_update(store: &dyn ProgressStore, response_hash: &str) -> bool {
    store.get(RESPONSE_HASH_KEY).as_deref() == Some(response_hash)
        && UPDATE_STATE_KEYS.iter().all(|key| {
            if *key == MANIFEST_KEY {
                store.get_blob(key).is_some()
            } else {
                store.get(key).is_some()
            }
        })
}

/// Clears the per-operation progress state, leaving the response hash in
/// place so the same payload restarts from scratch rather than resuming.
pub fn reset_update_progress(store: &mut dyn ProgressStore) -> io::Result<()> {
    for key in UPDATE_STATE_KEYS {
        store.remove(key)?;
    }
    Ok(())
}

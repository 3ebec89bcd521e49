use crate::error::{self, Result};
use sha2::digest::common::hazmat::{SerializableState, SerializedState};
use sha2::{Digest, Sha256};

/// A running SHA-256 whose state can be round-tripped through a prefs
/// string, so an interrupted apply resumes without rehashing consumed
/// bytes.
#[derive(Clone)]
pub struct ResumableSha256 {
    inner: Sha256,
}

impl ResumableSha256 {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }

    /// Serializes the hash state as hex for the prefs store.
    pub fn serialize_hex(&self) -> String {
        hex::encode(self.inner.serialize().as_slice())
    }

    /// Restores a hash state previously produced by [`serialize_hex`].
    ///
    /// [`serialize_hex`]: Self::serialize_hex
    pub fn from_hex(serialized: &str) -> Result<Self> {
        let bytes = hex::decode(serialized).map_err(|e| {
            error::ResumeStateSnafu {
                what: "sha256 context",
                detail: e.to_string(),
            }
            .build()
        })?;
        let mut state = SerializedState::<Sha256>::default();
        if bytes.len() != state.len() {
            return error::ResumeStateSnafu {
                what: "sha256 context",
                detail: format!("expected {} bytes, got {}", state.len(), bytes.len()),
            }
            .fail();
        }
        state.copy_from_slice(&bytes);
        let inner = Sha256::deserialize(&state).map_err(|e| {
            error::ResumeStateSnafu {
                what: "sha256 context",
                detail: e.to_string(),
            }
            .build()
        })?;
        Ok(Self { inner })
    }
}

impl Default for ResumableSha256 {
    fn default() -> Self {
        Self::new()
    }
}

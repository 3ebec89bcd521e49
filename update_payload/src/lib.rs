//! The signed update payload format and its streaming processor.
//!
//! A payload is framed as a fixed header (magic, format version, manifest
//! length), a manifest describing install operations for the root partition
//! and the kernel, a data region holding the operations' blobs, and a
//! trailing signature over everything before it. [`PayloadProcessor`]
//! consumes the byte stream as it arrives, applies operations to the
//! inactive slot, and persists its progress so an interrupted apply can
//! resume at an operation boundary.

pub mod build;
pub mod error;
mod hash;
mod manifest;
mod operation;
mod processor;
mod store;
mod verify;

pub use error::{Error, ErrorKind};
pub use hash::ResumableSha256;
pub use manifest::{
    BlobRef, Extent, ImageInfo, InstallOperation, Manifest, OperationTarget, OperationType,
};
pub use processor::{InstallResult, PayloadProcessor, ProcessorConfig};
pub use store::{can_resume_update, reset_update_progress, ProgressStore};
pub use verify::Signature;

/// The first four bytes of every payload.
pub const MAGIC: &[u8; 4] = b"CrAU";

/// The payload format version this processor understands.
pub const FORMAT_VERSION: u64 = 1;

/// Fixed header size: magic, version, manifest length.
pub const HEADER_SIZE: u64 = 20;

/// Upper bound on the manifest region, to keep a corrupt length field from
/// ballooning the parse buffer.
pub const MAX_MANIFEST_SIZE: u64 = 8 * 1024 * 1024;

/// Where the payload verification public key lives on the image.
pub const PUBLIC_KEY_PATH: &str = "/usr/share/update_engine/update-payload-key.pub.pem";

/// Prefs key: hash of the server response any persisted progress belongs to.
pub const RESPONSE_HASH_KEY: &str = "update-check-response-hash";
/// Prefs key: absolute payload offset at which the stream resumes.
pub const NEXT_DATA_OFFSET_KEY: &str = "update-state-next-data-offset";
/// Prefs key: index of the next operation to apply.
pub const NEXT_OPERATION_KEY: &str = "update-state-next-operation";
/// Prefs key: serialized running hash over all payload bytes.
pub const SHA256_CONTEXT_KEY: &str = "update-state-sha256-context";
/// Prefs key: serialized running hash over the signed prefix.
pub const SIGNED_SHA256_CONTEXT_KEY: &str = "update-state-signed-sha256-context";
/// Prefs key: raw manifest bytes, kept so a resume can rebuild the
/// operation list without re-downloading the payload head.
pub const MANIFEST_KEY: &str = "update-state-manifest";

use snafu::Snafu;
use std::path::PathBuf;

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a processor failure, used by the attempter to
/// pick a recovery policy. `PayloadMismatch` failures are fatal for the
/// current URL but allow trying a mirror; `Hash` and `Signature` condemn the
/// payload itself; `Io` aborts the attempt; `Internal` is an invariant
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Hash,
    Signature,
    PayloadMismatch,
    Io,
    Internal,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Payload does not start with the expected magic"))]
    BadMagic,

    #[snafu(display("Unsupported payload format version {}", version))]
    UnsupportedVersion { version: u64 },

    #[snafu(display("Manifest length {} exceeds the {} byte limit", size, limit))]
    ManifestTooLarge { size: u64, limit: u64 },

    #[snafu(display("Failed to parse payload manifest: {}", source))]
    ManifestParse { source: bincode::Error },

    #[snafu(display("Failed to encode payload manifest: {}", source))]
    ManifestEncode { source: bincode::Error },

    #[snafu(display(
        "Operation {} declares data offset {} but the stream is at {}",
        operation,
        declared,
        expected
    ))]
    DataOffsetMismatch {
        operation: usize,
        declared: u64,
        expected: u64,
    },

    #[snafu(display("Operation {} data does not match its declared hash", operation))]
    OperationHashMismatch { operation: usize },

    #[snafu(display(
        "Operation {} produced {} bytes for destination extents totaling {}",
        operation,
        produced,
        expected
    ))]
    DestinationSizeMismatch {
        operation: usize,
        produced: u64,
        expected: u64,
    },

    #[snafu(display(
        "Operation {} writes past the destination image size {}",
        operation,
        size
    ))]
    DestinationOverrun { operation: usize, size: u64 },

    #[snafu(display(
        "Manifest frames a {} byte payload but the response declared {}",
        manifest,
        response
    ))]
    PayloadSizeDisagreement { manifest: u64, response: u64 },

    #[snafu(display("Payload hash does not match the expected hash from the update response"))]
    PayloadHashMismatch,

    #[snafu(display("Expected payload hash '{}' is not valid hex: {}", hash, source))]
    ExpectedHashFormat {
        hash: String,
        source: hex::FromHexError,
    },

    #[snafu(display("Failed to parse signature blob: {}", source))]
    SignatureParse { source: bincode::Error },

    #[snafu(display("Failed to encode signature blob: {}", source))]
    SignatureEncode { source: bincode::Error },

    #[snafu(display("Signature blob contains no signatures"))]
    EmptySignature,

    #[snafu(display("No signature in the blob verifies against the public key"))]
    NoValidSignature,

    #[snafu(display("Failed to read public key {}: {}", path.display(), source))]
    PublicKeyRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse public key {}: {}", path.display(), source))]
    PublicKeyParse {
        path: PathBuf,
        source: openssl::error::ErrorStack,
    },

    #[snafu(display("RSA operation failed: {}", source))]
    Rsa { source: openssl::error::ErrorStack },

    #[snafu(display(
        "Payload stream exceeds its declared size of {} bytes",
        expected
    ))]
    PayloadOvershoot { expected: u64 },

    #[snafu(display("Payload stream ended {} bytes short of its declared size", missing))]
    PayloadTruncated { missing: u64 },

    #[snafu(display("Failed to open {}: {}", path.display(), source))]
    TargetOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to read source extents: {}", source))]
    SourceRead { source: std::io::Error },

    #[snafu(display("Failed writing update data to disk: {}", source))]
    TargetWrite { source: std::io::Error },

    #[snafu(display("Failed to decompress operation data: {}", source))]
    BzDecode { source: std::io::Error },

    #[snafu(display("Failed to apply binary diff: {}", source))]
    BsdiffApply { source: std::io::Error },

    #[snafu(display("Failed to persist update progress: {}", source))]
    StorePersist { source: std::io::Error },

    #[snafu(display("Persisted {} state is unusable: {}", what, detail))]
    ResumeState { what: &'static str, detail: String },

    #[snafu(display("Payload processor used out of order: {}", detail))]
    ProcessorState { detail: &'static str },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            PayloadHashMismatch | ExpectedHashFormat { .. } => ErrorKind::Hash,
            SignatureParse { .. }
            | SignatureEncode { .. }
            | EmptySignature
            | NoValidSignature
            | PublicKeyRead { .. }
            | PublicKeyParse { .. }
            | Rsa { .. } => ErrorKind::Signature,
            BadMagic
            | UnsupportedVersion { .. }
            | ManifestTooLarge { .. }
            | ManifestParse { .. }
            | DataOffsetMismatch { .. }
            | OperationHashMismatch { .. }
            | DestinationSizeMismatch { .. }
            | DestinationOverrun { .. }
            | PayloadSizeDisagreement { .. }
            | BzDecode { .. }
            | BsdiffApply { .. } => ErrorKind::PayloadMismatch,
            ManifestEncode { .. }
            | PayloadOvershoot { .. }
            | PayloadTruncated { .. }
            | TargetOpen { .. }
            | SourceRead { .. }
            | TargetWrite { .. }
            | StorePersist { .. }
            | ResumeState { .. } => ErrorKind::Io,
            ProcessorState { .. } => ErrorKind::Internal,
        }
    }
}

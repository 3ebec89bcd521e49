use crate::error::{self, Result};
use crate::{HEADER_SIZE, MAX_MANIFEST_SIZE};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

/// One contiguous byte range in a partition or kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }
}

/// Sum of the lengths of a list of extents.
pub(crate) fn extents_length(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.length).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// Write literal bytes from the data region to the destination extents.
    Replace,
    /// Like `Replace`, with bzip2-compressed data.
    ReplaceBz,
    /// Copy bytes from the source extents to the destination extents.
    Move,
    /// Apply a binary diff from the data region against the source extents.
    Bsdiff,
    /// Copy bytes from the source extents to the destination extents.
    SourceCopy,
    /// Apply a binary diff from the data region against the source extents.
    SourceBsdiff,
}

impl OperationType {
    /// Whether operations of this type carry bytes in the data region.
    pub fn has_data(self) -> bool {
        !matches!(self, OperationType::Move | OperationType::SourceCopy)
    }

    /// Whether operations of this type read from the old image.
    pub fn reads_source(self) -> bool {
        !matches!(self, OperationType::Replace | OperationType::ReplaceBz)
    }
}

/// Which image an operation applies to. The manifest interleaves root
/// partition and kernel operations in one ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationTarget {
    Partition,
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOperation {
    pub op_type: OperationType,
    pub target: OperationTarget,
    /// Offset of this operation's blob, relative to the start of the data
    /// region.
    pub data_offset: u64,
    pub data_length: u64,
    /// Hash of the blob, when the generator recorded one.
    pub data_sha256: Option<Vec<u8>>,
    /// Byte ranges read from the old image.
    pub src_extents: Vec<Extent>,
    /// Byte ranges written in the new image.
    pub dst_extents: Vec<Extent>,
}

/// Size and hash of a whole partition or kernel image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub size: u64,
    pub sha256: Vec<u8>,
}

/// A blob in the data region that is not tied to an install operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub data_offset: u64,
    pub data_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Human-readable version of the image this payload produces.
    pub version_label: String,
    pub operations: Vec<InstallOperation>,
    pub old_partition_info: Option<ImageInfo>,
    pub new_partition_info: Option<ImageInfo>,
    pub old_kernel_info: Option<ImageInfo>,
    pub new_kernel_info: Option<ImageInfo>,
    /// PCR policy archive staged for the measured-boot facility.
    pub pcr_policy: Option<BlobRef>,
    /// Absolute payload offset of the trailing signature blob.
    pub signature_offset: u64,
    pub signature_size: u64,
    /// Optional detached signature over the header and manifest bytes.
    pub metadata_signature: Option<Vec<u8>>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = bincode::deserialize(bytes).context(error::ManifestParseSnafu)?;
        manifest.validate(HEADER_SIZE + bytes.len() as u64)?;
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context(error::ManifestEncodeSnafu)
    }

    /// Checks the internal consistency the processor relies on: operation
    /// blobs laid out contiguously in manifest order from the start of the
    /// data region, the PCR policy blob directly after them, and the
    /// signature directly after the data region.
    pub fn validate(&self, data_region_start: u64) -> Result<()> {
        let mut expected = 0u64;
        for (index, op) in self.operations.iter().enumerate() {
            if op.op_type.has_data() {
                ensure!(
                    op.data_offset == expected,
                    error::DataOffsetMismatchSnafu {
                        operation: index,
                        declared: op.data_offset,
                        expected,
                    }
                );
                expected += op.data_length;
            }
            let image_info = match op.target {
                OperationTarget::Partition => &self.new_partition_info,
                OperationTarget::Kernel => &self.new_kernel_info,
            };
            if let Some(info) = image_info {
                let end = op
                    .dst_extents
                    .iter()
                    .map(|e| e.offset + e.length)
                    .max()
                    .unwrap_or(0);
                ensure!(
                    end <= info.size,
                    error::DestinationOverrunSnafu {
                        operation: index,
                        size: info.size,
                    }
                );
            }
        }
        if let Some(pcr) = &self.pcr_policy {
            ensure!(
                pcr.data_offset == expected,
                error::DataOffsetMismatchSnafu {
                    operation: self.operations.len(),
                    declared: pcr.data_offset,
                    expected,
                }
            );
            expected += pcr.data_length;
        }
        ensure!(
            self.signature_offset == data_region_start + expected,
            error::DataOffsetMismatchSnafu {
                operation: self.operations.len(),
                declared: self.signature_offset,
                expected: data_region_start + expected,
            }
        );
        ensure!(self.signature_size > 0, error::EmptySignatureSnafu);
        Ok(())
    }

    /// Total payload size implied by the manifest framing.
    pub fn payload_size(&self) -> u64 {
        self.signature_offset + self.signature_size
    }
}

/// Parses the fixed 20-byte header, returning the manifest length.
pub(crate) fn parse_header(header: &[u8; 20]) -> Result<u64> {
    ensure!(&header[..4] == crate::MAGIC, error::BadMagicSnafu);
    let field = |range: std::ops::Range<usize>| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[range]);
        u64::from_be_bytes(bytes)
    };
    let version = field(4..12);
    ensure!(
        version == crate::FORMAT_VERSION,
        error::UnsupportedVersionSnafu { version }
    );
    let manifest_len = field(12..20);
    ensure!(
        manifest_len <= MAX_MANIFEST_SIZE,
        error::ManifestTooLargeSnafu {
            size: manifest_len,
            limit: MAX_MANIFEST_SIZE,
        }
    );
    Ok(manifest_len)
}

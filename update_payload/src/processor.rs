use crate::error::{self, Result};
use crate::hash::ResumableSha256;
use crate::manifest::{self, Manifest, OperationTarget};
use crate::store::{reset_update_progress, ProgressStore};
use crate::{operation, verify};
use crate::{
    HEADER_SIZE, MANIFEST_KEY, NEXT_DATA_OFFSET_KEY, NEXT_OPERATION_KEY, SHA256_CONTEXT_KEY,
    SIGNED_SHA256_CONTEXT_KEY,
};
use log::{debug, info};
use sha2::{Digest, Sha256};
use snafu::{ensure, OptionExt, ResultExt};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

/// Everything the processor needs to know about one apply attempt, resolved
/// from the install plan.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub old_partition: PathBuf,
    pub new_partition: PathBuf,
    pub old_kernel: PathBuf,
    pub new_kernel: PathBuf,
    /// Declared size of the whole payload stream.
    pub payload_size: u64,
    /// Expected hex SHA-256 of the whole payload, from the update response.
    pub payload_hash: String,
    /// PEM public key the trailing signature must verify against.
    pub public_key: PathBuf,
}

/// What a successfully verified apply produced, beyond the images
/// themselves.
#[derive(Debug)]
pub struct InstallResult {
    pub version_label: String,
    pub pcr_policy: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Manifest { length: u64 },
    Operations,
    PcrPolicy,
    Signature,
    Complete,
}

struct Targets {
    new_partition: File,
    new_kernel: File,
    old_partition: Option<File>,
    old_kernel: Option<File>,
}

impl Targets {
    fn open(config: &ProcessorConfig, manifest: &Manifest) -> Result<Self> {
        let open_write = |path: &PathBuf| -> Result<File> {
            OpenOptions::new()
                .write(true)
                .create(true)
                .open(path)
                .context(error::TargetOpenSnafu { path })
        };
        let open_read = |path: &PathBuf| -> Result<File> {
            File::open(path).context(error::TargetOpenSnafu { path })
        };

        let reads = |target: OperationTarget| {
            manifest
                .operations
                .iter()
                .any(|op| op.op_type.reads_source() && op.target == target)
        };

        Ok(Self {
            new_partition: open_write(&config.new_partition)?,
            new_kernel: open_write(&config.new_kernel)?,
            old_partition: if reads(OperationTarget::Partition) {
                Some(open_read(&config.old_partition)?)
            } else {
                None
            },
            old_kernel: if reads(OperationTarget::Kernel) {
                Some(open_read(&config.old_kernel)?)
            } else {
                None
            },
        })
    }

    fn pair(&self, target: OperationTarget) -> (Option<&File>, &File) {
        match target {
            OperationTarget::Partition => (self.old_partition.as_ref(), &self.new_partition),
            OperationTarget::Kernel => (self.old_kernel.as_ref(), &self.new_kernel),
        }
    }
}

/// Streaming consumer of a payload. Bytes are fed through [`write`]; the
/// processor parses the framing, applies operations to the inactive slot as
/// their data becomes available, and persists progress after every
/// operation so a crash resumes at an operation boundary. [`finish`]
/// performs the final hash and signature verification; until it succeeds no
/// byte is trusted, which is tolerable only because the destination is the
/// inactive slot and marking it bootable is gated on the verification.
///
/// [`write`]: Self::write
/// [`finish`]: Self::finish
pub struct PayloadProcessor {
    store: Box<dyn ProgressStore>,
    config: ProcessorConfig,
    targets: Option<Targets>,
    phase: Phase,
    buffer: Vec<u8>,
    /// Absolute payload offset of the next unconsumed byte.
    consumed: u64,
    hash: ResumableSha256,
    signed_hash: ResumableSha256,
    manifest: Option<Manifest>,
    metadata_size: u64,
    next_operation: usize,
    pcr_policy: Option<Vec<u8>>,
    signature_blob: Vec<u8>,
    /// Bytes to drop, unhashed, when the server ignored a range request.
    skip_remaining: u64,
    resume_offset: u64,
    started: bool,
}

impl PayloadProcessor {
    pub fn new(store: Box<dyn ProgressStore>, config: ProcessorConfig) -> Self {
        Self {
            store,
            config,
            targets: None,
            phase: Phase::Header,
            buffer: Vec::new(),
            consumed: 0,
            hash: ResumableSha256::new(),
            signed_hash: ResumableSha256::new(),
            manifest: None,
            metadata_size: 0,
            next_operation: 0,
            pcr_policy: None,
            signature_blob: Vec::new(),
            skip_remaining: 0,
            resume_offset: 0,
            started: false,
        }
    }

    /// Prepares for a run and returns the payload offset the download
    /// should resume from (zero for a fresh apply). For a resume, the
    /// manifest, hash contexts, and operation index are restored from the
    /// progress store.
    pub fn start(&mut self, is_resume: bool) -> Result<u64> {
        ensure!(
            !self.started,
            error::ProcessorStateSnafu {
                detail: "start called twice",
            }
        );
        self.started = true;

        if !is_resume {
            return Ok(0);
        }

        let manifest_bytes =
            self.store
                .get_blob(MANIFEST_KEY)
                .context(error::ResumeStateSnafu {
                    what: "manifest",
                    detail: "missing from the progress store".to_string(),
                })?;
        let manifest = Manifest::parse(&manifest_bytes)?;
        self.metadata_size = HEADER_SIZE + manifest_bytes.len() as u64;
        self.check_payload_size(&manifest)?;
        self.check_metadata_signature(&manifest)?;

        self.next_operation = self.read_state_number(NEXT_OPERATION_KEY)? as usize;
        self.consumed = self.read_state_number(NEXT_DATA_OFFSET_KEY)?;
        self.hash = self.read_state_context(SHA256_CONTEXT_KEY)?;
        self.signed_hash = self.read_state_context(SIGNED_SHA256_CONTEXT_KEY)?;
        ensure!(
            self.next_operation <= manifest.operations.len(),
            error::ResumeStateSnafu {
                what: "operation index",
                detail: format!(
                    "{} exceeds the {} operations in the manifest",
                    self.next_operation,
                    manifest.operations.len()
                ),
            }
        );
        ensure!(
            self.consumed <= self.config.payload_size,
            error::ResumeStateSnafu {
                what: "data offset",
                detail: format!(
                    "{} exceeds the {} byte payload",
                    self.consumed, self.config.payload_size
                ),
            }
        );

        self.targets = Some(Targets::open(&self.config, &manifest)?);
        self.manifest = Some(manifest);
        self.phase = Phase::Operations;
        self.resume_offset = self.consumed;
        info!(
            "Resuming apply at operation {}, payload offset {}",
            self.next_operation, self.consumed
        );
        Ok(self.consumed)
    }

    /// Tells the processor where the incoming stream actually starts. A
    /// server that answers a ranged request with the whole payload streams
    /// from zero; bytes below the resume point are then discarded without
    /// rehashing, since the restored contexts already cover them.
    pub fn set_stream_start(&mut self, offset: u64) -> Result<()> {
        if offset == self.resume_offset {
            return Ok(());
        }
        ensure!(
            offset == 0,
            error::ResumeStateSnafu {
                what: "stream offset",
                detail: format!(
                    "server started the stream at {} instead of {} or 0",
                    offset, self.resume_offset
                ),
            }
        );
        self.skip_remaining = self.resume_offset;
        Ok(())
    }

    /// Total payload bytes consumed so far, for progress reporting.
    pub fn bytes_processed(&self) -> u64 {
        self.consumed
    }

    /// Feeds the next chunk of the payload stream.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        ensure!(
            self.started,
            error::ProcessorStateSnafu {
                detail: "write before start",
            }
        );
        let mut data = data;
        if self.skip_remaining > 0 {
            let skip = self.skip_remaining.min(data.len() as u64) as usize;
            data = &data[skip..];
            self.skip_remaining -= skip as u64;
            if data.is_empty() {
                return Ok(());
            }
        }
        let fed = self.consumed + self.buffer.len() as u64 + data.len() as u64;
        ensure!(
            fed <= self.config.payload_size,
            error::PayloadOvershootSnafu {
                expected: self.config.payload_size,
            }
        );
        self.buffer.extend_from_slice(data);
        self.drain()
    }

    /// Verifies the completed stream: final payload hash, then the
    /// signature over the signed prefix. On a hash or signature failure the
    /// persisted operation state is cleared (the response hash is kept, so
    /// the same payload restarts from scratch rather than resuming).
    pub fn finish(mut self) -> Result<InstallResult> {
        if self.phase != Phase::Complete {
            let missing = self.config.payload_size - self.consumed;
            return error::PayloadTruncatedSnafu { missing }.fail();
        }

        let expected = hex::decode(&self.config.payload_hash).context(
            error::ExpectedHashFormatSnafu {
                hash: &self.config.payload_hash,
            },
        )?;
        let actual = self.hash.finalize();
        if expected[..] != actual[..] {
            reset_update_progress(self.store.as_mut()).context(error::StorePersistSnafu)?;
            return error::PayloadHashMismatchSnafu.fail();
        }

        let signed_digest = self.signed_hash.finalize();
        if let Err(e) =
            verify::verify_signature_blob(&self.signature_blob, &signed_digest, &self.config.public_key)
        {
            reset_update_progress(self.store.as_mut()).context(error::StorePersistSnafu)?;
            return Err(e);
        }

        if let Some(targets) = &self.targets {
            targets
                .new_partition
                .sync_all()
                .context(error::TargetWriteSnafu)?;
            targets
                .new_kernel
                .sync_all()
                .context(error::TargetWriteSnafu)?;
        }

        reset_update_progress(self.store.as_mut()).context(error::StorePersistSnafu)?;
        let manifest = self.manifest.take().context(error::ProcessorStateSnafu {
            detail: "finish without a manifest",
        })?;
        info!("Payload verified, version {}", manifest.version_label);
        Ok(InstallResult {
            version_label: manifest.version_label,
            pcr_policy: self.pcr_policy.take(),
        })
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            match self.phase {
                Phase::Header => {
                    if self.buffer.len() < HEADER_SIZE as usize {
                        return Ok(());
                    }
                    let bytes = self.consume(HEADER_SIZE as usize);
                    let mut header = [0u8; 20];
                    header.copy_from_slice(&bytes);
                    let length = manifest::parse_header(&header)?;
                    self.phase = Phase::Manifest { length };
                }
                Phase::Manifest { length } => {
                    if (self.buffer.len() as u64) < length {
                        return Ok(());
                    }
                    let bytes = self.consume(length as usize);
                    let manifest = Manifest::parse(&bytes)?;
                    self.metadata_size = HEADER_SIZE + length;
                    self.check_payload_size(&manifest)?;
                    self.check_metadata_signature(&manifest)?;
                    self.store
                        .set_blob(MANIFEST_KEY, &bytes)
                        .context(error::StorePersistSnafu)?;
                    self.targets = Some(Targets::open(&self.config, &manifest)?);
                    debug!(
                        "Parsed manifest: {} operations, version {}",
                        manifest.operations.len(),
                        manifest.version_label
                    );
                    self.manifest = Some(manifest);
                    self.phase = Phase::Operations;
                }
                Phase::Operations => {
                    let manifest = self.manifest.as_ref().context(error::ProcessorStateSnafu {
                        detail: "operations before manifest",
                    })?;
                    if self.next_operation >= manifest.operations.len() {
                        self.phase = if manifest.pcr_policy.is_some() {
                            Phase::PcrPolicy
                        } else {
                            Phase::Signature
                        };
                        continue;
                    }
                    let index = self.next_operation;
                    let op = manifest.operations[index].clone();
                    let need = if op.op_type.has_data() {
                        op.data_length as usize
                    } else {
                        0
                    };
                    if self.buffer.len() < need {
                        return Ok(());
                    }
                    let data = self.consume(need);
                    if let Some(declared) = &op.data_sha256 {
                        let actual = Sha256::digest(&data);
                        ensure!(
                            declared[..] == actual[..],
                            error::OperationHashMismatchSnafu { operation: index }
                        );
                    }
                    let targets = self.targets.as_ref().context(error::ProcessorStateSnafu {
                        detail: "operations before targets are open",
                    })?;
                    let (source, destination) = targets.pair(op.target);
                    operation::apply(index, &op, &data, source, destination)?;
                    self.next_operation += 1;
                    self.persist_progress()?;
                }
                Phase::PcrPolicy => {
                    let pcr = self
                        .manifest
                        .as_ref()
                        .and_then(|m| m.pcr_policy)
                        .context(error::ProcessorStateSnafu {
                            detail: "pcr phase without a pcr blob",
                        })?;
                    if (self.buffer.len() as u64) < pcr.data_length {
                        return Ok(());
                    }
                    self.pcr_policy = Some(self.consume(pcr.data_length as usize));
                    self.phase = Phase::Signature;
                }
                Phase::Signature => {
                    let size = self
                        .manifest
                        .as_ref()
                        .map(|m| m.signature_size)
                        .context(error::ProcessorStateSnafu {
                            detail: "signature phase without a manifest",
                        })?;
                    if (self.buffer.len() as u64) < size {
                        return Ok(());
                    }
                    self.signature_blob = self.consume(size as usize);
                    self.phase = Phase::Complete;
                }
                Phase::Complete => {
                    // Overshoot past the declared size was rejected in
                    // write(); an empty buffer is all that can remain.
                    return Ok(());
                }
            }
        }
    }

    /// Removes `n` bytes from the front of the buffer, folding them into
    /// the running hash contexts. The signed context stops at the
    /// signature offset.
    fn consume(&mut self, n: usize) -> Vec<u8> {
        let bytes: Vec<u8> = self.buffer.drain(..n).collect();
        let boundary = self
            .manifest
            .as_ref()
            .map_or(u64::MAX, |m| m.signature_offset);
        let signed_end = boundary.saturating_sub(self.consumed).min(n as u64) as usize;
        self.signed_hash.update(&bytes[..signed_end]);
        self.hash.update(&bytes);
        self.consumed += n as u64;
        bytes
    }

    /// Commits progress after an operation. This linearizes after the data
    /// write, so a crash never claims completion of an un-written
    /// operation.
    fn persist_progress(&mut self) -> Result<()> {
        self.store
            .set(NEXT_OPERATION_KEY, &self.next_operation.to_string())
            .context(error::StorePersistSnafu)?;
        self.store
            .set(NEXT_DATA_OFFSET_KEY, &self.consumed.to_string())
            .context(error::StorePersistSnafu)?;
        self.store
            .set(SHA256_CONTEXT_KEY, &self.hash.serialize_hex())
            .context(error::StorePersistSnafu)?;
        self.store
            .set(SIGNED_SHA256_CONTEXT_KEY, &self.signed_hash.serialize_hex())
            .context(error::StorePersistSnafu)?;
        Ok(())
    }

    fn check_payload_size(&self, manifest: &Manifest) -> Result<()> {
        ensure!(
            manifest.payload_size() == self.config.payload_size,
            error::PayloadSizeDisagreementSnafu {
                manifest: manifest.payload_size(),
                response: self.config.payload_size,
            }
        );
        Ok(())
    }

    /// When the manifest carries a detached signature, check it before
    /// trusting a single operation. The signed form is the framing with
    /// the signature field absent.
    fn check_metadata_signature(&self, manifest: &Manifest) -> Result<()> {
        let Some(signature) = &manifest.metadata_signature else {
            return Ok(());
        };
        let mut unsigned = manifest.clone();
        unsigned.metadata_signature = None;
        let unsigned_bytes = unsigned.to_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(crate::MAGIC);
        hasher.update(crate::FORMAT_VERSION.to_be_bytes());
        hasher.update((unsigned_bytes.len() as u64).to_be_bytes());
        hasher.update(&unsigned_bytes);
        let digest: [u8; 32] = hasher.finalize().into();
        verify::verify_raw_signature(signature, &digest, &self.config.public_key)?;
        debug!("Manifest metadata signature verified");
        Ok(())
    }

    fn read_state_number(&self, key: &str) -> Result<u64> {
        let value = self.store.get(key).context(error::ResumeStateSnafu {
            what: "progress",
            detail: format!("missing key {key}"),
        })?;
        value.parse().map_err(|_| {
            error::ResumeStateSnafu {
                what: "progress",
                detail: format!("key {key} holds '{value}', not a number"),
            }
            .build()
        })
    }

    fn read_state_context(&self, key: &str) -> Result<ResumableSha256> {
        let value = self.store.get(key).context(error::ResumeStateSnafu {
            what: "sha256 context",
            detail: format!("missing key {key}"),
        })?;
        ResumableSha256::from_hex(&value)
    }
}

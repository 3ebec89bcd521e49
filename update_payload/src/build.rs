//! Payload assembly. The image build pipeline uses this to produce signed
//! payloads; the test suites use it to construct fixtures that exercise the
//! processor end to end.

use crate::error::{self, Result};
use crate::manifest::{BlobRef, Extent, InstallOperation, Manifest, OperationTarget, OperationType};
use crate::verify::{sign_digest, Signature};
use crate::{FORMAT_VERSION, HEADER_SIZE, MAGIC};
use sha2::{Digest, Sha256};
use snafu::ResultExt;

/// Assembles a payload from install operations, laying out the data region
/// in operation order and signing the result with an RSA private key.
pub struct PayloadBuilder {
    version_label: String,
    operations: Vec<(InstallOperation, Vec<u8>)>,
    pcr_policy: Option<Vec<u8>>,
    data_length: u64,
    sign_metadata: bool,
}

impl PayloadBuilder {
    pub fn new<S: Into<String>>(version_label: S) -> Self {
        Self {
            version_label: version_label.into(),
            operations: Vec::new(),
            pcr_policy: None,
            data_length: 0,
            sign_metadata: false,
        }
    }

    /// Also carry a detached signature over the framing, so a processor can
    /// reject a forged manifest before applying anything.
    pub fn sign_metadata(mut self) -> Self {
        self.sign_metadata = true;
        self
    }

    /// Appends an operation. `data` is its blob (empty for operations that
    /// carry none); the blob's offset and hash are filled in here.
    pub fn operation(
        mut self,
        op_type: OperationType,
        target: OperationTarget,
        src_extents: Vec<Extent>,
        dst_extents: Vec<Extent>,
        data: Vec<u8>,
    ) -> Self {
        let data_sha256 = if op_type.has_data() {
            Some(Sha256::digest(&data).to_vec())
        } else {
            None
        };
        let operation = InstallOperation {
            op_type,
            target,
            data_offset: self.data_length,
            data_length: data.len() as u64,
            data_sha256,
            src_extents,
            dst_extents,
        };
        if op_type.has_data() {
            self.data_length += data.len() as u64;
        }
        self.operations.push((operation, data));
        self
    }

    pub fn pcr_policy(mut self, bytes: Vec<u8>) -> Self {
        self.pcr_policy = Some(bytes);
        self
    }

    /// Serializes and signs the payload with the PEM RSA private key.
    pub fn build(self, private_key_pem: &[u8]) -> Result<Vec<u8>> {
        let pcr_policy = self.pcr_policy.as_ref().map(|bytes| BlobRef {
            data_offset: self.data_length,
            data_length: bytes.len() as u64,
        });
        let data_length = self.data_length + pcr_policy.map_or(0, |p| p.data_length);

        let rsa = openssl::rsa::Rsa::private_key_from_pem(private_key_pem)
            .context(error::RsaSnafu)?;

        // The encoded manifest length does not depend on the offset values
        // (and the metadata signature placeholder is already final-sized),
        // so a first pass sizes the framing and a second pass fills in the
        // real offsets.
        let mut manifest = Manifest {
            version_label: self.version_label,
            operations: self.operations.iter().map(|(op, _)| op.clone()).collect(),
            old_partition_info: None,
            new_partition_info: None,
            old_kernel_info: None,
            new_kernel_info: None,
            pcr_policy,
            signature_offset: 0,
            signature_size: 0,
            metadata_signature: if self.sign_metadata {
                Some(vec![0u8; rsa.size() as usize])
            } else {
                None
            },
        };
        let manifest_len = manifest.to_bytes()?.len() as u64;
        manifest.signature_offset = HEADER_SIZE + manifest_len + data_length;
        manifest.signature_size = signature_blob_size(&rsa)?;
        if self.sign_metadata {
            let mut unsigned = manifest.clone();
            unsigned.metadata_signature = None;
            let unsigned_bytes = unsigned.to_bytes()?;
            let mut hasher = Sha256::new();
            hasher.update(MAGIC);
            hasher.update(FORMAT_VERSION.to_be_bytes());
            hasher.update((unsigned_bytes.len() as u64).to_be_bytes());
            hasher.update(&unsigned_bytes);
            let digest: [u8; 32] = hasher.finalize().into();
            manifest.metadata_signature = Some(sign_digest(&digest, private_key_pem)?);
        }
        let manifest_bytes = manifest.to_bytes()?;

        let mut payload =
            Vec::with_capacity((manifest.signature_offset + manifest.signature_size) as usize);
        payload.extend_from_slice(MAGIC);
        payload.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        payload.extend_from_slice(&(manifest_bytes.len() as u64).to_be_bytes());
        payload.extend_from_slice(&manifest_bytes);
        for (_, data) in &self.operations {
            payload.extend_from_slice(data);
        }
        if let Some(bytes) = &self.pcr_policy {
            payload.extend_from_slice(bytes);
        }

        let signed_digest: [u8; 32] = Sha256::digest(&payload).into();
        let signature = Signature {
            version: 1,
            data: sign_digest(&signed_digest, private_key_pem)?,
        };
        let blob =
            bincode::serialize(&vec![signature]).context(error::SignatureEncodeSnafu)?;
        payload.extend_from_slice(&blob);
        Ok(payload)
    }
}

/// The encoded signature blob size for a given key, needed in the manifest
/// before the signature itself can be computed. An RSA PKCS#1 signature is
/// always exactly the key size, so a placeholder of that length measures
/// the real blob.
fn signature_blob_size(rsa: &openssl::rsa::Rsa<openssl::pkey::Private>) -> Result<u64> {
    let placeholder = Signature {
        version: 1,
        data: vec![0u8; rsa.size() as usize],
    };
    let blob =
        bincode::serialize(&vec![placeholder]).context(error::SignatureEncodeSnafu)?;
    Ok(blob.len() as u64)
}

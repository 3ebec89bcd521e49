use crate::error::{self, Result};
use openssl::rsa::{Padding, Rsa};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fs;
use std::path::Path;

/// DER prefix of a PKCS#1 DigestInfo structure for SHA-256.
const SHA256_DIGEST_INFO_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

/// One entry of the trailing signature blob. A payload may carry several
/// signatures (key rotation); any one verifying accepts the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub version: u32,
    pub data: Vec<u8>,
}

fn digest_info(digest: &[u8; 32]) -> Vec<u8> {
    let mut expected = Vec::with_capacity(SHA256_DIGEST_INFO_PREFIX.len() + digest.len());
    expected.extend_from_slice(&SHA256_DIGEST_INFO_PREFIX);
    expected.extend_from_slice(digest);
    expected
}

/// Verifies the signature blob against a SHA-256 digest of the signed
/// payload prefix, using the PEM public key at `key_path`.
pub(crate) fn verify_signature_blob(
    blob: &[u8],
    digest: &[u8; 32],
    key_path: &Path,
) -> Result<()> {
    let signatures: Vec<Signature> =
        bincode::deserialize(blob).context(error::SignatureParseSnafu)?;
    ensure!(!signatures.is_empty(), error::EmptySignatureSnafu);

    let pem = fs::read(key_path).context(error::PublicKeyReadSnafu { path: key_path })?;
    let rsa = Rsa::public_key_from_pem(&pem).context(error::PublicKeyParseSnafu { path: key_path })?;

    let expected = digest_info(digest);
    let mut decrypted = vec![0u8; rsa.size() as usize];
    for signature in &signatures {
        if signature.data.len() != rsa.size() as usize {
            continue;
        }
        match rsa.public_decrypt(&signature.data, &mut decrypted, Padding::PKCS1) {
            Ok(len) if decrypted[..len] == expected[..] => return Ok(()),
            _ => continue,
        }
    }
    error::NoValidSignatureSnafu.fail()
}

/// Verifies one raw signature (not a blob) against a digest, as used for
/// the manifest's detached metadata signature.
pub(crate) fn verify_raw_signature(
    signature: &[u8],
    digest: &[u8; 32],
    key_path: &Path,
) -> Result<()> {
    let pem = fs::read(key_path).context(error::PublicKeyReadSnafu { path: key_path })?;
    let rsa = Rsa::public_key_from_pem(&pem).context(error::PublicKeyParseSnafu { path: key_path })?;
    let expected = digest_info(digest);
    let mut decrypted = vec![0u8; rsa.size() as usize];
    if signature.len() == rsa.size() as usize {
        if let Ok(len) = rsa.public_decrypt(signature, &mut decrypted, Padding::PKCS1) {
            if decrypted[..len] == expected[..] {
                return Ok(());
            }
        }
    }
    error::NoValidSignatureSnafu.fail()
}

/// Signs a SHA-256 digest with a PEM private key, producing the signature
/// bytes carried in the blob. Used by the payload builder.
pub(crate) fn sign_digest(digest: &[u8; 32], private_key_pem: &[u8]) -> Result<Vec<u8>> {
    let rsa = Rsa::private_key_from_pem(private_key_pem).context(error::RsaSnafu)?;
    let expected = digest_info(digest);
    let mut signature = vec![0u8; rsa.size() as usize];
    let len = rsa
        .private_encrypt(&expected, &mut signature, Padding::PKCS1)
        .context(error::RsaSnafu)?;
    signature.truncate(len);
    Ok(signature)
}

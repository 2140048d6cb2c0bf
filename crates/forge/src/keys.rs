//! RSA key material for node access and for the datastore PKI.

use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;

use crate::error::{Error, Result};

pub(crate) const RSA_KEY_BITS: usize = 4096;

/// An SSH identity: a PKCS#1 PEM private key and its OpenSSH public key line.
#[derive(Clone)]
pub struct SshKeyPair {
    pub private_key_pem: String,
    pub public_key: String,
}

impl std::fmt::Debug for SshKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

pub(crate) fn generate_rsa_key(purpose: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| Error::key_material(purpose, e))
}

pub(crate) fn pkcs1_pem(key: &RsaPrivateKey, purpose: &str) -> Result<String> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map(|pem| pem.as_str().to_owned())
        .map_err(|e| Error::key_material(format!("{} pkcs1 encoding", purpose), e))
}

pub(crate) fn pkcs8_pem(key: &RsaPrivateKey, purpose: &str) -> Result<String> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.as_str().to_owned())
        .map_err(|e| Error::key_material(format!("{} pkcs8 encoding", purpose), e))
}

/// Generates a fresh RSA-4096 SSH identity. This is CPU heavy; call it from a
/// blocking task.
pub fn generate_ssh_key_pair(comment: &str) -> Result<SshKeyPair> {
    let key = generate_rsa_key("ssh key")?;
    Ok(SshKeyPair {
        private_key_pem: pkcs1_pem(&key, "ssh key")?,
        public_key: openssh_public_key(&key, comment),
    })
}

/// Renders the `ssh-rsa AAAA... comment` line for `key`.
pub(crate) fn openssh_public_key(key: &RsaPrivateKey, comment: &str) -> String {
    let mut blob = Vec::new();
    write_ssh_string(&mut blob, b"ssh-rsa");
    write_mpint(&mut blob, &key.e().to_bytes_be());
    write_mpint(&mut blob, &key.n().to_bytes_be());
    let encoded = base64::encode(&blob);
    if comment.is_empty() {
        format!("ssh-rsa {}", encoded)
    } else {
        format!("ssh-rsa {} {}", encoded, comment)
    }
}

fn write_ssh_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

// Positive integers whose high bit is set need a leading zero byte.
fn write_mpint(out: &mut Vec<u8>, be_bytes: &[u8]) {
    let trimmed: &[u8] = match be_bytes.iter().position(|b| *b != 0) {
        Some(start) => &be_bytes[start..],
        None => &[],
    };
    if trimmed.first().map_or(false, |b| b & 0x80 != 0) {
        let mut padded = Vec::with_capacity(trimmed.len() + 1);
        padded.push(0);
        padded.extend_from_slice(trimmed);
        write_ssh_string(out, &padded);
    } else {
        write_ssh_string(out, trimmed);
    }
}

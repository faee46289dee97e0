pub mod errors;

/// Plugin artifact signing using Ed25519.
///
/// Signatures cover the SHA-256 digest of the artifact, not the artifact
/// itself, so large binaries are hashed once and the signature check stays
/// constant-size. On disk a signature is the ASCII hex of the 64 signature
/// bytes, stored next to the artifact as `<artifact>.sig`.
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use std::path::Path;

use errors::SignerError;

/// Ed25519 public key trusted to sign plugin artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key_bytes: [u8; 32],

    /// Optional label for this key (e.g. "official", "partner-acme").
    pub label: Option<String>,
}

impl PublicKey {
    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key_bytes: bytes,
            label: None,
        }
    }

    /// Create with a label.
    #[must_use]
    pub const fn with_label(bytes: [u8; 32], label: String) -> Self {
        Self {
            key_bytes: bytes,
            label: Some(label),
        }
    }

    /// Create from a hex string.
    ///
    /// # Errors
    ///
    /// Fails on malformed hex or a length other than 32 bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(hex_str.trim())?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignerError::Format(format!("public key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self {
            key_bytes,
            label: None,
        })
    }

    /// Hex form of the key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.key_bytes)
    }

    fn to_verifying_key(&self) -> Result<VerifyingKey, SignerError> {
        Ok(VerifyingKey::from_bytes(&self.key_bytes)?)
    }
}

/// A detached artifact signature.
#[derive(Debug, Clone)]
pub struct Signature {
    signature_bytes: [u8; 64],
}

impl Signature {
    /// Create from raw bytes.
    #[must_use]
    pub const fn from_bytes(signature_bytes: [u8; 64]) -> Self {
        Self { signature_bytes }
    }

    /// Parse the hex form used in `.sig` files.
    ///
    /// # Errors
    ///
    /// Fails on malformed hex or a decoded length other than 64 bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(hex_str.trim())?;
        let signature_bytes: [u8; 64] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignerError::Format(format!("signature must be 64 bytes, got {}", b.len()))
        })?;
        Ok(Self { signature_bytes })
    }

    /// Read and parse a `.sig` file.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, empty, or not 64 hex-encoded bytes.
    pub fn from_sig_file<P: AsRef<Path>>(path: P) -> Result<Self, SignerError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        if text.trim().is_empty() {
            return Err(SignerError::Format("signature file is empty".to_string()));
        }
        Self::from_hex(&text)
    }

    /// Hex form of the signature.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.signature_bytes)
    }

    /// Verify this signature over `content` against one key.
    ///
    /// # Errors
    ///
    /// Fails only when the public key itself is malformed; a non-matching
    /// signature returns `Ok(false)`.
    pub fn verify(&self, content: &[u8], key: &PublicKey) -> Result<bool, SignerError> {
        let verifying_key = key.to_verifying_key()?;
        let digest = Sha256::digest(content);
        let signature = Ed25519Signature::from_bytes(&self.signature_bytes);
        Ok(verifying_key.verify(&digest, &signature).is_ok())
    }
}

/// Signing key pair, for artifact publishers and test fixtures.
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    /// Generate a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// The public half.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.verifying_key.to_bytes())
    }

    /// Sign content (over its SHA-256 digest).
    #[must_use]
    pub fn sign(&self, content: &[u8]) -> Signature {
        let digest = Sha256::digest(content);
        Signature::from_bytes(self.signing_key.sign(&digest).to_bytes())
    }

    /// Sign a file and write `<path>.sig` next to it.
    ///
    /// # Errors
    ///
    /// Fails when the artifact cannot be read or the `.sig` file written.
    pub fn sign_file<P: AsRef<Path>>(&self, path: P) -> Result<Signature, SignerError> {
        let content = std::fs::read(path.as_ref())?;
        let signature = self.sign(&content);
        let sig_path = sig_path_for(path.as_ref());
        std::fs::write(sig_path, signature.to_hex())?;
        Ok(signature)
    }

    /// Import from a private key in hex.
    ///
    /// # Errors
    ///
    /// Fails on malformed hex or a length other than 32 bytes.
    pub fn from_private_key_hex(hex_str: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(hex_str.trim())?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignerError::Format(format!("private key must be 32 bytes, got {}", b.len()))
        })?;
        let signing_key = SigningKey::from_bytes(&key_bytes);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Export the private key as hex. Keep it secret.
    #[must_use]
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

/// The `.sig` path for an artifact.
#[must_use]
pub fn sig_path_for(artifact: &Path) -> std::path::PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".sig");
    std::path::PathBuf::from(name)
}

/// Verify an artifact against its `.sig` file with a set of trusted keys.
///
/// At least one key must verify.
///
/// # Errors
///
/// Fails when the artifact or signature file is unreadable or malformed, or
/// when no trusted key verifies.
pub fn verify_artifact<P: AsRef<Path>>(
    artifact: P,
    trusted_keys: &[PublicKey],
) -> Result<(), SignerError> {
    let content = std::fs::read(artifact.as_ref())?;
    let signature = Signature::from_sig_file(sig_path_for(artifact.as_ref()))?;
    for key in trusted_keys {
        if signature.verify(&content, key)? {
            return Ok(());
        }
    }
    Err(SignerError::Untrusted)
}

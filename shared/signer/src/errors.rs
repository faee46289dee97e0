use ed25519_dalek::SignatureError;
use hex::FromHexError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid hex string: {0}")]
    HexFormat(#[from] FromHexError),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] SignatureError),

    #[error("No trusted key verifies the signature")]
    Untrusted,
}

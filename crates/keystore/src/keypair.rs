//! Local peer identity
//!
//! Nodes on the network derive their peer id from the operator's secp256k1
//! chain key, so the same key material always yields the same identity.
//! Operators without one get a generated ed25519 identity persisted to disk.

use std::path::Path;

use libp2p::identity::{self, Keypair};
use thiserror::Error;
use tracing::info;

use crate::paths::expand_path;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read keyfile: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write keyfile: {0}")]
    WriteError(std::io::Error),

    #[error("Invalid key material: {0}")]
    InvalidFormat(String),

    #[error("Failed to create directory: {0}")]
    CreateDirError(std::io::Error),
}

/// Derive a secp256k1 keypair from hex-encoded private key material.
///
/// Accepts an optional `0x` prefix and surrounding whitespace.
pub fn keypair_from_private_key_hex(private_key: &str) -> Result<Keypair, KeystoreError> {
    let trimmed = private_key.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let mut bytes =
        hex::decode(digits).map_err(|e| KeystoreError::InvalidFormat(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(KeystoreError::InvalidFormat(format!(
            "Expected 32-byte secp256k1 key, got {} bytes",
            bytes.len()
        )));
    }

    let secret = identity::secp256k1::SecretKey::try_from_bytes(&mut bytes)
        .map_err(|e| KeystoreError::InvalidFormat(e.to_string()))?;
    Ok(identity::secp256k1::Keypair::from(secret).into())
}

/// Load an existing ed25519 keypair from disk, or generate and store a new one.
///
/// The file holds the raw 32-byte secret; `~` is expanded.
pub fn load_or_generate_libp2p_keypair(keyfile: &Path) -> Result<Keypair, KeystoreError> {
    let path = expand_path(keyfile);

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(KeystoreError::CreateDirError)?;
        }
    }

    if path.exists() {
        let bytes = std::fs::read(&path).map_err(KeystoreError::ReadError)?;
        let keypair = Keypair::ed25519_from_bytes(bytes)
            .map_err(|e| KeystoreError::InvalidFormat(e.to_string()))?;
        info!("Loaded node identity from {:?}", path);
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let ed25519_keypair = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|_| KeystoreError::InvalidFormat("Failed to extract ed25519 key".to_string()))?;

    std::fs::write(&path, ed25519_keypair.secret().as_ref()).map_err(KeystoreError::WriteError)?;

    info!("Generated node identity, saved to {:?}", path);
    Ok(keypair)
}

/// Resolve the node identity: private key material wins over the keyfile.
pub fn resolve_identity(
    private_key: Option<&str>,
    keyfile: &Path,
) -> Result<Keypair, KeystoreError> {
    match private_key {
        Some(hex_key) if !hex_key.trim().is_empty() => keypair_from_private_key_hex(hex_key),
        _ => load_or_generate_libp2p_keypair(keyfile),
    }
}

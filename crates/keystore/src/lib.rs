//! Tidewatch Keystore
//!
//! Derives the local peer identity, either from operator-supplied
//! secp256k1 key material or from an ed25519 keyfile on disk.

mod keypair;
mod paths;

pub use keypair::{
    keypair_from_private_key_hex, load_or_generate_libp2p_keypair, resolve_identity,
    KeystoreError,
};
pub use paths::{default_config_dir, default_keyfile, default_keystore_dir, expand_path};

//! Cryptographic layer for the data plane
//!
//! This module provides:
//! - MD5-based key/IV derivation from the shared secret
//! - AES-128-CTR stream wrappers for side-channel connections
//! - Splice helpers relaying between plaintext and cipher streams
//!
//! # Security
//!
//! This scheme is **confidentiality-only**. The key and IV are static per
//! shared secret, so every side-channel in a session reuses the same
//! keystream, and CTR mode carries no integrity: bit flips pass through
//! undetected and two streams can be cross-correlated. The format is
//! preserved bit-for-bit for interoperability with existing peers; a
//! protocol with no version negotiation leaves no room to upgrade it
//! without breaking them.

mod kdf;
mod stream;

pub use kdf::derive_key_iv;
pub use stream::{copy_decrypting, copy_encrypting, splice, CipherReader, CipherWriter};

/// Length of the AES-128 key in bytes
pub const KEY_LEN: usize = 16;

/// Length of the CTR IV in bytes
pub const IV_LEN: usize = 16;

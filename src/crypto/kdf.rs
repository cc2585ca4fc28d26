//! Key derivation from the shared secret

use super::{IV_LEN, KEY_LEN};

/// Derive the AES key and CTR IV from the shared secret.
///
/// The secret is split at `len / 2`: the key is the MD5 digest of the
/// first half, the IV the MD5 digest of the second half. Both peers
/// perform the identical split, so equal secrets yield equal keystreams.
pub fn derive_key_iv(secret: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let split = secret.len() / 2;
    let key = md5::compute(&secret[..split]).0;
    let iv = md5::compute(&secret[split..]).0;
    (key, iv)
}

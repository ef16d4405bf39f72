//! Key derivation functions
//!
//! Two KDFs are in play: the legacy SHA-1 counter construction used by TAP
//! and CREATE_FAST, and HKDF-SHA256 used by ntor.

use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// KDF-TOR: expand `seed` to `len` bytes as SHA1(seed | 0), SHA1(seed | 1),
/// ... concatenated and truncated.
pub fn kdf_tor(len: usize, seed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 20);
    let mut counter = 0u8;
    while out.len() < len {
        let mut sha = Sha1::new();
        sha.update(seed);
        sha.update([counter]);
        out.extend_from_slice(&sha.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// RFC 5869 HKDF-SHA256: extract with `salt` as the HMAC key over `secret`,
/// then expand under `info` to `len` bytes.
pub fn kdf_hkdf(len: usize, secret: &[u8], salt: &[u8], info: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; len];
    Hkdf::<Sha256>::new(Some(salt), secret)
        .expand(info, &mut out)
        .expect("HKDF output length within bounds");
    out
}

//! Tor hybrid public-key decryption
//!
//! The TAP onionskin is encrypted to the relay's onion key with Tor's
//! hybrid scheme: up to 128 bytes are plain RSA-OAEP(SHA-1); anything
//! longer packs a symmetric key and the first plaintext fragment into the
//! RSA block, with the remainder under AES-128-CTR (zero IV).

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;

use crate::error::{Result, TorError};

type Aes128Ctr = Ctr128BE<Aes128>;

/// RSA block size for the 1024-bit onion key.
const RSA_LEN: usize = 128;

/// Symmetric key length inside the RSA block.
const KEY_LEN: usize = 16;

pub fn hybrid_decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() <= RSA_LEN {
        return key
            .decrypt(Oaep::new::<Sha1>(), data)
            .map_err(|e| TorError::Crypto(format!("RSA decrypt failed: {e}")));
    }

    let head = key
        .decrypt(Oaep::new::<Sha1>(), &data[..RSA_LEN])
        .map_err(|e| TorError::Crypto(format!("RSA decrypt failed: {e}")))?;
    if head.len() < KEY_LEN + 70 {
        return Err(TorError::Crypto(
            "hybrid-encrypted block too short".into(),
        ));
    }

    let mut sym_key = [0u8; KEY_LEN];
    sym_key.copy_from_slice(&head[..KEY_LEN]);
    let mut cipher = Aes128Ctr::new((&sym_key).into(), (&[0u8; 16]).into());
    let mut rest = data[RSA_LEN..].to_vec();
    cipher.apply_keystream(&mut rest);

    let mut out = Vec::with_capacity(head.len() - KEY_LEN + rest.len());
    out.extend_from_slice(&head[KEY_LEN..]);
    out.extend_from_slice(&rest);
    Ok(out)
}

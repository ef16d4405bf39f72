//! ntor handshake, responder side
//!
//! The ntor (ntor1) key exchange used for CREATE2, from the relay's
//! perspective: the client sends ID | B | X, we answer Y | AUTH and derive
//! 72 bytes of circuit key material.
//!
//! Security: fingerprint and shared-secret checks are constant time, and
//! low-order client keys are rejected via the contributory-behavior check.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::kdf::kdf_hkdf;
use crate::error::{Result, TorError};

pub const PROTO_ID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Client handshake: ID (20) | B (32) | X (32).
pub const CLIENT_HANDSHAKE_LEN: usize = 84;

/// Server reply: Y (32) | AUTH (32).
pub const SERVER_REPLY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// The relay's long-term ntor keypair.
///
/// SECURITY: the secret scalar is zeroized on drop.
pub struct NtorKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl Drop for NtorKeys {
    fn drop(&mut self) {
        // StaticSecret wipes its own scalar via x25519-dalek.
        log::trace!("ntor keypair dropped, secret zeroized");
    }
}

impl NtorKeys {
    pub fn generate() -> NtorKeys {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        NtorKeys { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> NtorKeys {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        NtorKeys { secret, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }
}

/// Outcome of a successful responder handshake.
///
/// SECURITY: the derived key material is zeroized when the response is
/// dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NtorServerResponse {
    /// Y | AUTH, the CREATED2 handshake data.
    pub reply: [u8; SERVER_REPLY_LEN],
    /// Df (20) | Db (20) | Kf (16) | Kb (16).
    pub key_material: [u8; 72],
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Run the responder side over the client's ID | B | X handshake data.
pub fn server_handshake(
    data: &[u8],
    my_fingerprint: &[u8; 20],
    keys: &NtorKeys,
) -> Result<NtorServerResponse> {
    if data.len() < CLIENT_HANDSHAKE_LEN {
        return Err(TorError::Handshake("ntor handshake too short".into()));
    }

    let fingerprint = &data[0..20];
    if !bool::from(fingerprint.ct_eq(my_fingerprint)) {
        return Err(TorError::Handshake(
            "ntor handshake addressed to another relay".into(),
        ));
    }

    let mut x_bytes = [0u8; 32];
    x_bytes.copy_from_slice(&data[52..84]);
    let key_x = PublicKey::from(x_bytes);

    // Ephemeral y; clamping happens inside the scalar multiplication.
    let key_y = StaticSecret::random_from_rng(OsRng);
    let key_big_y = PublicKey::from(&key_y);

    let exp_xy = key_y.diffie_hellman(&key_x);
    let exp_xb = keys.secret.diffie_hellman(&key_x);
    if !exp_xy.was_contributory() || !exp_xb.was_contributory() {
        return Err(TorError::Handshake("degenerate ntor client key".into()));
    }

    // secret_input = EXP(X,y) | EXP(X,b) | ID | B | X | Y | PROTOID
    let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTO_ID.len());
    secret_input.extend_from_slice(exp_xy.as_bytes());
    secret_input.extend_from_slice(exp_xb.as_bytes());
    secret_input.extend_from_slice(fingerprint);
    secret_input.extend_from_slice(keys.public.as_bytes());
    secret_input.extend_from_slice(key_x.as_bytes());
    secret_input.extend_from_slice(key_big_y.as_bytes());
    secret_input.extend_from_slice(PROTO_ID);

    let mut kdf = kdf_hkdf(72, &secret_input, T_KEY, M_EXPAND);
    let mut verify = hmac(T_VERIFY, &secret_input);

    // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
    let mut auth_input = Vec::with_capacity(32 + 20 + 32 * 3 + PROTO_ID.len() + 6);
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(fingerprint);
    auth_input.extend_from_slice(keys.public.as_bytes());
    auth_input.extend_from_slice(key_big_y.as_bytes());
    auth_input.extend_from_slice(key_x.as_bytes());
    auth_input.extend_from_slice(PROTO_ID);
    auth_input.extend_from_slice(b"Server");

    let auth = hmac(T_MAC, &auth_input);

    let mut reply = [0u8; SERVER_REPLY_LEN];
    reply[..32].copy_from_slice(key_big_y.as_bytes());
    reply[32..].copy_from_slice(&auth);

    let mut key_material = [0u8; 72];
    key_material.copy_from_slice(&kdf);

    // The transcript and intermediate secrets are no longer needed.
    secret_input.zeroize();
    kdf.zeroize();
    verify.zeroize();

    Ok(NtorServerResponse {
        reply,
        key_material,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Client-side completion, for verifying the responder against.
    fn client_complete(
        client_secret: &StaticSecret,
        fingerprint: &[u8; 20],
        relay_public: &PublicKey,
        reply: &[u8; SERVER_REPLY_LEN],
    ) -> Option<[u8; 72]> {
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[..32]);
        let key_y = PublicKey::from(y_bytes);
        let client_public = PublicKey::from(client_secret);

        let exp_yx = client_secret.diffie_hellman(&key_y);
        let exp_bx = client_secret.diffie_hellman(relay_public);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(exp_yx.as_bytes());
        secret_input.extend_from_slice(exp_bx.as_bytes());
        secret_input.extend_from_slice(fingerprint);
        secret_input.extend_from_slice(relay_public.as_bytes());
        secret_input.extend_from_slice(client_public.as_bytes());
        secret_input.extend_from_slice(key_y.as_bytes());
        secret_input.extend_from_slice(PROTO_ID);

        let verify = hmac(T_VERIFY, &secret_input);
        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(fingerprint);
        auth_input.extend_from_slice(relay_public.as_bytes());
        auth_input.extend_from_slice(key_y.as_bytes());
        auth_input.extend_from_slice(client_public.as_bytes());
        auth_input.extend_from_slice(PROTO_ID);
        auth_input.extend_from_slice(b"Server");
        let auth = hmac(T_MAC, &auth_input);
        if auth != reply[32..] {
            return None;
        }

        let kdf = kdf_hkdf(72, &secret_input, T_KEY, M_EXPAND);
        let mut out = [0u8; 72];
        out.copy_from_slice(&kdf);
        Some(out)
    }

    #[test]
    fn responder_agrees_with_initiator() {
        let relay = NtorKeys::generate();
        let fingerprint = [0x42u8; 20];
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);

        let mut handshake = Vec::new();
        handshake.extend_from_slice(&fingerprint);
        handshake.extend_from_slice(relay.public().as_bytes());
        handshake.extend_from_slice(client_public.as_bytes());

        let response = server_handshake(&handshake, &fingerprint, &relay).unwrap();
        let client_keys =
            client_complete(&client_secret, &fingerprint, relay.public(), &response.reply)
                .expect("AUTH must verify");
        assert_eq!(client_keys, response.key_material);
    }

    #[test]
    fn wrong_fingerprint_is_rejected() {
        let relay = NtorKeys::generate();
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let mut handshake = vec![0u8; CLIENT_HANDSHAKE_LEN];
        handshake[0..20].copy_from_slice(&[1u8; 20]);
        handshake[20..52].copy_from_slice(relay.public().as_bytes());
        handshake[52..84].copy_from_slice(PublicKey::from(&client_secret).as_bytes());

        assert!(server_handshake(&handshake, &[2u8; 20], &relay).is_err());
    }

    #[test]
    fn short_handshake_is_rejected() {
        let relay = NtorKeys::generate();
        assert!(server_handshake(&[0u8; 50], &[0u8; 20], &relay).is_err());
    }

    #[test]
    fn low_order_client_key_is_rejected() {
        let relay = NtorKeys::generate();
        let fingerprint = [7u8; 20];
        let mut handshake = vec![0u8; CLIENT_HANDSHAKE_LEN];
        handshake[0..20].copy_from_slice(&fingerprint);
        handshake[20..52].copy_from_slice(relay.public().as_bytes());
        // X = 0, the identity point.
        assert!(server_handshake(&handshake, &fingerprint, &relay).is_err());
    }
}

//! Circuit state
//!
//! A [`Circuit`] is a hop that terminates locally: it owns the directional
//! crypto and flow-control state, its streams, and (once extended) a handle
//! to the next hop's connection. A [`RelayCircuit`] merely passes bytes
//! through and holds no crypto at all.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use aes::Aes128;
use ctr::cipher::KeyIvInit;
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use zeroize::Zeroize;

use crate::commands::{CircuitQueue, ExtendState};
use crate::protocol::{CellBuf, CircuitId, LinkVersion, Window};

pub(crate) type Aes128Ctr = Ctr128BE<Aes128>;

/// Initial circuit-level flow control window.
pub const CIRCUIT_WINDOW: i64 = 1000;

/// Cipher plus rolling digest for one direction of a circuit.
///
/// SECURITY: the raw key and digest seed are retained alongside the
/// running state and zeroized when the circuit is torn down.
pub struct DirectionState {
    pub cipher: Aes128Ctr,
    pub digest: Sha1,
    key: [u8; 16],
    seed: [u8; 20],
}

impl DirectionState {
    /// AES-128-CTR under `key` with a zero IV; digest seeded with `seed`.
    pub fn new(key: &[u8], seed: &[u8]) -> DirectionState {
        let cipher =
            Aes128Ctr::new_from_slices(key, &[0u8; 16]).expect("AES-128 key length");
        let mut digest = Sha1::new();
        digest.update(seed);
        let mut key_bytes = [0u8; 16];
        key_bytes.copy_from_slice(key);
        let mut seed_bytes = [0u8; 20];
        seed_bytes.copy_from_slice(seed);
        DirectionState {
            cipher,
            digest,
            key: key_bytes,
            seed: seed_bytes,
        }
    }
}

impl Drop for DirectionState {
    fn drop(&mut self) {
        self.key.zeroize();
        self.seed.zeroize();
    }
}

/// Actor-side handle to a running stream task.
///
/// Dropping the handle closes the write channel, which is the single
/// destruction signal the stream task watches for.
pub struct StreamHandle {
    pub write_tx: mpsc::Sender<CellBuf>,
    pub forward_window: Arc<Window>,
    pub backward_window: Arc<Window>,
    pub finished: Arc<AtomicBool>,
}

impl StreamHandle {
    /// Tear the stream down. Consuming the handle drops the last sender on
    /// the write channel; the stream task cleans up from there.
    pub fn destroy(self) {}
}

/// A locally terminated hop.
pub struct Circuit {
    pub id: CircuitId,
    pub forward: DirectionState,
    pub backward: DirectionState,
    /// Inbound RELAY_DATA quota; a circuit SENDME goes out when it sags
    /// below the threshold.
    pub forward_window: i64,
    /// Credit for backward RELAY_DATA, shared with the stream tasks.
    pub backward_window: Arc<Window>,
    /// Installed next hop, once an extension completed.
    pub next_hop: Option<(CircuitQueue, CircuitId)>,
    pub streams: HashMap<u16, StreamHandle>,
    /// In-flight extension, mutually exclusive with `next_hop`.
    pub extend_state: Option<Arc<ExtendState>>,
}

impl Circuit {
    pub fn new(
        id: CircuitId,
        f_seed: &[u8],
        b_seed: &[u8],
        f_key: &[u8],
        b_key: &[u8],
    ) -> Circuit {
        debug_assert!(!id.is_zero());
        Circuit {
            id,
            forward: DirectionState::new(f_key, f_seed),
            backward: DirectionState::new(b_key, b_seed),
            forward_window: CIRCUIT_WINDOW,
            backward_window: Arc::new(Window::new(CIRCUIT_WINDOW)),
            next_hop: None,
            streams: HashMap::new(),
            extend_state: None,
        }
    }

    /// Install keys derived as Df | Db | Kf | Kb with 20-byte digest seeds
    /// and 16-byte AES keys, the layout both KDFs emit.
    pub fn from_key_material(id: CircuitId, km: &[u8]) -> Circuit {
        debug_assert!(km.len() >= 72);
        Circuit::new(id, &km[0..20], &km[20..40], &km[40..56], &km[56..72])
    }
}

/// A hop passing through this relay without terminating: our ID on the
/// outbound link, the ID the previous hop knows, and the previous hop's
/// command queue.
pub struct RelayCircuit {
    pub id: CircuitId,
    pub their_id: CircuitId,
    pub previous_hop: CircuitQueue,
}

/// Draw a random circuit ID candidate with the initiator bit forced to
/// `is_outbound`. On v3 links only the upper 16 bits survive on the wire,
/// so the lower half is cleared. Collision checks against the live maps
/// are the caller's job.
pub fn random_circ_id(is_outbound: bool, version: LinkVersion) -> CircuitId {
    loop {
        let mut raw: u32 = rand::random();
        if is_outbound {
            raw |= 0x8000_0000;
        } else {
            raw &= 0x7fff_ffff;
        }
        if version < LinkVersion::V4 {
            raw &= 0xffff_0000;
        }
        if raw != 0 {
            return CircuitId::new(raw);
        }
    }
}

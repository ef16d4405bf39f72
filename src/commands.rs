//! Internal circuit commands
//!
//! Cross-actor messages: everything a connection actor can receive from
//! stream tasks, DNS workers, the node registry, and other connections.
//! Each actor owns its circuit maps outright, so this queue is the only
//! way anyone else influences them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::dns::DnsAddress;
use crate::error::{DestroyReason, Result, StreamEndReason, TorError};
use crate::protocol::{CellBuf, CellCommand, CircuitId};
use crate::tls::Fingerprint;

/// Handle to a connection actor's command queue.
pub type CircuitQueue = mpsc::Sender<CircuitCommand>;

/// Stream lifecycle notifications from a stream task to its actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Connected,
    Disconnected,
    Sendme,
}

/// A message on a connection actor's command queue.
pub enum CircuitCommand {
    /// Relay payload handed over from a neighboring connection: backward
    /// traffic for a terminating circuit (`for_relay` false) or forward
    /// traffic for a relay-through circuit (`for_relay` true).
    RelayData {
        id: CircuitId,
        data: CellBuf,
        for_relay: bool,
        /// RELAY or RELAY_EARLY, preserved across the hop.
        command: CellCommand,
    },
    /// A neighbor's circuit went away.
    Destroyed {
        id: CircuitId,
        reason: DestroyReason,
        for_relay: bool,
    },
    /// The outbound leg of an extension produced CREATED(2) handshake data.
    Created {
        id: CircuitId,
        handshake: Vec<u8>,
        new_handshake: bool,
    },
    /// Ask this (outbound) connection to create a circuit on its link.
    Request(Box<CircuitRequest>),
    /// Stream task state change.
    Stream {
        id: CircuitId,
        stream: u16,
        event: StreamEvent,
        reason: StreamEndReason,
        remote_addr: Option<Vec<u8>>,
    },
    /// Bytes read from a stream's socket, headed backward.
    StreamBytes {
        id: CircuitId,
        stream: u16,
        data: CellBuf,
    },
    /// Asynchronous DNS answer for a RELAY_RESOLVE.
    Resolved {
        id: CircuitId,
        stream: u16,
        answers: Vec<DnsAddress>,
    },
}

impl CircuitCommand {
    pub fn circ_id(&self) -> CircuitId {
        match self {
            CircuitCommand::RelayData { id, .. }
            | CircuitCommand::Destroyed { id, .. }
            | CircuitCommand::Created { id, .. }
            | CircuitCommand::Stream { id, .. }
            | CircuitCommand::StreamBytes { id, .. }
            | CircuitCommand::Resolved { id, .. } => *id,
            CircuitCommand::Request(_) => CircuitId::ZERO,
        }
    }

    /// Whether this command addresses the relay-circuit map rather than
    /// the terminating-circuit map.
    pub fn for_relay(&self) -> bool {
        match self {
            CircuitCommand::RelayData { for_relay, .. }
            | CircuitCommand::Destroyed { for_relay, .. } => *for_relay,
            _ => false,
        }
    }
}

/// Where an extension should connect to: a fingerprint to find an existing
/// authenticated connection, and addresses to dial otherwise.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHint {
    fingerprint: Option<Fingerprint>,
    addresses: Vec<SocketAddr>,
}

impl ConnectionHint {
    pub fn add_fingerprint(&mut self, bytes: &[u8]) -> Result<()> {
        if self.fingerprint.is_some() {
            return Err(TorError::Protocol("already have a fingerprint".into()));
        }
        self.fingerprint = Some(Fingerprint::from_slice(bytes)?);
        Ok(())
    }

    /// Accept a 6-byte IPv4+port or 18-byte IPv6+port link specifier.
    pub fn add_address(&mut self, bytes: &[u8]) -> Result<()> {
        let addr = match bytes.len() {
            6 => {
                let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                let port = u16::from_be_bytes([bytes[4], bytes[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            }
            18 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[..16]);
                let port = u16::from_be_bytes([bytes[16], bytes[17]]);
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            _ => {
                return Err(TorError::Protocol(
                    "not an address we recognize".into(),
                ))
            }
        };
        self.addresses.push(addr);
        Ok(())
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }
}

/// A pending outbound extension.
pub struct CircuitRequest {
    /// The requesting circuit on the origin connection.
    pub local_id: CircuitId,
    pub hint: ConnectionHint,
    /// Where CircuitCreated / Destroyed answers go: the origin actor.
    pub success_queue: CircuitQueue,
    pub handshake_type: u16,
    pub handshake_data: Vec<u8>,
    /// CREATE2 framing rather than legacy CREATE.
    pub new_handshake: bool,
    pub state: std::sync::Arc<ExtendState>,
}

struct ExtendInner {
    aborted: bool,
    next_hop: Option<(CircuitQueue, CircuitId)>,
}

/// Coordination record shared between the origin circuit and whichever
/// actor ends up owning the outbound leg. Both sides race on it under the
/// mutex: exactly one of completion and abort wins.
pub struct ExtendState {
    inner: Mutex<ExtendInner>,
}

impl ExtendState {
    pub fn new() -> std::sync::Arc<ExtendState> {
        std::sync::Arc::new(ExtendState {
            inner: Mutex::new(ExtendInner {
                aborted: false,
                next_hop: None,
            }),
        })
    }

    /// Dialer side: record the outbound circuit unless the origin already
    /// gave up. Returns `false` when aborted.
    pub fn install_next_hop(&self, queue: CircuitQueue, id: CircuitId) -> bool {
        let mut inner = self.inner.lock().expect("extend state poisoned");
        if inner.aborted {
            return false;
        }
        inner.next_hop = Some((queue, id));
        true
    }

    /// Origin side, on success: claim the installed next hop.
    pub fn take_next_hop(&self) -> Option<(CircuitQueue, CircuitId)> {
        self.inner
            .lock()
            .expect("extend state poisoned")
            .next_hop
            .take()
    }

    /// Origin side, on teardown: mark aborted and inherit whatever the
    /// dialer already installed so the cancellation reaches it.
    pub fn abort(&self) -> Option<(CircuitQueue, CircuitId)> {
        let mut inner = self.inner.lock().expect("extend state poisoned");
        inner.aborted = true;
        inner.next_hop.take()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().expect("extend state poisoned").aborted
    }
}

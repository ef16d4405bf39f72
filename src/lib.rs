//! # tor-relay
//!
//! The onion relay core of a Tor-compatible node: per-connection link
//! handshakes, per-circuit crypto pipelines, relay-cell dispatch, and
//! windowed stream proxying.
//!
//! ## Architecture
//!
//! ```text
//! OrContext (keys, registry, listener)
//!   ↓
//! OnionConnection actor (one per TLS link)
//!   ├─ reader task  ── cells in
//!   ├─ writer task  ── batched cells out
//!   └─ circuits / relay-circuits
//!        └─ stream tasks (TCP proxying)
//! ```
//!
//! The TLS record layer, configuration parsing, and key generation live
//! outside this crate; see [`tls::TlsTransport`] for the seam.

// Modules
pub mod protocol;
mod circuit;
mod commands;
mod config;
mod connection;
mod create;
mod dns;
mod error;
mod exitpolicy;
mod extend;
mod handshake;
mod or;
mod relay;
mod stream;
mod tls;

pub use commands::{
    CircuitCommand, CircuitQueue, CircuitRequest, ConnectionHint, ExtendState, StreamEvent,
};
pub use config::Config;
pub use connection::OnionConnection;
pub use dns::DnsAddress;
pub use error::{DestroyReason, Result, StreamEndReason, TorError};
pub use exitpolicy::{ExitPolicy, ExitRule};
pub use or::{OrContext, RelayKeys};
pub use protocol::ntor::NtorKeys;
pub use tls::{Fingerprint, LinkStream, TlsLink, TlsSessionInfo, TlsTransport, TorTls};

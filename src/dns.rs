//! DNS resolution for exit streams
//!
//! Lookups run in their own short-lived tasks so the connection actor
//! never waits on a resolver. Answers use the RELAY_RESOLVED record types:
//! 4 and 6 for addresses, 0xF0/0xF1 for transient and nontransient errors.

use std::net::IpAddr;

use crate::commands::{CircuitCommand, CircuitQueue};
use crate::protocol::CircuitId;

/// Answer type for a transient resolution error.
pub const DNS_ERR_TRANSIENT: u8 = 0xF0;
/// Answer type for a permanent resolution error.
pub const DNS_ERR_NONTRANSIENT: u8 = 0xF1;

/// TTL reported for address literals, which never expire on our account.
const LITERAL_TTL: u32 = 86_400;

/// TTL reported for resolver answers. The system resolver does not expose
/// the record TTL, so a conservative constant stands in.
const RESOLVED_TTL: u32 = 300;

/// One RELAY_RESOLVED answer record.
#[derive(Debug, Clone)]
pub struct DnsAddress {
    /// 4, 6, or one of the error types.
    pub kind: u8,
    pub ttl: u32,
    pub value: Vec<u8>,
}

impl DnsAddress {
    pub fn is_address(&self) -> bool {
        self.kind == 4 || self.kind == 6
    }

    fn from_ip(ip: IpAddr, ttl: u32) -> DnsAddress {
        match ip {
            IpAddr::V4(v4) => DnsAddress {
                kind: 4,
                ttl,
                value: v4.octets().to_vec(),
            },
            IpAddr::V6(v6) => DnsAddress {
                kind: 6,
                ttl,
                value: v6.octets().to_vec(),
            },
        }
    }

    /// Render as an [`IpAddr`], when this is an address record.
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self.kind {
            4 => {
                let octets: [u8; 4] = self.value.as_slice().try_into().ok()?;
                Some(IpAddr::from(octets))
            }
            6 => {
                let octets: [u8; 16] = self.value.as_slice().try_into().ok()?;
                Some(IpAddr::from(octets))
            }
            _ => None,
        }
    }
}

/// Resolve a hostname or address literal. Never fails; errors come back as
/// error-typed answer records.
pub async fn resolve(host: &str) -> Vec<DnsAddress> {
    // Address literals skip the resolver entirely. Bracketed IPv6 arrives
    // from the stream-target grammar.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return vec![DnsAddress::from_ip(ip, LITERAL_TTL)];
    }

    match tokio::net::lookup_host((bare, 0u16)).await {
        Ok(addrs) => {
            let results: Vec<DnsAddress> = addrs
                .map(|sa| DnsAddress::from_ip(sa.ip(), RESOLVED_TTL))
                .collect();
            if results.is_empty() {
                vec![DnsAddress {
                    kind: DNS_ERR_NONTRANSIENT,
                    ttl: 0,
                    value: Vec::new(),
                }]
            } else {
                results
            }
        }
        Err(err) => {
            log::debug!("resolution of {host:?} failed: {err}");
            vec![DnsAddress {
                kind: DNS_ERR_TRANSIENT,
                ttl: 0,
                value: Vec::new(),
            }]
        }
    }
}

/// Resolve in a detached task and post the answer to the actor's queue.
pub fn resolve_async(host: String, circuit: CircuitId, stream: u16, queue: CircuitQueue) {
    tokio::spawn(async move {
        let answers = resolve(&host).await;
        let _ = queue
            .send(CircuitCommand::Resolved {
                id: circuit,
                stream,
                answers,
            })
            .await;
    });
}

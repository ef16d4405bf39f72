//! Relay configuration
//!
//! Only the knobs the relay core actually reads. Parsing a configuration
//! file into this structure is the embedder's concern.

use std::net::IpAddr;

use crate::exitpolicy::ExitPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the OR listener accepts on.
    pub or_port: u16,
    /// Directory port, or 0 when this relay serves no directory. Gates
    /// RELAY_BEGIN_DIR.
    pub dir_port: u16,
    /// Advertised address, written into NETINFO cells.
    pub address: Option<IpAddr>,
    /// Policy applied to exiting streams.
    pub exit_policy: ExitPolicy,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            or_port: 9001,
            dir_port: 0,
            address: None,
            exit_policy: ExitPolicy::default(),
        }
    }
}

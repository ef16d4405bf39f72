//! Exit policies
//!
//! An ordered list of accept/reject rules matched first-hit against the
//! target address and port of an outgoing stream. The zero value of
//! [`ExitPolicy`] rejects everything.

use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, TorError};

/// One policy line.
#[derive(Debug, Clone)]
pub struct ExitRule {
    /// Exact address bytes (4 or 16), or `None` for a wildcard.
    pub address: Option<Vec<u8>>,
    /// Exact port, or 0 for a wildcard.
    pub port: u16,
    /// `true` accepts, `false` rejects.
    pub action: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExitPolicy {
    pub rules: Vec<ExitRule>,
    pub default_action: bool,
}

fn rule_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(accept6?|reject6?)\s+(\*|\[?[0-9a-fA-F:.]+\]?):(\*|[1-9][0-9]{0,4})$")
            .expect("exit rule regex compiles")
    })
}

impl ExitPolicy {
    /// A policy that accepts everything not otherwise rejected.
    pub fn accept_all() -> ExitPolicy {
        ExitPolicy {
            rules: Vec::new(),
            default_action: true,
        }
    }

    /// Parse one `accept`/`reject` line, e.g. `accept *:80` or
    /// `reject6 [::1]:25`.
    pub fn push_rule(&mut self, line: &str) -> Result<()> {
        let caps = rule_regex()
            .captures(line.trim())
            .ok_or_else(|| TorError::Protocol(format!("could not parse exit rule {line:?}")))?;

        let action = caps[1].starts_with("accept");
        let port = if &caps[3] == "*" {
            0
        } else {
            let port: u32 = caps[3].parse().expect("regex admits digits only");
            u16::try_from(port)
                .map_err(|_| TorError::Protocol(format!("port out of range in {line:?}")))?
        };
        let address = if &caps[2] == "*" {
            None
        } else {
            let text = caps[2].trim_start_matches('[').trim_end_matches(']');
            let ip: IpAddr = text
                .parse()
                .map_err(|_| TorError::Protocol(format!("bad address in exit rule {line:?}")))?;
            Some(match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            })
        };

        self.rules.push(ExitRule {
            address,
            port,
            action,
        });
        Ok(())
    }

    /// First-match policy decision for raw address bytes (4 or 16) and a
    /// port; falls through to the default action.
    pub fn allows_connect(&self, addr: &[u8], port: u16) -> bool {
        for rule in &self.rules {
            if rule.port != port && rule.port != 0 {
                continue;
            }
            match &rule.address {
                None => return rule.action,
                Some(bytes) if bytes[..] == addr[..] => return rule.action,
                Some(_) => {}
            }
        }
        self.default_action
    }
}

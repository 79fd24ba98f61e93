//! # Auth Gate
//!
//! Decides whether a caller may request a certificate for a hostname.
//!
//! The TLS terminator in front of the CA verifies the client certificate
//! against the configured roots and hands over the verified chains. The gate
//! only inspects those chains; both checks fail closed.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

/// The client certificate material negotiated by the TLS terminator.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientTls {
    /// Verified chains, each ordered leaf first, certificates DER encoded.
    pub verified_chains: Vec<Vec<Vec<u8>>>,
}

impl ClientTls {
    /// Creates the state for a client that presented a single verified chain.
    pub fn with_chain(chain: Vec<Vec<u8>>) -> Self {
        ClientTls {
            verified_chains: vec![chain],
        }
    }

    /// The leaf certificate of the first verified chain. An empty entry is
    /// not a chain and is skipped.
    fn leaf(&self) -> Option<&[u8]> {
        self.verified_chains
            .iter()
            .find_map(|chain| chain.first())
            .map(Vec::as_slice)
    }
}

/// Returns true if the caller presented a certificate that the terminator
/// verified.
pub fn is_authenticated(tls: &ClientTls) -> bool {
    tls.leaf().is_some()
}

/// Returns true if the leaf of the first verified chain names `hostname` in
/// its subject alternative names.
///
/// DNS names are compared case-insensitively and may use a wildcard as their
/// whole left-most label. IP addresses only match IP address entries.
pub fn matches_hostname(hostname: &str, tls: &ClientTls) -> bool {
    let Some(leaf) = tls.leaf() else {
        return false;
    };
    let cert = match X509Certificate::from_der(leaf) {
        Ok((_, cert)) => cert,
        Err(e) => {
            warn!("could not parse client certificate: {}", e);
            return false;
        }
    };
    let san = match cert.subject_alternative_name() {
        Ok(Some(san)) => san,
        Ok(None) => {
            debug!("client certificate {} has no SAN", cert.subject());
            return false;
        }
        Err(e) => {
            warn!("malformed SAN in client certificate: {}", e);
            return false;
        }
    };
    let names = &san.value.general_names;

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return names.iter().any(|name| match name {
            GeneralName::IPAddress(bytes) => ip_address_matches(ip, bytes),
            _ => false,
        });
    }

    let Some(hostname) = normalize_hostname(hostname) else {
        debug!("rejecting malformed hostname {:?}", hostname);
        return false;
    };
    names.iter().any(|name| match name {
        GeneralName::DNSName(pattern) => dns_name_matches(pattern, &hostname),
        _ => false,
    })
}

fn ip_address_matches(ip: IpAddr, bytes: &[u8]) -> bool {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            ip == IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            ip == IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => false,
    }
}

/// Lowercases the hostname and strips a trailing dot. Returns `None` for
/// anything that is not a plain DNS name.
fn normalize_hostname(hostname: &str) -> Option<String> {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname.is_empty() || hostname.len() > 253 {
        return None;
    }
    let valid = hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });
    valid.then(|| hostname.to_ascii_lowercase())
}

fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.strip_suffix('.').unwrap_or(pattern);
    let pattern = pattern.to_ascii_lowercase();
    if pattern == hostname {
        return true;
    }
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    // a wildcard never matches across labels or a bare suffix
    match hostname.split_once('.') {
        Some((first, rest)) => !first.is_empty() && !suffix.is_empty() && rest == suffix,
        None => false,
    }
}

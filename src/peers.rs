//! Live-peer registry and the service-name grammar.
//!
//! The registry is a passive data structure: the daemon feeds it discovery
//! events, the replication controller works from snapshots of it. It never
//! makes network calls. Peers are keyed by service name and classified as
//! contributor or bridge, recovered from the advertised name without any
//! extra protocol exchange.

use std::{collections::HashMap, net::Ipv4Addr};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The kind of role a peer plays in the fleet.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    /// Publishes its own public documents and subscribes to others.
    Contributor,
    /// Aggregates public documents from contributors into its cache.
    Bridge,
}

/// A known peer, as advertised on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Advertised service instance name, the registry key.
    #[serde(rename = "name")]
    pub service_name: String,
    /// Host name of the peer.
    pub host: String,
    /// IPv4 address, when the advertisement carried one.
    #[serde(rename = "ip")]
    pub ipv4: Option<Ipv4Addr>,
    /// DocDB port of the peer.
    pub port: u16,
    /// Tenant tag the peer belongs to.
    pub prefix: String,
    /// Role of the peer.
    #[serde(rename = "type")]
    pub peer_type: PeerType,
}

impl PeerInfo {
    /// The server URL of the peer's DocDB, preferring the IPv4 address.
    pub fn server_url(&self) -> String {
        match self.ipv4 {
            Some(ip) => format!("http://{}:{}/", ip, self.port),
            None => format!("http://{}:{}/", self.host, self.port),
        }
    }
}

/// Render the advertised service instance name.
///
/// The grammar is `ERS on <host>(prefix=<p>,type=<t>)`; the trailing suffix
/// keeps names unique when hostnames clash and is ignored by parsers.
pub fn format_service_name(host: &str, prefix: &str, peer_type: PeerType, suffix: &str) -> String {
    format!("ERS on {host}(prefix={prefix},type={peer_type}) {suffix}")
}

/// A short random tag for [`format_service_name`].
pub fn random_suffix() -> String {
    format!("{:04x}", rand::thread_rng().gen::<u16>())
}

/// Recover `(prefix, peer type)` from an advertised service name.
///
/// Unknown parameters are ignored; missing ones fall back to the defaults
/// (`ers`, contributor) so older advertisements stay joinable.
pub fn parse_service_name(name: &str) -> (String, PeerType) {
    let mut prefix = "ers".to_string();
    let mut peer_type = PeerType::Contributor;
    if let Some(start) = name.find('(') {
        if let Some(end) = name[start..].find(')') {
            for param in name[start + 1..start + end].split(',') {
                match param.split_once('=') {
                    Some(("prefix", value)) => prefix = value.trim().to_string(),
                    Some(("type", value)) => {
                        if let Ok(t) = value.trim().parse() {
                            peer_type = t;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    (prefix, peer_type)
}

/// Tracks the currently visible peers, one map per peer class.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    contributors: HashMap<String, PeerInfo>,
    bridges: HashMap<String, PeerInfo>,
}

/// A point-in-time copy of the registry, peers sorted by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// The contributor peers.
    pub contributors: Vec<PeerInfo>,
    /// The bridge peers.
    pub bridges: Vec<PeerInfo>,
}

impl PeerSnapshot {
    /// All peers of the snapshot, contributors first.
    pub fn all(&self) -> impl Iterator<Item = &PeerInfo> {
        self.contributors.iter().chain(self.bridges.iter())
    }
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a joined peer. Peers without an IPv4 address are ignored.
    /// Returns whether the registry changed.
    pub fn on_join(&mut self, peer: PeerInfo) -> bool {
        if peer.ipv4.is_none() {
            debug!(peer = %peer.service_name, "ignoring peer without IPv4 address");
            return false;
        }
        let map = match peer.peer_type {
            PeerType::Contributor => &mut self.contributors,
            PeerType::Bridge => &mut self.bridges,
        };
        map.insert(peer.service_name.clone(), peer) // re-joins are idempotent
            .is_none()
    }

    /// Record a left peer by service name. Returns whether it was known.
    pub fn on_leave(&mut self, service_name: &str) -> bool {
        self.contributors.remove(service_name).is_some()
            || self.bridges.remove(service_name).is_some()
    }

    /// A deep copy of the current peer set.
    pub fn snapshot(&self) -> PeerSnapshot {
        let mut contributors: Vec<PeerInfo> = self.contributors.values().cloned().collect();
        let mut bridges: Vec<PeerInfo> = self.bridges.values().cloned().collect();
        contributors.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        bridges.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        PeerSnapshot {
            contributors,
            bridges,
        }
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.contributors.is_empty() && self.bridges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, ip: [u8; 4], peer_type: PeerType) -> PeerInfo {
        PeerInfo {
            service_name: name.to_string(),
            host: name.to_string(),
            ipv4: Some(ip.into()),
            port: 5984,
            prefix: "ers".to_string(),
            peer_type,
        }
    }

    #[test]
    fn service_name_roundtrip() {
        let name = format_service_name("alice", "lab", PeerType::Bridge, "a1b2");
        assert_eq!(name, "ERS on alice(prefix=lab,type=bridge) a1b2");
        assert_eq!(parse_service_name(&name), ("lab".to_string(), PeerType::Bridge));
    }

    #[test]
    fn parse_falls_back_on_malformed_names() {
        assert_eq!(
            parse_service_name("ERS on alice"),
            ("ers".to_string(), PeerType::Contributor)
        );
        assert_eq!(
            parse_service_name("ERS on alice(type=bogus,prefix=lab)"),
            ("lab".to_string(), PeerType::Contributor)
        );
    }

    #[test]
    fn join_leave_and_snapshot() {
        let mut registry = PeerRegistry::new();
        assert!(registry.on_join(peer("b", [10, 0, 0, 2], PeerType::Bridge)));
        assert!(registry.on_join(peer("a", [10, 0, 0, 1], PeerType::Contributor)));
        // re-join of a known peer changes nothing
        assert!(!registry.on_join(peer("a", [10, 0, 0, 1], PeerType::Contributor)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.contributors.len(), 1);
        assert_eq!(snapshot.bridges.len(), 1);

        assert!(registry.on_leave("b"));
        assert!(!registry.on_leave("b"));
        assert!(registry.snapshot().bridges.is_empty());
    }

    #[test]
    fn non_ipv4_peers_are_ignored() {
        let mut registry = PeerRegistry::new();
        let mut p = peer("v6only", [0, 0, 0, 0], PeerType::Contributor);
        p.ipv4 = None;
        assert!(!registry.on_join(p));
        assert!(registry.is_empty());
    }
}

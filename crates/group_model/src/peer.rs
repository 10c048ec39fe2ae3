//! Peer records as the consensus engine reads them from disk.

use serde::{Deserialize, Serialize};

/// File name of the genesis peer list inside a configuration directory.
pub const GENESIS_PEERS_FILE: &str = "peers.genesis.json";

/// File name of the current peer list inside a configuration directory.
pub const CURRENT_PEERS_FILE: &str = "peers.json";

/// One peer in a genesis or current peer list. Field names match the
/// engine's on-disk peers documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "PubKeyHex")]
    pub pub_key_hex: String,
    #[serde(rename = "NetAddr")]
    pub net_addr: String,
    #[serde(rename = "Moniker")]
    pub moniker: String,
}

impl Peer {
    pub fn new(pub_key_hex: &str, net_addr: &str, moniker: &str) -> Self {
        Self {
            pub_key_hex: pub_key_hex.to_string(),
            net_addr: net_addr.to_string(),
            moniker: moniker.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_engine_field_names() {
        let peer = Peer::new("ab01", "10.0.0.1:1337", "alice");
        let json = serde_json::to_string(&peer).unwrap();
        assert!(json.contains("\"PubKeyHex\":\"ab01\""));
        assert!(json.contains("\"NetAddr\":\"10.0.0.1:1337\""));
        assert!(json.contains("\"Moniker\":\"alice\""));
    }

    #[test]
    fn round_trips_through_json() {
        let peer = Peer::new("cd02", "192.168.1.5:1337", "bob");
        let json = serde_json::to_string(&peer).unwrap();
        let back: Peer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }
}

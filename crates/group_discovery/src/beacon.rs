//! UDP broadcast beacon transport.
//!
//! Advertising nodes broadcast a magic-prefixed JSON beacon on an
//! interval; listeners fold beacons into their group book and treat a
//! missed refresh window as loss. Discovery and advertising run on
//! independent sockets so a joined node keeps announcing after its
//! discovery side shuts down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use group_model::{GroupBook, Peer, ProviderId, ResolvedGroup, ResolvedService, ServiceIdentity};

use crate::transport::{
    service_from_advertisement, Advertisement, Advertiser, AdvertiserHandle, DiscoveryTransport,
    LocalGroup, TransportContext, PROP_APP_ID, PROP_CURRENT_PEERS, PROP_GROUP_NAME,
    PROP_GROUP_UID, PROP_INITIAL_PEERS,
};
use crate::{DiscoveryError, Result};

pub const DEFAULT_BEACON_PORT: u16 = 42113;
pub const MAX_PACKET_SIZE: usize = 1400;
pub const MAGIC_BYTES: &[u8; 4] = b"GMSH";
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    pub port: u16,
    pub bind_addr: String,
    pub broadcast_addr: String,
    pub announce_interval: Duration,
    /// A beacon not refreshed within this window is treated as lost.
    pub ttl: Duration,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BEACON_PORT,
            bind_addr: "0.0.0.0".to_string(),
            broadcast_addr: "255.255.255.255".to_string(),
            announce_interval: Duration::from_secs(5),
            ttl: Duration::from_secs(15),
        }
    }
}

/// One broadcast beacon, magic-prefixed JSON on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconPacket {
    pub version: u8,
    pub node_id: String,
    pub app_id: String,
    pub group_uid: String,
    pub group_name: String,
    pub listen_addr: String,
    pub initial_peers: Vec<Peer>,
    pub current_peers: Vec<Peer>,
}

impl BeaconPacket {
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        let json = serde_json::to_vec(self).ok()?;
        let mut bytes = Vec::with_capacity(MAGIC_BYTES.len() + json.len());
        bytes.extend_from_slice(MAGIC_BYTES);
        bytes.extend(json);
        Some(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MAGIC_BYTES.len() {
            return None;
        }
        if &bytes[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return None;
        }
        let packet: BeaconPacket = serde_json::from_slice(&bytes[MAGIC_BYTES.len()..]).ok()?;
        if packet.version != PROTOCOL_VERSION {
            return None;
        }
        Some(packet)
    }

    fn to_advertisement(&self, raw: &str, source: &str) -> Advertisement {
        let mut advert = Advertisement::new(raw)
            .with_address(&self.listen_addr)
            .with_property(PROP_APP_ID, &self.app_id)
            .with_property(PROP_GROUP_NAME, &self.group_name)
            .with_property(PROP_GROUP_UID, &self.group_uid)
            .with_property("source", source);
        if let Ok(json) = serde_json::to_string(&self.initial_peers) {
            advert = advert.with_property(PROP_INITIAL_PEERS, &json);
        }
        if let Ok(json) = serde_json::to_string(&self.current_peers) {
            advert = advert.with_property(PROP_CURRENT_PEERS, &json);
        }
        advert
    }
}

#[derive(Clone)]
pub struct BeaconTransport {
    shared: Arc<BeaconShared>,
}

struct BeaconShared {
    node_id: String,
    listen_addr: String,
    config: BeaconConfig,
    provider: Mutex<Option<ProviderId>>,
    task: Mutex<Option<JoinHandle<()>>>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
    local_group: Mutex<Option<LocalGroup>>,
    outgoing: Mutex<Option<BeaconPacket>>,
    bound_port: Mutex<Option<u16>>,
}

impl BeaconTransport {
    /// `listen_addr` is the consensus listen address announced in this
    /// node's beacons.
    pub fn new(node_id: &str, listen_addr: &str, config: BeaconConfig) -> Self {
        Self {
            shared: Arc::new(BeaconShared {
                node_id: node_id.to_string(),
                listen_addr: listen_addr.to_string(),
                config,
                provider: Mutex::new(None),
                task: Mutex::new(None),
                announce_task: Mutex::new(None),
                local_group: Mutex::new(None),
                outgoing: Mutex::new(None),
                bound_port: Mutex::new(None),
            }),
        }
    }

    /// The port the discovery socket actually bound, once started.
    pub fn bound_port(&self) -> Option<u16> {
        *self.shared.bound_port.lock().unwrap()
    }

    async fn advertise_inner(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        let Some(local) = self.shared.local_group.lock().unwrap().clone() else {
            return Ok(false);
        };

        let packet = BeaconPacket {
            version: PROTOCOL_VERSION,
            node_id: self.shared.node_id.clone(),
            app_id: local.app_id,
            group_uid: local.group_uid,
            group_name: local.group_name,
            listen_addr: self.shared.listen_addr.clone(),
            initial_peers: initial,
            current_peers: current,
        };
        *self.shared.outgoing.lock().unwrap() = Some(packet);
        self.ensure_announcer().await?;
        Ok(true)
    }

    async fn ensure_announcer(&self) -> Result<()> {
        if self.shared.announce_task.lock().unwrap().is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind((self.shared.config.bind_addr.as_str(), 0))
            .await
            .map_err(|e| DiscoveryError::Advertise(format!("bind announce socket: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::Advertise(format!("enable broadcast: {e}")))?;

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.announce_interval);
            loop {
                ticker.tick().await;
                let packet = shared.outgoing.lock().unwrap().clone();
                let Some(packet) = packet else { continue };
                let Some(bytes) = packet.to_bytes() else { continue };
                let target = (shared.config.broadcast_addr.as_str(), shared.config.port);
                if let Err(e) = socket.send_to(&bytes, target).await {
                    warn!("beacon: broadcast failed: {e}");
                }
            }
        });
        *self.shared.announce_task.lock().unwrap() = Some(handle);
        info!(node_id = %self.shared.node_id, "beacon: announcing started");
        Ok(())
    }

    async fn stop_advertising_inner(&self) {
        self.shared.outgoing.lock().unwrap().take();
        if let Some(task) = self.shared.announce_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn run_listener(shared: Arc<BeaconShared>, ctx: TransportContext, socket: UdpSocket) {
    let provider_id = ctx.provider_id();
    let mut book = GroupBook::new(provider_id);
    ctx.publish(book.snapshot());

    let mut last_seen: HashMap<String, Instant> = HashMap::new();
    let mut sweep = tokio::time::interval(shared.config.announce_interval);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("beacon: receive failed: {e}");
                        break;
                    }
                };
                let Some(packet) = BeaconPacket::from_bytes(&buf[..len]) else {
                    continue;
                };
                if packet.node_id == shared.node_id {
                    continue;
                }

                let raw = format!("{}/{}", packet.node_id, packet.group_uid);
                last_seen.insert(raw.clone(), Instant::now());

                let advert = packet.to_advertisement(&raw, &from.to_string());
                match service_from_advertisement(provider_id, &advert) {
                    Ok(service) => match book.insert(service) {
                        Ok(true) => {
                            info!(raw = %raw, "beacon: group advertisement resolved");
                            ctx.publish(book.snapshot());
                        }
                        Ok(false) => {}
                        Err(e) => warn!("beacon: conflicting advertisement dropped: {e}"),
                    },
                    Err(e) => debug!("beacon: {e}"),
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<String> = last_seen
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) > shared.config.ttl)
                    .map(|(raw, _)| raw.clone())
                    .collect();
                let mut changed = false;
                for raw in expired {
                    last_seen.remove(&raw);
                    let identity = ServiceIdentity::new(provider_id, &raw);
                    if let Ok(true) = book.remove(&identity) {
                        debug!(raw = %raw, "beacon: group advertisement expired");
                        changed = true;
                    }
                }
                if changed {
                    ctx.publish(book.snapshot());
                }
            }
        }
    }
}

#[async_trait]
impl Advertiser for BeaconTransport {
    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        self.advertise_inner(initial, current).await
    }

    async fn stop_advertising(&self) {
        self.stop_advertising_inner().await;
    }
}

#[async_trait]
impl DiscoveryTransport for BeaconTransport {
    async fn start_discovery(&self, ctx: TransportContext) -> Result<()> {
        if self.shared.task.lock().unwrap().is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind((self.shared.config.bind_addr.as_str(), self.shared.config.port))
            .await
            .map_err(|e| DiscoveryError::StartFailed(format!("bind beacon socket: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::StartFailed(format!("enable broadcast: {e}")))?;
        if let Ok(addr) = socket.local_addr() {
            *self.shared.bound_port.lock().unwrap() = Some(addr.port());
        }
        *self.shared.provider.lock().unwrap() = Some(ctx.provider_id());

        let shared = self.shared.clone();
        let handle = tokio::spawn(run_listener(shared, ctx, socket));
        *self.shared.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn stop_discovery(&self) {
        if let Some(task) = self.shared.task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn resolve(&self, advert: Advertisement) -> Result<ResolvedService> {
        let provider_id = self
            .shared
            .provider
            .lock()
            .unwrap()
            .ok_or_else(|| DiscoveryError::resolution(&advert.raw, "transport not started"))?;
        // Beacons carry complete data; there is no secondary strategy.
        service_from_advertisement(provider_id, &advert)
    }

    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        self.advertise_inner(initial, current).await
    }

    async fn stop_advertising(&self) {
        self.stop_advertising_inner().await;
    }

    async fn before_join(&self, group: &ResolvedGroup) -> Result<()> {
        let local = LocalGroup::from_group(group)
            .ok_or_else(|| DiscoveryError::join("selected group has no members"))?;
        *self.shared.local_group.lock().unwrap() = Some(local);
        Ok(())
    }

    fn advertiser(&self) -> AdvertiserHandle {
        AdvertiserHandle::new(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingSink;
    use crate::transport::SnapshotSink;

    fn packet(node_id: &str, uid: &str, name: &str) -> BeaconPacket {
        BeaconPacket {
            version: PROTOCOL_VERSION,
            node_id: node_id.to_string(),
            app_id: "chatapp".to_string(),
            group_uid: uid.to_string(),
            group_name: name.to_string(),
            listen_addr: "10.0.0.2:1337".to_string(),
            initial_peers: vec![Peer::new("aa", "10.0.0.2:1337", "bob")],
            current_peers: vec![Peer::new("aa", "10.0.0.2:1337", "bob")],
        }
    }

    #[test]
    fn packet_round_trips_with_magic_header() {
        let bytes = packet("node-b", "g1", "Team").to_bytes().unwrap();
        assert_eq!(&bytes[..4], MAGIC_BYTES);

        let decoded = BeaconPacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.node_id, "node-b");
        assert_eq!(decoded.group_uid, "g1");
        assert_eq!(decoded.initial_peers.len(), 1);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = packet("node-b", "g1", "Team").to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(BeaconPacket::from_bytes(&bytes).is_none());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut wrong = packet("node-b", "g1", "Team");
        wrong.version = 99;
        let bytes = wrong.to_bytes().unwrap();
        assert!(BeaconPacket::from_bytes(&bytes).is_none());
    }

    #[test]
    fn truncated_packets_are_rejected() {
        assert!(BeaconPacket::from_bytes(b"GM").is_none());
        assert!(BeaconPacket::from_bytes(b"GMSH{").is_none());
    }

    #[tokio::test]
    async fn received_beacons_populate_snapshots() {
        let config = BeaconConfig {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            broadcast_addr: "127.0.0.1".to_string(),
            announce_interval: Duration::from_millis(100),
            ttl: Duration::from_millis(300),
        };
        let transport = BeaconTransport::new("node-a", "10.0.0.1:1337", config);
        let sink = Arc::new(RecordingSink::new());
        let ctx = TransportContext::new(ProviderId::random(), sink.clone() as Arc<dyn SnapshotSink>);
        transport.start_discovery(ctx).await.unwrap();
        let port = transport.bound_port().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = packet("node-b", "g1", "Team").to_bytes().unwrap();
        sender.send_to(&bytes, ("127.0.0.1", port)).await.unwrap();

        let mut resolved = false;
        for _ in 0..50 {
            if sink
                .latest()
                .map(|s| !s.groups.is_empty())
                .unwrap_or(false)
            {
                resolved = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(resolved, "beacon never resolved into a snapshot");

        let snapshot = sink.latest().unwrap();
        assert_eq!(snapshot.groups[0].group_uid(), "g1");

        // Without refreshes the advertisement expires and is swept.
        let mut swept = false;
        for _ in 0..100 {
            if sink
                .latest()
                .map(|s| s.groups.is_empty())
                .unwrap_or(false)
            {
                swept = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(swept, "expired beacon was never swept");

        transport.stop_discovery().await;
    }

    #[tokio::test]
    async fn own_beacons_are_ignored() {
        let config = BeaconConfig {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            broadcast_addr: "127.0.0.1".to_string(),
            announce_interval: Duration::from_millis(100),
            ttl: Duration::from_secs(10),
        };
        let transport = BeaconTransport::new("node-a", "10.0.0.1:1337", config);
        let sink = Arc::new(RecordingSink::new());
        let ctx = TransportContext::new(ProviderId::random(), sink.clone() as Arc<dyn SnapshotSink>);
        transport.start_discovery(ctx).await.unwrap();
        let port = transport.bound_port().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = packet("node-a", "g1", "Team").to_bytes().unwrap();
        sender.send_to(&bytes, ("127.0.0.1", port)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.latest().unwrap().groups.is_empty());

        transport.stop_discovery().await;
    }

    #[tokio::test]
    async fn advertise_broadcasts_until_stopped() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let config = BeaconConfig {
            port,
            bind_addr: "127.0.0.1".to_string(),
            broadcast_addr: "127.0.0.1".to_string(),
            announce_interval: Duration::from_millis(50),
            ttl: Duration::from_secs(10),
        };
        let transport = BeaconTransport::new("node-a", "10.0.0.1:1337", config);

        // No local group yet: nothing to advertise.
        assert!(!transport.advertise_inner(vec![], vec![]).await.unwrap());

        let provider = ProviderId::random();
        let group = ResolvedGroup::new(ResolvedService::new(
            ServiceIdentity::new(provider, "self"),
            "chatapp",
            "Team",
            "g1",
        ));
        transport.before_join(&group).await.unwrap();

        let peers = vec![Peer::new("aa", "10.0.0.1:1337", "alice")];
        assert!(transport
            .advertise_inner(peers.clone(), peers)
            .await
            .unwrap());

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let received = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .expect("no beacon within timeout")
            .unwrap();
        let decoded = BeaconPacket::from_bytes(&buf[..received.0]).unwrap();
        assert_eq!(decoded.node_id, "node-a");
        assert_eq!(decoded.group_uid, "g1");

        transport.stop_advertising_inner().await;
    }
}

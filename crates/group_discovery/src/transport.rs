//! The transport seam: discovery contract, context, and the scriptable
//! mock used across the test suite.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use group_model::{
    GroupBook, Peer, ProviderId, ResolvedGroup, ResolvedService, ServiceIdentity, Snapshot,
};

use crate::{DiscoveryError, Result};

/// Property keys shared by every discovery medium.
pub const PROP_APP_ID: &str = "app_id";
pub const PROP_GROUP_NAME: &str = "group_name";
pub const PROP_GROUP_UID: &str = "group_uid";
pub const PROP_INITIAL_PEERS: &str = "initial_peers";
pub const PROP_CURRENT_PEERS: &str = "current_peers";

/// A medium-specific advertisement normalized to a property bag before
/// resolution. `raw` is the medium's own identity for the advertisement
/// (mDNS fullname, beacon sender, relay entry key).
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub raw: String,
    pub address: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl Advertisement {
    pub fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Snapshot consumer. The controller is the production implementation;
/// it discards snapshots from transports it no longer considers active.
pub trait SnapshotSink: Send + Sync {
    fn publish(&self, snapshot: Snapshot);
}

/// Handed to a transport when discovery starts: the provider id assigned
/// at registration plus the sink its snapshots go to.
#[derive(Clone)]
pub struct TransportContext {
    provider_id: ProviderId,
    sink: Arc<dyn SnapshotSink>,
}

impl TransportContext {
    pub fn new(provider_id: ProviderId, sink: Arc<dyn SnapshotSink>) -> Self {
        Self { provider_id, sink }
    }

    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    pub fn publish(&self, snapshot: Snapshot) {
        self.sink.publish(snapshot);
    }
}

/// Advertising half of a transport, detached so the join workflow can
/// hand it to the configuration-written hook without keeping the whole
/// transport reachable.
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool>;
    async fn stop_advertising(&self);
}

#[derive(Clone)]
pub struct AdvertiserHandle(Arc<dyn Advertiser>);

impl AdvertiserHandle {
    pub fn new(advertiser: Arc<dyn Advertiser>) -> Self {
        Self(advertiser)
    }

    pub async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        self.0.advertise(initial, current).await
    }

    pub async fn stop_advertising(&self) {
        self.0.stop_advertising().await;
    }
}

/// The group a transport advertises on behalf of the local node, captured
/// when a join begins.
#[derive(Debug, Clone)]
pub(crate) struct LocalGroup {
    pub app_id: String,
    pub group_uid: String,
    pub group_name: String,
}

impl LocalGroup {
    pub fn from_group(group: &ResolvedGroup) -> Option<Self> {
        let member = group.any_member()?;
        Some(Self {
            app_id: member.app_id.clone(),
            group_uid: group.group_uid().to_string(),
            group_name: group.group_name().to_string(),
        })
    }
}

/// Contract every discovery medium implements.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Begin discovery, publishing snapshots into the context. Calling
    /// this on a running transport is a no-op.
    async fn start_discovery(&self, ctx: TransportContext) -> Result<()>;

    /// Stop discovery. Calling this on a stopped transport is a no-op.
    async fn stop_discovery(&self);

    /// Resolve one advertisement into a canonical service record.
    /// Implementations may attempt a single bounded fallback pass when
    /// the primary data is incomplete; after that, failure is terminal
    /// for this advertisement.
    async fn resolve(&self, advert: Advertisement) -> Result<ResolvedService>;

    /// Advertise the locally joined group with the given peer lists.
    /// Returns whether an advertisement is now live on the medium.
    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool>;

    async fn stop_advertising(&self);

    /// Transport-specific preparation before a join of `group` proceeds.
    async fn before_join(&self, group: &ResolvedGroup) -> Result<()>;

    /// A detached handle to this transport's advertising half.
    fn advertiser(&self) -> AdvertiserHandle;
}

/// Build a resolved service from a normalized advertisement. The three
/// identity properties are required; peer lists are optional JSON arrays.
pub fn service_from_advertisement(
    provider_id: ProviderId,
    advert: &Advertisement,
) -> Result<ResolvedService> {
    let app_id = required(advert, PROP_APP_ID)?.to_string();
    let group_name = required(advert, PROP_GROUP_NAME)?.to_string();
    let group_uid = required(advert, PROP_GROUP_UID)?.to_string();

    let mut service = ResolvedService::new(
        ServiceIdentity::new(provider_id, &advert.raw),
        &app_id,
        &group_name,
        &group_uid,
    );
    if let Some(address) = &advert.address {
        service = service.with_address(address);
    }
    for (key, value) in &advert.properties {
        match key.as_str() {
            PROP_APP_ID | PROP_GROUP_NAME | PROP_GROUP_UID | PROP_INITIAL_PEERS
            | PROP_CURRENT_PEERS => {}
            _ => service = service.with_attribute(key, value),
        }
    }

    let initial = peers_property(advert, PROP_INITIAL_PEERS)?;
    let current = peers_property(advert, PROP_CURRENT_PEERS)?;
    if let Some(initial) = initial {
        let current = current.unwrap_or_else(|| initial.clone());
        service = service.with_peers(initial, current);
    }
    Ok(service)
}

fn required<'a>(advert: &'a Advertisement, key: &str) -> Result<&'a str> {
    advert
        .property(key)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DiscoveryError::resolution(&advert.raw, format!("missing {key}")))
}

fn peers_property(advert: &Advertisement, key: &str) -> Result<Option<Vec<Peer>>> {
    match advert.property(key) {
        None => Ok(None),
        Some(json) => serde_json::from_str(json)
            .map(Some)
            .map_err(|e| DiscoveryError::resolution(&advert.raw, format!("bad {key}: {e}"))),
    }
}

/// Scriptable in-memory transport: tests push advertisements, script
/// failures, and observe lifecycle calls.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

struct MockState {
    ctx: std::sync::Mutex<Option<TransportContext>>,
    book: std::sync::Mutex<Option<GroupBook>>,
    start_failure: std::sync::Mutex<Option<String>>,
    resolve_failure: std::sync::Mutex<Option<String>>,
    before_join_failure: std::sync::Mutex<Option<String>>,
    local_group: std::sync::Mutex<Option<LocalGroup>>,
    advertising: AtomicBool,
    advertised: std::sync::Mutex<Vec<(Vec<Peer>, Vec<Peer>)>>,
    before_join_uids: std::sync::Mutex<Vec<String>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                ctx: std::sync::Mutex::new(None),
                book: std::sync::Mutex::new(None),
                start_failure: std::sync::Mutex::new(None),
                resolve_failure: std::sync::Mutex::new(None),
                before_join_failure: std::sync::Mutex::new(None),
                local_group: std::sync::Mutex::new(None),
                advertising: AtomicBool::new(false),
                advertised: std::sync::Mutex::new(Vec::new()),
                before_join_uids: std::sync::Mutex::new(Vec::new()),
                start_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn script_start_failure(&self, message: &str) {
        *self.state.start_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn script_resolve_failure(&self, message: &str) {
        *self.state.resolve_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn script_before_join_failure(&self, message: &str) {
        *self.state.before_join_failure.lock().unwrap() = Some(message.to_string());
    }

    /// The provider id assigned at the last start, if any.
    pub fn provider_id(&self) -> Option<ProviderId> {
        self.state
            .ctx
            .lock()
            .unwrap()
            .as_ref()
            .map(TransportContext::provider_id)
    }

    pub fn is_started(&self) -> bool {
        self.state.ctx.lock().unwrap().is_some()
    }

    pub fn start_calls(&self) -> usize {
        self.state.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.state.stop_calls.load(Ordering::SeqCst)
    }

    pub fn is_advertising(&self) -> bool {
        self.state.advertising.load(Ordering::SeqCst)
    }

    pub fn take_advertised(&self) -> Vec<(Vec<Peer>, Vec<Peer>)> {
        std::mem::take(&mut *self.state.advertised.lock().unwrap())
    }

    pub fn before_join_uids(&self) -> Vec<String> {
        self.state.before_join_uids.lock().unwrap().clone()
    }

    /// Simulate an advertisement appearing on the medium. The transport
    /// must be started; the snapshot is published on every change.
    pub fn announce(
        &self,
        raw: &str,
        app_id: &str,
        group_name: &str,
        group_uid: &str,
    ) -> Result<()> {
        self.announce_with_peers(raw, app_id, group_name, group_uid, None, None)
    }

    pub fn announce_with_peers(
        &self,
        raw: &str,
        app_id: &str,
        group_name: &str,
        group_uid: &str,
        initial: Option<Vec<Peer>>,
        current: Option<Vec<Peer>>,
    ) -> Result<()> {
        let ctx = self
            .state
            .ctx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DiscoveryError::resolution(raw, "transport not started"))?;

        let mut service = ResolvedService::new(
            ServiceIdentity::new(ctx.provider_id(), raw),
            app_id,
            group_name,
            group_uid,
        );
        if let Some(initial) = initial {
            let current = current.unwrap_or_else(|| initial.clone());
            service = service.with_peers(initial, current);
        }

        let mut guard = self.state.book.lock().unwrap();
        if let Some(book) = guard.as_mut() {
            if book.insert(service)? {
                ctx.publish(book.snapshot());
            }
        }
        Ok(())
    }

    /// Simulate a loss signal for a previously announced advertisement.
    pub fn lose(&self, raw: &str) -> Result<()> {
        let ctx = self
            .state
            .ctx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DiscoveryError::resolution(raw, "transport not started"))?;

        let identity = ServiceIdentity::new(ctx.provider_id(), raw);
        let mut guard = self.state.book.lock().unwrap();
        if let Some(book) = guard.as_mut() {
            if book.remove(&identity)? {
                ctx.publish(book.snapshot());
            }
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Advertiser for MockTransport {
    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        DiscoveryTransport::advertise(self, initial, current).await
    }

    async fn stop_advertising(&self) {
        DiscoveryTransport::stop_advertising(self).await;
    }
}

#[async_trait]
impl DiscoveryTransport for MockTransport {
    async fn start_discovery(&self, ctx: TransportContext) -> Result<()> {
        self.state.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.state.start_failure.lock().unwrap().clone() {
            return Err(DiscoveryError::StartFailed(message));
        }
        let mut guard = self.state.ctx.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let book = GroupBook::new(ctx.provider_id());
        ctx.publish(book.snapshot());
        *self.state.book.lock().unwrap() = Some(book);
        *guard = Some(ctx);
        Ok(())
    }

    async fn stop_discovery(&self) {
        self.state.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.state.ctx.lock().unwrap().take();
        self.state.book.lock().unwrap().take();
    }

    async fn resolve(&self, advert: Advertisement) -> Result<ResolvedService> {
        if let Some(message) = self.state.resolve_failure.lock().unwrap().clone() {
            return Err(DiscoveryError::resolution(&advert.raw, message));
        }
        let provider_id = self
            .provider_id()
            .ok_or_else(|| DiscoveryError::resolution(&advert.raw, "transport not started"))?;
        service_from_advertisement(provider_id, &advert)
    }

    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        if self.state.local_group.lock().unwrap().is_none() {
            return Ok(false);
        }
        self.state
            .advertised
            .lock()
            .unwrap()
            .push((initial, current));
        self.state.advertising.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn stop_advertising(&self) {
        self.state.advertising.store(false, Ordering::SeqCst);
    }

    async fn before_join(&self, group: &ResolvedGroup) -> Result<()> {
        if let Some(message) = self.state.before_join_failure.lock().unwrap().clone() {
            return Err(DiscoveryError::join(message));
        }
        self.state
            .before_join_uids
            .lock()
            .unwrap()
            .push(group.group_uid().to_string());
        *self.state.local_group.lock().unwrap() = LocalGroup::from_group(group);
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

    fn context(sink: &Arc<RecordingSink>) -> TransportContext {
        TransportContext::new(ProviderId::random(), sink.clone() as Arc<dyn SnapshotSink>)
    }

    #[tokio::test]
    async fn start_is_idempotent_and_publishes_an_empty_snapshot() {
        let sink = Arc::new(RecordingSink::new());
        let mock = MockTransport::new();

        mock.start_discovery(context(&sink)).await.unwrap();
        mock.start_discovery(context(&sink)).await.unwrap();

        assert_eq!(mock.start_calls(), 2);
        // Only the first start publishes; the second is a no-op.
        assert_eq!(sink.snapshots().len(), 1);
        assert!(sink.latest().unwrap().groups.is_empty());
    }

    #[tokio::test]
    async fn announce_publishes_a_complete_snapshot() {
        let sink = Arc::new(RecordingSink::new());
        let mock = MockTransport::new();
        mock.start_discovery(context(&sink)).await.unwrap();

        mock.announce("a", "chatapp", "Team", "g1").unwrap();
        mock.announce("b", "chatapp", "Team", "g1").unwrap();

        let snapshot = sink.latest().unwrap();
        assert_eq!(snapshot.groups.len(), 1);
        assert_eq!(snapshot.groups[0].len(), 2);
    }

    #[tokio::test]
    async fn lose_removes_and_publishes() {
        let sink = Arc::new(RecordingSink::new());
        let mock = MockTransport::new();
        mock.start_discovery(context(&sink)).await.unwrap();

        mock.announce("a", "chatapp", "Team", "g1").unwrap();
        mock.lose("a").unwrap();

        assert!(sink.latest().unwrap().groups.is_empty());
    }

    #[tokio::test]
    async fn scripted_start_failure_surfaces() {
        let sink = Arc::new(RecordingSink::new());
        let mock = MockTransport::new();
        mock.script_start_failure("no sockets");

        let err = mock.start_discovery(context(&sink)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::StartFailed(_)));
        assert!(!mock.is_started());
    }

    #[tokio::test]
    async fn advertise_requires_a_local_group() {
        let sink = Arc::new(RecordingSink::new());
        let mock = MockTransport::new();
        mock.start_discovery(context(&sink)).await.unwrap();

        let live = DiscoveryTransport::advertise(&mock, vec![], vec![])
            .await
            .unwrap();
        assert!(!live);

        mock.announce("a", "chatapp", "Team", "g1").unwrap();
        let group = sink.latest().unwrap().groups[0].clone();
        mock.before_join(&group).await.unwrap();

        let live = DiscoveryTransport::advertise(&mock, vec![], vec![])
            .await
            .unwrap();
        assert!(live);
        assert_eq!(mock.before_join_uids(), vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn advertiser_handle_drives_the_same_state() {
        let sink = Arc::new(RecordingSink::new());
        let mock = MockTransport::new();
        mock.start_discovery(context(&sink)).await.unwrap();
        mock.announce("a", "chatapp", "Team", "g1").unwrap();
        let group = sink.latest().unwrap().groups[0].clone();
        mock.before_join(&group).await.unwrap();

        let handle = DiscoveryTransport::advertiser(&mock);
        assert!(handle.advertise(vec![], vec![]).await.unwrap());
        assert!(mock.is_advertising());
        handle.stop_advertising().await;
        assert!(!mock.is_advertising());
    }

    #[test]
    fn resolution_requires_the_identity_properties() {
        let provider = ProviderId::random();
        let advert = Advertisement::new("raw-1")
            .with_property(PROP_APP_ID, "chatapp")
            .with_property(PROP_GROUP_NAME, "Team");

        let err = service_from_advertisement(provider, &advert).unwrap_err();
        assert!(matches!(err, DiscoveryError::Resolution { .. }));
    }

    #[test]
    fn resolution_maps_properties_and_peers() {
        let provider = ProviderId::random();
        let peers = vec![Peer::new("aa", "10.0.0.1:1337", "alice")];
        let peers_json = serde_json::to_string(&peers).unwrap();
        let advert = Advertisement::new("raw-1")
            .with_address("10.0.0.1:1337")
            .with_property(PROP_APP_ID, "chatapp")
            .with_property(PROP_GROUP_NAME, "Team")
            .with_property(PROP_GROUP_UID, "g1")
            .with_property(PROP_INITIAL_PEERS, &peers_json)
            .with_property("host", "alpha");

        let service = service_from_advertisement(provider, &advert).unwrap();
        assert_eq!(service.app_id, "chatapp");
        assert_eq!(service.group_uid, "g1");
        assert_eq!(service.address.as_deref(), Some("10.0.0.1:1337"));
        // Identity and peer properties stay out of the attribute bag.
        assert_eq!(service.attributes.len(), 1);
        assert_eq!(service.attributes.get("host").map(String::as_str), Some("alpha"));
        assert_eq!(service.initial_peers.as_ref().unwrap().len(), 1);
        // Missing current peers default to the initial list.
        assert_eq!(service.current_peers.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn malformed_peer_json_is_a_resolution_error() {
        let provider = ProviderId::random();
        let advert = Advertisement::new("raw-1")
            .with_property(PROP_APP_ID, "chatapp")
            .with_property(PROP_GROUP_NAME, "Team")
            .with_property(PROP_GROUP_UID, "g1")
            .with_property(PROP_INITIAL_PEERS, "not json");

        let err = service_from_advertisement(provider, &advert).unwrap_err();
        assert!(matches!(err, DiscoveryError::Resolution { .. }));
    }
}

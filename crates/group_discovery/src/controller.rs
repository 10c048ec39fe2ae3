//! The discovery controller: provider registry, snapshot cache, and the
//! atomic join workflow.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use group_config::{AmendOutcome, ConfigStore, NodeConfiguration};
use group_model::{GroupDescriptor, ProviderId, ResolvedGroup, ResolvedService, Snapshot};
use parking_lot::{FairMutex, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transport::{AdvertiserHandle, DiscoveryTransport, SnapshotSink, TransportContext};
use crate::{DiscoveryError, Result};

/// Emitted over the controller's event channel.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// A transport published a fresh view of its medium.
    SnapshotUpdated(Snapshot),
    /// A transport could not start; the others keep running.
    TransportFailed {
        provider_id: ProviderId,
        error: String,
    },
}

/// Everything a join needs: which group on which provider, the node
/// tunables for the new directory, and the node's signing key.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub provider_id: ProviderId,
    pub group_uid: String,
    pub configuration: NodeConfiguration,
    pub private_key_hex: String,
}

type JoinConfirmation = Arc<dyn Fn(&ResolvedGroup) -> bool + Send + Sync>;
type ConfigurationWritten = Arc<dyn Fn(&Path, &GroupDescriptor, AdvertiserHandle) + Send + Sync>;

struct ProviderRegistration {
    transport: Arc<dyn DiscoveryTransport>,
    active: bool,
}

/// State shared with every transport context. Snapshot publication goes
/// through here, so a transport that keeps publishing after it was
/// stopped or deregistered is silently ignored.
struct ControllerShared {
    registry: FairMutex<HashMap<ProviderId, ProviderRegistration>>,
    snapshots: Mutex<HashMap<ProviderId, Snapshot>>,
    discovering: AtomicBool,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl SnapshotSink for ControllerShared {
    fn publish(&self, snapshot: Snapshot) {
        let provider_id = snapshot.provider_id;
        {
            let registry = self.registry.lock();
            match registry.get(&provider_id) {
                Some(entry) if entry.active => {}
                _ => {
                    debug!(%provider_id, "discarding snapshot from inactive provider");
                    return;
                }
            }
        }
        self.snapshots.lock().insert(provider_id, snapshot.clone());
        let _ = self.events.send(ControllerEvent::SnapshotUpdated(snapshot));
    }
}

/// Caches transport snapshots, fans discovery start/stop out to every
/// registered transport, and drives the join that turns a discovered
/// group into a configuration directory.
pub struct DiscoveryController {
    shared: Arc<ControllerShared>,
    store: Mutex<ConfigStore>,
    local_moniker: Mutex<Option<String>>,
    join_confirmation: Mutex<Option<JoinConfirmation>>,
    configuration_written: Mutex<Option<ConfigurationWritten>>,
}

impl DiscoveryController {
    pub fn new(store: ConfigStore) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let controller = Self {
            shared: Arc::new(ControllerShared {
                registry: FairMutex::new(HashMap::new()),
                snapshots: Mutex::new(HashMap::new()),
                discovering: AtomicBool::new(false),
                events,
            }),
            store: Mutex::new(store),
            local_moniker: Mutex::new(None),
            join_confirmation: Mutex::new(None),
            configuration_written: Mutex::new(None),
        };
        (controller, receiver)
    }

    /// Hook consulted by [`Self::on_service_selected`]; returning false
    /// cancels the join without error.
    pub fn set_join_confirmation<F>(&self, hook: F)
    where
        F: Fn(&ResolvedGroup) -> bool + Send + Sync + 'static,
    {
        *self.join_confirmation.lock() = Some(Arc::new(hook));
    }

    /// Hook invoked after a join wrote its configuration directory. The
    /// handle lets the application advertise the joined group without
    /// holding the transport itself.
    pub fn set_configuration_written<F>(&self, hook: F)
    where
        F: Fn(&Path, &GroupDescriptor, AdvertiserHandle) + Send + Sync + 'static,
    {
        *self.configuration_written.lock() = Some(Arc::new(hook));
    }

    /// Register a transport under a fresh provider id. Registration
    /// itself never fails; when discovery is already running the
    /// transport is started immediately and a start failure is reported
    /// through the event channel.
    pub async fn register_provider(&self, transport: Arc<dyn DiscoveryTransport>) -> ProviderId {
        let provider_id = ProviderId::random();
        self.shared.registry.lock().insert(
            provider_id,
            ProviderRegistration {
                transport: transport.clone(),
                active: false,
            },
        );
        debug!(%provider_id, "provider registered");
        if self.shared.discovering.load(Ordering::SeqCst) {
            self.start_transport(provider_id, transport).await;
        }
        provider_id
    }

    /// Remove a provider and its cached snapshot. The transport is not
    /// stopped; the caller keeps that responsibility.
    pub fn deregister_provider(&self, provider_id: ProviderId) -> bool {
        let removed = self.shared.registry.lock().remove(&provider_id).is_some();
        if removed {
            self.shared.snapshots.lock().remove(&provider_id);
            debug!(%provider_id, "provider deregistered");
        }
        removed
    }

    pub fn is_discovering(&self) -> bool {
        self.shared.discovering.load(Ordering::SeqCst)
    }

    /// Start discovery on every registered transport that is not already
    /// running. Failures are isolated per transport.
    pub async fn start_discovery(&self) {
        self.shared.discovering.store(true, Ordering::SeqCst);
        let pending: Vec<(ProviderId, Arc<dyn DiscoveryTransport>)> = {
            let registry = self.shared.registry.lock();
            registry
                .iter()
                .filter(|(_, entry)| !entry.active)
                .map(|(id, entry)| (*id, entry.transport.clone()))
                .collect()
        };
        for (provider_id, transport) in pending {
            self.start_transport(provider_id, transport).await;
        }
    }

    /// Stop discovery everywhere. Entries are marked inactive before the
    /// transports are awaited, so snapshots racing the stop are dropped.
    pub async fn stop_discovery(&self) {
        self.shared.discovering.store(false, Ordering::SeqCst);
        let running: Vec<Arc<dyn DiscoveryTransport>> = {
            let mut registry = self.shared.registry.lock();
            registry
                .values_mut()
                .filter(|entry| entry.active)
                .map(|entry| {
                    entry.active = false;
                    entry.transport.clone()
                })
                .collect()
        };
        for transport in running {
            transport.stop_discovery().await;
        }
    }

    /// The entry is activated before the transport starts so that the
    /// initial snapshot most transports publish during startup is not
    /// discarded; a failed start rolls both back.
    async fn start_transport(
        &self,
        provider_id: ProviderId,
        transport: Arc<dyn DiscoveryTransport>,
    ) {
        {
            let mut registry = self.shared.registry.lock();
            match registry.get_mut(&provider_id) {
                Some(entry) => entry.active = true,
                None => return,
            }
        }
        let ctx = TransportContext::new(provider_id, self.shared.clone() as Arc<dyn SnapshotSink>);
        if let Err(error) = transport.start_discovery(ctx).await {
            {
                let mut registry = self.shared.registry.lock();
                if let Some(entry) = registry.get_mut(&provider_id) {
                    entry.active = false;
                }
            }
            self.shared.snapshots.lock().remove(&provider_id);
            warn!(%provider_id, %error, "transport failed to start");
            let _ = self.shared.events.send(ControllerEvent::TransportFailed {
                provider_id,
                error: error.to_string(),
            });
        }
    }

    /// The latest cached snapshot of every provider.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.shared.snapshots.lock().values().cloned().collect()
    }

    pub fn find_group(&self, provider_id: ProviderId, group_uid: &str) -> Option<ResolvedGroup> {
        self.shared
            .snapshots
            .lock()
            .get(&provider_id)
            .and_then(|snapshot| {
                snapshot
                    .groups
                    .iter()
                    .find(|group| group.group_uid() == group_uid)
            })
            .cloned()
    }

    /// The moniker recorded by the last successful join or amendment.
    pub fn local_moniker(&self) -> Option<String> {
        self.local_moniker.lock().clone()
    }

    /// A user selected a discovered group. Consults the confirmation
    /// hook first; a declined join returns `Ok(None)` and changes
    /// nothing.
    pub async fn on_service_selected(&self, request: &JoinRequest) -> Result<Option<PathBuf>> {
        let group = self
            .find_group(request.provider_id, &request.group_uid)
            .ok_or_else(|| {
                DiscoveryError::join(format!(
                    "group {} is not in the current view",
                    request.group_uid
                ))
            })?;
        if let Some(confirm) = self.join_confirmation.lock().clone() {
            if !confirm(&group) {
                debug!(group_uid = %group.group_uid(), "join declined by confirmation hook");
                return Ok(None);
            }
        }
        self.join_group(request).await.map(Some)
    }

    /// Join a discovered group: transport preparation, a full discovery
    /// stop, then the configuration directory write. The write is the
    /// commit point; if it fails, discovery is restored and no state
    /// changes.
    pub async fn join_group(&self, request: &JoinRequest) -> Result<PathBuf> {
        let transport = {
            let registry = self.shared.registry.lock();
            registry
                .get(&request.provider_id)
                .map(|entry| entry.transport.clone())
                .ok_or(DiscoveryError::UnknownProvider(request.provider_id))?
        };
        let group = self
            .find_group(request.provider_id, &request.group_uid)
            .ok_or_else(|| {
                DiscoveryError::join(format!(
                    "group {} is not in the current view",
                    request.group_uid
                ))
            })?;

        let member = group
            .services()
            .iter()
            .find(|service| service.initial_peers.is_some())
            .ok_or_else(|| DiscoveryError::join("advertisement carries no peer list"))?;
        let initial = member.initial_peers.clone().unwrap_or_default();
        let current = member
            .current_peers
            .clone()
            .unwrap_or_else(|| initial.clone());

        let moniker = request.configuration.moniker.clone();
        let descriptor = GroupDescriptor::for_join(&group, &moniker)
            .ok_or_else(|| DiscoveryError::join("group has no members"))?;

        transport.before_join(&group).await?;

        let was_discovering = self.is_discovering();
        self.stop_discovery().await;

        let created = self.store.lock().create_configuration(
            group.group_uid(),
            group.group_name(),
            &request.configuration,
            &request.private_key_hex,
            &initial,
            &current,
        );
        let path = match created {
            Ok(path) => path,
            Err(source) => {
                if was_discovering {
                    self.start_discovery().await;
                }
                return Err(DiscoveryError::JoinFailed {
                    reason: "configuration directory could not be created".to_string(),
                    source: Some(source),
                });
            }
        };

        *self.local_moniker.lock() = Some(moniker);
        info!(group_uid = %group.group_uid(), dir = %path.display(), "group joined");

        if let Some(hook) = self.configuration_written.lock().clone() {
            hook(&path, &descriptor, transport.advertiser());
        }
        Ok(path)
    }

    /// Inject a group the application constructed itself, typically when
    /// founding a new one. The owning transport's discovery is stopped
    /// first so the medium cannot overwrite the injected view.
    pub async fn add_pseudo_group(&self, service: ResolvedService) -> Result<()> {
        let provider_id = service.provider_id();
        let transport = {
            let mut registry = self.shared.registry.lock();
            let entry = registry
                .get_mut(&provider_id)
                .ok_or(DiscoveryError::UnknownProvider(provider_id))?;
            entry.active = false;
            entry.transport.clone()
        };
        transport.stop_discovery().await;

        let group_uid = service.group_uid.clone();
        let snapshot = {
            let mut snapshots = self.shared.snapshots.lock();
            let snapshot = snapshots.entry(provider_id).or_insert_with(|| Snapshot {
                provider_id,
                groups: Vec::new(),
            });
            snapshot.groups.retain(|group| group.group_uid() != group_uid);
            snapshot.groups.push(ResolvedGroup::new(service));
            snapshot.clone()
        };
        debug!(%provider_id, %group_uid, "pseudo group injected");
        let _ = self
            .shared
            .events
            .send(ControllerEvent::SnapshotUpdated(snapshot));
        Ok(())
    }

    /// Amend the settings document of an existing configuration
    /// directory. A moniker change is mirrored into the controller.
    pub fn amend_settings(
        &self,
        path: &Path,
        changes: &BTreeMap<String, toml::Value>,
    ) -> Result<AmendOutcome> {
        let outcome = self.store.lock().amend_settings(path, changes)?;
        if let Some(moniker) = &outcome.moniker {
            *self.local_moniker.lock() = Some(moniker.clone());
        }
        Ok(outcome)
    }

    /// Run `f` against the configuration store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut ConfigStore) -> R) -> R {
        f(&mut self.store.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Advertisement, MockTransport};
    use async_trait::async_trait;
    use group_config::CollisionPolicy;
    use group_model::{GroupBook, Peer, ServiceIdentity};
    use tempfile::TempDir;

    fn store(dir: &TempDir, policy: CollisionPolicy) -> ConfigStore {
        ConfigStore::open(dir.path(), "chatapp", policy).unwrap()
    }

    fn configuration(moniker: &str) -> NodeConfiguration {
        NodeConfiguration::builder().moniker(moniker).build().unwrap()
    }

    fn join_request(provider_id: ProviderId, group_uid: &str) -> JoinRequest {
        JoinRequest {
            provider_id,
            group_uid: group_uid.to_string(),
            configuration: configuration("alice"),
            private_key_hex: "deadbeef".to_string(),
        }
    }

    fn peers() -> Vec<Peer> {
        vec![Peer::new("aa", "10.0.0.1:1337", "bob")]
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<ControllerEvent>) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Keeps its context across a stop so it can publish stale
    /// snapshots.
    #[derive(Clone, Default)]
    struct LingeringTransport {
        ctx: Arc<std::sync::Mutex<Option<TransportContext>>>,
    }

    impl LingeringTransport {
        fn publish_late(&self, raw: &str) {
            let ctx = self.ctx.lock().unwrap().clone().unwrap();
            let mut book = GroupBook::new(ctx.provider_id());
            let service = ResolvedService::new(
                ServiceIdentity::new(ctx.provider_id(), raw),
                "chatapp",
                "Stale",
                "stale",
            );
            book.insert(service).unwrap();
            ctx.publish(book.snapshot());
        }
    }

    #[async_trait]
    impl DiscoveryTransport for LingeringTransport {
        async fn start_discovery(&self, ctx: TransportContext) -> Result<()> {
            *self.ctx.lock().unwrap() = Some(ctx);
            Ok(())
        }

        async fn stop_discovery(&self) {}

        async fn resolve(&self, advert: Advertisement) -> Result<ResolvedService> {
            Err(DiscoveryError::resolution(&advert.raw, "unsupported"))
        }

        async fn advertise(&self, _initial: Vec<Peer>, _current: Vec<Peer>) -> Result<bool> {
            Ok(false)
        }

        async fn stop_advertising(&self) {}

        async fn before_join(&self, _group: &ResolvedGroup) -> Result<()> {
            Ok(())
        }

        fn advertiser(&self) -> AdvertiserHandle {
            unimplemented!("not used in these tests")
        }
    }

    #[tokio::test]
    async fn registration_while_discovering_starts_the_transport() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();

        controller.start_discovery().await;
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;

        assert!(mock.is_started());
        assert_eq!(mock.provider_id(), Some(provider_id));
    }

    #[tokio::test]
    async fn registration_before_start_stays_idle() {
        let dir = TempDir::new().unwrap();
        let (controller, mut events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();

        controller.register_provider(Arc::new(mock.clone())).await;
        assert!(!mock.is_started());

        controller.start_discovery().await;
        assert!(mock.is_started());

        let events = drain(&mut events);
        assert!(matches!(
            events.as_slice(),
            [ControllerEvent::SnapshotUpdated(s)] if s.groups.is_empty()
        ));
    }

    #[tokio::test]
    async fn start_failure_is_isolated_to_the_failing_transport() {
        let dir = TempDir::new().unwrap();
        let (controller, mut events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let broken = MockTransport::new();
        broken.script_start_failure("no sockets");
        let healthy = MockTransport::new();

        let broken_id = controller.register_provider(Arc::new(broken.clone())).await;
        controller.register_provider(Arc::new(healthy.clone())).await;
        controller.start_discovery().await;

        assert!(!broken.is_started());
        assert!(healthy.is_started());
        healthy.announce("a", "chatapp", "Team", "g1").unwrap();
        assert_eq!(controller.snapshots().len(), 1);

        let failed = drain(&mut events)
            .into_iter()
            .any(|event| matches!(
                event,
                ControllerEvent::TransportFailed { provider_id, .. } if provider_id == broken_id
            ));
        assert!(failed);
    }

    #[tokio::test]
    async fn snapshots_after_stop_are_discarded() {
        let dir = TempDir::new().unwrap();
        let (controller, mut events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let lingering = LingeringTransport::default();

        controller.register_provider(Arc::new(lingering.clone())).await;
        controller.start_discovery().await;
        controller.stop_discovery().await;
        drain(&mut events);

        lingering.publish_late("late");

        assert!(controller.snapshots().is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn snapshots_after_deregistration_are_discarded() {
        let dir = TempDir::new().unwrap();
        let (controller, mut events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let lingering = LingeringTransport::default();

        let provider_id = controller.register_provider(Arc::new(lingering.clone())).await;
        controller.start_discovery().await;
        assert!(controller.deregister_provider(provider_id));
        drain(&mut events);

        lingering.publish_late("late");

        assert!(controller.snapshots().is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn join_writes_the_directory_and_stops_discovery() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;
        controller.start_discovery().await;

        mock.announce_with_peers("a", "chatapp", "Team", "g1", Some(peers()), None)
            .unwrap();

        let written: Arc<std::sync::Mutex<Option<(PathBuf, GroupDescriptor)>>> =
            Arc::new(std::sync::Mutex::new(None));
        let written_clone = written.clone();
        controller.set_configuration_written(move |path, descriptor, _advertiser| {
            *written_clone.lock().unwrap() = Some((path.to_path_buf(), descriptor.clone()));
        });

        let path = controller
            .join_group(&join_request(provider_id, "g1"))
            .await
            .unwrap();

        assert!(path.join("settings.toml").is_file());
        assert!(path.join("peers.genesis.json").is_file());
        assert!(path.join("peers.json").is_file());
        assert!(!controller.is_discovering());
        assert!(mock.stop_calls() >= 1);
        assert_eq!(mock.before_join_uids(), vec!["g1".to_string()]);
        assert_eq!(controller.local_moniker().as_deref(), Some("alice"));

        let (hook_path, descriptor) = written.lock().unwrap().clone().unwrap();
        assert_eq!(hook_path, path);
        assert_eq!(descriptor.group_uid, "g1");
        assert_eq!(descriptor.moniker, "alice");

        // The handle given to the hook can advertise the joined group.
        let handle = mock.advertiser();
        assert!(handle.advertise(peers(), peers()).await.unwrap());
    }

    #[tokio::test]
    async fn join_requires_a_peer_list() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;
        controller.start_discovery().await;

        mock.announce("a", "chatapp", "Team", "g1").unwrap();

        let err = controller
            .join_group(&join_request(provider_id, "g1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::JoinFailed { .. }));
        // Nothing was committed.
        assert!(controller.is_discovering());
        assert!(controller.local_moniker().is_none());
    }

    #[tokio::test]
    async fn join_of_an_unknown_provider_fails() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));

        let err = controller
            .join_group(&join_request(ProviderId::random(), "g1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn failed_directory_write_restores_discovery() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;
        controller.start_discovery().await;
        mock.announce_with_peers("a", "chatapp", "Team", "g1", Some(peers()), None)
            .unwrap();

        // A pre-existing directory for the same group forces a collision
        // under the abort policy.
        controller
            .with_store(|store| {
                store.create_configuration(
                    "g1",
                    "Team",
                    &configuration("alice"),
                    "deadbeef",
                    &peers(),
                    &peers(),
                )
            })
            .unwrap();

        let err = controller
            .join_group(&join_request(provider_id, "g1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DiscoveryError::JoinFailed {
                source: Some(group_config::ConfigError::Collision { .. }),
                ..
            }
        ));
        assert!(controller.is_discovering());
        assert!(mock.is_started());
        assert!(controller.local_moniker().is_none());
    }

    #[tokio::test]
    async fn confirmation_hook_can_decline_a_join() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;
        controller.start_discovery().await;
        mock.announce_with_peers("a", "chatapp", "Team", "g1", Some(peers()), None)
            .unwrap();

        controller.set_join_confirmation(|_| false);
        let joined = controller
            .on_service_selected(&join_request(provider_id, "g1"))
            .await
            .unwrap();

        assert!(joined.is_none());
        assert!(controller.is_discovering());
        assert!(mock.before_join_uids().is_empty());
        assert!(controller.with_store(|store| store.live_directories().is_empty()));
    }

    #[tokio::test]
    async fn confirmation_hook_can_approve_a_join() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;
        controller.start_discovery().await;
        mock.announce_with_peers("a", "chatapp", "Team", "g1", Some(peers()), None)
            .unwrap();

        controller.set_join_confirmation(|group| group.group_name() == "Team");
        let joined = controller
            .on_service_selected(&join_request(provider_id, "g1"))
            .await
            .unwrap();

        assert!(joined.is_some());
    }

    #[tokio::test]
    async fn pseudo_group_stops_that_transport_and_is_findable() {
        let dir = TempDir::new().unwrap();
        let (controller, mut events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;
        controller.start_discovery().await;
        drain(&mut events);

        let service = ResolvedService::new(
            ServiceIdentity::new(provider_id, "local"),
            "chatapp",
            "Founders",
            "new-group",
        )
        .with_peers(peers(), peers());
        controller.add_pseudo_group(service).await.unwrap();

        assert_eq!(mock.stop_calls(), 1);
        let group = controller.find_group(provider_id, "new-group").unwrap();
        assert_eq!(group.group_name(), "Founders");
        assert!(matches!(
            drain(&mut events).as_slice(),
            [ControllerEvent::SnapshotUpdated(_)]
        ));
    }

    #[tokio::test]
    async fn pseudo_group_for_an_unknown_provider_fails() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));

        let service = ResolvedService::new(
            ServiceIdentity::new(ProviderId::random(), "local"),
            "chatapp",
            "Founders",
            "new-group",
        );
        let err = controller.add_pseudo_group(service).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn amending_the_moniker_updates_the_controller() {
        let dir = TempDir::new().unwrap();
        let (controller, _events) = DiscoveryController::new(store(&dir, CollisionPolicy::Abort));
        let mock = MockTransport::new();
        let provider_id = controller.register_provider(Arc::new(mock.clone())).await;
        controller.start_discovery().await;
        mock.announce_with_peers("a", "chatapp", "Team", "g1", Some(peers()), None)
            .unwrap();

        let path = controller
            .join_group(&join_request(provider_id, "g1"))
            .await
            .unwrap();

        let mut changes = BTreeMap::new();
        changes.insert("moniker".to_string(), toml::Value::String("carol".into()));
        let outcome = controller.amend_settings(&path, &changes).unwrap();

        assert!(outcome.rewritten);
        assert_eq!(controller.local_moniker().as_deref(), Some("carol"));
    }
}

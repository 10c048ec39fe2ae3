//! mDNS LAN transport using mdns-sd.
//!
//! Groups are advertised as instances of `_groupmesh._tcp.local.` with
//! the group identity and peer lists in TXT properties. A background
//! task browses the service type and folds resolved instances into this
//! transport's group book.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use group_model::{GroupBook, Peer, ProviderId, ResolvedGroup, ResolvedService, ServiceIdentity};

use crate::transport::{
    service_from_advertisement, Advertisement, Advertiser, AdvertiserHandle, DiscoveryTransport,
    LocalGroup, TransportContext, PROP_APP_ID, PROP_CURRENT_PEERS, PROP_GROUP_NAME,
    PROP_GROUP_UID, PROP_INITIAL_PEERS,
};
use crate::{DiscoveryError, Result};

pub const SERVICE_TYPE: &str = "_groupmesh._tcp.local.";

/// Bound on the single fallback re-resolve pass.
const REQUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct LanTransport {
    shared: Arc<LanShared>,
}

struct LanShared {
    service_type: String,
    node_id: String,
    port: u16,
    provider: Mutex<Option<ProviderId>>,
    daemon: Mutex<Option<ServiceDaemon>>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_group: Mutex<Option<LocalGroup>>,
    registered: Mutex<Option<String>>,
    /// Advertisements whose resolution failed terminally.
    failed: Mutex<HashSet<String>>,
}

impl LanTransport {
    pub fn new(node_id: &str, port: u16) -> Self {
        Self {
            shared: Arc::new(LanShared {
                service_type: SERVICE_TYPE.to_string(),
                node_id: node_id.to_string(),
                port,
                provider: Mutex::new(None),
                daemon: Mutex::new(None),
                task: Mutex::new(None),
                local_group: Mutex::new(None),
                registered: Mutex::new(None),
                failed: Mutex::new(HashSet::new()),
            }),
        }
    }

    async fn advertise_inner(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        let Some(local) = self.shared.local_group.lock().unwrap().clone() else {
            return Ok(false);
        };

        let initial_json = serde_json::to_string(&initial)
            .map_err(|e| DiscoveryError::Advertise(format!("encode initial peers: {e}")))?;
        let current_json = serde_json::to_string(&current)
            .map_err(|e| DiscoveryError::Advertise(format!("encode current peers: {e}")))?;

        let host = local_hostname();
        let instance_name = format!("{}.{host}", self.shared.node_id);
        let properties = [
            (PROP_APP_ID.to_string(), local.app_id),
            (PROP_GROUP_NAME.to_string(), local.group_name),
            (PROP_GROUP_UID.to_string(), local.group_uid),
            (PROP_INITIAL_PEERS.to_string(), initial_json),
            (PROP_CURRENT_PEERS.to_string(), current_json),
        ];

        let service = ServiceInfo::new(
            &self.shared.service_type,
            &instance_name,
            &format!("{host}.local."),
            "",
            self.shared.port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::Advertise(format!("create mDNS service info: {e}")))?;

        let fullname = service.get_fullname().to_string();
        let daemon = self.shared.ensure_daemon()?;
        daemon
            .register(service)
            .map_err(|e| DiscoveryError::Advertise(format!("register mDNS service: {e}")))?;
        *self.shared.registered.lock().unwrap() = Some(fullname);

        info!(
            node_id = %self.shared.node_id,
            port = self.shared.port,
            "mDNS: group advertisement registered"
        );
        Ok(true)
    }

    async fn stop_advertising_inner(&self) {
        let fullname = self.shared.registered.lock().unwrap().take();
        if let Some(fullname) = fullname {
            let daemon = self.shared.daemon.lock().unwrap();
            if let Some(daemon) = daemon.as_ref() {
                if let Err(e) = daemon.unregister(&fullname) {
                    warn!("mDNS: failed to unregister: {e}");
                }
            }
        }
    }
}

impl LanShared {
    fn ensure_daemon(&self) -> Result<ServiceDaemon> {
        let mut guard = self.daemon.lock().unwrap();
        if let Some(daemon) = guard.as_ref() {
            return Ok(daemon.clone());
        }
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::StartFailed(format!("create mDNS daemon: {e}")))?;
        *guard = Some(daemon.clone());
        Ok(daemon)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "groupmesh-node".into())
}

fn advertisement_from_info(info: &ServiceInfo) -> Advertisement {
    let mut advert = Advertisement::new(info.get_fullname());
    if let Some(addr) = info.get_addresses().iter().next() {
        advert = advert.with_address(&format!("{addr}:{}", info.get_port()));
    }
    for prop in info.get_properties().iter() {
        advert = advert.with_property(prop.key(), prop.val_str());
    }
    advert
}

/// One bounded re-resolve pass for an instance the primary event carried
/// incomplete TXT data for. A short-lived daemon browses the type until
/// the instance shows up again or the timeout expires.
async fn requery(service_type: &str, fullname: &str) -> Option<Advertisement> {
    let daemon = ServiceDaemon::new().ok()?;
    let receiver = daemon.browse(service_type).ok()?;

    let found = tokio::time::timeout(REQUERY_TIMEOUT, async {
        while let Ok(event) = receiver.recv_async().await {
            if let ServiceEvent::ServiceResolved(info) = event {
                if info.get_fullname() == fullname {
                    return Some(advertisement_from_info(&info));
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    daemon.shutdown().ok();
    found
}

async fn resolve_with_fallback(
    service_type: &str,
    provider_id: ProviderId,
    advert: Advertisement,
) -> Result<ResolvedService> {
    match service_from_advertisement(provider_id, &advert) {
        Ok(service) => Ok(service),
        Err(primary) => {
            debug!(raw = %advert.raw, "mDNS: incomplete TXT data, re-resolving once");
            match requery(service_type, &advert.raw).await {
                Some(retry) => service_from_advertisement(provider_id, &retry),
                None => Err(primary),
            }
        }
    }
}

async fn handle_event(
    shared: &Arc<LanShared>,
    ctx: &TransportContext,
    book: &mut GroupBook,
    event: ServiceEvent,
) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let raw = info.get_fullname().to_string();
            if shared.registered.lock().unwrap().as_deref() == Some(raw.as_str()) {
                return;
            }
            if shared.failed.lock().unwrap().contains(&raw) {
                return;
            }

            let advert = advertisement_from_info(&info);
            match resolve_with_fallback(&shared.service_type, ctx.provider_id(), advert).await {
                Ok(service) => match book.insert(service) {
                    Ok(true) => {
                        info!(raw = %raw, "mDNS: group advertisement resolved");
                        ctx.publish(book.snapshot());
                    }
                    Ok(false) => {}
                    Err(e) => warn!("mDNS: conflicting advertisement dropped: {e}"),
                },
                Err(e) => {
                    shared.failed.lock().unwrap().insert(raw);
                    debug!("mDNS: {e}");
                }
            }
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            shared.failed.lock().unwrap().remove(&fullname);
            let identity = ServiceIdentity::new(ctx.provider_id(), &fullname);
            if let Ok(true) = book.remove(&identity) {
                debug!(raw = %fullname, "mDNS: group advertisement lost");
                ctx.publish(book.snapshot());
            }
        }
        ServiceEvent::SearchStarted(_) => {
            debug!("mDNS: browse started");
        }
        _ => {}
    }
}

#[async_trait]
impl Advertiser for LanTransport {
    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        self.advertise_inner(initial, current).await
    }

    async fn stop_advertising(&self) {
        self.stop_advertising_inner().await;
    }
}

#[async_trait]
impl DiscoveryTransport for LanTransport {
    async fn start_discovery(&self, ctx: TransportContext) -> Result<()> {
        let mut task_guard = self.shared.task.lock().unwrap();
        if task_guard.is_some() {
            return Ok(());
        }

        let daemon = self.shared.ensure_daemon()?;
        let receiver = daemon
            .browse(&self.shared.service_type)
            .map_err(|e| DiscoveryError::StartFailed(format!("start mDNS browse: {e}")))?;
        *self.shared.provider.lock().unwrap() = Some(ctx.provider_id());

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut book = GroupBook::new(ctx.provider_id());
            ctx.publish(book.snapshot());
            loop {
                match tokio::time::timeout(Duration::from_secs(5), receiver.recv_async()).await {
                    Ok(Ok(event)) => handle_event(&shared, &ctx, &mut book, event).await,
                    Ok(Err(_)) => {
                        debug!("mDNS: browse channel closed");
                        break;
                    }
                    Err(_) => {
                        // Timeout, just loop again.
                    }
                }
            }
        });
        *task_guard = Some(handle);
        Ok(())
    }

    async fn stop_discovery(&self) {
        let task = self.shared.task.lock().unwrap().take();
        if let Some(task) = task {
            let daemon = self.shared.daemon.lock().unwrap();
            if let Some(daemon) = daemon.as_ref() {
                daemon.stop_browse(&self.shared.service_type).ok();
            }
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
        resolve_with_fallback(&self.shared.service_type, provider_id, advert).await
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

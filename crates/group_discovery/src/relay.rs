//! Relay transport: rendezvous client of the relay server.
//!
//! Used when devices cannot see each other on the local network. The
//! transport polls the relay's advertisement directory over TCP+mTLS,
//! registers the local group when advertising, and heartbeats to keep
//! the registration alive.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use group_crypto::NodeIdentity;
use group_model::{GroupBook, Peer, ProviderId, ResolvedGroup, ResolvedService, ServiceIdentity};
use group_relay::{
    relay_request, DiscoverRequest, GroupAdvertisement, HeartbeatRequest, RegisterRequest,
    RelayFrame, WithdrawRequest,
};

use crate::transport::{
    service_from_advertisement, Advertisement, Advertiser, AdvertiserHandle, DiscoveryTransport,
    LocalGroup, TransportContext, PROP_APP_ID, PROP_CURRENT_PEERS, PROP_GROUP_NAME,
    PROP_GROUP_UID, PROP_INITIAL_PEERS,
};
use crate::{DiscoveryError, Result};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A quarter of the relay's advertisement TTL.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RelayTransport {
    shared: Arc<RelayShared>,
}

struct RelayShared {
    connector: TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
    relay_addr: String,
    relay_port: u16,
    node_id: String,
    app_id: String,
    provider: StdMutex<Option<ProviderId>>,
    poll_task: StdMutex<Option<JoinHandle<()>>>,
    heartbeat_task: StdMutex<Option<JoinHandle<()>>>,
    local_group: StdMutex<Option<LocalGroup>>,
    token: Mutex<String>,
}

impl RelayTransport {
    pub fn new(
        identity: &NodeIdentity,
        ca_cert_pem: &str,
        app_id: &str,
        relay_addr: &str,
        relay_port: u16,
    ) -> Result<Self> {
        let client_config =
            group_crypto::build_client_config(&identity.cert_pem, &identity.key_pem, ca_cert_pem)
                .map_err(|e| DiscoveryError::StartFailed(format!("relay client TLS config: {e}")))?;

        let server_name = rustls::pki_types::ServerName::try_from("localhost")
            .map_err(|e| DiscoveryError::StartFailed(format!("invalid server name: {e}")))?
            .to_owned();

        Ok(Self {
            shared: Arc::new(RelayShared {
                connector: TlsConnector::from(Arc::new(client_config)),
                server_name,
                relay_addr: relay_addr.to_string(),
                relay_port,
                node_id: identity.node_id.clone(),
                app_id: app_id.to_string(),
                provider: StdMutex::new(None),
                poll_task: StdMutex::new(None),
                heartbeat_task: StdMutex::new(None),
                local_group: StdMutex::new(None),
                token: Mutex::new(String::new()),
            }),
        })
    }

    async fn advertise_inner(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        let Some(local) = self.shared.local_group.lock().unwrap().clone() else {
            return Ok(false);
        };

        let frame = RelayFrame::Register(RegisterRequest {
            node_id: self.shared.node_id.clone(),
            app_id: local.app_id,
            group_uid: local.group_uid.clone(),
            group_name: local.group_name,
            initial_peers: initial,
            current_peers: current,
        });

        let response = self
            .shared
            .request(&frame)
            .await
            .map_err(|e| DiscoveryError::Advertise(format!("relay register: {e}")))?;
        match response {
            RelayFrame::RegisterResp(resp) if resp.success => {
                *self.shared.token.lock().await = resp.token;
                debug!(group_uid = %local.group_uid, "registered with relay server");
                self.ensure_heartbeat();
                Ok(true)
            }
            RelayFrame::RegisterResp(resp) => Err(DiscoveryError::Advertise(resp.error)),
            other => Err(DiscoveryError::Advertise(format!(
                "unexpected relay response: {other:?}"
            ))),
        }
    }

    fn ensure_heartbeat(&self) {
        let mut guard = self.shared.heartbeat_task.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let shared = self.shared.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let token = shared.token.lock().await.clone();
                let Some(local) = shared.local_group.lock().unwrap().clone() else {
                    continue;
                };
                if token.is_empty() {
                    continue;
                }

                let frame = RelayFrame::Heartbeat(HeartbeatRequest {
                    node_id: shared.node_id.clone(),
                    group_uid: local.group_uid,
                    token,
                });
                match shared.request(&frame).await {
                    Ok(RelayFrame::HeartbeatResp(resp)) if resp.alive => {}
                    Ok(RelayFrame::HeartbeatResp(_)) => {
                        warn!("relay: heartbeat rejected, advertisement may have expired");
                    }
                    Ok(other) => warn!("relay: unexpected heartbeat response: {other:?}"),
                    Err(e) => debug!("relay: heartbeat failed: {e}"),
                }
            }
        }));
    }

    async fn stop_advertising_inner(&self) {
        if let Some(task) = self.shared.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }

        let token = std::mem::take(&mut *self.shared.token.lock().await);
        let local = self.shared.local_group.lock().unwrap().clone();
        if token.is_empty() {
            return;
        }
        let Some(local) = local else { return };

        let frame = RelayFrame::Withdraw(WithdrawRequest {
            node_id: self.shared.node_id.clone(),
            group_uid: local.group_uid,
            token,
        });
        if let Err(e) = self.shared.request(&frame).await {
            warn!("relay: withdraw failed: {e}");
        }
    }
}

impl RelayShared {
    async fn request(&self, frame: &RelayFrame) -> group_relay::Result<RelayFrame> {
        relay_request(
            &self.connector,
            &self.server_name,
            &self.relay_addr,
            self.relay_port,
            frame,
        )
        .await
    }
}

fn advertisement_from_group(raw: &str, ad: &GroupAdvertisement) -> Advertisement {
    let mut advert = Advertisement::new(raw)
        .with_property(PROP_APP_ID, &ad.app_id)
        .with_property(PROP_GROUP_NAME, &ad.group_name)
        .with_property(PROP_GROUP_UID, &ad.group_uid);
    if let Ok(json) = serde_json::to_string(&ad.initial_peers) {
        advert = advert.with_property(PROP_INITIAL_PEERS, &json);
    }
    if let Ok(json) = serde_json::to_string(&ad.current_peers) {
        advert = advert.with_property(PROP_CURRENT_PEERS, &json);
    }
    advert
}

async fn run_poller(shared: Arc<RelayShared>, ctx: TransportContext) {
    let provider_id = ctx.provider_id();
    let mut book = GroupBook::new(provider_id);
    ctx.publish(book.snapshot());

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;

        let frame = RelayFrame::Discover(DiscoverRequest {
            requester: shared.node_id.clone(),
            app_id: shared.app_id.clone(),
            max_results: 0,
        });
        let response = match shared.request(&frame).await {
            Ok(response) => response,
            Err(e) => {
                debug!("relay: discover poll failed: {e}");
                continue;
            }
        };
        let RelayFrame::DiscoverResp(resp) = response else {
            warn!("relay: unexpected discover response");
            continue;
        };

        let mut announced = HashSet::new();
        let mut changed = false;
        for ad in &resp.advertisements {
            let raw = format!("{}/{}", ad.node_id, ad.group_uid);
            announced.insert(raw.clone());

            let advert = advertisement_from_group(&raw, ad);
            match service_from_advertisement(provider_id, &advert) {
                Ok(service) => match book.insert(service) {
                    Ok(true) => {
                        info!(raw = %raw, "relay: group advertisement resolved");
                        changed = true;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("relay: conflicting advertisement dropped: {e}"),
                },
                Err(e) => debug!("relay: {e}"),
            }
        }

        // Entries the relay no longer returns have expired or withdrawn.
        let vanished: Vec<ServiceIdentity> = book
            .groups()
            .iter()
            .flat_map(|g| g.services())
            .map(|s| s.identity.clone())
            .filter(|identity| !announced.contains(&identity.raw))
            .collect();
        for identity in vanished {
            if let Ok(true) = book.remove(&identity) {
                debug!(raw = %identity.raw, "relay: group advertisement gone");
                changed = true;
            }
        }

        if changed {
            ctx.publish(book.snapshot());
        }
    }
}

#[async_trait]
impl Advertiser for RelayTransport {
    async fn advertise(&self, initial: Vec<Peer>, current: Vec<Peer>) -> Result<bool> {
        self.advertise_inner(initial, current).await
    }

    async fn stop_advertising(&self) {
        self.stop_advertising_inner().await;
    }
}

#[async_trait]
impl DiscoveryTransport for RelayTransport {
    async fn start_discovery(&self, ctx: TransportContext) -> Result<()> {
        let mut guard = self.shared.poll_task.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        *self.shared.provider.lock().unwrap() = Some(ctx.provider_id());
        *guard = Some(tokio::spawn(run_poller(self.shared.clone(), ctx)));
        Ok(())
    }

    async fn stop_discovery(&self) {
        if let Some(task) = self.shared.poll_task.lock().unwrap().take() {
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
        // Relay advertisements carry complete data; no secondary strategy.
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

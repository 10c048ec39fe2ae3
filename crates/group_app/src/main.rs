use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use group_app::{load_config, register_transports};
use group_config::{random_unique_id, ConfigStore, NodeConfiguration};
use group_crypto::{DevCa, PeerKeypair};
use group_discovery::{
    AdvertiserHandle, ControllerEvent, DiscoveryController, JoinRequest,
};
use group_engine::{ConsensusEngine, MockEngine};
use group_model::{Peer, ProviderId, ResolvedService, ServiceIdentity};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(Path::new("groupmesh.toml"))?;

    tracing::info!("groupmesh starting...");
    tracing::info!("data_dir  = {:?}", config.data_dir);
    tracing::info!("app_id    = {}", config.app_id);
    tracing::info!("moniker   = {}", config.moniker);
    tracing::info!("listen    = {}", config.listen);

    std::fs::create_dir_all(&config.data_dir)?;
    let store = ConfigStore::open(&config.data_dir, &config.app_id, config.collision_policy()?)
        .context("open configuration store")?;

    let ca = DevCa::generate().context("generate dev CA")?;
    let identity = ca
        .generate_node_cert("groupmesh-node")
        .context("generate node cert")?;
    tracing::info!("node_id   = {}", identity.node_id);

    let (controller, mut events) = DiscoveryController::new(store);

    let advertiser_slot: Arc<Mutex<Option<AdvertiserHandle>>> = Arc::new(Mutex::new(None));
    let slot = advertiser_slot.clone();
    controller.set_configuration_written(move |path, descriptor, advertiser| {
        tracing::info!(
            dir = %path.display(),
            group = %descriptor.group_name,
            moniker = %descriptor.moniker,
            "configuration directory written"
        );
        *slot.lock().unwrap() = Some(advertiser);
    });

    let providers = register_transports(&controller, &config, &identity, &ca.cert_pem).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ControllerEvent::SnapshotUpdated(snapshot) => {
                    tracing::debug!(
                        provider_id = %snapshot.provider_id,
                        groups = snapshot.groups.len(),
                        "discovery snapshot"
                    );
                }
                ControllerEvent::TransportFailed { provider_id, error } => {
                    tracing::warn!(%provider_id, %error, "transport failed");
                }
            }
        }
    });

    controller.start_discovery().await;

    if let Some(group_name) = &config.found_group {
        found_and_join(
            &controller,
            &config,
            group_name,
            providers[0],
            &advertiser_slot,
        )
        .await?;
    } else {
        tracing::info!(
            "discovering for {} seconds...",
            config.discovery_window_secs
        );
        tokio::time::sleep(Duration::from_secs(config.discovery_window_secs)).await;

        for snapshot in controller.snapshots() {
            for group in &snapshot.groups {
                tracing::info!(
                    provider_id = %snapshot.provider_id,
                    group_uid = %group.group_uid(),
                    group_name = %group.group_name(),
                    members = group.len(),
                    "discovered group"
                );
            }
        }
        controller.stop_discovery().await;
    }

    Ok(())
}

/// Found a brand-new group and join it: the local node is its only
/// member, so the peer lists contain just us.
async fn found_and_join(
    controller: &DiscoveryController,
    config: &group_app::AppConfig,
    group_name: &str,
    provider_id: ProviderId,
    advertiser_slot: &Mutex<Option<AdvertiserHandle>>,
) -> Result<()> {
    let keypair = PeerKeypair::generate();
    let local_peer = Peer::new(&keypair.public_key_hex(), &config.listen, &config.moniker);
    let group_uid = random_unique_id();

    let service = ResolvedService::new(
        ServiceIdentity::new(provider_id, "local"),
        &config.app_id,
        group_name,
        &group_uid,
    )
    .with_address(&config.listen)
    .with_peers(vec![local_peer.clone()], vec![local_peer]);
    controller.add_pseudo_group(service).await?;

    let request = JoinRequest {
        provider_id,
        group_uid: group_uid.clone(),
        configuration: NodeConfiguration::builder()
            .listen(&config.listen)
            .moniker(&config.moniker)
            .build()?,
        private_key_hex: keypair.private_key_hex(),
    };
    let dir = controller.join_group(&request).await?;
    tracing::info!(group_uid = %group_uid, dir = %dir.display(), "founded group");

    let engine = MockEngine::new(&dir);
    engine.start().await?;
    engine
        .submit_transaction(format!("hello from {}", config.moniker).as_bytes())
        .await?;

    // The join handed an advertiser to the configuration-written hook;
    // use it to announce the founded group with the engine's view of the
    // peer lists.
    let advertiser = advertiser_slot.lock().unwrap().take();
    if let Some(advertiser) = advertiser {
        let genesis = engine.genesis_peers().await?;
        let current = engine.current_peers().await?;
        if advertiser.advertise(genesis, current).await? {
            tracing::info!("advertising the founded group");
        }
        tokio::time::sleep(Duration::from_secs(config.discovery_window_secs)).await;
        advertiser.stop_advertising().await;
    }

    let stats = engine.stats().await?;
    tracing::info!(%stats, "engine stats");
    engine.leave().await?;
    Ok(())
}

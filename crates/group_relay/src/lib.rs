//! Rendezvous server for the relay discovery medium.
//!
//! Devices that cannot see each other on a LAN advertise their groups
//! here and discover everyone else's. The server keeps an in-memory
//! directory of group advertisements with per-entry tokens and TTL
//! expiry; it never joins a group itself.
//!
//! Wire protocol: 4-byte LE length prefix + JSON [`RelayFrame`] over
//! TCP+mTLS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use group_crypto::{build_server_config, NodeIdentity};
use group_model::Peer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
const ADVERTISEMENT_TTL: Duration = Duration::from_secs(120);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("TLS configuration: {0}")]
    Tls(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// One frame on the relay wire. Requests come from devices; the server
/// answers every request with exactly one response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Register(RegisterRequest),
    RegisterResp(RegisterResponse),
    Withdraw(WithdrawRequest),
    WithdrawResp(WithdrawResponse),
    Heartbeat(HeartbeatRequest),
    HeartbeatResp(HeartbeatResponse),
    Discover(DiscoverRequest),
    DiscoverResp(DiscoverResponse),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub app_id: String,
    pub group_uid: String,
    pub group_name: String,
    pub initial_peers: Vec<Peer>,
    pub current_peers: Vec<Peer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub token: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub node_id: String,
    pub group_uid: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub group_uid: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub alive: bool,
    pub advertised_groups: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub requester: String,
    pub app_id: String,
    pub max_results: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub advertisements: Vec<GroupAdvertisement>,
}

/// A group advertisement as handed back to discoverers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAdvertisement {
    pub node_id: String,
    pub app_id: String,
    pub group_uid: String,
    pub group_name: String,
    pub initial_peers: Vec<Peer>,
    pub current_peers: Vec<Peer>,
    pub last_seen_ms: u64,
}

/// A registered advertisement in the directory.
#[derive(Debug, Clone)]
pub struct RegisteredGroup {
    pub node_id: String,
    pub app_id: String,
    pub group_uid: String,
    pub group_name: String,
    pub initial_peers: Vec<Peer>,
    pub current_peers: Vec<Peer>,
    pub token: String,
    pub last_seen: Instant,
}

impl RegisteredGroup {
    pub fn is_expired(&self) -> bool {
        self.last_seen.elapsed() > ADVERTISEMENT_TTL
    }

    fn to_advertisement(&self) -> GroupAdvertisement {
        GroupAdvertisement {
            node_id: self.node_id.clone(),
            app_id: self.app_id.clone(),
            group_uid: self.group_uid.clone(),
            group_name: self.group_name.clone(),
            initial_peers: self.initial_peers.clone(),
            current_peers: self.current_peers.clone(),
            last_seen_ms: self.last_seen.elapsed().as_millis() as u64,
        }
    }
}

/// The in-memory advertisement directory, keyed by (advertiser, group).
#[derive(Default)]
pub struct RelayDirectory {
    entries: HashMap<(String, String), RegisteredGroup>,
}

impl RelayDirectory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, req: &RegisterRequest, token: String) -> RegisterResponse {
        if req.node_id.is_empty() || req.group_uid.is_empty() || req.group_name.is_empty() {
            return RegisterResponse {
                success: false,
                token: String::new(),
                error: "node_id, group_uid and group_name required".into(),
            };
        }

        self.entries.insert(
            (req.node_id.clone(), req.group_uid.clone()),
            RegisteredGroup {
                node_id: req.node_id.clone(),
                app_id: req.app_id.clone(),
                group_uid: req.group_uid.clone(),
                group_name: req.group_name.clone(),
                initial_peers: req.initial_peers.clone(),
                current_peers: req.current_peers.clone(),
                token: token.clone(),
                last_seen: Instant::now(),
            },
        );

        info!(
            node = %req.node_id,
            group = %req.group_uid,
            "group advertisement registered"
        );

        RegisterResponse {
            success: true,
            token,
            error: String::new(),
        }
    }

    pub fn withdraw(&mut self, req: &WithdrawRequest) -> WithdrawResponse {
        let key = (req.node_id.clone(), req.group_uid.clone());
        let valid = self
            .entries
            .get(&key)
            .map(|e| e.token == req.token)
            .unwrap_or(false);
        if valid {
            self.entries.remove(&key);
            info!(node = %req.node_id, group = %req.group_uid, "advertisement withdrawn");
        }
        WithdrawResponse { success: valid }
    }

    pub fn heartbeat(&mut self, req: &HeartbeatRequest) -> HeartbeatResponse {
        let key = (req.node_id.clone(), req.group_uid.clone());
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.token == req.token {
                entry.last_seen = Instant::now();
                return HeartbeatResponse {
                    alive: true,
                    advertised_groups: self.entries.len() as u32,
                };
            }
        }
        HeartbeatResponse {
            alive: false,
            advertised_groups: 0,
        }
    }

    /// Everyone else's live advertisements, optionally filtered by app.
    pub fn discover(&self, requester: &str, app_id: &str, max_results: u32) -> DiscoverResponse {
        let max = if max_results == 0 { 30 } else { max_results as usize };

        let advertisements: Vec<GroupAdvertisement> = self
            .entries
            .values()
            .filter(|e| !e.is_expired())
            .filter(|e| e.node_id != requester)
            .filter(|e| app_id.is_empty() || e.app_id == app_id)
            .take(max)
            .map(|e| e.to_advertisement())
            .collect();

        DiscoverResponse { advertisements }
    }

    pub fn remove_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Handle a single request frame. Response frames arriving here are a
/// protocol violation and answered with an error frame.
pub fn handle_frame(dir: &mut RelayDirectory, frame: &RelayFrame) -> RelayFrame {
    match frame {
        RelayFrame::Register(req) => RelayFrame::RegisterResp(dir.register(req, generate_token())),
        RelayFrame::Withdraw(req) => RelayFrame::WithdrawResp(dir.withdraw(req)),
        RelayFrame::Heartbeat(req) => RelayFrame::HeartbeatResp(dir.heartbeat(req)),
        RelayFrame::Discover(req) => {
            RelayFrame::DiscoverResp(dir.discover(&req.requester, &req.app_id, req.max_results))
        }
        _ => RelayFrame::Error {
            message: "unexpected frame".into(),
        },
    }
}

/// Run the rendezvous server with mTLS on the given address.
pub async fn run_relay_server(
    identity: &NodeIdentity,
    ca_cert_pem: &str,
    addr: &str,
    port: u16,
) -> Result<()> {
    let listener = TcpListener::bind((addr, port)).await?;
    info!("relay server listening on {addr}:{port}");
    serve(listener, identity, ca_cert_pem).await
}

/// Serve an already-bound listener. Spawns the expiry sweep task and
/// one task per connection.
pub async fn serve(listener: TcpListener, identity: &NodeIdentity, ca_cert_pem: &str) -> Result<()> {
    let server_config = build_server_config(&identity.cert_pem, &identity.key_pem, ca_cert_pem)
        .map_err(RelayError::Tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let directory = Arc::new(RwLock::new(RelayDirectory::new()));

    let dir_sweep = directory.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = dir_sweep.write().await.remove_expired();
            if removed > 0 {
                debug!("removed {removed} expired advertisements");
            }
        }
    });

    loop {
        let (tcp_stream, peer_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let directory = directory.clone();

        tokio::spawn(async move {
            match acceptor.accept(tcp_stream).await {
                Ok(mut tls_stream) => {
                    debug!("relay connection from {peer_addr}");
                    loop {
                        match read_frame(&mut tls_stream).await {
                            Ok(frame) => {
                                let response = {
                                    let mut dir = directory.write().await;
                                    handle_frame(&mut dir, &frame)
                                };
                                if let Err(e) = write_frame(&mut tls_stream, &response).await {
                                    warn!("failed to write response to {peer_addr}: {e}");
                                    break;
                                }
                            }
                            Err(_) => {
                                debug!("connection from {peer_addr} closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("TLS accept failed from {peer_addr}: {e}");
                }
            }
        });
    }
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &RelayFrame,
) -> Result<()> {
    let data = serde_json::to_vec(frame)?;
    let len = (data.len() as u32).to_le_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<RelayFrame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RelayError::FrameTooLarge(len));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Client-side helper: connect, send one frame, read one response.
pub async fn relay_request(
    connector: &tokio_rustls::TlsConnector,
    server_name: &rustls::pki_types::ServerName<'static>,
    addr: &str,
    port: u16,
    frame: &RelayFrame,
) -> Result<RelayFrame> {
    let tcp = tokio::net::TcpStream::connect((addr, port)).await?;
    let mut tls = connector.connect(server_name.clone(), tcp).await?;

    write_frame(&mut tls, frame).await?;
    let response = read_frame(&mut tls).await?;
    tls.shutdown().await.ok();
    Ok(response)
}

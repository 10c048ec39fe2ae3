//! Peer keys, transport identity, and mTLS configuration.
//!
//! Two key families live here: ed25519 consensus keys that end up in the
//! engine's peers documents and private-key file, and X.509 material for
//! the mTLS relay medium (dev CA + per-node certificates).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};

/// An ed25519 keypair identifying this device as a consensus peer.
#[derive(Clone)]
pub struct PeerKeypair {
    signing: SigningKey,
}

impl PeerKeypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from the single-line hex form stored on disk.
    pub fn from_private_hex(private_hex: &str) -> Result<Self> {
        let bytes = hex::decode(private_hex.trim()).context("decode private key hex")?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }
}

/// A node's transport identity: its ID (derived from the cert
/// fingerprint) and key/cert material for the relay medium.
#[derive(Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// A dev CA bundle: cert, key, and the rcgen objects needed to sign more
/// certs for local development and tests.
pub struct DevCa {
    pub cert_pem: String,
    pub key_pem: String,
    key_pair: KeyPair,
    params: CertificateParams,
}

impl DevCa {
    /// Generate a new self-signed dev CA.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Groupmesh Dev CA");
        dn.push(DnType::OrganizationName, "Groupmesh");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().context("generate CA key pair")?;
        let cert = params
            .clone()
            .self_signed(&key_pair)
            .context("self-sign CA cert")?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            key_pair,
            params,
        })
    }

    /// Generate a node certificate signed by this CA.
    pub fn generate_node_cert(&self, node_name: &str) -> Result<NodeIdentity> {
        let ca_cert = self
            .params
            .clone()
            .self_signed(&self.key_pair)
            .context("rebuild CA cert for signing")?;

        let mut params = CertificateParams::new(vec![
            node_name.to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .context("create node cert params")?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_name);
        dn.push(DnType::OrganizationName, "Groupmesh");
        params.distinguished_name = dn;

        let node_key = KeyPair::generate().context("generate node key pair")?;
        let node_cert = params
            .signed_by(&node_key, &ca_cert, &self.key_pair)
            .context("sign node cert")?;

        let cert_pem = node_cert.pem();
        let key_pem = node_key.serialize_pem();

        Ok(NodeIdentity {
            node_id: node_id_from_cert(&cert_pem),
            cert_pem,
            key_pem,
        })
    }
}

/// Derive a node_id from cert PEM by hashing.
pub fn node_id_from_cert(cert_pem: &str) -> String {
    let fingerprint = hex::encode(Sha256::digest(cert_pem.as_bytes()));
    format!("node-{}", &fingerprint[..16])
}

/// Write cert and key to files in a directory.
pub fn write_identity(identity: &NodeIdentity, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, &identity.cert_pem)?;
    std::fs::write(&key_path, &identity.key_pem)?;
    Ok((cert_path, key_path))
}

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build a rustls ServerConfig for mTLS.
pub fn build_server_config(
    cert_pem: &str,
    key_pem: &str,
    ca_cert_pem: &str,
) -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse server certs")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("parse server key")?
        .context("no private key found")?;

    let mut root_store = rustls::RootCertStore::empty();
    let ca_certs = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse CA cert")?;
    for cert in ca_certs {
        root_store.add(cert).context("add CA to root store")?;
    }

    let client_verifier = rustls::server::WebPkiClientVerifier::builder(root_store.into())
        .build()
        .context("build client verifier")?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .context("build server config")?;

    Ok(config)
}

/// Build a rustls ClientConfig for mTLS.
pub fn build_client_config(
    cert_pem: &str,
    key_pem: &str,
    ca_cert_pem: &str,
) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse client certs")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("parse client key")?
        .context("no private key found")?;

    let mut root_store = rustls::RootCertStore::empty();
    let ca_certs = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse CA cert")?;
    for cert in ca_certs {
        root_store.add(cert).context("add CA to root store")?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)
        .context("build client config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_keypair_round_trips_through_hex() {
        let pair = PeerKeypair::generate();
        let restored = PeerKeypair::from_private_hex(&pair.private_key_hex()).unwrap();
        assert_eq!(restored.public_key_hex(), pair.public_key_hex());
    }

    #[test]
    fn peer_key_hex_is_32_bytes() {
        let pair = PeerKeypair::generate();
        assert_eq!(pair.private_key_hex().len(), 64);
        assert_eq!(pair.public_key_hex().len(), 64);
    }

    #[test]
    fn from_private_hex_rejects_garbage() {
        assert!(PeerKeypair::from_private_hex("not-hex").is_err());
        assert!(PeerKeypair::from_private_hex("abcd").is_err());
    }

    #[test]
    fn generate_dev_ca_succeeds() {
        let ca = DevCa::generate().unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn generate_node_cert_succeeds() {
        let ca = DevCa::generate().unwrap();
        let identity = ca.generate_node_cert("test-node").unwrap();
        assert!(identity.node_id.starts_with("node-"));
        assert!(identity.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(identity.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn two_nodes_different_ids() {
        let ca = DevCa::generate().unwrap();
        let id1 = ca.generate_node_cert("node-alpha").unwrap();
        let id2 = ca.generate_node_cert("node-beta").unwrap();
        assert_ne!(id1.node_id, id2.node_id);
    }

    #[test]
    fn node_id_from_cert_deterministic() {
        let ca = DevCa::generate().unwrap();
        let identity = ca.generate_node_cert("det-node").unwrap();
        assert_eq!(node_id_from_cert(&identity.cert_pem), identity.node_id);
    }

    #[test]
    fn write_and_read_identity() {
        let ca = DevCa::generate().unwrap();
        let identity = ca.generate_node_cert("write-test").unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        let (cert_path, key_path) = write_identity(&identity, tmp.path()).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());
        let read_cert = std::fs::read_to_string(&cert_path).unwrap();
        assert_eq!(read_cert, identity.cert_pem);
    }

    #[test]
    fn build_server_config_succeeds() {
        let ca = DevCa::generate().unwrap();
        let identity = ca.generate_node_cert("server-node").unwrap();
        let config = build_server_config(&identity.cert_pem, &identity.key_pem, &ca.cert_pem);
        assert!(config.is_ok());
    }

    #[test]
    fn build_client_config_succeeds() {
        let ca = DevCa::generate().unwrap();
        let identity = ca.generate_node_cert("client-node").unwrap();
        let config = build_client_config(&identity.cert_pem, &identity.key_pem, &ca.cert_pem);
        assert!(config.is_ok());
    }
}

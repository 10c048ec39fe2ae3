//! Resolved services and their identity keys.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::peer::Peer;

/// Identifies one registered transport inside a controller.
///
/// Assigned randomly at registration; routes user actions back to exactly
/// one transport and lets a transport push only its own snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(Uuid);

impl ProviderId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dedup key for a resolved service: the owning transport plus the raw
/// advertisement identity the medium reported. Deliberately not the group
/// uid, so re-announcements of the same advertisement are dropped while
/// distinct members of one group are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    pub provider_id: ProviderId,
    pub raw: String,
}

impl ServiceIdentity {
    pub fn new(provider_id: ProviderId, raw: &str) -> Self {
        Self {
            provider_id,
            raw: raw.to_string(),
        }
    }
}

/// A transport advertisement resolved into canonical form.
///
/// Immutable once built; the grouping algorithm only moves these records
/// between groups, never edits them.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub identity: ServiceIdentity,
    pub address: Option<String>,
    pub app_id: String,
    pub group_name: String,
    pub group_uid: String,
    pub attributes: BTreeMap<String, String>,
    pub initial_peers: Option<Vec<Peer>>,
    pub current_peers: Option<Vec<Peer>>,
}

impl ResolvedService {
    pub fn new(
        identity: ServiceIdentity,
        app_id: &str,
        group_name: &str,
        group_uid: &str,
    ) -> Self {
        Self {
            identity,
            address: None,
            app_id: app_id.to_string(),
            group_name: group_name.to_string(),
            group_uid: group_uid.to_string(),
            attributes: BTreeMap::new(),
            initial_peers: None,
            current_peers: None,
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_peers(mut self, initial: Vec<Peer>, current: Vec<Peer>) -> Self {
        self.initial_peers = Some(initial);
        self.current_peers = Some(current);
        self
    }

    pub fn provider_id(&self) -> ProviderId {
        self.identity.provider_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_are_unique() {
        assert_ne!(ProviderId::random(), ProviderId::random());
    }

    #[test]
    fn identity_equality_uses_provider_and_raw() {
        let provider = ProviderId::random();
        let a = ServiceIdentity::new(provider, "advert-1");
        let b = ServiceIdentity::new(provider, "advert-1");
        let c = ServiceIdentity::new(provider, "advert-2");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let other = ServiceIdentity::new(ProviderId::random(), "advert-1");
        assert_ne!(a, other);
    }

    #[test]
    fn builder_style_construction() {
        let provider = ProviderId::random();
        let svc = ResolvedService::new(
            ServiceIdentity::new(provider, "raw-1"),
            "chatapp",
            "Team",
            "g1",
        )
        .with_address("10.0.0.9:1337")
        .with_attribute("host", "10.0.0.9")
        .with_peers(vec![Peer::new("aa", "10.0.0.9:1337", "alice")], vec![]);

        assert_eq!(svc.provider_id(), provider);
        assert_eq!(svc.address.as_deref(), Some("10.0.0.9:1337"));
        assert_eq!(svc.attributes.get("host").map(String::as_str), Some("10.0.0.9"));
        assert_eq!(svc.initial_peers.as_ref().unwrap().len(), 1);
        assert_eq!(svc.current_peers.as_ref().unwrap().len(), 0);
    }
}

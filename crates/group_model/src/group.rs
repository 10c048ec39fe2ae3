//! Groups of resolved services sharing one group uid within a transport.

use crate::service::{ProviderId, ResolvedService, ServiceIdentity};
use crate::{ModelError, Result};

/// All resolved services advertising the same group uid, as seen by one
/// transport. Groups are never merged across transports even when their
/// uids coincide.
#[derive(Debug, Clone)]
pub struct ResolvedGroup {
    group_uid: String,
    group_name: String,
    services: Vec<ResolvedService>,
}

impl ResolvedGroup {
    pub fn new(first: ResolvedService) -> Self {
        Self {
            group_uid: first.group_uid.clone(),
            group_name: first.group_name.clone(),
            services: vec![first],
        }
    }

    pub fn group_uid(&self) -> &str {
        &self.group_uid
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Add a member. The service must advertise this group's uid and name;
    /// a mismatch is a contract violation by the caller, not a retryable
    /// failure.
    pub fn add(&mut self, service: ResolvedService) -> Result<()> {
        if service.group_uid != self.group_uid || service.group_name != self.group_name {
            return Err(ModelError::GroupMismatch {
                group_uid: self.group_uid.clone(),
                group_name: self.group_name.clone(),
                found_uid: service.group_uid,
                found_name: service.group_name,
                raw: service.identity.raw,
            });
        }
        self.services.push(service);
        Ok(())
    }

    /// Remove a member. Removing an absent member is a precondition
    /// failure, never a silent no-op. Returns whether the group is now
    /// empty.
    pub fn remove(&mut self, identity: &ServiceIdentity) -> Result<bool> {
        let position = self
            .services
            .iter()
            .position(|s| &s.identity == identity)
            .ok_or_else(|| ModelError::UnknownMember {
                group_uid: self.group_uid.clone(),
                raw: identity.raw.clone(),
            })?;
        self.services.remove(position);
        Ok(self.services.is_empty())
    }

    pub fn contains(&self, identity: &ServiceIdentity) -> bool {
        self.services.iter().any(|s| &s.identity == identity)
    }

    /// Any member of the group; which one is unspecified.
    pub fn any_member(&self) -> Option<&ResolvedService> {
        self.services.first()
    }

    pub fn services(&self) -> &[ResolvedService] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn provider_id(&self) -> Option<ProviderId> {
        self.services.first().map(|s| s.provider_id())
    }
}

/// Compact summary of a group handed to callers at join time.
#[derive(Debug, Clone)]
pub struct GroupDescriptor {
    pub provider_id: ProviderId,
    pub app_id: String,
    pub group_uid: String,
    pub group_name: String,
    pub moniker: String,
}

impl GroupDescriptor {
    /// Describe a group, attaching the local moniker chosen for the join.
    pub fn for_join(group: &ResolvedGroup, moniker: &str) -> Option<Self> {
        let member = group.any_member()?;
        Some(Self {
            provider_id: member.provider_id(),
            app_id: member.app_id.clone(),
            group_uid: group.group_uid.clone(),
            group_name: group.group_name.clone(),
            moniker: moniker.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(provider: ProviderId, raw: &str, uid: &str, name: &str) -> ResolvedService {
        ResolvedService::new(ServiceIdentity::new(provider, raw), "chatapp", name, uid)
    }

    #[test]
    fn add_same_uid_and_name_merges() {
        let provider = ProviderId::random();
        let mut group = ResolvedGroup::new(service(provider, "a", "g1", "Team"));
        group.add(service(provider, "b", "g1", "Team")).unwrap();
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn add_mismatched_uid_fails() {
        let provider = ProviderId::random();
        let mut group = ResolvedGroup::new(service(provider, "a", "g1", "Team"));
        let err = group.add(service(provider, "b", "g2", "Team")).unwrap_err();
        assert!(matches!(err, ModelError::GroupMismatch { .. }));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn add_mismatched_name_fails() {
        let provider = ProviderId::random();
        let mut group = ResolvedGroup::new(service(provider, "a", "g1", "Team"));
        let err = group.add(service(provider, "b", "g1", "Other")).unwrap_err();
        assert!(matches!(err, ModelError::GroupMismatch { .. }));
    }

    #[test]
    fn remove_returns_empty_flag() {
        let provider = ProviderId::random();
        let mut group = ResolvedGroup::new(service(provider, "a", "g1", "Team"));
        group.add(service(provider, "b", "g1", "Team")).unwrap();

        let empty = group
            .remove(&ServiceIdentity::new(provider, "a"))
            .unwrap();
        assert!(!empty);

        let empty = group
            .remove(&ServiceIdentity::new(provider, "b"))
            .unwrap();
        assert!(empty);
        assert!(group.is_empty());
    }

    #[test]
    fn remove_absent_member_is_an_error() {
        let provider = ProviderId::random();
        let mut group = ResolvedGroup::new(service(provider, "a", "g1", "Team"));
        let err = group
            .remove(&ServiceIdentity::new(provider, "missing"))
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownMember { .. }));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn empty_iff_no_members() {
        let provider = ProviderId::random();
        let mut group = ResolvedGroup::new(service(provider, "a", "g1", "Team"));
        assert!(!group.is_empty());
        group.remove(&ServiceIdentity::new(provider, "a")).unwrap();
        assert!(group.is_empty());
        assert_eq!(group.len(), 0);
    }

    #[test]
    fn descriptor_carries_moniker_and_owner() {
        let provider = ProviderId::random();
        let group = ResolvedGroup::new(service(provider, "a", "g1", "Team"));
        let desc = GroupDescriptor::for_join(&group, "alice").unwrap();
        assert_eq!(desc.provider_id, provider);
        assert_eq!(desc.group_uid, "g1");
        assert_eq!(desc.group_name, "Team");
        assert_eq!(desc.moniker, "alice");
    }
}

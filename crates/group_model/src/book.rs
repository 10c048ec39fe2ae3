//! The shared dedup/grouping algorithm every transport consumes.

use std::collections::HashSet;

use tracing::debug;

use crate::group::ResolvedGroup;
use crate::service::{ProviderId, ResolvedService, ServiceIdentity};
use crate::Result;

/// A transport's complete view of its discovered groups at one instant,
/// keyed by the owning provider id. Possibly empty.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub provider_id: ProviderId,
    pub groups: Vec<ResolvedGroup>,
}

/// Per-transport grouping state. Exactly one transport owns and mutates a
/// book; everyone else only sees the snapshots it publishes.
#[derive(Debug)]
pub struct GroupBook {
    provider_id: ProviderId,
    seen: HashSet<ServiceIdentity>,
    groups: Vec<ResolvedGroup>,
}

impl GroupBook {
    pub fn new(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            seen: HashSet::new(),
            groups: Vec::new(),
        }
    }

    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    /// Fold a freshly resolved service into the book.
    ///
    /// A service whose identity key was already resolved is dropped
    /// (idempotent dedup, returns `false`). Otherwise it joins the group
    /// with a matching uid, or founds a new single-member group. A
    /// uid/name mismatch against the matching group is an invariant
    /// violation and leaves the book unchanged.
    pub fn insert(&mut self, service: ResolvedService) -> Result<bool> {
        if self.seen.contains(&service.identity) {
            debug!(raw = %service.identity.raw, "duplicate advertisement dropped");
            return Ok(false);
        }

        let identity = service.identity.clone();
        match self
            .groups
            .iter_mut()
            .find(|g| g.group_uid() == service.group_uid)
        {
            Some(group) => group.add(service)?,
            None => self.groups.push(ResolvedGroup::new(service)),
        }

        self.seen.insert(identity);
        Ok(true)
    }

    /// Handle a "service lost" signal. A loss for a service that was
    /// never resolved is dropped silently (returns `false`); a known
    /// service is removed from its group, and the group itself is removed
    /// once empty.
    pub fn remove(&mut self, identity: &ServiceIdentity) -> Result<bool> {
        let Some(position) = self.groups.iter().position(|g| g.contains(identity)) else {
            debug!(raw = %identity.raw, "loss signal for unresolved service ignored");
            return Ok(false);
        };

        self.seen.remove(identity);
        if self.groups[position].remove(identity)? {
            self.groups.remove(position);
        }
        Ok(true)
    }

    /// Install a synthetic group, replacing any existing group with the
    /// same uid. The caller must have stopped this transport's discovery
    /// first so a real same-uid group cannot overwrite the injected one.
    pub fn inject_group(&mut self, group: ResolvedGroup) {
        if let Some(position) = self
            .groups
            .iter()
            .position(|g| g.group_uid() == group.group_uid())
        {
            for service in self.groups[position].services() {
                self.seen.remove(&service.identity);
            }
            self.groups.remove(position);
        }
        for service in group.services() {
            self.seen.insert(service.identity.clone());
        }
        self.groups.push(group);
    }

    pub fn find(&self, group_uid: &str) -> Option<&ResolvedGroup> {
        self.groups.iter().find(|g| g.group_uid() == group_uid)
    }

    pub fn groups(&self) -> &[ResolvedGroup] {
        &self.groups
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.groups.clear();
    }

    /// The complete current view, cloned for publication.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            provider_id: self.provider_id,
            groups: self.groups.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelError;

    fn service(provider: ProviderId, raw: &str, uid: &str, name: &str) -> ResolvedService {
        ResolvedService::new(ServiceIdentity::new(provider, raw), "chatapp", name, uid)
    }

    #[test]
    fn same_uid_services_merge_into_one_group() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        assert!(book.insert(service(provider, "a", "g1", "Team")).unwrap());
        assert!(book.insert(service(provider, "b", "g1", "Team")).unwrap());

        assert_eq!(book.groups().len(), 1);
        assert_eq!(book.groups()[0].len(), 2);
    }

    #[test]
    fn distinct_uids_found_separate_groups() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        book.insert(service(provider, "a", "g1", "Team")).unwrap();
        book.insert(service(provider, "b", "g2", "Crew")).unwrap();
        assert_eq!(book.groups().len(), 2);
    }

    #[test]
    fn duplicate_identity_is_dropped() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        assert!(book.insert(service(provider, "a", "g1", "Team")).unwrap());
        assert!(!book.insert(service(provider, "a", "g1", "Team")).unwrap());
        assert_eq!(book.groups()[0].len(), 1);
    }

    #[test]
    fn mismatched_name_for_same_uid_is_rejected() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        book.insert(service(provider, "a", "g1", "Team")).unwrap();
        let err = book
            .insert(service(provider, "b", "g1", "Other"))
            .unwrap_err();
        assert!(matches!(err, ModelError::GroupMismatch { .. }));

        // The failed insert must not poison the dedup set.
        assert_eq!(book.groups().len(), 1);
        assert_eq!(book.groups()[0].len(), 1);
    }

    #[test]
    fn removing_last_member_drops_the_group() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        book.insert(service(provider, "a", "g1", "Team")).unwrap();
        book.insert(service(provider, "b", "g1", "Team")).unwrap();

        assert!(book.remove(&ServiceIdentity::new(provider, "a")).unwrap());
        assert_eq!(book.groups().len(), 1);

        assert!(book.remove(&ServiceIdentity::new(provider, "b")).unwrap());
        assert!(book.groups().is_empty());
    }

    #[test]
    fn loss_for_unknown_service_is_silently_ignored() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        assert!(!book
            .remove(&ServiceIdentity::new(provider, "ghost"))
            .unwrap());
    }

    #[test]
    fn reinsert_after_loss_is_accepted() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        book.insert(service(provider, "a", "g1", "Team")).unwrap();
        book.remove(&ServiceIdentity::new(provider, "a")).unwrap();
        assert!(book.insert(service(provider, "a", "g1", "Team")).unwrap());
    }

    #[test]
    fn snapshot_reflects_current_state() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        let snap = book.snapshot();
        assert_eq!(snap.provider_id, provider);
        assert!(snap.groups.is_empty());

        book.insert(service(provider, "a", "g1", "Team")).unwrap();
        assert_eq!(book.snapshot().groups.len(), 1);
    }

    #[test]
    fn inject_group_replaces_same_uid() {
        let provider = ProviderId::random();
        let mut book = GroupBook::new(provider);
        book.insert(service(provider, "real", "g1", "Team")).unwrap();

        let synthetic = ResolvedGroup::new(service(provider, "self", "g1", "Team"));
        book.inject_group(synthetic);

        assert_eq!(book.groups().len(), 1);
        assert_eq!(book.groups()[0].len(), 1);
        assert_eq!(book.groups()[0].services()[0].identity.raw, "self");
    }
}

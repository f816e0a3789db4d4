use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use redirection_core::EndpointId;

use crate::session::{Session, SessionSnapshot};

/// In-memory table of active sessions, one per endpoint.
///
/// Each endpoint's slot is guarded by its own shard lock, so admission for one
/// endpoint never waits on traffic for another. Clones share the same table.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<DashMap<EndpointId, Arc<Session>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` only if `endpoint_id` has no entry. Returns `false`
    /// without touching the table otherwise.
    pub fn try_register(&self, endpoint_id: EndpointId, session: Arc<Session>) -> bool {
        match self.sessions.entry(endpoint_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        }
    }

    pub fn lookup(&self, endpoint_id: &EndpointId) -> Option<Arc<Session>> {
        self.sessions
            .get(endpoint_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes whatever session is registered for `endpoint_id`. A missing
    /// entry is not an error.
    pub fn remove(&self, endpoint_id: &EndpointId) -> Option<Arc<Session>> {
        self.sessions
            .remove(endpoint_id)
            .map(|(_, session)| session)
    }

    /// Removes the entry only while it still points at `session`, so a stale
    /// cleanup never evicts a newer session for the same endpoint.
    pub fn remove_if_current(&self, endpoint_id: &EndpointId, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(endpoint_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions()
            .iter()
            .map(|session| session.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.handle.endpoint_id.cmp(&b.handle.endpoint_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::ScriptedChannel;
    use crate::negotiator::Negotiated;
    use bytes::BytesMut;
    use redirection_core::{AuthType, ProtocolVersion, RedirectionKind};
    use std::sync::Barrier;

    fn session(endpoint: &str) -> Arc<Session> {
        let negotiated = Negotiated {
            auth_type: AuthType::Query,
            version: ProtocolVersion::default(),
            rejected: Vec::new(),
            leftover: BytesMut::new(),
        };
        Arc::new(Session::new(
            endpoint.into(),
            RedirectionKind::Sol,
            negotiated,
            Arc::new(ScriptedChannel::new()),
        ))
    }

    #[test_timeout::timeout]
    fn second_registration_is_refused_without_mutation() {
        let registry = ConnectionRegistry::new();
        let first = session("dev-1");
        let second = session("dev-1");

        assert!(registry.try_register("dev-1".into(), Arc::clone(&first)));
        assert!(!registry.try_register("dev-1".into(), second));

        let current = registry.lookup(&"dev-1".into()).unwrap();
        assert!(Arc::ptr_eq(&current, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.try_register("dev-1".into(), session("dev-1"));

        assert!(registry.remove(&"dev-1".into()).is_some());
        assert!(registry.remove(&"dev-1".into()).is_none());
        assert!(registry.remove(&"never".into()).is_none());
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn stale_cleanup_keeps_newer_session() {
        let registry = ConnectionRegistry::new();
        let old = session("dev-1");
        let new = session("dev-1");
        registry.try_register("dev-1".into(), Arc::clone(&old));
        registry.remove(&"dev-1".into());
        registry.try_register("dev-1".into(), Arc::clone(&new));

        assert!(!registry.remove_if_current(&"dev-1".into(), &old));
        assert!(registry.lookup(&"dev-1".into()).is_some());
        assert!(registry.remove_if_current(&"dev-1".into(), &new));
        assert!(registry.lookup(&"dev-1".into()).is_none());
    }

    #[test_timeout::timeout]
    fn racing_registrations_admit_exactly_one() {
        const CONTENDERS: usize = 16;
        let registry = ConnectionRegistry::new();
        let barrier = Arc::new(Barrier::new(CONTENDERS));

        let handles: Vec<_> = (0..CONTENDERS)
            .map(|_| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                let candidate = session("dev-1");
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.try_register("dev-1".into(), candidate)
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn snapshot_is_sorted_by_endpoint() {
        let registry = ConnectionRegistry::new();
        for id in ["dev-3", "dev-1", "dev-2"] {
            registry.try_register(id.into(), session(id));
        }
        let ids: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|snapshot| snapshot.handle.endpoint_id.to_string())
            .collect();
        assert_eq!(ids, vec!["dev-1", "dev-2", "dev-3"]);
    }
}

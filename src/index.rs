use std::collections::HashMap;
use std::sync::Arc;

use crate::session::Session;
use crate::shared::ConnectionId;

/// Routing index for inbound datagrams.
///
/// A session is registered under one primary CID and any number of
/// aliases pointing back at it. No CID is ever both a primary and an
/// alias; an alias whose primary has vanished is an internal logic error
/// and fails loudly.
pub(crate) struct CidIndex<S: Session> {
    sessions: HashMap<ConnectionId, Arc<S>>,
    aliases: HashMap<ConnectionId, ConnectionId>,
}

impl<S: Session> CidIndex<S> {
    pub(crate) fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Resolves a CID to its session, following one level of aliasing.
    pub(crate) fn find(&self, cid: &ConnectionId) -> Option<&Arc<S>> {
        if let Some(session) = self.sessions.get(cid) {
            return Some(session);
        }
        let primary = self.aliases.get(cid)?;
        Some(
            self.sessions
                .get(primary)
                .expect("alias bound to a missing primary CID"),
        )
    }

    pub(crate) fn insert_primary(&mut self, cid: ConnectionId, session: Arc<S>) {
        debug_assert!(!self.aliases.contains_key(&cid));
        self.sessions.insert(cid, session);
    }

    pub(crate) fn insert_alias(&mut self, alias: ConnectionId, primary: ConnectionId) {
        assert!(
            self.sessions.contains_key(&primary),
            "alias registered for an unknown primary CID"
        );
        debug_assert!(!self.sessions.contains_key(&alias));
        self.aliases.insert(alias, primary);
    }

    /// Unbinds an alias, yielding the primary it pointed at.
    pub(crate) fn remove_alias(&mut self, alias: &ConnectionId) -> Option<ConnectionId> {
        self.aliases.remove(alias)
    }

    /// Unbinds a primary CID and every alias pointing at it.
    pub(crate) fn remove_primary(&mut self, cid: &ConnectionId) -> Option<Arc<S>> {
        let session = self.sessions.remove(cid)?;
        self.aliases.retain(|_, primary| primary != cid);
        Some(session)
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn alias_count(&self) -> usize {
        self.aliases.len()
    }
}

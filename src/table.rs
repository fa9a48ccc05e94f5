// Active transfers, keyed by the full (address, port) of the client.
//
// Keying by address alone would mix up two clients behind the same NAT, or two transfers started
// from the same host.

use crate::session::Session;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SocketAddr, Session>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn resolve(&self, peer: &SocketAddr) -> Option<&Session> {
        self.sessions.get(peer)
    }

    pub fn resolve_mut(&mut self, peer: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(peer)
    }

    /// Inserts `session` under its peer. Whatever the peer had before is dropped and handed back.
    pub fn create_or_replace(&mut self, session: Session) -> Option<Session> {
        self.sessions.insert(session.peer(), session)
    }

    pub fn remove(&mut self, peer: &SocketAddr) -> Option<Session> {
        self.sessions.remove(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// The earliest point at which some session's outstanding message times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter(|s| !s.is_finished())
            .map(Session::deadline)
            .min()
    }

    /// Removes and returns every session that reached `Complete` or `Failed`.
    pub fn drain_finished(&mut self) -> Vec<Session> {
        let finished: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_finished())
            .map(|(peer, _)| *peer)
            .collect();

        finished.iter().filter_map(|peer| self.remove(peer)).collect()
    }
}

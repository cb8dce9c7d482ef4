//! Connected-peer sessions and the registry that owns them.

use std::collections::HashMap;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;

use shared::codec::frame;
use shared::packets::Packet;

use crate::entity::EntityId;
use crate::network::Outgoing;

/// Where a session stands in the credential pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Connected; only whitelisted packets are dispatched.
    Unauthenticated,
    /// A login or registration request is in flight; gameplay packets are
    /// ignored until it resolves.
    Authenticating,
    Authenticated,
}

/// Liveness-checked reference to a session, safe to stash inside deferred
/// callbacks. If the peer disconnects and the id is reused, the generation
/// no longer matches and resolution fails instead of touching the newcomer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub peer_id: u32,
    pub generation: u64,
}

/// Server-side state of one connected peer.
#[derive(Debug)]
pub struct PlayerSession {
    pub peer_id: u32,
    pub generation: u64,
    pub auth_state: AuthState,
    /// Primary key of the account row once authenticated.
    pub database_id: Option<i32>,
    pub login: String,
    pub display_name: String,
    pub permission_level: u16,
    pub arena_index: Option<usize>,
    pub controlled_entity: Option<EntityId>,
    /// Timestamp of the newest movement input accepted from this peer.
    pub last_input_time: u64,
    pub last_shoot_time: u64,
    outgoing: UnboundedSender<Outgoing>,
}

impl PlayerSession {
    fn new(peer_id: u32, generation: u64, outgoing: UnboundedSender<Outgoing>) -> Self {
        Self {
            peer_id,
            generation,
            auth_state: AuthState::Unauthenticated,
            database_id: None,
            login: String::new(),
            display_name: String::new(),
            permission_level: 0,
            arena_index: None,
            controlled_entity: None,
            last_input_time: 0,
            last_shoot_time: 0,
            outgoing,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            peer_id: self.peer_id,
            generation: self.generation,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state == AuthState::Authenticated
    }

    /// Encodes, frames and queues a packet for this peer. A send failure
    /// means the writer task is already gone; the disconnect event is on its
    /// way, so the packet is just dropped.
    pub fn send_packet(&self, packet: &Packet) {
        let framed = frame(&packet.encode());
        if self.outgoing.send(Outgoing::Frame(framed)).is_err() {
            debug!("dropping packet for departing peer {}", self.peer_id);
        }
    }

    /// Asks the writer task to flush and close the connection.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

/// All live sessions, keyed by peer id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<u32, PlayerSession>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the session for a freshly connected peer.
    pub fn insert(&mut self, peer_id: u32, outgoing: UnboundedSender<Outgoing>) -> SessionHandle {
        let generation = self.next_generation;
        self.next_generation += 1;

        let session = PlayerSession::new(peer_id, generation, outgoing);
        let handle = session.handle();

        if self.sessions.insert(peer_id, session).is_some() {
            warn!("peer id {} reused while session still registered", peer_id);
        }

        handle
    }

    pub fn remove(&mut self, peer_id: u32) -> Option<PlayerSession> {
        self.sessions.remove(&peer_id)
    }

    pub fn get(&self, peer_id: u32) -> Option<&PlayerSession> {
        self.sessions.get(&peer_id)
    }

    pub fn get_mut(&mut self, peer_id: u32) -> Option<&mut PlayerSession> {
        self.sessions.get_mut(&peer_id)
    }

    /// Resolves a handle, failing if the peer disconnected since the handle
    /// was taken.
    pub fn resolve(&self, handle: SessionHandle) -> Option<&PlayerSession> {
        self.sessions
            .get(&handle.peer_id)
            .filter(|s| s.generation == handle.generation)
    }

    pub fn resolve_mut(&mut self, handle: SessionHandle) -> Option<&mut PlayerSession> {
        self.sessions
            .get_mut(&handle.peer_id)
            .filter(|s| s.generation == handle.generation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_insert_and_resolve() {
        let mut registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = registry.insert(1, tx);

        assert!(registry.resolve(handle).is_some());
        assert_eq!(registry.get(1).unwrap().auth_state, AuthState::Unauthenticated);
    }

    #[test]
    fn test_stale_handle_after_reconnect() {
        let mut registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let old = registry.insert(1, tx.clone());
        registry.remove(1);
        let new = registry.insert(1, tx);

        // Same peer id, different generation: the old handle must not reach
        // the new session.
        assert!(registry.resolve(old).is_none());
        assert!(registry.resolve(new).is_some());
    }

    #[test]
    fn test_send_packet_frames_payload() {
        let mut registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.insert(7, tx);
        registry.get(7).unwrap().send_packet(&Packet::LoginSuccess);

        match rx.try_recv().unwrap() {
            Outgoing::Frame(bytes) => {
                let body = Packet::LoginSuccess.encode();
                assert_eq!(&bytes[..4], &(body.len() as u32).to_le_bytes());
                assert_eq!(&bytes[4..], &body[..]);
            }
            Outgoing::Close => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_send_to_departed_peer_does_not_panic() {
        let mut registry = SessionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        registry.insert(2, tx);
        registry.get(2).unwrap().send_packet(&Packet::LoginSuccess);
    }
}

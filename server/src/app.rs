//! The server application: owns every session and arena, and runs the main
//! loop that serializes network events, deferred callbacks and simulation
//! ticks onto one thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use shared::packets::{Packet, UpdateSpaceshipFailureReason};
use shared::string_table::NetworkStringTable;
use shared::MAX_SPACESHIP_NAME_LENGTH;

use crate::arena::Arena;
use crate::auth::{self, PasswordHasher};
use crate::config::ServerConfig;
use crate::database::{statements, Database, DatabaseValue};
use crate::network::{Outgoing, ServerEvent};
use crate::session::{AuthState, SessionRegistry};

/// Deferred work executed on the main loop with full access to server state.
pub type ServerCallback = Box<dyn FnOnce(&mut ServerApp) + Send>;

pub struct ServerApp {
    pub config: ServerConfig,
    pub sessions: SessionRegistry,
    pub arenas: Vec<Arena>,
    pub string_table: NetworkStringTable,
    pub database: Database,
    pub callback_tx: UnboundedSender<ServerCallback>,
    pub hasher: Arc<PasswordHasher>,
    start: Instant,
}

impl ServerApp {
    pub fn new(
        config: ServerConfig,
        database: Database,
        callback_tx: UnboundedSender<ServerCallback>,
    ) -> Self {
        let hasher = Arc::new(PasswordHasher::new(
            &config.security.password_salt,
            config.security.hash_iterations,
            config.security.hash_length,
        ));

        let mut string_table = NetworkStringTable::new();
        let arenas = vec![Arena::new("utopia", config.game.clone(), &mut string_table)];

        Self {
            config,
            sessions: SessionRegistry::new(),
            arenas,
            string_table,
            database,
            callback_tx,
            hasher,
            start: Instant::now(),
        }
    }

    /// Milliseconds since the server started; the time base of snapshots,
    /// inputs and cooldowns.
    pub fn app_time(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Drives the server until the transport shuts down.
    pub async fn run(
        mut self,
        mut event_rx: UnboundedReceiver<ServerEvent>,
        mut callback_rx: UnboundedReceiver<ServerCallback>,
    ) {
        let tick_rate = self.config.game.tick_rate.max(1);
        let dt = 1.0 / tick_rate as f32;
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(tick_rate)));

        info!("server loop running at {} ticks per second", tick_rate);

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!("transport closed; shutting down");
                            break;
                        }
                    }
                }
                callback = callback_rx.recv() => {
                    if let Some(callback) = callback {
                        callback(&mut self);
                    }
                }
                _ = ticker.tick() => {
                    self.tick(dt);
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected {
                peer_id,
                address,
                outgoing,
            } => self.handle_connect(peer_id, address, outgoing),
            ServerEvent::Disconnected { peer_id } => self.handle_disconnect(peer_id),
            ServerEvent::Packet { peer_id, data } => self.handle_packet(peer_id, &data),
        }
    }

    pub fn tick(&mut self, dt: f32) {
        let now_ms = self.start.elapsed().as_millis() as u64;
        for arena in &mut self.arenas {
            arena.update(&mut self.sessions, now_ms, dt);
        }
    }

    fn handle_connect(
        &mut self,
        peer_id: u32,
        address: SocketAddr,
        outgoing: UnboundedSender<Outgoing>,
    ) {
        if self.sessions.len() >= self.config.network.max_clients {
            warn!("refusing {}: server full", address);
            let _ = outgoing.send(Outgoing::Close);
            return;
        }

        info!("peer {} connected from {}", peer_id, address);
        self.sessions.insert(peer_id, outgoing);

        if let Some(session) = self.sessions.get(peer_id) {
            session.send_packet(&self.string_table.build_packet(0));
        }
    }

    fn handle_disconnect(&mut self, peer_id: u32) {
        let arena_index = self.sessions.get(peer_id).and_then(|s| s.arena_index);

        if let Some(index) = arena_index {
            if let Some(arena) = self.arenas.get_mut(index) {
                arena.handle_player_leave(&mut self.sessions, peer_id);
            }
        }

        if let Some(session) = self.sessions.remove(peer_id) {
            session.close();
            if session.is_authenticated() {
                info!("peer {} ({}) disconnected", peer_id, session.login);
            } else {
                info!("peer {} disconnected", peer_id);
            }
        }
    }

    /// Terminates a connection after a protocol violation.
    fn disconnect_peer(&mut self, peer_id: u32, why: &str) {
        warn!("disconnecting peer {}: {}", peer_id, why);
        self.handle_disconnect(peer_id);
    }

    fn handle_packet(&mut self, peer_id: u32, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                self.disconnect_peer(peer_id, &format!("malformed packet: {}", err));
                return;
            }
        };

        let Some(session) = self.sessions.get(peer_id) else {
            return;
        };

        match session.auth_state {
            // Whatever arrives while credentials are being checked is stale
            // by definition.
            AuthState::Authenticating => return,
            AuthState::Unauthenticated => {
                match packet {
                    Packet::Login {
                        login,
                        password_hash,
                    } => auth::handle_login(self, peer_id, login, password_hash),
                    Packet::Register {
                        login,
                        email,
                        password_hash,
                    } => auth::handle_register(self, peer_id, login, email, password_hash),
                    Packet::TimeSyncRequest { request_id } => {
                        self.handle_time_sync(peer_id, request_id)
                    }
                    other => {
                        debug!(
                            "dropping {} from unauthenticated peer {}",
                            packet_name(&other),
                            peer_id
                        );
                    }
                }
            }
            AuthState::Authenticated => self.dispatch_authenticated(peer_id, packet),
        }
    }

    fn dispatch_authenticated(&mut self, peer_id: u32, packet: Packet) {
        match packet {
            Packet::JoinArena { arena_index } => self.handle_join_arena(peer_id, arena_index),
            Packet::PlayerMovement {
                input_time,
                direction,
                rotation,
            } => self.handle_movement(peer_id, input_time, direction, rotation),
            Packet::PlayerShoot => self.handle_shoot(peer_id),
            Packet::PlayerChat { text } => self.handle_chat(peer_id, text),
            Packet::UpdateSpaceship { name, new_name } => {
                self.handle_update_spaceship(peer_id, name, new_name)
            }
            Packet::TimeSyncRequest { request_id } => self.handle_time_sync(peer_id, request_id),

            // A second authentication attempt on a live session is harmless;
            // ignore it.
            Packet::Login { .. } | Packet::Register { .. } => {
                debug!("ignoring re-authentication from peer {}", peer_id);
            }

            // Server-to-client packets coming back at us mean the peer is not
            // a real client.
            other => {
                self.disconnect_peer(
                    peer_id,
                    &format!("client sent server-only packet {}", packet_name(&other)),
                );
            }
        }
    }

    fn handle_join_arena(&mut self, peer_id: u32, arena_index: u32) {
        let index = arena_index as usize;
        if index >= self.arenas.len() {
            self.disconnect_peer(peer_id, "requested a nonexistent arena");
            return;
        }

        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        if session.arena_index.is_some() {
            debug!("peer {} is already in an arena", peer_id);
            return;
        }
        session.arena_index = Some(index);

        self.arenas[index].handle_player_join(&mut self.sessions, peer_id);
    }

    fn handle_movement(
        &mut self,
        peer_id: u32,
        input_time: u64,
        direction: shared::math::Vec3,
        rotation: shared::math::Vec3,
    ) {
        if !direction.is_finite() || !rotation.is_finite() {
            warn!("dropping non-finite input from peer {}", peer_id);
            return;
        }

        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        let (Some(index), Some(ship)) = (session.arena_index, session.controlled_entity) else {
            return;
        };

        // Out-of-order or replayed input; the newest accepted one wins.
        if input_time <= session.last_input_time {
            debug!("dropping stale input from peer {}", peer_id);
            return;
        }
        session.last_input_time = input_time;

        if let Some(arena) = self.arenas.get_mut(index) {
            arena.handle_movement_input(ship, input_time, direction, rotation);
        }
    }

    fn handle_shoot(&mut self, peer_id: u32) {
        let Some(index) = self.sessions.get(peer_id).and_then(|s| s.arena_index) else {
            return;
        };

        let now_ms = self.start.elapsed().as_millis() as u64;
        if let Some(arena) = self.arenas.get_mut(index) {
            arena.handle_player_shoot(&mut self.sessions, peer_id, now_ms);
        }
    }

    fn handle_chat(&mut self, peer_id: u32, text: String) {
        if text.trim().is_empty() {
            return;
        }

        let Some(session) = self.sessions.get(peer_id) else {
            return;
        };
        let Some(index) = session.arena_index else {
            return;
        };

        let line = format!("{}: {}", session.display_name, text);
        if let Some(arena) = self.arenas.get(index) {
            arena.dispatch_chat(&self.sessions, &line);
        }
    }

    fn handle_update_spaceship(&mut self, peer_id: u32, name: String, new_name: String) {
        let Some(session) = self.sessions.get(peer_id) else {
            return;
        };
        let handle = session.handle();
        let Some(account_id) = session.database_id else {
            return;
        };

        if new_name.is_empty() || new_name.len() > MAX_SPACESHIP_NAME_LENGTH {
            session.send_packet(&Packet::UpdateSpaceshipFailure {
                reason: UpdateSpaceshipFailureReason::ServerError,
            });
            return;
        }

        self.database.execute_prepared(
            statements::UPDATE_SPACESHIP_NAME,
            vec![
                DatabaseValue::Int32(account_id),
                DatabaseValue::Text(name),
                DatabaseValue::Text(new_name),
            ],
            Box::new(move |app, result| {
                let Some(session) = app.sessions.resolve(handle) else {
                    return;
                };

                let packet = match result {
                    Ok(result) if result.affected_rows > 0 => Packet::UpdateSpaceshipSuccess,
                    Ok(_) => Packet::UpdateSpaceshipFailure {
                        reason: UpdateSpaceshipFailureReason::NotFound,
                    },
                    Err(err) => {
                        log::error!("spaceship rename failed: {}", err);
                        Packet::UpdateSpaceshipFailure {
                            reason: UpdateSpaceshipFailureReason::ServerError,
                        }
                    }
                };
                session.send_packet(&packet);
            }),
        );
    }

    fn handle_time_sync(&mut self, peer_id: u32, request_id: u8) {
        let server_time = self.app_time();
        if let Some(session) = self.sessions.get(peer_id) {
            session.send_packet(&Packet::TimeSyncResponse {
                request_id,
                server_time,
            });
        }
    }
}

fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::ArenaPrefabs { .. } => "ArenaPrefabs",
        Packet::ArenaSounds { .. } => "ArenaSounds",
        Packet::ArenaState { .. } => "ArenaState",
        Packet::ChatMessage { .. } => "ChatMessage",
        Packet::ControlEntity { .. } => "ControlEntity",
        Packet::CreateEntity { .. } => "CreateEntity",
        Packet::DeleteEntity { .. } => "DeleteEntity",
        Packet::IntegrityUpdate { .. } => "IntegrityUpdate",
        Packet::JoinArena { .. } => "JoinArena",
        Packet::Login { .. } => "Login",
        Packet::LoginFailure { .. } => "LoginFailure",
        Packet::LoginSuccess => "LoginSuccess",
        Packet::NetworkStrings { .. } => "NetworkStrings",
        Packet::PlayerChat { .. } => "PlayerChat",
        Packet::PlayerMovement { .. } => "PlayerMovement",
        Packet::PlayerShoot => "PlayerShoot",
        Packet::Register { .. } => "Register",
        Packet::RegisterFailure { .. } => "RegisterFailure",
        Packet::RegisterSuccess => "RegisterSuccess",
        Packet::TimeSyncRequest { .. } => "TimeSyncRequest",
        Packet::TimeSyncResponse { .. } => "TimeSyncResponse",
        Packet::UpdateSpaceship { .. } => "UpdateSpaceship",
        Packet::UpdateSpaceshipSuccess => "UpdateSpaceshipSuccess",
        Packet::UpdateSpaceshipFailure { .. } => "UpdateSpaceshipFailure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;
    use shared::codec::frame;
    use shared::math::Vec3;
    use tokio::sync::mpsc;

    fn test_app() -> (ServerApp, UnboundedReceiver<ServerCallback>) {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let memory = MemoryDatabase::new();
        let database = Database::new(1, memory.connection_factory(), callback_tx.clone());
        let app = ServerApp::new(ServerConfig::default(), database, callback_tx);
        (app, callback_rx)
    }

    fn connect(app: &mut ServerApp, peer_id: u32) -> mpsc::UnboundedReceiver<Outgoing> {
        let (tx, rx) = mpsc::unbounded_channel();
        app.handle_connect(peer_id, "127.0.0.1:5000".parse().unwrap(), tx);
        rx
    }

    fn received_packets(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Outgoing::Frame(bytes) = message {
                packets.push(Packet::decode(&bytes[4..]).unwrap());
            }
        }
        packets
    }

    #[test]
    fn test_connect_sends_string_table() {
        let (mut app, _callbacks) = test_app();
        let mut rx = connect(&mut app, 1);

        let packets = received_packets(&mut rx);
        assert!(matches!(
            packets.first(),
            Some(Packet::NetworkStrings { start_id: 0, .. })
        ));
    }

    #[test]
    fn test_malformed_packet_disconnects() {
        let (mut app, _callbacks) = test_app();
        connect(&mut app, 1);

        app.handle_packet(1, &[0xFE, 0x00]);

        assert!(app.sessions.get(1).is_none());
    }

    #[test]
    fn test_unauthenticated_gameplay_packet_dropped_silently() {
        let (mut app, _callbacks) = test_app();
        let mut rx = connect(&mut app, 1);
        received_packets(&mut rx);

        app.handle_packet(1, &Packet::PlayerShoot.encode());

        // Still connected, nothing sent back, nothing simulated.
        assert!(app.sessions.get(1).is_some());
        assert!(received_packets(&mut rx).is_empty());
        assert_eq!(app.arenas[0].player_count(), 0);
    }

    #[test]
    fn test_server_only_packet_from_client_disconnects() {
        let (mut app, _callbacks) = test_app();
        connect(&mut app, 1);
        app.sessions.get_mut(1).unwrap().auth_state = AuthState::Authenticated;

        app.handle_packet(1, &Packet::LoginSuccess.encode());

        assert!(app.sessions.get(1).is_none());
    }

    #[test]
    fn test_time_sync_allowed_before_authentication() {
        let (mut app, _callbacks) = test_app();
        let mut rx = connect(&mut app, 1);
        received_packets(&mut rx);

        app.handle_packet(1, &Packet::TimeSyncRequest { request_id: 7 }.encode());

        let packets = received_packets(&mut rx);
        assert!(matches!(
            packets.first(),
            Some(Packet::TimeSyncResponse { request_id: 7, .. })
        ));
    }

    #[test]
    fn test_join_arena_and_stale_input() {
        let (mut app, _callbacks) = test_app();
        let mut rx = connect(&mut app, 1);
        {
            let session = app.sessions.get_mut(1).unwrap();
            session.auth_state = AuthState::Authenticated;
            session.display_name = "alice".to_string();
        }

        app.handle_packet(1, &Packet::JoinArena { arena_index: 0 }.encode());
        assert_eq!(app.arenas[0].player_count(), 1);
        received_packets(&mut rx);

        let movement = |input_time| Packet::PlayerMovement {
            input_time,
            direction: Vec3::FORWARD,
            rotation: Vec3::ZERO,
        };

        app.handle_packet(1, &movement(100).encode());
        assert_eq!(app.sessions.get(1).unwrap().last_input_time, 100);

        // Older timestamp: dropped, newest accepted input stands.
        app.handle_packet(1, &movement(50).encode());
        assert_eq!(app.sessions.get(1).unwrap().last_input_time, 100);
    }

    #[test]
    fn test_non_finite_input_dropped() {
        let (mut app, _callbacks) = test_app();
        connect(&mut app, 1);
        {
            let session = app.sessions.get_mut(1).unwrap();
            session.auth_state = AuthState::Authenticated;
        }
        app.handle_packet(1, &Packet::JoinArena { arena_index: 0 }.encode());

        let packet = Packet::PlayerMovement {
            input_time: 100,
            direction: Vec3::new(f32::NAN, 0.0, 0.0),
            rotation: Vec3::ZERO,
        };
        app.handle_packet(1, &packet.encode());

        assert_eq!(app.sessions.get(1).unwrap().last_input_time, 0);
        assert!(app.sessions.get(1).is_some());
    }

    #[test]
    fn test_nonexistent_arena_disconnects() {
        let (mut app, _callbacks) = test_app();
        connect(&mut app, 1);
        app.sessions.get_mut(1).unwrap().auth_state = AuthState::Authenticated;

        app.handle_packet(1, &Packet::JoinArena { arena_index: 99 }.encode());

        assert!(app.sessions.get(1).is_none());
    }

    #[test]
    fn test_server_full_refuses_connection() {
        let (mut app, _callbacks) = test_app();
        app.config.network.max_clients = 1;

        connect(&mut app, 1);
        let mut rx = connect(&mut app, 2);

        assert!(app.sessions.get(2).is_none());
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Close)));
    }

    #[test]
    fn test_frame_helper_matches_reader_expectation() {
        let body = Packet::PlayerShoot.encode();
        let framed = frame(&body);
        assert_eq!(&framed[..4], &(body.len() as u32).to_le_bytes());
    }
}

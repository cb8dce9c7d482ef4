//! Integration tests for the arena server
//!
//! These tests run the full stack: real TCP connections, the packet codec,
//! the credential pipeline with its database workers, and the simulation
//! loop with its broadcast schedule.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use server::app::ServerApp;
use server::auth;
use server::config::ServerConfig;
use server::database::{statements, AccountRow, Database, DatabaseValue, MemoryDatabase};
use server::network;
use shared::codec::frame;
use shared::packets::{LoginFailureReason, Packet, RegisterFailureReason};

/// Boots a complete server on an ephemeral port and returns its address.
async fn start_server() -> SocketAddr {
    let mut config = ServerConfig::default();
    // Keep credential checks fast under test.
    config.security.hash_iterations = 10;

    let (callback_tx, callback_rx) = mpsc::unbounded_channel();
    let memory = MemoryDatabase::new();
    let database = Database::new(
        config.database.worker_count,
        memory.connection_factory(),
        callback_tx.clone(),
    );

    let (addr, event_rx) = network::start("127.0.0.1", 0)
        .await
        .expect("failed to bind test server");

    let app = ServerApp::new(config, database, callback_tx);
    tokio::spawn(app.run(event_rx, callback_rx));

    addr
}

async fn send_packet(stream: &mut TcpStream, packet: &Packet) {
    stream
        .write_all(&frame(&packet.encode()))
        .await
        .expect("failed to send packet");
}

async fn read_packet(stream: &mut TcpStream) -> Packet {
    let mut length_bytes = [0u8; 4];
    stream
        .read_exact(&mut length_bytes)
        .await
        .expect("connection closed while reading");
    let mut body = vec![0u8; u32::from_le_bytes(length_bytes) as usize];
    stream
        .read_exact(&mut body)
        .await
        .expect("connection closed mid-frame");
    Packet::decode(&body).expect("received undecodable packet")
}

/// Reads packets until one matches, with a deadline. Returns every packet
/// read, the matching one last.
async fn read_until(stream: &mut TcpStream, matches: fn(&Packet) -> bool) -> Vec<Packet> {
    timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            let packet = read_packet(stream).await;
            let done = matches(&packet);
            seen.push(packet);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("timed out waiting for packet")
}

/// Connects and consumes the string table greeting.
async fn connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("failed to connect");
    let greeting = read_packet(&mut stream).await;
    assert!(matches!(greeting, Packet::NetworkStrings { start_id: 0, .. }));
    stream
}

/// Registers and authenticates an account over the wire.
async fn authenticate(stream: &mut TcpStream, login: &str) {
    send_packet(
        stream,
        &Packet::Register {
            login: login.to_string(),
            email: format!("{}@example.com", login),
            password_hash: format!("{}-client-hash", login),
        },
    )
    .await;
    let packets = read_until(stream, |p| {
        matches!(p, Packet::RegisterSuccess | Packet::RegisterFailure { .. })
    })
    .await;
    assert!(matches!(packets.last(), Some(Packet::RegisterSuccess)));

    send_packet(
        stream,
        &Packet::Login {
            login: login.to_string(),
            password_hash: format!("{}-client-hash", login),
        },
    )
    .await;
    let packets = read_until(stream, |p| {
        matches!(p, Packet::LoginSuccess | Packet::LoginFailure { .. })
    })
    .await;
    assert!(matches!(packets.last(), Some(Packet::LoginSuccess)));
}

/// ACCOUNT LIFECYCLE TESTS
mod account_tests {
    use super::*;

    /// Registering, failing a login, then succeeding, over one connection
    #[tokio::test]
    async fn register_then_login() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;

        send_packet(
            &mut stream,
            &Packet::Register {
                login: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: "secret-hash".to_string(),
            },
        )
        .await;
        let packets = read_until(&mut stream, |p| matches!(p, Packet::RegisterSuccess)).await;
        assert_eq!(packets.len(), 1);

        // Wrong client hash.
        send_packet(
            &mut stream,
            &Packet::Login {
                login: "alice".to_string(),
                password_hash: "wrong-hash".to_string(),
            },
        )
        .await;
        let packets = read_until(&mut stream, |p| matches!(p, Packet::LoginFailure { .. })).await;
        assert!(matches!(
            packets.last(),
            Some(Packet::LoginFailure {
                reason: LoginFailureReason::PasswordMismatch
            })
        ));

        // Correct credentials.
        send_packet(
            &mut stream,
            &Packet::Login {
                login: "alice".to_string(),
                password_hash: "secret-hash".to_string(),
            },
        )
        .await;
        read_until(&mut stream, |p| matches!(p, Packet::LoginSuccess)).await;
    }

    /// A successful login records the account identity on the session
    #[tokio::test]
    async fn login_records_account_identity() {
        let mut config = ServerConfig::default();
        config.security.hash_iterations = 10;

        let (callback_tx, mut callback_rx) = mpsc::unbounded_channel();
        let memory = MemoryDatabase::new();
        let database = Database::new(1, memory.connection_factory(), callback_tx.clone());
        let mut app = ServerApp::new(config, database, callback_tx);

        let salt = "0011";
        let digest = app.hasher.hash("client-hash", salt);
        memory.seed_account(AccountRow {
            id: 7,
            login: "alice".to_string(),
            display_name: "Alice".to_string(),
            email: "alice@example.com".to_string(),
            password: digest,
            password_salt: salt.to_string(),
            permission_level: 0,
            last_login: None,
        });

        let (outgoing_tx, _outgoing_rx) = mpsc::unbounded_channel();
        app.sessions.insert(1, outgoing_tx);

        auth::handle_login(&mut app, 1, "alice".to_string(), "client-hash".to_string());

        // Apply marshalled callbacks the way the main loop would until the
        // session authenticates.
        for _ in 0..8 {
            if app
                .sessions
                .get(1)
                .map_or(false, |s| s.is_authenticated())
            {
                break;
            }
            let callback = timeout(Duration::from_secs(5), callback_rx.recv())
                .await
                .expect("timed out waiting for callback")
                .expect("callback channel closed");
            callback(&mut app);
        }

        let session = app.sessions.get(1).expect("session dropped");
        assert!(session.is_authenticated());
        assert_eq!(session.login, "alice");
        assert_eq!(session.database_id, Some(7));
    }

    /// Unknown accounts get a typed failure, not a disconnect
    #[tokio::test]
    async fn login_unknown_account() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;

        send_packet(
            &mut stream,
            &Packet::Login {
                login: "nobody".to_string(),
                password_hash: "hash".to_string(),
            },
        )
        .await;

        let packets = read_until(&mut stream, |p| matches!(p, Packet::LoginFailure { .. })).await;
        assert!(matches!(
            packets.last(),
            Some(Packet::LoginFailure {
                reason: LoginFailureReason::AccountNotFound
            })
        ));
    }

    /// A second registration with the same login is rejected with a reason
    #[tokio::test]
    async fn duplicate_login_rejected() {
        let addr = start_server().await;
        let mut first = connect(addr).await;
        authenticate(&mut first, "taken").await;

        let mut second = connect(addr).await;
        send_packet(
            &mut second,
            &Packet::Register {
                login: "taken".to_string(),
                email: "other@example.com".to_string(),
                password_hash: "hash".to_string(),
            },
        )
        .await;

        let packets =
            read_until(&mut second, |p| matches!(p, Packet::RegisterFailure { .. })).await;
        assert!(matches!(
            packets.last(),
            Some(Packet::RegisterFailure {
                reason: RegisterFailureReason::LoginAlreadyTaken
            })
        ));
    }

    /// Time synchronization works before authentication
    #[tokio::test]
    async fn time_sync_before_login() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;

        send_packet(&mut stream, &Packet::TimeSyncRequest { request_id: 42 }).await;

        let packets = read_until(&mut stream, |p| {
            matches!(p, Packet::TimeSyncResponse { .. })
        })
        .await;
        assert!(matches!(
            packets.last(),
            Some(Packet::TimeSyncResponse { request_id: 42, .. })
        ));
    }
}

/// ARENA GAMEPLAY TESTS
mod arena_tests {
    use super::*;

    /// The join burst arrives in order and strictly before any snapshot
    #[tokio::test]
    async fn join_burst_precedes_snapshots() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;
        authenticate(&mut stream, "alice").await;

        send_packet(&mut stream, &Packet::JoinArena { arena_index: 0 }).await;

        let packets = read_until(&mut stream, |p| matches!(p, Packet::ArenaState { .. })).await;

        let sounds = packets
            .iter()
            .position(|p| matches!(p, Packet::ArenaSounds { .. }))
            .expect("missing sound table");
        let prefabs = packets
            .iter()
            .position(|p| matches!(p, Packet::ArenaPrefabs { .. }))
            .expect("missing prefab table");
        let control = packets
            .iter()
            .position(|p| matches!(p, Packet::ControlEntity { .. }))
            .expect("missing control assignment");
        let last_create = packets
            .iter()
            .rposition(|p| matches!(p, Packet::CreateEntity { .. }))
            .expect("missing entity burst");
        let first_state = packets.len() - 1;

        assert!(sounds < prefabs);
        assert!(prefabs < last_create);
        assert!(last_create < first_state);
        assert!(control < first_state);

        // The controlled entity was announced in the burst.
        let Some(Packet::ControlEntity { id: controlled }) = packets.get(control) else {
            unreachable!();
        };
        assert!(packets.iter().any(
            |p| matches!(p, Packet::CreateEntity { id, entity_type, .. }
                if id == controlled && entity_type == "spaceship")
        ));
    }

    /// Snapshot ids increase across consecutive broadcasts
    #[tokio::test]
    async fn snapshot_ids_increase() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;
        authenticate(&mut stream, "alice").await;
        send_packet(&mut stream, &Packet::JoinArena { arena_index: 0 }).await;

        let first = read_until(&mut stream, |p| matches!(p, Packet::ArenaState { .. })).await;
        let second = read_until(&mut stream, |p| matches!(p, Packet::ArenaState { .. })).await;

        let state_id = |packets: &[Packet]| match packets.last() {
            Some(Packet::ArenaState { state_id, .. }) => *state_id,
            _ => unreachable!(),
        };

        assert_eq!(state_id(&second), state_id(&first).wrapping_add(1));
    }

    /// A second player's ship is announced to everyone already present
    #[tokio::test]
    async fn players_see_each_other() {
        let addr = start_server().await;

        let mut alice = connect(addr).await;
        authenticate(&mut alice, "alice").await;
        send_packet(&mut alice, &Packet::JoinArena { arena_index: 0 }).await;
        read_until(&mut alice, |p| matches!(p, Packet::ArenaState { .. })).await;

        let mut bob = connect(addr).await;
        authenticate(&mut bob, "bob").await;
        send_packet(&mut bob, &Packet::JoinArena { arena_index: 0 }).await;

        // Bob's burst includes alice's ship.
        let bob_packets = read_until(&mut bob, |p| matches!(p, Packet::ArenaState { .. })).await;
        assert!(bob_packets
            .iter()
            .any(|p| matches!(p, Packet::CreateEntity { name, .. } if name == "alice")));

        // Alice hears about bob's ship without waiting for a snapshot.
        let alice_packets = read_until(&mut alice, |p| {
            matches!(p, Packet::CreateEntity { name, .. } if name == "bob")
        })
        .await;
        assert!(!alice_packets.is_empty());

        // And sees the join announcement.
        read_until(&mut alice, |p| {
            matches!(p, Packet::ChatMessage { message } if message.contains("bob"))
        })
        .await;
    }

    /// Chat lines are relayed with the sender's name
    #[tokio::test]
    async fn chat_is_relayed() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;
        authenticate(&mut stream, "alice").await;
        send_packet(&mut stream, &Packet::JoinArena { arena_index: 0 }).await;
        read_until(&mut stream, |p| matches!(p, Packet::ArenaState { .. })).await;

        send_packet(
            &mut stream,
            &Packet::PlayerChat {
                text: "hello arena".to_string(),
            },
        )
        .await;

        let packets = read_until(&mut stream, |p| {
            matches!(p, Packet::ChatMessage { message } if message.contains("hello arena"))
        })
        .await;
        assert!(matches!(
            packets.last(),
            Some(Packet::ChatMessage { message }) if message.starts_with("alice:")
        ));
    }
}

/// PROTOCOL VIOLATION TESTS
mod protocol_tests {
    use super::*;

    /// An undecodable packet terminates the connection
    #[tokio::test]
    async fn malformed_packet_disconnects() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;

        stream.write_all(&frame(&[0xFE, 0x01, 0x02])).await.unwrap();

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("timed out waiting for close");
        assert_eq!(read.unwrap_or(0), 0);
    }

    /// A frame header announcing an oversized body terminates the connection
    #[tokio::test]
    async fn oversized_frame_disconnects() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;

        stream
            .write_all(&(10_000_000u32).to_le_bytes())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("timed out waiting for close");
        assert_eq!(read.unwrap_or(0), 0);
    }

    /// Gameplay packets sent before login are ignored, not fatal
    #[tokio::test]
    async fn unauthenticated_gameplay_packet_ignored() {
        let addr = start_server().await;
        let mut stream = connect(addr).await;

        send_packet(&mut stream, &Packet::PlayerShoot).await;

        // The connection stays usable.
        send_packet(&mut stream, &Packet::TimeSyncRequest { request_id: 1 }).await;
        read_until(&mut stream, |p| matches!(p, Packet::TimeSyncResponse { .. })).await;
    }
}

/// DATABASE ENGINE TESTS
mod database_tests {
    use super::*;

    /// Worker pool results come back as callbacks on the main-loop channel
    #[tokio::test]
    async fn worker_pool_marshals_results() {
        let (callback_tx, mut callback_rx) = mpsc::unbounded_channel();
        let memory = MemoryDatabase::new();
        let database = Database::new(2, memory.connection_factory(), callback_tx.clone());

        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        database.execute_prepared(
            statements::FIND_ACCOUNT_BY_LOGIN,
            vec![DatabaseValue::Text("ghost".to_string())],
            Box::new(move |_, result| {
                let _ = probe_tx.send(result);
            }),
        );

        // Apply the marshalled callback the way the main loop would.
        let callback = timeout(Duration::from_secs(5), callback_rx.recv())
            .await
            .expect("timed out waiting for database callback")
            .expect("callback channel closed");

        let database2 = Database::new(1, memory.connection_factory(), callback_tx.clone());
        let mut app = ServerApp::new(ServerConfig::default(), database2, callback_tx);
        callback(&mut app);

        let result = probe_rx.try_recv().expect("callback did not run").unwrap();
        assert!(result.rows.is_empty());
    }
}

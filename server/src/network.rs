//! TCP transport: accept loop, per-connection reader and writer tasks, and
//! the event stream they feed into the main loop.
//!
//! Packets travel as length-prefixed frames (4-byte little-endian body
//! length, then the body). Framing violations end the connection; decoding
//! is left to the main loop so the reader task never interprets payloads.

use std::io;
use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use shared::MAX_FRAME_SIZE;

/// What the main loop hears from the transport.
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        peer_id: u32,
        address: SocketAddr,
        outgoing: UnboundedSender<Outgoing>,
    },
    Disconnected {
        peer_id: u32,
    },
    /// A complete frame body, not yet decoded.
    Packet {
        peer_id: u32,
        data: Vec<u8>,
    },
}

/// What the main loop tells a connection's writer task.
#[derive(Debug)]
pub enum Outgoing {
    /// A fully framed packet, written as-is.
    Frame(Vec<u8>),
    /// Flush and close the connection.
    Close,
}

/// Binds the listener and spawns the accept loop. Events for every
/// connection arrive on the returned receiver.
pub async fn start(
    host: &str,
    port: u16,
) -> io::Result<(SocketAddr, UnboundedReceiver<ServerEvent>)> {
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    info!("listening on {}", local_addr);

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(accept_loop(listener, event_tx));

    Ok((local_addr, event_rx))
}

async fn accept_loop(listener: TcpListener, event_tx: UnboundedSender<ServerEvent>) {
    let mut next_peer_id: u32 = 0;

    loop {
        let (stream, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {}", err);
                continue;
            }
        };

        let peer_id = next_peer_id;
        next_peer_id = next_peer_id.wrapping_add(1);

        if stream.set_nodelay(true).is_err() {
            debug!("could not set nodelay for peer {}", peer_id);
        }

        let (read_half, write_half) = stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        if event_tx
            .send(ServerEvent::Connected {
                peer_id,
                address,
                outgoing: outgoing_tx,
            })
            .is_err()
        {
            // Main loop is gone; stop accepting.
            return;
        }

        tokio::spawn(reader_task(peer_id, read_half, event_tx.clone()));
        tokio::spawn(writer_task(peer_id, write_half, outgoing_rx));
    }
}

async fn reader_task(
    peer_id: u32,
    mut read_half: OwnedReadHalf,
    event_tx: UnboundedSender<ServerEvent>,
) {
    loop {
        let mut length_bytes = [0u8; 4];
        if read_half.read_exact(&mut length_bytes).await.is_err() {
            break;
        }

        let length = u32::from_le_bytes(length_bytes) as usize;
        if length == 0 || length > MAX_FRAME_SIZE {
            warn!("peer {} announced a {}-byte frame; closing", peer_id, length);
            break;
        }

        let mut body = vec![0u8; length];
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }

        if event_tx
            .send(ServerEvent::Packet {
                peer_id,
                data: body,
            })
            .is_err()
        {
            return;
        }
    }

    let _ = event_tx.send(ServerEvent::Disconnected { peer_id });
}

async fn writer_task(
    peer_id: u32,
    mut write_half: OwnedWriteHalf,
    mut outgoing_rx: UnboundedReceiver<Outgoing>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        match message {
            Outgoing::Frame(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    debug!("write to peer {} failed", peer_id);
                    break;
                }
            }
            Outgoing::Close => {
                let _ = write_half.flush().await;
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

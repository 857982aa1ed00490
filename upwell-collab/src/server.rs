//! WebSocket relay routing peers into rooms by document id.
//!
//! Architecture:
//! ```text
//! ws://host/{id}/connect/{peerA} ──┐
//!                                   ├── Room (id) ── broadcast ──► every other peer
//! ws://host/{id}/connect/{peerB} ──┘
//! ```
//!
//! The relay does not look inside sync payloads. It forwards every text
//! frame to the rest of the room. A `BYE` frame is forwarded, then the
//! sender is removed. Empty rooms are dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Method;
use crate::room::RoomManager;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Only the method is needed to route a frame.
#[derive(Deserialize)]
struct FrameHead {
    method: Method,
}

pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut route = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match parse_route(req.uri().path()) {
                Some(parsed) => {
                    route = Some(parsed);
                    Ok(resp)
                }
                None => {
                    let body = "expected /{id}/connect/{peerId}".to_string();
                    let mut err = ErrorResponse::new(Some(body));
                    *err.status_mut() = StatusCode::NOT_FOUND;
                    Err(err)
                }
            }
        };
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.write().await.rejected_connections += 1;
                return Err(e.into());
            }
        };
        let Some((doc_id, peer_id)) = route else {
            return Ok(());
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let room = rooms.get_or_create(&doc_id).await;
        if room.peer_count().await >= config.max_peers_per_room && !room.has_peer(&peer_id).await {
            log::warn!("Room {doc_id} is full, refusing {peer_id} from {addr}");
            stats.write().await.rejected_connections += 1;
            let _ = ws_sender.send(Message::Close(None)).await;
            rooms.remove_if_empty(&doc_id).await;
            return Ok(());
        }
        let mut room_rx = room.add_peer(&peer_id).await;
        log::info!("Peer {peer_id} joined room {doc_id} from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = rooms.room_count().await;
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let method = match serde_json::from_str::<FrameHead>(text.as_str()) {
                                Ok(head) => head.method,
                                Err(e) => {
                                    log::warn!("Dropping unreadable frame from {peer_id}: {e}");
                                    continue;
                                }
                            };
                            room.relay(&peer_id, text.as_str().to_string());
                            if method == Method::Bye {
                                log::debug!("Peer {peer_id} said goodbye to {doc_id}");
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("Socket error from {peer_id}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = room_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.from == peer_id {
                                continue;
                            }
                            let text = Message::Text(frame.payload.clone().into());
                            if let Err(e) = ws_sender.send(text).await {
                                log::warn!("Send to {peer_id} failed: {e}");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {peer_id} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        room.remove_peer(&peer_id).await;
        if rooms.remove_if_empty(&doc_id).await {
            log::info!("Room {doc_id} removed (empty)");
        }
        let mut s = stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = rooms.room_count().await;
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// Split `/{id}/connect/{peerId}` into its two ids.
pub fn parse_route(path: &str) -> Option<(String, String)> {
    let mut parts = path.trim_matches('/').split('/');
    let id = parts.next().filter(|s| !s.is_empty())?;
    if parts.next()? != "connect" {
        return None;
    }
    let peer = parts.next().filter(|s| !s.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some((id.to_string(), peer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_parse_route() {
        assert_eq!(
            parse_route("/doc-1/connect/peer-2"),
            Some(("doc-1".to_string(), "peer-2".to_string()))
        );
        assert_eq!(parse_route("/doc-1/connect/"), None);
        assert_eq!(parse_route("/doc-1/listen/peer"), None);
        assert_eq!(parse_route("/a/connect/b/c"), None);
        assert_eq!(parse_route("/"), None);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(server.room_manager().room_count().await, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }
}

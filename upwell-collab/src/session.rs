//! Per-peer sync protocol, free of any socket.
//!
//! A [`SyncSession`] turns incoming [`WireMessage`]s into replica updates,
//! outgoing frames and [`TransportEvent`]s. The async transport feeds it and
//! delivers whatever it returns, so every transition is testable without a
//! network.

use std::collections::HashMap;
use std::time::Instant;

use upwell_core::{Author, Heads, OpRange, PeerState, ReplicatedDoc};

use crate::protocol::{CursorPosition, Method, ProtocolError, WireMessage};

/// Connection lifecycle of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    /// Waiting on the replica to settle with at least one peer
    Syncing,
    /// Every known peer is up to date
    Idle,
    Closed,
}

/// Notifications surfaced to the transport owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Peer { peer_id: String, author: Author },
    PeerDisconnect { peer_id: String, author: Author },
    /// A sync payload introduced new operations.
    Data { author: Author, ops: Vec<OpRange> },
    Cursor { author: Author, cursor: CursorPosition },
    /// Reconnection stopped after this many attempts.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct PeerSyncState {
    pub(crate) state: PeerState,
    /// Consecutive sync payloads from this peer the replica rejected.
    pub retries: u32,
    /// When we last sent this peer a sync payload.
    pub last_attempt_at: Option<Instant>,
}

/// Operations applied by one incoming payload, with the frontier before it.
#[derive(Debug, Clone)]
pub struct Received {
    pub author: Author,
    pub before: Heads,
    pub ops: Vec<OpRange>,
}

/// Everything one transition produced.
#[derive(Debug, Default)]
pub struct Step {
    pub outgoing: Vec<WireMessage>,
    pub events: Vec<TransportEvent>,
    pub received: Option<Received>,
}

pub struct SyncSession {
    peer_id: String,
    author: Author,
    state: TransportState,
    peers: HashMap<String, PeerSyncState>,
}

impl SyncSession {
    pub fn new(peer_id: impl Into<String>, author: Author) -> Self {
        Self {
            peer_id: peer_id.into(),
            author,
            state: TransportState::Connecting,
            peers: HashMap::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerSyncState> {
        self.peers.get(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connecting(&mut self) {
        self.state = TransportState::Connecting;
    }

    /// The socket is up; announce ourselves to the room.
    pub fn opened(&mut self) -> WireMessage {
        self.state = TransportState::Open;
        WireMessage::open(&self.peer_id, &self.author)
    }

    /// The socket is gone. Peer handshakes restart after the next `OPEN`.
    pub fn closed(&mut self) {
        self.state = TransportState::Closed;
        self.peers.clear();
    }

    pub fn bye(&self) -> WireMessage {
        WireMessage::bye(&self.peer_id, &self.author)
    }

    pub fn cursor(&self, cursor: CursorPosition) -> WireMessage {
        WireMessage::cursor(&self.peer_id, &self.author, cursor)
    }

    /// Process one frame from the room.
    pub fn handle(&mut self, doc: &mut dyn ReplicatedDoc, msg: WireMessage) -> Step {
        let mut step = Step::default();
        if msg.peer_id == self.peer_id {
            return step;
        }

        match msg.method {
            Method::Open => {
                log::debug!("peer {} opened", msg.peer_id);
                self.peers.insert(msg.peer_id.clone(), PeerSyncState::default());
                step.events.push(TransportEvent::Peer {
                    peer_id: msg.peer_id.clone(),
                    author: msg.author.clone(),
                });
                self.send_to(doc, &msg.peer_id, &mut step);
            }
            Method::Message => {
                let payload = match msg.payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("{e}");
                        return step;
                    }
                };
                self.state = TransportState::Syncing;
                match self.receive(doc, &msg.peer_id, &payload) {
                    Ok((before, ops)) if !ops.is_empty() => {
                        step.events.push(TransportEvent::Data {
                            author: msg.author.clone(),
                            ops: ops.clone(),
                        });
                        step.received = Some(Received {
                            author: msg.author.clone(),
                            before,
                            ops,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("sync payload from {} rejected: {e}", msg.peer_id),
                }
                self.send_to(doc, &msg.peer_id, &mut step);
                if step.outgoing.is_empty() && self.peers.values().all(|p| p.retries == 0) {
                    self.state = TransportState::Idle;
                }
            }
            Method::Bye => {
                log::debug!("peer {} said goodbye", msg.peer_id);
                self.peers.remove(&msg.peer_id);
                step.events.push(TransportEvent::PeerDisconnect {
                    peer_id: msg.peer_id,
                    author: msg.author,
                });
            }
            Method::Cursor => match msg.cursor {
                Some(cursor) => step.events.push(TransportEvent::Cursor {
                    author: msg.author,
                    cursor,
                }),
                None => {
                    let reason = format!("cursor frame from {} has no cursor", msg.peer_id);
                    log::error!("{}", ProtocolError::MalformedMessage(reason));
                }
            },
        }
        step
    }

    /// Fresh sync payloads for every known peer, after local edits.
    pub fn update_peers(&mut self, doc: &dyn ReplicatedDoc) -> Vec<WireMessage> {
        let mut step = Step::default();
        for peer_id in self.peer_ids() {
            self.send_to(doc, &peer_id, &mut step);
        }
        if !step.outgoing.is_empty() {
            self.state = TransportState::Syncing;
        }
        step.outgoing
    }

    fn receive(
        &mut self,
        doc: &mut dyn ReplicatedDoc,
        peer_id: &str,
        payload: &[u8],
    ) -> Result<(Heads, Vec<OpRange>), ProtocolError> {
        let before = doc.heads();
        let peer = self.peers.entry(peer_id.to_string()).or_default();
        match doc.receive_sync_message(&mut peer.state, payload) {
            Ok(ops) => {
                peer.retries = 0;
                Ok((before, ops))
            }
            Err(e) => {
                peer.retries += 1;
                Err(e.into())
            }
        }
    }

    fn send_to(&mut self, doc: &dyn ReplicatedDoc, peer_id: &str, step: &mut Step) {
        let peer = self.peers.entry(peer_id.to_string()).or_default();
        match doc.generate_sync_message(&mut peer.state) {
            Ok(Some(payload)) => {
                peer.last_attempt_at = Some(Instant::now());
                step.outgoing.push(WireMessage::sync(&self.peer_id, &self.author, &payload));
            }
            Ok(None) => {}
            Err(e) => log::error!("failed to build sync message for {peer_id}: {e}"),
        }
    }
}

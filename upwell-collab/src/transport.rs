//! WebSocket sync transport for one draft or family.
//!
//! Provides:
//! - Connection lifecycle with linear backoff reconnects
//! - Per-peer handshakes driven by [`SyncSession`]
//! - `update_peers` after local edits, `send_cursor` for presence
//! - Deterministic shutdown through `destroy`
//!
//! The socket, the retry timer and the session live in one spawned task.
//! The handle talks to it over a command channel and reads
//! [`TransportEvent`]s from a bounded event channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use upwell_core::{Author, Draft, Heads, OpRange, ReplicatedDoc, Upwell};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::protocol::{CursorPosition, ProtocolError, WireMessage};
use crate::session::{SyncSession, TransportEvent, TransportState};

/// Something a transport can keep in sync.
pub trait SyncTarget: Send + 'static {
    /// Id used in the connection URL.
    fn sync_id(&self) -> String;

    fn replica_mut(&mut self) -> &mut dyn ReplicatedDoc;

    /// A remote payload applied `ops`; `before` is the frontier prior to it.
    fn synced(&mut self, _author: &Author, _before: &Heads, _ops: &[OpRange]) {}

    fn cursor(&mut self, _author: &Author, _cursor: CursorPosition) {}
}

impl SyncTarget for Draft {
    fn sync_id(&self) -> String {
        self.id().to_string()
    }

    fn replica_mut(&mut self) -> &mut dyn ReplicatedDoc {
        Draft::replica_mut(self)
    }

    fn synced(&mut self, _author: &Author, _before: &Heads, _ops: &[OpRange]) {
        self.notify_subscriber();
    }
}

/// Syncs the family metadata: root pointer, authors and archive.
impl SyncTarget for Upwell {
    fn sync_id(&self) -> String {
        self.id()
    }

    fn replica_mut(&mut self) -> &mut dyn ReplicatedDoc {
        self.metadata_mut()
    }

    fn synced(&mut self, _author: &Author, _before: &Heads, _ops: &[OpRange]) {
        self.notify();
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay base URL; `http(s)://` is rewritten to `ws(s)://`
    pub base_url: String,
    /// Attempt `n` waits `n * retry_base_delay` (default: 3s)
    pub retry_base_delay: Duration,
    /// Reconnect attempts before giving up (default: 5)
    pub max_retries: u32,
    /// Event channel capacity (default: 256)
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:9090".to_string(),
            retry_base_delay: Duration::from_secs(3),
            max_retries: 5,
            event_capacity: 256,
        }
    }
}

impl TransportConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// `{base}/{id}/connect/{peer_id}` on a websocket scheme.
    pub fn connect_url(&self, id: &str, peer_id: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/{id}/connect/{peer_id}")
    }
}

#[derive(Debug)]
enum Command {
    UpdatePeers,
    Cursor(CursorPosition),
    Destroy,
}

enum Outcome {
    Destroyed,
    Dropped,
}

/// Handle to a running transport.
pub struct SyncTransport {
    id: String,
    peer_id: String,
    state: Arc<RwLock<TransportState>>,
    command_tx: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    task: Option<JoinHandle<()>>,
}

impl SyncTransport {
    /// Start syncing `target` under a fresh peer id.
    pub async fn connect<T: SyncTarget>(
        target: Arc<Mutex<T>>,
        author: Author,
        config: TransportConfig,
    ) -> Self {
        Self::connect_as(target, Uuid::new_v4().to_string(), author, config).await
    }

    pub async fn connect_as<T: SyncTarget>(
        target: Arc<Mutex<T>>,
        peer_id: impl Into<String>,
        author: Author,
        config: TransportConfig,
    ) -> Self {
        let peer_id = peer_id.into();
        let id = target.lock().await.sync_id();
        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let state = Arc::new(RwLock::new(TransportState::Connecting));

        let runner = Runner {
            url: config.connect_url(&id, &peer_id),
            backoff: Backoff::new(config.retry_base_delay, config.max_retries),
            session: SyncSession::new(peer_id.clone(), author),
            target,
            commands: command_rx,
            events: event_tx,
            state: state.clone(),
            pending_cursor: None,
        };
        let task = tokio::spawn(runner.run());

        Self {
            id,
            peer_id,
            state,
            command_tx,
            event_rx: Some(event_rx),
            task: Some(task),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn state(&self) -> TransportState {
        *self.state.read().await
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Push fresh sync messages to every known peer. Call after local edits.
    pub async fn update_peers(&self) -> Result<(), ProtocolError> {
        self.command(Command::UpdatePeers).await
    }

    pub async fn send_cursor(&self, cursor: CursorPosition) -> Result<(), ProtocolError> {
        self.command(Command::Cursor(cursor)).await
    }

    /// Say goodbye, close the socket and stop reconnecting.
    pub async fn destroy(mut self) {
        let _ = self.command_tx.send(Command::Destroy).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("transport task for {} ended abnormally: {e}", self.id);
            }
        }
    }

    async fn command(&self, command: Command) -> Result<(), ProtocolError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

struct Runner<T> {
    url: String,
    backoff: Backoff,
    session: SyncSession,
    target: Arc<Mutex<T>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<RwLock<TransportState>>,
    /// Latest cursor sent while offline, delivered after the next OPEN.
    pending_cursor: Option<CursorPosition>,
}

impl<T: SyncTarget> Runner<T> {
    async fn run(mut self) {
        loop {
            self.session.connecting();
            self.publish_state().await;

            let url = self.url.clone();
            let connect = tokio_tungstenite::connect_async(url.as_str());
            tokio::pin!(connect);
            let connected = loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    command = self.commands.recv() => {
                        if !self.offline(command) {
                            break None;
                        }
                    }
                }
            };

            let outcome = match connected {
                None => Outcome::Destroyed,
                Some(Ok((ws, _))) => {
                    log::info!("connected to {}", self.url);
                    self.backoff.reset();
                    let outcome = self.drive(ws).await;
                    self.emit(TransportEvent::Disconnected);
                    outcome
                }
                Some(Err(e)) => {
                    log::warn!("connection to {} failed: {e}", self.url);
                    Outcome::Dropped
                }
            };

            self.session.closed();
            self.publish_state().await;
            if let Outcome::Destroyed = outcome {
                log::info!("transport for {} destroyed", self.url);
                return;
            }

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempt();
                log::warn!("giving up on {} after {attempts} attempts", self.url);
                self.emit(TransportEvent::GaveUp { attempts });
                return;
            };
            log::info!(
                "reconnecting to {} in {:?} (attempt {})",
                self.url,
                delay,
                self.backoff.attempt()
            );
            if !self.wait(delay).await {
                return;
            }
        }
    }

    /// Sleep out a retry delay. Returns false if destroyed meanwhile.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => {
                    if !self.offline(command) {
                        return false;
                    }
                }
            }
        }
    }

    /// Take a command while there is no socket. Returns false on destroy.
    fn offline(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Destroy) | None => false,
            // The handshake after the next OPEN carries every local edit.
            Some(Command::UpdatePeers) => true,
            Some(Command::Cursor(cursor)) => {
                log::debug!("holding cursor for {} until reconnected", self.url);
                self.pending_cursor = Some(cursor);
                true
            }
        }
    }

    async fn drive<S>(&mut self, ws: S) -> Outcome
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        let open = self.session.opened();
        if deliver(&mut sink, vec![open]).await.is_err() {
            return Outcome::Dropped;
        }
        self.publish_state().await;
        self.emit(TransportEvent::Connected);

        if let Some(cursor) = self.pending_cursor.take() {
            if deliver(&mut sink, vec![self.session.cursor(cursor)]).await.is_err() {
                self.pending_cursor = Some(cursor);
                return Outcome::Dropped;
            }
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let msg = match WireMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::error!("dropping frame on {}: {e}", self.url);
                                continue;
                            }
                        };
                        let outgoing = self.handle(msg).await;
                        if deliver(&mut sink, outgoing).await.is_err() {
                            return Outcome::Dropped;
                        }
                        self.publish_state().await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return Outcome::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Outcome::Dropped,
                    Some(Err(e)) => {
                        log::warn!("socket error on {}: {e}", self.url);
                        return Outcome::Dropped;
                    }
                    Some(Ok(_)) => {}
                },
                command = self.commands.recv() => match command {
                    Some(Command::UpdatePeers) => {
                        let outgoing = {
                            let mut target = self.target.lock().await;
                            self.session.update_peers(target.replica_mut())
                        };
                        if deliver(&mut sink, outgoing).await.is_err() {
                            return Outcome::Dropped;
                        }
                        self.publish_state().await;
                    }
                    Some(Command::Cursor(cursor)) => {
                        let frame = self.session.cursor(cursor);
                        if deliver(&mut sink, vec![frame]).await.is_err() {
                            return Outcome::Dropped;
                        }
                    }
                    Some(Command::Destroy) | None => {
                        let _ = deliver(&mut sink, vec![self.session.bye()]).await;
                        let _ = sink.close().await;
                        return Outcome::Destroyed;
                    }
                },
            }
        }
    }

    /// Run one frame through the session against the locked target.
    async fn handle(&mut self, msg: WireMessage) -> Vec<WireMessage> {
        let step = {
            let mut target = self.target.lock().await;
            let step = self.session.handle(target.replica_mut(), msg);
            if let Some(received) = &step.received {
                target.synced(&received.author, &received.before, &received.ops);
            }
            for event in &step.events {
                if let TransportEvent::Cursor { author, cursor } = event {
                    target.cursor(author, *cursor);
                }
            }
            step
        };
        for event in step.events {
            self.emit(event);
        }
        step.outgoing
    }

    fn emit(&self, event: TransportEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::warn!("event channel full on {}, dropping {event:?}", self.url);
        }
    }

    async fn publish_state(&self) {
        *self.state.write().await = self.session.state();
    }
}

async fn deliver<S>(sink: &mut S, frames: Vec<WireMessage>) -> Result<(), ProtocolError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    for frame in frames {
        let text = frame.encode()?;
        log::debug!("sending {:?} from {}", frame.method, frame.peer_id);
        sink.send(Message::Text(text.into())).await.map_err(|e| {
            log::warn!("send failed: {e}");
            ProtocolError::ConnectionClosed
        })?;
    }
    Ok(())
}

//! Relay rooms: one broadcast channel per document id.
//!
//! A frame relayed into a room reaches every receiver, the sender's
//! included; connections skip frames they sent themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A text frame tagged with the peer that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub from: String,
    pub payload: String,
}

#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub active_peers: usize,
}

pub struct Room {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    /// Open connections per peer id. A peer may briefly hold two while it
    /// reconnects.
    peers: RwLock<HashMap<String, usize>>,
    capacity: usize,
    frames_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl Room {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            frames_relayed: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
        }
    }

    /// Register a connection for `peer_id` and return its receiver.
    pub async fn add_peer(&self, peer_id: &str) -> broadcast::Receiver<Arc<RelayFrame>> {
        let mut peers = self.peers.write().await;
        *peers.entry(peer_id.to_string()).or_insert(0) += 1;
        self.sender.subscribe()
    }

    /// Drop one connection for `peer_id`. Returns true when none are left.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(peer_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                peers.remove(peer_id);
                true
            }
            None => true,
        }
    }

    /// Fan `payload` out to the room. Returns the number of receivers.
    pub fn relay(&self, from: &str, payload: String) -> usize {
        let bytes = payload.len() as u64;
        let frame = Arc::new(RelayFrame {
            from: from.to_string(),
            payload,
        });
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it meanwhile.
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(self.default_capacity));
        rooms.insert(id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn remove_if_empty(&self, id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(id) {
            if room.peer_count().await == 0 {
                rooms.remove(id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use loralink_core::topic::{resolve, room_code};
use loralink_core::{Event, EventBus, PeerId, Room, RoomKind};

use crate::error::{GridError, Result};
use crate::transfer::TransferEngine;
use crate::transport::{Target, Transport};
use crate::wire::WireMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnectionState {
    status: ConnectionStatus,
    room: Option<Room>,
    initialized: bool,
}

/// Owns the single active room.
///
/// Connects and disconnects are serialized: a second `connect` waits for the
/// first to finish, then replaces its room.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    bus: EventBus,
    transfers: TransferEngine,
    state: Mutex<ConnectionState>,
    op_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, transfers: TransferEngine) -> Self {
        Self {
            transport,
            bus,
            transfers,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Disconnected,
                room: None,
                initialized: false,
            }),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Joins the room for `kind` and `code`, leaving any current room first.
    ///
    /// An invalid code fails before the current room is touched.
    pub async fn connect(&self, kind: RoomKind, code: Option<&str>) -> Result<Room> {
        let raw = code.unwrap_or_default();
        let topic = resolve(kind, raw)?;
        let code = room_code(kind, raw);

        let _op = self.op_lock.lock().await;
        self.disconnect_locked().await;

        self.state.lock().status = ConnectionStatus::Connecting;
        info!("Connecting to {} room {}", kind, &topic[..8]);

        let joined = match self.ensure_initialized().await {
            Ok(()) => self.transport.join(&topic).await,
            Err(e) => Err(e),
        };
        let joined = match joined {
            Ok(joined) => joined,
            Err(e) => {
                self.state.lock().status = ConnectionStatus::Disconnected;
                warn!("Failed to join {} room: {}", kind, e);
                return Err(match e {
                    GridError::ConnectionFailed(_) => e,
                    other => GridError::ConnectionFailed(other.to_string()),
                });
            }
        };

        let mut room = Room::new(kind, topic, code);
        room.peers_count = joined.peers_count;
        {
            let mut state = self.state.lock();
            state.status = ConnectionStatus::Connected;
            state.room = Some(room.clone());
        }

        info!(
            "Joined {} room {} with {} peers",
            kind,
            room.short_topic(),
            room.peers_count
        );
        self.bus.publish(Event::RoomJoined(room.clone()));
        Ok(room)
    }

    /// Leaves the current room. Does nothing when already disconnected.
    pub async fn disconnect(&self) {
        let _op = self.op_lock.lock().await;
        self.disconnect_locked().await;
    }

    async fn disconnect_locked(&self) {
        let room = {
            let mut state = self.state.lock();
            state.status = ConnectionStatus::Disconnected;
            state.room.take()
        };
        let Some(mut room) = room else {
            return;
        };

        if let Err(e) = self.transport.leave().await {
            warn!("Error leaving room {}: {}", room.short_topic(), e);
        }
        let cancelled = self.transfers.cancel_room(&room.topic);
        if cancelled > 0 {
            debug!("Cancelled {} transfers on leaving {}", cancelled, room.short_topic());
        }

        room.active = false;
        room.peers_count = 0;
        info!("Left {} room {}", room.kind, room.short_topic());
        self.bus.publish(Event::RoomLeft(room));
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if self.state.lock().initialized {
            return Ok(());
        }
        self.transport.initialize().await?;
        self.state.lock().initialized = true;
        Ok(())
    }

    /// Applies a peer count reported by the transport. Returns the previous
    /// count when it changed.
    pub fn on_peer_count(&self, peers_count: u32) -> Option<u32> {
        let (topic, previous) = {
            let mut state = self.state.lock();
            match state.room.as_mut() {
                Some(room) if room.peers_count != peers_count => {
                    let previous = std::mem::replace(&mut room.peers_count, peers_count);
                    (room.topic.clone(), previous)
                }
                _ => return None,
            }
        };
        debug!("Room {} now has {} peers", &topic[..8], peers_count);
        self.bus.publish(Event::PeersUpdated { topic, peers_count });
        Some(previous)
    }

    pub async fn broadcast(&self, message: &WireMessage) -> Result<()> {
        self.send(Target::Broadcast, message).await
    }

    pub async fn send_to(&self, peer: &PeerId, message: &WireMessage) -> Result<()> {
        self.send(Target::Peer(peer.clone()), message).await
    }

    async fn send(&self, target: Target, message: &WireMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(GridError::NotConnected);
        }
        let payload = message.encode()?;
        self.transport.send(target, payload).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn current_room(&self) -> Option<Room> {
        self.state.lock().room.clone()
    }

    pub fn room_topic(&self) -> Option<String> {
        self.state.lock().room.as_ref().map(|room| room.topic.clone())
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }
}

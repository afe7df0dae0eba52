use std::sync::Arc;
use tracing::{debug, warn};

use loralink_core::PeerId;

use crate::connection::ConnectionManager;
use crate::registry::AdapterRegistry;
use crate::transfer::{ChunkOutcome, CompletedTransfer, TransferEngine};
use crate::transport::TransportEvent;
use crate::wire::WireMessage;

/// What handling one transport event amounted to.
#[derive(Debug)]
pub enum Routed {
    PeersChanged(u32),
    Announcement { from: PeerId, count: usize },
    Served { to: PeerId, chunks: u32 },
    Chunk,
    Completed(CompletedTransfer),
    /// Undecodable, unexpected, or failed; already logged
    Dropped,
}

/// Hands transport events to the component that owns them.
#[derive(Clone)]
pub struct MessageRouter {
    connection: Arc<ConnectionManager>,
    registry: Arc<AdapterRegistry>,
    transfers: TransferEngine,
}

impl MessageRouter {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<AdapterRegistry>,
        transfers: TransferEngine,
    ) -> Self {
        Self {
            connection,
            registry,
            transfers,
        }
    }

    pub async fn route(&self, event: TransportEvent) -> Routed {
        match event {
            TransportEvent::PeerCountChanged(count) => {
                // Newcomers need our list; nobody re-sends it otherwise
                if let Some(previous) = self.connection.on_peer_count(count) {
                    if count > previous {
                        self.registry.broadcast_shared().await;
                    }
                }
                Routed::PeersChanged(count)
            }
            TransportEvent::Message { from, payload } => match WireMessage::decode(&payload) {
                Ok(message) => self.handle_message(from, message).await,
                Err(e) => {
                    warn!("Undecodable message from {}: {}", from.short_id(), e);
                    Routed::Dropped
                }
            },
        }
    }

    async fn handle_message(&self, from: PeerId, message: WireMessage) -> Routed {
        debug!("{} from {}", message.type_name(), from.short_id());
        match message {
            WireMessage::AdapterList(list) => {
                let count = list.len();
                self.registry.on_peer_announcement(from.clone(), list);
                Routed::Announcement { from, count }
            }
            WireMessage::AdapterRequest { topic } => {
                match self.registry.serve_request(&from, &topic).await {
                    Ok(chunks) => Routed::Served { to: from, chunks },
                    Err(e) => {
                        warn!("Could not serve {} to {}: {}", &topic, from.short_id(), e);
                        Routed::Dropped
                    }
                }
            }
            WireMessage::AdapterChunk(chunk) => match self.transfers.on_chunk(&from, chunk) {
                Ok(ChunkOutcome::Completed(done)) => Routed::Completed(done),
                Ok(ChunkOutcome::Ignored) => Routed::Dropped,
                Ok(_) => Routed::Chunk,
                // Already reported as transfer:error
                Err(_) => Routed::Dropped,
            },
        }
    }
}

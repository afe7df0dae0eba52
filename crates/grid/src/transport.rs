use async_trait::async_trait;
use bytes::Bytes;

use loralink_core::PeerId;

use crate::error::Result;

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    /// Every other peer in the joined topic
    Broadcast,
}

/// What the transport reports when a join succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    pub topic: String,
    pub peers_count: u32,
}

/// Notifications delivered by the transport at arbitrary times.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerCountChanged(u32),
    Message { from: PeerId, payload: Bytes },
}

/// The swarm/DHT layer. Discovery, hole punching and framing all live behind
/// this trait; the rest of the crate only joins topics and moves payloads.
///
/// Implementations hand out their [`TransportEvent`] receiver at
/// construction time.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn join(&self, topic: &str) -> Result<JoinInfo>;
    async fn leave(&self) -> Result<()>;
    async fn send(&self, target: Target, payload: Bytes) -> Result<()>;
    fn local_peer_id(&self) -> PeerId;
}

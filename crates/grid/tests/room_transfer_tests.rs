use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use loralink_core::{checksum, Event, EventBus, EventKind, PeerId, RoomKind, TransferFailure};
use loralink_grid::{
    AdapterRegistry, ConnectionManager, GridError, MemorySwarm, MessageRouter, Routed,
    TransferConfig, TransferEngine, TransportEvent, WireMessage,
};
use loralink_storage::MemoryAdapterStore;

const TEST_CHUNK: usize = 1024;

struct Peer {
    id: PeerId,
    bus: EventBus,
    store: Arc<MemoryAdapterStore>,
    transfers: TransferEngine,
    connection: Arc<ConnectionManager>,
    registry: Arc<AdapterRegistry>,
    router: MessageRouter,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Peer {
    fn new(swarm: &MemorySwarm, name: &str) -> Self {
        let id = PeerId::new(name);
        let bus = EventBus::new();
        let store = Arc::new(MemoryAdapterStore::new());
        let (transport, events) = swarm.endpoint(id.clone());
        let transfers = TransferEngine::with_config(
            bus.clone(),
            TransferConfig {
                chunk_size: TEST_CHUNK,
                ..Default::default()
            },
        );
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(transport),
            bus.clone(),
            transfers.clone(),
        ));
        let registry = Arc::new(AdapterRegistry::new(
            store.clone(),
            connection.clone(),
            transfers.clone(),
            bus.clone(),
        ));
        let router = MessageRouter::new(connection.clone(), registry.clone(), transfers.clone());
        Self {
            id,
            bus,
            store,
            transfers,
            connection,
            registry,
            router,
            events,
        }
    }

    /// Routes everything the transport has delivered so far.
    async fn pump(&mut self) -> Vec<Routed> {
        let mut routed = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            routed.push(self.router.route(event).await);
        }
        routed
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Joins both peers to the pizza room with alice sharing one adapter, and
/// lets bob see the announcement.
async fn pizza_room(swarm: &MemorySwarm, data: &[u8]) -> (Peer, Peer, String) {
    let mut alice = Peer::new(swarm, "alice");
    let mut bob = Peer::new(swarm, "bob");
    alice.store.insert("gemma-lora-v1", data.to_vec());

    alice
        .connection
        .connect(RoomKind::Private, Some("PIZZA-123"))
        .await
        .unwrap();
    let shared = alice.registry.share("gemma-lora-v1").await.unwrap();

    bob.connection
        .connect(RoomKind::Private, Some("  pizza-123 "))
        .await
        .unwrap();
    alice.pump().await;
    bob.pump().await;

    (alice, bob, shared.info.topic)
}

#[tokio::test]
async fn test_private_room_share_and_download() {
    let swarm = MemorySwarm::new();
    let data = payload(5000);
    let mut alice = Peer::new(&swarm, "alice");
    let mut bob = Peer::new(&swarm, "bob");
    alice.store.insert("gemma-lora-v1", data.clone());

    let mut available = bob.bus.channel(&[EventKind::AdaptersAvailable]);
    let mut complete = bob.bus.channel(&[EventKind::TransferComplete]);

    alice
        .connection
        .connect(RoomKind::Private, Some("PIZZA-123"))
        .await
        .unwrap();
    let shared = alice.registry.share("gemma-lora-v1").await.unwrap();
    bob.connection
        .connect(RoomKind::Private, Some("PIZZA-123"))
        .await
        .unwrap();

    alice.pump().await;
    bob.pump().await;

    let mut offered = Vec::new();
    while let Some(Event::AdaptersAvailable(list)) = available.try_recv() {
        offered = list;
    }
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].info.name, "gemma-lora-v1");
    assert_eq!(offered[0].peer_id, alice.id);

    bob.registry
        .request_download(&offered[0].info.topic, Some(&alice.id))
        .await
        .unwrap();
    let served = alice.pump().await;
    assert!(served
        .iter()
        .any(|r| matches!(r, Routed::Served { chunks: 5, .. })));

    let routed = bob.pump().await;
    assert!(routed.iter().any(|r| matches!(r, Routed::Completed(_))));

    match complete.try_recv() {
        Some(Event::TransferComplete { metadata, data: got }) => {
            assert_eq!(metadata.checksum, shared.info.checksum);
            assert_eq!(checksum(&got), shared.info.checksum);
            assert_eq!(&got[..], &data[..]);
        }
        other => panic!("expected transfer:complete, got {other:?}"),
    }
    assert_eq!(bob.transfers.active_count(), 0);
}

#[tokio::test]
async fn test_out_of_order_chunks_reassemble() {
    let swarm = MemorySwarm::new();
    let data = payload(3 * TEST_CHUNK);
    let (mut alice, mut bob, topic) = pizza_room(&swarm, &data).await;

    let captured: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    swarm.set_interceptor(Some(Arc::new(move |_from: &PeerId, _to: &PeerId, payload: Bytes| {
        if let Ok(WireMessage::AdapterChunk(_)) = WireMessage::decode(&payload) {
            sink.lock().push(payload);
            return None;
        }
        Some(payload)
    })));

    bob.registry.request_download(&topic, None).await.unwrap();
    alice.pump().await;
    let chunks = captured.lock().clone();
    assert_eq!(chunks.len(), 3);

    let mut result = None;
    for i in [2usize, 0, 1] {
        let event = TransportEvent::Message {
            from: alice.id.clone(),
            payload: chunks[i].clone(),
        };
        if let Routed::Completed(done) = bob.router.route(event).await {
            result = Some(done.data);
        }
    }
    assert_eq!(result.as_deref(), Some(&data[..]));
}

#[tokio::test]
async fn test_corrupted_chunk_aborts_download() {
    let swarm = MemorySwarm::new();
    let data = payload(4000);
    let (mut alice, mut bob, topic) = pizza_room(&swarm, &data).await;
    let mut errors = bob.bus.channel(&[EventKind::TransferError]);
    let mut complete = bob.bus.channel(&[EventKind::TransferComplete]);

    swarm.set_interceptor(Some(Arc::new(|_from: &PeerId, _to: &PeerId, payload: Bytes| {
        match WireMessage::decode(&payload) {
            Ok(WireMessage::AdapterChunk(mut chunk)) if chunk.index == 1 => {
                let mut bytes = chunk.chunk.to_vec();
                bytes[0] ^= 0xff;
                chunk.chunk = Bytes::from(bytes);
                WireMessage::AdapterChunk(chunk).encode().ok()
            }
            _ => Some(payload),
        }
    })));

    bob.registry.request_download(&topic, None).await.unwrap();
    alice.pump().await;
    bob.pump().await;

    assert!(matches!(
        errors.try_recv(),
        Some(Event::TransferError {
            failure: TransferFailure::ChunkValidation,
            ..
        })
    ));
    assert!(complete.try_recv().is_none());
    assert!(matches!(
        bob.transfers.get_progress(&topic),
        Err(GridError::TransferNotFound(_))
    ));
    assert!(bob.connection.is_connected());
}

#[tokio::test]
async fn test_disconnect_cancels_inflight_download() {
    let swarm = MemorySwarm::new();
    let data = payload(2000);
    let (mut alice, bob, topic) = pizza_room(&swarm, &data).await;
    let mut errors = bob.bus.channel(&[EventKind::TransferError]);

    bob.registry.request_download(&topic, None).await.unwrap();
    assert!(bob.transfers.get_progress(&topic).is_ok());

    bob.connection.disconnect().await;
    assert!(matches!(
        bob.transfers.get_progress(&topic),
        Err(GridError::TransferNotFound(_))
    ));
    assert!(matches!(
        errors.try_recv(),
        Some(Event::TransferError {
            failure: TransferFailure::Cancelled,
            ..
        })
    ));

    // alice cannot reach bob any more; the request is dropped on her side
    let routed = alice.pump().await;
    assert!(routed.iter().any(|r| matches!(r, Routed::Dropped)));
}

#[tokio::test]
async fn test_reannouncement_drops_stale_entries() {
    let swarm = MemorySwarm::new();
    let data = payload(100);
    let (mut alice, mut bob, topic) = pizza_room(&swarm, &data).await;
    assert!(bob.registry.find_available(&topic, None).is_some());

    alice.registry.unshare(&topic).await.unwrap();
    alice.pump().await;
    bob.pump().await;

    assert!(bob.registry.list_available().is_empty());
}

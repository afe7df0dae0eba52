//! An in-process swarm. Every endpoint created from the same [`MemorySwarm`]
//! can join topics and exchange payloads with the others, which is enough to
//! run whole rooms inside one process for tests and demos.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use loralink_core::PeerId;

use crate::error::{GridError, Result};
use crate::transport::{JoinInfo, Target, Transport, TransportEvent};

/// Rewrites or drops a payload in flight: `(from, to, payload)`.
pub type Interceptor = Arc<dyn Fn(&PeerId, &PeerId, Bytes) -> Option<Bytes> + Send + Sync>;

struct Endpoint {
    tx: mpsc::UnboundedSender<TransportEvent>,
    topic: Option<String>,
}

#[derive(Default)]
struct SwarmState {
    endpoints: HashMap<PeerId, Endpoint>,
    unreachable: bool,
    join_delay: Option<Duration>,
    send_delay: Option<Duration>,
    join_attempts: usize,
    interceptor: Option<Interceptor>,
}

impl SwarmState {
    fn members(&self, topic: &str) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .endpoints
            .iter()
            .filter(|(_, e)| e.topic.as_deref() == Some(topic))
            .map(|(id, _)| id.clone())
            .collect();
        members.sort();
        members
    }

    fn notify_counts(&self, topic: &str) {
        let members = self.members(topic);
        let peers = members.len().saturating_sub(1) as u32;
        for id in &members {
            if let Some(endpoint) = self.endpoints.get(id) {
                let _ = endpoint.tx.send(TransportEvent::PeerCountChanged(peers));
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemorySwarm {
    state: Arc<Mutex<SwarmState>>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new endpoint and returns it with its event stream.
    pub fn endpoint(
        &self,
        peer_id: PeerId,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .endpoints
            .insert(peer_id.clone(), Endpoint { tx, topic: None });
        (
            MemoryTransport {
                swarm: self.clone(),
                peer_id,
            },
            rx,
        )
    }

    /// While unreachable every join fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    pub fn set_join_delay(&self, delay: Option<Duration>) {
        self.state.lock().join_delay = delay;
    }

    /// Every send waits this long before delivering.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.lock().send_delay = delay;
    }

    pub fn set_interceptor(&self, interceptor: Option<Interceptor>) {
        self.state.lock().interceptor = interceptor;
    }

    pub fn join_attempts(&self) -> usize {
        self.state.lock().join_attempts
    }

    pub fn members(&self, topic: &str) -> Vec<PeerId> {
        self.state.lock().members(topic)
    }
}

pub struct MemoryTransport {
    swarm: MemorySwarm,
    peer_id: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn initialize(&self) -> Result<()> {
        debug!(peer = %self.peer_id.short_id(), "Memory transport initialized");
        Ok(())
    }

    async fn join(&self, topic: &str) -> Result<JoinInfo> {
        let delay = {
            let mut state = self.swarm.state.lock();
            state.join_attempts += 1;
            state.join_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.swarm.state.lock();
        if state.unreachable {
            return Err(GridError::ConnectionFailed("swarm unreachable".into()));
        }

        let previous = match state.endpoints.get_mut(&self.peer_id) {
            Some(endpoint) => endpoint.topic.replace(topic.to_string()),
            None => return Err(GridError::ConnectionFailed("endpoint closed".into())),
        };
        if let Some(previous) = previous.filter(|p| p != topic) {
            state.notify_counts(&previous);
        }
        state.notify_counts(topic);

        let peers_count = state.members(topic).len().saturating_sub(1) as u32;
        debug!(peer = %self.peer_id.short_id(), peers_count, "Joined memory topic");
        Ok(JoinInfo {
            topic: topic.to_string(),
            peers_count,
        })
    }

    async fn leave(&self) -> Result<()> {
        let mut state = self.swarm.state.lock();
        let previous = state
            .endpoints
            .get_mut(&self.peer_id)
            .and_then(|endpoint| endpoint.topic.take());
        if let Some(topic) = previous {
            state.notify_counts(&topic);
        }
        Ok(())
    }

    async fn send(&self, target: Target, payload: Bytes) -> Result<()> {
        let delay = self.swarm.state.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.swarm.state.lock();
        let topic = state
            .endpoints
            .get(&self.peer_id)
            .and_then(|e| e.topic.clone())
            .ok_or(GridError::NotConnected)?;

        let recipients: Vec<PeerId> = match target {
            Target::Broadcast => state
                .members(&topic)
                .into_iter()
                .filter(|id| id != &self.peer_id)
                .collect(),
            Target::Peer(peer) => {
                if !state.members(&topic).contains(&peer) {
                    return Err(GridError::ConnectionFailed(format!(
                        "peer {} is not in the room",
                        peer.short_id()
                    )));
                }
                vec![peer]
            }
        };

        for recipient in recipients {
            let payload = match &state.interceptor {
                Some(intercept) => match intercept(&self.peer_id, &recipient, payload.clone()) {
                    Some(p) => p,
                    None => continue,
                },
                None => payload.clone(),
            };
            if let Some(endpoint) = state.endpoints.get(&recipient) {
                trace!(to = %recipient.short_id(), bytes = payload.len(), "Delivering payload");
                let _ = endpoint.tx.send(TransportEvent::Message {
                    from: self.peer_id.clone(),
                    payload,
                });
            }
        }
        Ok(())
    }

    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.swarm.state.lock();
        if let Some(endpoint) = state.endpoints.remove(&self.peer_id) {
            if let Some(topic) = endpoint.topic {
                state.notify_counts(&topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_notifies_peer_counts() {
        let swarm = MemorySwarm::new();
        let (a, mut a_rx) = swarm.endpoint(PeerId::new("a"));
        let (b, _b_rx) = swarm.endpoint(PeerId::new("b"));

        assert_eq!(a.join("room").await.unwrap().peers_count, 0);
        assert_eq!(b.join("room").await.unwrap().peers_count, 1);

        let mut last = None;
        while let Ok(event) = a_rx.try_recv() {
            if let TransportEvent::PeerCountChanged(n) = event {
                last = Some(n);
            }
        }
        assert_eq!(last, Some(1));

        b.leave().await.unwrap();
        match a_rx.recv().await.unwrap() {
            TransportEvent::PeerCountChanged(n) => assert_eq!(n, 0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_stays_in_topic() {
        let swarm = MemorySwarm::new();
        let (a, _a_rx) = swarm.endpoint(PeerId::new("a"));
        let (b, mut b_rx) = swarm.endpoint(PeerId::new("b"));
        let (c, mut c_rx) = swarm.endpoint(PeerId::new("c"));

        a.join("room").await.unwrap();
        b.join("room").await.unwrap();
        c.join("elsewhere").await.unwrap();

        a.send(Target::Broadcast, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let mut got = false;
        while let Ok(event) = b_rx.try_recv() {
            if let TransportEvent::Message { from, payload } = event {
                assert_eq!(from, PeerId::new("a"));
                assert_eq!(&payload[..], b"hello");
                got = true;
            }
        }
        assert!(got);
        while let Ok(event) = c_rx.try_recv() {
            assert!(!matches!(event, TransportEvent::Message { .. }));
        }
    }

    #[tokio::test]
    async fn test_unreachable_and_unjoined() {
        let swarm = MemorySwarm::new();
        let (a, _rx) = swarm.endpoint(PeerId::new("a"));

        assert!(matches!(
            a.send(Target::Broadcast, Bytes::new()).await,
            Err(GridError::NotConnected)
        ));

        swarm.set_reachable(false);
        assert!(matches!(
            a.join("room").await,
            Err(GridError::ConnectionFailed(_))
        ));
        assert_eq!(swarm.join_attempts(), 1);
    }
}

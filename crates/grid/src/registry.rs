//! Adapters we share and adapters peers have announced.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use loralink_core::{checksum, random_topic, AdapterInfo, AvailableAdapter, Event, EventBus, PeerId};
use loralink_storage::AdapterStore;

use crate::connection::ConnectionManager;
use crate::error::{GridError, Result};
use crate::transfer::TransferEngine;
use crate::wire::WireMessage;

/// Result of a share-list change. The local change always stands;
/// `broadcast_confirmed` says whether the room heard about it.
#[derive(Debug, Clone)]
pub struct ShareOutcome {
    pub info: AdapterInfo,
    pub broadcast_confirmed: bool,
}

pub struct AdapterRegistry {
    store: Arc<dyn AdapterStore>,
    connection: Arc<ConnectionManager>,
    transfers: TransferEngine,
    bus: EventBus,
    /// Keyed by instance topic
    shared: RwLock<HashMap<String, AdapterInfo>>,
    /// Per announcing peer, keyed by instance topic
    available: RwLock<HashMap<PeerId, BTreeMap<String, AdapterInfo>>>,
}

impl AdapterRegistry {
    pub fn new(
        store: Arc<dyn AdapterStore>,
        connection: Arc<ConnectionManager>,
        transfers: TransferEngine,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            connection,
            transfers,
            bus,
            shared: RwLock::new(HashMap::new()),
            available: RwLock::new(HashMap::new()),
        }
    }

    /// Starts sharing the adapter file called `name` under a fresh topic.
    ///
    /// Sharing a name that is already shared keeps its topic and announces
    /// the list again.
    pub async fn share(&self, name: &str) -> Result<ShareOutcome> {
        if let Some(existing) = self.shared_by_name(name) {
            let broadcast_confirmed = self.broadcast_shared().await;
            return Ok(ShareOutcome {
                info: existing,
                broadcast_confirmed,
            });
        }

        let located = self
            .store
            .locate(name)
            .await?
            .ok_or_else(|| GridError::AdapterNotFound(name.to_string()))?;
        let info = AdapterInfo::new(
            name,
            located.size_bytes,
            checksum(&located.bytes),
            random_topic(),
        );

        self.shared.write().insert(info.topic.clone(), info.clone());
        info!(
            "Sharing {} ({} bytes) as {}",
            name,
            info.size_bytes,
            &info.topic[..8]
        );

        let broadcast_confirmed = self.broadcast_shared().await;
        Ok(ShareOutcome {
            info,
            broadcast_confirmed,
        })
    }

    pub async fn unshare(&self, topic: &str) -> Result<ShareOutcome> {
        let info = self
            .shared
            .write()
            .remove(topic)
            .ok_or_else(|| GridError::AdapterNotFound(topic.to_string()))?;
        info!("Stopped sharing {}", info.name);
        let broadcast_confirmed = self.broadcast_shared().await;
        Ok(ShareOutcome {
            info,
            broadcast_confirmed,
        })
    }

    pub async fn unshare_by_name(&self, name: &str) -> Result<ShareOutcome> {
        let topic = self
            .shared_by_name(name)
            .map(|info| info.topic)
            .ok_or_else(|| GridError::AdapterNotFound(name.to_string()))?;
        self.unshare(&topic).await
    }

    /// Announces the full shared list to the room. Failures are logged.
    pub async fn broadcast_shared(&self) -> bool {
        if !self.connection.is_connected() {
            debug!("Not in a room, share list not announced");
            return false;
        }
        let message = WireMessage::AdapterList(self.shared_list());
        match self.connection.broadcast(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to announce shared adapters: {}", e);
                false
            }
        }
    }

    /// Replaces everything `peer` announced before with `list`.
    pub fn on_peer_announcement(&self, peer: PeerId, list: Vec<AdapterInfo>) {
        let own_names = self.shared_names();
        let announced = list.len();
        let entries: BTreeMap<String, AdapterInfo> = list
            .into_iter()
            .filter(|info| !own_names.contains(&info.name))
            .map(|info| (info.topic.clone(), info))
            .collect();

        debug!(
            "Peer {} announced {} adapters, {} kept",
            peer.short_id(),
            announced,
            entries.len()
        );
        {
            let mut available = self.available.write();
            if entries.is_empty() {
                available.remove(&peer);
            } else {
                available.insert(peer, entries);
            }
        }
        self.bus.publish(Event::AdaptersAvailable(self.list_available()));
    }

    /// Forgets every announcement, e.g. after leaving the room.
    pub fn clear_available(&self) {
        let had_any = {
            let mut available = self.available.write();
            let had_any = !available.is_empty();
            available.clear();
            had_any
        };
        if had_any {
            self.bus.publish(Event::AdaptersAvailable(Vec::new()));
        }
    }

    /// Everything peers offer, minus anything we share under the same name.
    pub fn list_available(&self) -> Vec<AvailableAdapter> {
        let own_names = self.shared_names();
        let available = self.available.read();
        let mut seen = HashSet::new();
        let mut out: Vec<AvailableAdapter> = available
            .iter()
            .flat_map(|(peer, entries)| {
                entries.values().map(move |info| AvailableAdapter {
                    peer_id: peer.clone(),
                    info: info.clone(),
                })
            })
            .filter(|entry| !own_names.contains(&entry.info.name))
            .filter(|entry| seen.insert((entry.info.topic.clone(), entry.peer_id.clone())))
            .collect();
        out.sort_by(|a, b| {
            a.info
                .name
                .cmp(&b.info.name)
                .then_with(|| a.peer_id.as_str().cmp(b.peer_id.as_str()))
        });
        out
    }

    /// Finds an announced instance, optionally from a specific peer.
    pub fn find_available(&self, topic: &str, peer: Option<&PeerId>) -> Option<AvailableAdapter> {
        self.list_available().into_iter().find(|entry| {
            entry.info.topic == topic && peer.map_or(true, |p| &entry.peer_id == p)
        })
    }

    /// Asks the announcing peer to stream `topic` and starts tracking it.
    pub async fn request_download(
        &self,
        topic: &str,
        peer: Option<&PeerId>,
    ) -> Result<AvailableAdapter> {
        let room_topic = self.connection.room_topic().ok_or(GridError::NotConnected)?;
        let entry = self
            .find_available(topic, peer)
            .ok_or_else(|| GridError::AdapterNotFound(topic.to_string()))?;
        self.transfers.config().check_size(&entry.info)?;

        self.transfers
            .begin(entry.info.clone(), entry.peer_id.clone(), Some(room_topic))?;
        let request = WireMessage::AdapterRequest {
            topic: topic.to_string(),
        };
        if let Err(e) = self.connection.send_to(&entry.peer_id, &request).await {
            self.transfers.discard(topic);
            return Err(e);
        }

        info!(
            "Requested {} from {}",
            entry.info.name,
            entry.peer_id.short_id()
        );
        Ok(entry)
    }

    /// Streams a shared adapter to the peer that asked for it.
    pub async fn serve_request(&self, peer: &PeerId, topic: &str) -> Result<u32> {
        let info = self
            .shared
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| GridError::AdapterNotFound(topic.to_string()))?;
        let located = self
            .store
            .locate(&info.name)
            .await?
            .ok_or_else(|| GridError::AdapterNotFound(info.name.clone()))?;

        let outgoing = self.transfers.outgoing(topic, &located.bytes);
        if !outgoing.checksum.eq_ignore_ascii_case(&info.checksum) {
            warn!("{} changed on disk since it was shared", info.name);
        }

        let total = outgoing.total();
        debug!(
            "Sending {} to {} in {} chunks",
            info.name,
            peer.short_id(),
            total
        );
        for chunk in outgoing.chunks {
            self.connection
                .send_to(peer, &WireMessage::AdapterChunk(chunk))
                .await?;
        }
        Ok(total)
    }

    pub fn shared_list(&self) -> Vec<AdapterInfo> {
        let mut list: Vec<AdapterInfo> = self.shared.read().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn shared_by_name(&self, name: &str) -> Option<AdapterInfo> {
        self.shared
            .read()
            .values()
            .find(|info| info.name == name)
            .cloned()
    }

    pub fn is_sharing(&self) -> bool {
        !self.shared.read().is_empty()
    }

    fn shared_names(&self) -> HashSet<String> {
        self.shared
            .read()
            .values()
            .map(|info| info.name.clone())
            .collect()
    }
}

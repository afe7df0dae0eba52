//! The per-process peer session.
//!
//! [`P2pService`] wires the event bus, transfer engine, room connection and
//! adapter registry together, pumps transport events into them, and keeps
//! the persisted session state written through on every change.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use loralink_core::{
    now_millis, AdapterInfo, AvailableAdapter, DownloadProgress, EventBus, EventKind, PeerId, Room,
    RoomKind, SubscriptionHandle, TransferProgress,
};
use loralink_grid::{
    AdapterRegistry, ConnectionManager, ConnectionStatus, GridError, MessageRouter, Routed,
    ShareOutcome, TransferEngine, Transport, TransportEvent,
};
use loralink_storage::{
    AdapterStore, ConnectionMode, KvStore, LastRoom, PersistedState, PersistenceStore,
    RoomHistoryEntry,
};

use crate::config::SessionConfig;
use crate::downloads::DownloadTracker;
use crate::error::{Result, SessionError};
use crate::reconnect::{Attempt, ReconnectionCoordinator};

struct ServiceInner {
    bus: EventBus,
    transfers: TransferEngine,
    connection: Arc<ConnectionManager>,
    registry: Arc<AdapterRegistry>,
    adapters: Arc<dyn AdapterStore>,
    persistence: PersistenceStore,
    state: tokio::sync::Mutex<PersistedState>,
    downloads: DownloadTracker,
    reconnect: ReconnectionCoordinator,
    /// Serializes user room changes with restores
    room_lock: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// One peer session. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct P2pService {
    inner: Arc<ServiceInner>,
}

impl P2pService {
    /// Builds the session and starts routing `events` from `transport`.
    ///
    /// Persisted state is loaded here, once.
    pub async fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        adapters: Arc<dyn AdapterStore>,
        kv: Arc<dyn KvStore>,
        config: SessionConfig,
    ) -> Self {
        let bus = EventBus::new();
        let transfers = TransferEngine::with_config(bus.clone(), config.transfer.clone());
        let connection = Arc::new(ConnectionManager::new(
            transport,
            bus.clone(),
            transfers.clone(),
        ));
        let registry = Arc::new(AdapterRegistry::new(
            adapters.clone(),
            connection.clone(),
            transfers.clone(),
            bus.clone(),
        ));
        let downloads = DownloadTracker::new(bus.clone(), config.downloads.clone());

        let persistence = PersistenceStore::with_config(kv, config.state.clone());
        let state = persistence.load().await;
        debug!(
            "Loaded session state: last room {:?}, {} shared adapters",
            state.last_room.as_ref().map(|r| r.kind),
            state.shared_adapter_names.len()
        );

        let mut subscriptions = downloads.attach();
        let weak_registry = Arc::downgrade(&registry);
        subscriptions.push(bus.subscribe(EventKind::RoomLeft, move |_| {
            if let Some(registry) = weak_registry.upgrade() {
                registry.clear_available();
            }
            Ok(())
        }));

        let router = MessageRouter::new(connection.clone(), registry.clone(), transfers.clone());
        let pump = tokio::spawn(pump_events(
            events,
            router,
            adapters.clone(),
            downloads.clone(),
        ));

        let inner = ServiceInner {
            bus,
            transfers,
            connection,
            registry,
            adapters,
            persistence,
            state: tokio::sync::Mutex::new(state),
            downloads,
            reconnect: ReconnectionCoordinator::new(config.reconnect.clone()),
            room_lock: tokio::sync::Mutex::new(()),
            pump: Mutex::new(Some(pump)),
            subscriptions: Mutex::new(subscriptions),
        };
        info!("Session started as {}", inner.connection.local_peer_id().short_id());
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.connection.local_peer_id()
    }

    /// Joins a room chosen by the user, superseding any silent restore.
    pub async fn connect(&self, kind: RoomKind, code: Option<&str>) -> Result<Room> {
        self.inner.reconnect.supersede();
        let _room = self.inner.room_lock.lock().await;
        let room = self.inner.connection.connect(kind, code).await?;
        self.inner.registry.broadcast_shared().await;
        self.record_room(&room).await;
        Ok(room)
    }

    async fn record_room(&self, room: &Room) {
        let limit = self.inner.persistence.history_limit();
        self.update_state(|state| {
            state.set_last_room(room.kind, room.code.clone());
            state.record_room(room.kind, room.code.clone(), now_millis(), limit);
        })
        .await;
    }

    /// Leaves the room for good: the next start will not restore it.
    pub async fn leave_room(&self) {
        self.inner.reconnect.supersede();
        let _room = self.inner.room_lock.lock().await;
        self.inner.connection.disconnect().await;
        self.inner.reconnect.reset();
        self.update_state(|state| state.last_room = None).await;
    }

    /// Disconnects and stops routing, keeping the last room for next time.
    pub async fn shutdown(&self) {
        self.inner.reconnect.supersede();
        let _room = self.inner.room_lock.lock().await;
        self.inner.connection.disconnect().await;
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        for handle in self.inner.subscriptions.lock().drain(..) {
            handle.unsubscribe();
        }
        info!("Session shut down");
    }

    /// Shares a local adapter file with the room.
    ///
    /// The name is persisted first and rolled back if sharing fails.
    pub async fn share(&self, name: &str) -> Result<ShareOutcome> {
        let previous = self
            .update_state(|state| {
                state.remember_shared(name);
            })
            .await;

        match self.inner.registry.share(name).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("Sharing {} failed, rolling back: {}", name, e);
                self.restore_sharing(previous).await;
                Err(e.into())
            }
        }
    }

    pub async fn unshare(&self, topic: &str) -> Result<ShareOutcome> {
        let name = self
            .inner
            .registry
            .shared_list()
            .into_iter()
            .find(|info| info.topic == topic)
            .map(|info| info.name)
            .ok_or_else(|| GridError::AdapterNotFound(topic.to_string()))?;

        let previous = self
            .update_state(|state| {
                state.forget_shared(&name);
            })
            .await;

        match self.inner.registry.unshare(topic).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.restore_sharing(previous).await;
                Err(e.into())
            }
        }
    }

    /// The adapter file was deleted locally; stop offering it.
    pub async fn adapter_deleted(&self, name: &str) -> bool {
        let mut removed = false;
        while self.inner.registry.unshare_by_name(name).await.is_ok() {
            removed = true;
        }
        self.update_state(|state| {
            removed |= state.forget_shared(name);
        })
        .await;
        if removed {
            info!("Stopped sharing deleted adapter {}", name);
        }
        removed
    }

    /// Asks the peer that announced `topic` to send it.
    pub async fn request_download(
        &self,
        topic: &str,
        peer: Option<&PeerId>,
    ) -> Result<DownloadProgress> {
        if let Some(entry) = self.inner.registry.find_available(topic, peer) {
            if self.inner.downloads.is_downloading(&entry.info.name) {
                return Err(SessionError::DownloadUnavailable(format!(
                    "{} is already downloading",
                    entry.info.name
                )));
            }
        }

        let entry = self.inner.registry.request_download(topic, peer).await?;
        Ok(self
            .inner
            .downloads
            .start(&entry.info.name, topic, entry.info.size_bytes))
    }

    pub fn cancel_download(&self, topic: &str) -> Result<()> {
        self.inner.transfers.cancel(topic)?;
        Ok(())
    }

    pub fn get_progress(&self, topic: &str) -> Result<TransferProgress> {
        Ok(self.inner.transfers.get_progress(topic)?)
    }

    pub fn download_progress(&self, name: &str) -> Option<DownloadProgress> {
        self.inner.downloads.get(name)
    }

    pub fn downloads(&self) -> Vec<DownloadProgress> {
        self.inner.downloads.list()
    }

    pub fn list_available(&self) -> Vec<AvailableAdapter> {
        self.inner.registry.list_available()
    }

    pub fn shared_adapters(&self) -> Vec<AdapterInfo> {
        self.inner.registry.shared_list()
    }

    pub fn current_room(&self) -> Option<Room> {
        self.inner.connection.current_room()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub async fn set_mode(&self, mode: ConnectionMode) {
        self.update_state(|state| state.last_mode = mode).await;
    }

    pub async fn mode(&self) -> ConnectionMode {
        self.inner.state.lock().await.last_mode
    }

    pub async fn persisted_state(&self) -> PersistedState {
        self.inner.state.lock().await.clone()
    }

    pub async fn room_history(&self) -> Vec<RoomHistoryEntry> {
        self.inner.state.lock().await.room_history.clone()
    }

    /// Silently restores the last session if allowed.
    ///
    /// Runs at most once per cooldown period and never surfaces errors.
    /// Does nothing while a room is connected. Returns true when the session
    /// was restored.
    pub async fn check_and_auto_reconnect(&self) -> bool {
        if self.inner.connection.is_connected() {
            debug!("Already in a room, not restoring last room");
            return false;
        }
        let (last_room, mode) = {
            let state = self.inner.state.lock().await;
            (state.last_room.clone(), state.last_mode)
        };
        let Some(last_room) = last_room else {
            return false;
        };
        if mode == ConnectionMode::Manual {
            debug!("Manual connection mode, not restoring last room");
            return false;
        }
        let Some(attempt) = self.inner.reconnect.try_begin_auto() else {
            return false;
        };

        info!("Restoring last {} room", last_room.kind);
        match self.restore(&last_room, attempt).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Silent reconnect failed: {}", e);
                false
            }
        }
    }

    /// User-initiated restore of the last session. Errors are returned.
    pub async fn reconnect_to_last_session(&self) -> Result<Room> {
        let last_room = self
            .inner
            .state
            .lock()
            .await
            .last_room
            .clone()
            .ok_or(SessionError::NoLastSession)?;
        let attempt = self.inner.reconnect.begin_manual();
        self.restore(&last_room, attempt)
            .await?
            .ok_or(SessionError::NoLastSession)
    }

    pub async fn should_offer_manual_reconnect(&self) -> bool {
        if self.inner.connection.is_connected() {
            return false;
        }
        let has_last_room = self.inner.state.lock().await.last_room.is_some();
        self.inner.reconnect.should_offer_manual(has_last_room)
    }

    /// Returns `Ok(None)` when a newer attempt or a user room change took
    /// over. A superseded attempt never records its room.
    async fn restore(&self, last_room: &LastRoom, attempt: Attempt) -> Result<Option<Room>> {
        let _room = self.inner.room_lock.lock().await;
        if !self.inner.reconnect.is_current(&attempt) {
            debug!("Reconnect attempt superseded before joining");
            return Ok(None);
        }

        let room = match self
            .inner
            .connection
            .connect(last_room.kind, last_room.code.as_deref())
            .await
        {
            Ok(room) => room,
            Err(e) => {
                self.inner.reconnect.finish(attempt, false);
                return Err(e.into());
            }
        };
        self.inner.registry.broadcast_shared().await;
        if !self.inner.reconnect.is_current(&attempt) {
            debug!("Reconnect attempt superseded, not recording {} room", room.kind);
            return Ok(None);
        }

        self.record_room(&room).await;
        self.restore_shared().await;
        self.inner.reconnect.finish(attempt, true);
        Ok(Some(room))
    }

    /// Re-shares every persisted name still present in the file store.
    async fn restore_shared(&self) {
        let names: Vec<String> = self
            .inner
            .state
            .lock()
            .await
            .shared_adapter_names
            .iter()
            .cloned()
            .collect();

        for name in names {
            match self.inner.adapters.exists(&name).await {
                Ok(true) => {
                    if let Err(e) = self.inner.registry.share(&name).await {
                        warn!("Could not restore shared adapter {}: {}", name, e);
                    }
                }
                Ok(false) => {
                    info!("Shared adapter {} no longer exists, forgetting it", name);
                    self.update_state(|state| {
                        state.forget_shared(&name);
                    })
                    .await;
                }
                Err(e) => warn!("Could not check adapter {}: {}", name, e),
            }
        }
    }

    /// Mutates the in-memory state, writes it through, and returns the
    /// state as it was before.
    async fn update_state<F>(&self, update: F) -> PersistedState
    where
        F: FnOnce(&mut PersistedState),
    {
        let mut state = self.inner.state.lock().await;
        let previous = state.clone();
        update(&mut *state);
        if *state != previous {
            self.inner.persistence.save(&state).await;
        }
        previous
    }

    /// Puts the sharing fields back to an earlier value.
    async fn restore_sharing(&self, previous: PersistedState) {
        self.update_state(|state| {
            state.shared_adapter_names = previous.shared_adapter_names;
            state.is_sharing = previous.is_sharing;
        })
        .await;
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    router: MessageRouter,
    adapters: Arc<dyn AdapterStore>,
    downloads: DownloadTracker,
) {
    while let Some(event) = events.recv().await {
        if let Routed::Completed(done) = router.route(event).await {
            let topic = done.metadata.topic.clone();
            match adapters.store(&done.metadata.name, &done.data).await {
                Ok(()) => {
                    info!("Stored downloaded adapter {}", done.metadata.name);
                    downloads.complete(&topic);
                }
                Err(e) => {
                    error!("Failed to store adapter {}: {}", done.metadata.name, e);
                    downloads.fail(&topic, &e.to_string());
                }
            }
        }
    }
    debug!("Transport event stream closed");
}

impl std::fmt::Debug for P2pService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pService")
            .field("peer_id", &self.peer_id())
            .field("status", &self.status())
            .finish()
    }
}

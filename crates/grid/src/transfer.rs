//! Chunked adapter transfers.
//!
//! Outbound payloads are cut into fixed-size chunks, each carrying its own
//! checksum. Inbound transfers are tracked per instance topic: chunks are
//! validated before they are stored, slotted by index, and the reassembled
//! payload must match the announced whole-file checksum. Every transfer owns
//! its deadline timer, so removing the state from the table releases both the
//! slot memory and the timer no matter how the transfer ended.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use loralink_core::checksum::{self, ChecksumBuilder};
use loralink_core::{AdapterInfo, Event, EventBus, PeerId, ScheduledTask, TransferProgress};

use crate::error::{GridError, Result};
use crate::wire::ChunkMessage;

pub const CHUNK_SIZE: usize = 64 * 1024; // 64 KiB
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_ADAPTER_SIZE: u64 = 16 * 1024 * 1024 * 1024; // 16 GiB

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Measured from the moment the download is requested
    pub timeout: Duration,
    /// Largest announced size we agree to download
    pub max_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            timeout: TRANSFER_TIMEOUT,
            max_size: MAX_ADAPTER_SIZE,
        }
    }
}

impl TransferConfig {
    /// Number of chunks a payload of `size_bytes` is split into.
    pub fn chunk_count(&self, size_bytes: u64) -> u64 {
        let chunk_size = self.chunk_size.max(1) as u64;
        size_bytes.div_ceil(chunk_size).max(1)
    }

    /// Rejects announced sizes we will not allocate slots for.
    pub fn check_size(&self, metadata: &AdapterInfo) -> Result<u32> {
        let chunks = self.chunk_count(metadata.size_bytes);
        if metadata.size_bytes > self.max_size || chunks > u64::from(u32::MAX) {
            return Err(GridError::Protocol(format!(
                "adapter {} announces {} bytes, limit is {}",
                metadata.name, metadata.size_bytes, self.max_size
            )));
        }
        Ok(chunks as u32)
    }
}

/// Splits a payload into `chunk_size` slices. An empty payload is one empty chunk.
pub fn split(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect()
}

/// Concatenates chunks in the order given.
pub fn reassemble(chunks: &[Bytes]) -> Bytes {
    let mut out = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        out.extend_from_slice(chunk);
    }
    out.freeze()
}

/// A payload ready to stream: per-chunk messages plus the whole-file checksum.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub checksum: String,
    pub chunks: Vec<ChunkMessage>,
}

impl OutgoingTransfer {
    pub fn new(topic: &str, data: &Bytes, chunk_size: usize) -> Self {
        let pieces = split(data, chunk_size);
        let total = pieces.len() as u32;
        let chunks = pieces
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| ChunkMessage {
                topic: topic.to_string(),
                index: index as u32,
                total,
                chunk_checksum: checksum::checksum(&chunk),
                chunk,
            })
            .collect();
        Self {
            checksum: checksum::checksum(data),
            chunks,
        }
    }

    pub fn total(&self) -> u32 {
        self.chunks.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Requested; no chunk has told us the chunk count yet
    AwaitingMetadata,
    Receiving,
}

/// A transfer that passed every check.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub source: PeerId,
    pub metadata: AdapterInfo,
    pub data: Bytes,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    Accepted(TransferProgress),
    /// Already had this index
    Duplicate(TransferProgress),
    Completed(CompletedTransfer),
    /// No transfer was requested for this topic
    Ignored,
}

struct TransferState {
    id: u64,
    source: PeerId,
    room_topic: Option<String>,
    metadata: AdapterInfo,
    expected_chunks: u32,
    slots: Vec<Option<Bytes>>,
    received_count: u32,
    received_bytes: u64,
    created_at: Instant,
    timer: ScheduledTask,
}

enum Accepted {
    Stored { complete: bool },
    Duplicate,
}

impl TransferState {
    fn phase(&self) -> TransferPhase {
        if self.slots.is_empty() {
            TransferPhase::AwaitingMetadata
        } else {
            TransferPhase::Receiving
        }
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            topic: self.metadata.topic.clone(),
            received_chunks: self.received_count,
            total_chunks: self.slots.len() as u32,
            received_bytes: self.received_bytes,
        }
    }

    fn accept(&mut self, msg: ChunkMessage) -> Result<Accepted> {
        let topic = &self.metadata.topic;
        if self.slots.is_empty() {
            // Slot count comes from the requested size, never from the sender
            if msg.total != self.expected_chunks {
                return Err(GridError::Protocol(format!(
                    "transfer {topic} announced {} chunks, expected {} for {} bytes",
                    msg.total, self.expected_chunks, self.metadata.size_bytes
                )));
            }
            self.slots = vec![None; msg.total as usize];
        }

        if msg.total as usize != self.slots.len() {
            return Err(GridError::Protocol(format!(
                "transfer {topic} changed chunk count from {} to {}",
                self.slots.len(),
                msg.total
            )));
        }
        let index = msg.index as usize;
        if index >= self.slots.len() {
            return Err(GridError::Protocol(format!(
                "transfer {topic} chunk index {} out of range",
                msg.index
            )));
        }
        if !checksum::validate(&msg.chunk, &msg.chunk_checksum) {
            return Err(GridError::ChunkValidation {
                topic: topic.clone(),
                index: msg.index,
            });
        }
        if self.slots[index].is_some() {
            return Ok(Accepted::Duplicate);
        }

        self.received_bytes += msg.chunk.len() as u64;
        self.slots[index] = Some(msg.chunk);
        self.received_count += 1;
        Ok(Accepted::Stored {
            complete: self.received_count as usize == self.slots.len(),
        })
    }

    fn finish(self) -> Result<CompletedTransfer> {
        let mut hasher = ChecksumBuilder::new();
        let mut data = BytesMut::with_capacity(self.received_bytes as usize);
        for slot in &self.slots {
            let chunk = slot.as_ref().ok_or_else(|| {
                GridError::Protocol(format!("transfer {} has a missing chunk", self.metadata.topic))
            })?;
            hasher.update(chunk);
            data.extend_from_slice(chunk);
        }

        let actual = hasher.finish();
        if !actual.eq_ignore_ascii_case(self.metadata.checksum.trim()) {
            return Err(GridError::FileChecksum {
                topic: self.metadata.topic.clone(),
                expected: self.metadata.checksum.clone(),
                actual,
            });
        }

        Ok(CompletedTransfer {
            elapsed: self.created_at.elapsed(),
            source: self.source,
            metadata: self.metadata,
            data: data.freeze(),
        })
    }
}

struct EngineInner {
    transfers: DashMap<String, TransferState>,
    bus: EventBus,
    config: TransferConfig,
    next_id: AtomicU64,
}

impl EngineInner {
    /// Drops the state (slots and timer) and reports why.
    fn abort(&self, topic: &str, error: &GridError) -> bool {
        let Some((_, state)) = self.transfers.remove(topic) else {
            return false;
        };
        warn!(
            topic = %short(topic),
            adapter = %state.metadata.name,
            received = state.received_count,
            error = %error,
            "Transfer aborted"
        );
        drop(state);
        self.emit_error(topic, error);
        true
    }

    fn emit_error(&self, topic: &str, error: &GridError) {
        if let Some(failure) = error.transfer_failure() {
            self.bus.publish(Event::TransferError {
                topic: topic.to_string(),
                failure,
                message: error.to_string(),
            });
        }
    }

    fn expire(&self, topic: &str, id: u64) {
        let current = self.transfers.get(topic).map(|state| state.id);
        if current == Some(id) {
            self.abort(topic, &GridError::TransferTimeout(topic.to_string()));
        }
    }
}

fn short(topic: &str) -> &str {
    &topic[..topic.len().min(8)]
}

/// Tracks inbound transfers. Clones share the same table.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(bus: EventBus) -> Self {
        Self::with_config(bus, TransferConfig::default())
    }

    pub fn with_config(bus: EventBus, config: TransferConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transfers: DashMap::new(),
                bus,
                config,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Builds the chunk stream for a payload we are serving.
    pub fn outgoing(&self, topic: &str, data: &Bytes) -> OutgoingTransfer {
        OutgoingTransfer::new(topic, data, self.inner.config.chunk_size)
    }

    /// Starts tracking a download of `metadata.topic` from `source`.
    ///
    /// `room_topic` scopes the transfer so leaving that room cancels it.
    pub fn begin(
        &self,
        metadata: AdapterInfo,
        source: PeerId,
        room_topic: Option<String>,
    ) -> Result<()> {
        let expected_chunks = self.inner.config.check_size(&metadata)?;
        let topic = metadata.topic.clone();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let timer_topic = topic.clone();
        let deadline = ScheduledTask::after(self.inner.config.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(&timer_topic, id);
            }
        });

        match self.inner.transfers.entry(topic.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GridError::TransferExists(topic));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    topic = %short(&topic),
                    adapter = %metadata.name,
                    bytes = metadata.size_bytes,
                    from = %source.short_id(),
                    "Transfer started"
                );
                slot.insert(TransferState {
                    id,
                    source,
                    room_topic,
                    metadata,
                    expected_chunks,
                    slots: Vec::new(),
                    received_count: 0,
                    received_bytes: 0,
                    created_at: Instant::now(),
                    timer: deadline,
                });
            }
        }
        Ok(())
    }

    /// Feeds one received chunk into its transfer.
    ///
    /// Any error has already removed the transfer and emitted
    /// `transfer:error` by the time it is returned.
    pub fn on_chunk(&self, from: &PeerId, msg: ChunkMessage) -> Result<ChunkOutcome> {
        let topic = msg.topic.clone();
        let index = msg.index;

        let accepted = {
            let Some(mut state) = self.inner.transfers.get_mut(&topic) else {
                debug!(topic = %short(&topic), index, "Dropping chunk for unknown transfer");
                return Ok(ChunkOutcome::Ignored);
            };
            if &state.source != from {
                debug!(
                    topic = %short(&topic),
                    from = %from.short_id(),
                    "Dropping chunk from a peer we did not ask"
                );
                return Ok(ChunkOutcome::Ignored);
            }
            state.accept(msg).map(|accepted| (accepted, state.progress()))
        };

        let (accepted, progress) = match accepted {
            Ok(ok) => ok,
            Err(e) => {
                self.inner.abort(&topic, &e);
                return Err(e);
            }
        };

        match accepted {
            Accepted::Duplicate => {
                debug!(topic = %short(&topic), index, "Duplicate chunk ignored");
                Ok(ChunkOutcome::Duplicate(progress))
            }
            Accepted::Stored { complete: false } => {
                self.inner
                    .bus
                    .publish(Event::TransferProgress(progress.clone()));
                Ok(ChunkOutcome::Accepted(progress))
            }
            Accepted::Stored { complete: true } => {
                self.inner
                    .bus
                    .publish(Event::TransferProgress(progress.clone()));
                let Some((_, state)) = self.inner.transfers.remove(&topic) else {
                    // Cancelled from a progress handler
                    return Err(GridError::TransferCancelled(topic));
                };
                match state.finish() {
                    Ok(done) => {
                        info!(
                            topic = %short(&topic),
                            adapter = %done.metadata.name,
                            bytes = done.data.len(),
                            elapsed = ?done.elapsed,
                            "Transfer complete"
                        );
                        self.inner.bus.publish(Event::TransferComplete {
                            metadata: done.metadata.clone(),
                            data: done.data.clone(),
                        });
                        Ok(ChunkOutcome::Completed(done))
                    }
                    Err(e) => {
                        warn!(topic = %short(&topic), error = %e, "Transfer failed verification");
                        self.inner.emit_error(&topic, &e);
                        Err(e)
                    }
                }
            }
        }
    }

    pub fn cancel(&self, topic: &str) -> Result<()> {
        if self
            .inner
            .abort(topic, &GridError::TransferCancelled(topic.to_string()))
        {
            Ok(())
        } else {
            Err(GridError::TransferNotFound(topic.to_string()))
        }
    }

    /// Forgets a transfer without reporting it, for requests that never left.
    pub fn discard(&self, topic: &str) -> bool {
        self.inner.transfers.remove(topic).is_some()
    }

    /// Cancels every transfer started while `room_topic` was the active room.
    pub fn cancel_room(&self, room_topic: &str) -> usize {
        let topics: Vec<String> = self
            .inner
            .transfers
            .iter()
            .filter(|entry| entry.room_topic.as_deref() == Some(room_topic))
            .map(|entry| entry.key().clone())
            .collect();
        topics
            .iter()
            .filter(|topic| {
                self.inner
                    .abort(topic, &GridError::TransferCancelled(topic.to_string()))
            })
            .count()
    }

    pub fn cancel_all(&self) -> usize {
        let topics: Vec<String> = self
            .inner
            .transfers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics
            .iter()
            .filter(|topic| {
                self.inner
                    .abort(topic, &GridError::TransferCancelled(topic.to_string()))
            })
            .count()
    }

    pub fn get_progress(&self, topic: &str) -> Result<TransferProgress> {
        self.inner
            .transfers
            .get(topic)
            .map(|state| state.progress())
            .ok_or_else(|| GridError::TransferNotFound(topic.to_string()))
    }

    pub fn phase(&self, topic: &str) -> Option<TransferPhase> {
        self.inner.transfers.get(topic).map(|state| state.phase())
    }

    pub fn deadline(&self, topic: &str) -> Option<Instant> {
        self.inner
            .transfers
            .get(topic)
            .map(|state| state.timer.deadline())
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.inner.transfers.contains_key(topic)
    }

    pub fn active_count(&self) -> usize {
        self.inner.transfers.len()
    }
}

pub mod connection;
pub mod error;
pub mod memory;
pub mod registry;
pub mod router;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use connection::{ConnectionManager, ConnectionStatus};
pub use error::{GridError, Result};
pub use memory::{Interceptor, MemorySwarm, MemoryTransport};
pub use registry::{AdapterRegistry, ShareOutcome};
pub use router::{MessageRouter, Routed};
pub use transfer::{
    reassemble, split, ChunkOutcome, CompletedTransfer, OutgoingTransfer, TransferConfig,
    TransferEngine, TransferPhase, CHUNK_SIZE, MAX_ADAPTER_SIZE, TRANSFER_TIMEOUT,
};
pub use transport::{JoinInfo, Target, Transport, TransportEvent};
pub use wire::{ChunkMessage, WireMessage, MAX_MESSAGE_SIZE};

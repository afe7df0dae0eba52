pub mod adapter_store;
pub mod error;
pub mod kv;
pub mod session_state;

pub use adapter_store::{AdapterStore, DirectoryAdapterStore, LocatedAdapter, MemoryAdapterStore};
pub use error::{Result, StoreError};
pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use session_state::{
    ConnectionMode, LastRoom, PersistedState, PersistenceStore, RoomHistoryEntry,
    SessionStateConfig, SCHEMA_VERSION,
};

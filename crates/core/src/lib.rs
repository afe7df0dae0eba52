pub mod adapter;
pub mod checksum;
pub mod error;
pub mod event;
pub mod id;
pub mod progress;
pub mod room;
pub mod schedule;
pub mod topic;

pub use adapter::{now_millis, AdapterInfo, AvailableAdapter};
pub use checksum::{checksum, validate};
pub use error::{CoreError, Result};
pub use event::{Event, EventBus, EventKind, EventReceiver, SubscriptionHandle};
pub use id::{random_topic, PeerId};
pub use progress::{DownloadProgress, DownloadStatus, TransferFailure, TransferProgress};
pub use room::{Room, RoomKind};
pub use schedule::{Cooldown, ScheduledTask};
pub use topic::{generate_room_code, resolve, room_code};

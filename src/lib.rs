pub mod network;
pub mod protocol;
pub mod record;
pub mod region;
pub mod snapshot;
pub mod types;
pub mod value;
pub mod version;

// Re-export only what's needed by external users
pub use protocol::MemberNode;
pub use record::{ProxyKind, RecordStats, RemoteRecordProxy, StoredRecord};
pub use region::{LocalRegion, Region, RegionConfig, RegionEntry, UserAttributes};
pub use snapshot::{EntrySnapshot, EntryStatistics, RecordSource, SnapshotData};
pub use types::{ClusterMessage, EntryError, NodeId, NodeInfo};
pub use value::{CachedDeserializable, Resolved, Token, Value, ValueHolder};
pub use version::{VersionStamp, VersionTag};

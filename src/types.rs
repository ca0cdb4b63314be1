use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use uuid::Uuid;

/// Messages exchanged between members when one of them asks another for an
/// entry it hosts.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
pub enum ClusterMessage {
    HeartBeat,
    HeartBeatAck,

    EntryRequest {
        region: String,
        key: String,
        allow_tombstones: bool,
    },
    /// `payload` holds the snapshot wire form, or `None` when the member has
    /// no such entry.
    EntryResponse {
        member: NodeId,
        payload: Option<Vec<u8>>,
    },
    UnknownRegion {
        region: String,
    },
    /// The member could not answer the request.
    RequestFailed {
        member: NodeId,
        reason: String,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: SocketAddr,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Deserialize,
    rkyv::Serialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, PartialEq))]
pub struct NodeId(pub Uuid);

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeId {
    pub fn new() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors surfaced by entry handles, regions and the member transport.
#[derive(Debug, Error)]
pub enum EntryError {
    /// The entry or its region was destroyed. Drop the handle and look the key
    /// up again.
    #[error("entry destroyed: {key}")]
    EntryDestroyed { key: String },

    #[error("statistics disabled for region {region}")]
    StatisticsDisabled { region: String },

    #[error("region destroyed: {path}")]
    RegionDestroyed { path: String },

    #[error("malformed entry payload: {0}")]
    Malformed(String),

    #[error("failed to deserialize value: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("entry version exhausted for {key}")]
    VersionOverflow { key: String },

    #[error("region {0} is not hosted by this member")]
    RegionNotFound(String),
}

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version metadata carried on a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionStamp {
    member: NodeId,
    entry_version: u32,
    region_version: u64,
    timestamp: u64,
}

impl VersionStamp {
    pub fn new(member: NodeId, entry_version: u32, region_version: u64, timestamp: u64) -> Self {
        Self {
            member,
            entry_version,
            region_version,
            timestamp,
        }
    }

    pub fn member(&self) -> NodeId {
        self.member
    }

    pub fn entry_version(&self) -> u32 {
        self.entry_version
    }

    pub fn region_version(&self) -> u64 {
        self.region_version
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn as_version_tag(&self) -> VersionTag {
        VersionTag {
            member: self.member,
            entry_version: self.entry_version,
            region_version: self.region_version,
            timestamp: self.timestamp,
        }
    }
}

/// Conflict-resolution metadata handed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag {
    pub member: NodeId,
    pub entry_version: u32,
    pub region_version: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{v{}; rv{}; mbr={}; time={}}}",
            self.entry_version, self.region_version, self.member, self.timestamp
        )
    }
}

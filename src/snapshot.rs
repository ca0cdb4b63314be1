//! Location-transparent entry handles.
//!
//! An [`EntrySnapshot`] always carries a [`RemoteRecordProxy`], even when it
//! was built from a record held in local memory. The handle therefore stays
//! usable after the record's bucket is relocated, at the cost of only seeing
//! the record as it was when captured.
//!
//! # Destroyed detection is advisory
//!
//! [`EntrySnapshot::is_destroyed`] never contacts the member holding the
//! authoritative copy. It reports `true` when the owning region was torn down
//! or the captured record was already removed, and remembers that answer for
//! good. A `false` answer only means neither condition has been observed; the
//! record may have been destroyed elsewhere since capture.
//!
//! # Wire form
//!
//! `[1 byte: has-statistics flag][proxy payload]`. Decoding yields an unbound
//! [`SnapshotData`]; [`SnapshotData::bind`] attaches a region and produces a
//! working handle.

use crate::record::{RemoteRecordProxy, StoredRecord};
use crate::region::Region;
use crate::types::EntryError;
use crate::value::{Value, ValueHolder};
use crate::version::VersionTag;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Where a snapshot's record comes from.
pub enum RecordSource<'a> {
    /// Already captured, e.g. received from another member. Adopted as is.
    Remote(RemoteRecordProxy),
    /// Held by a region on this member. Captured into a new proxy.
    Local(&'a dyn StoredRecord),
}

impl From<RemoteRecordProxy> for RecordSource<'_> {
    fn from(proxy: RemoteRecordProxy) -> Self {
        RecordSource::Remote(proxy)
    }
}

impl<'a, R: StoredRecord> From<&'a R> for RecordSource<'a> {
    fn from(record: &'a R) -> Self {
        RecordSource::Local(record)
    }
}

/// Client-facing handle to one record of a region.
///
/// Two snapshots are equal when their keys are equal. Values, versions and
/// destroyed state do not take part in equality or hashing.
pub struct EntrySnapshot {
    region: Arc<dyn Region>,
    entry: RemoteRecordProxy,
    started_local: bool,
    destroyed: AtomicBool,
}

impl EntrySnapshot {
    /// Wraps a record looked up in `data_region` on behalf of a caller that
    /// addressed `region`.
    pub fn new<'a>(
        source: impl Into<RecordSource<'a>>,
        data_region: &dyn Region,
        region: Arc<dyn Region>,
        allow_tombstones: bool,
    ) -> Self {
        let (entry, started_local) = match source.into() {
            RecordSource::Remote(proxy) => (proxy, false),
            RecordSource::Local(record) => match record.as_proxy() {
                // An earlier capture passed by reference is adopted, not re-captured
                Some(proxy) => (proxy.clone(), false),
                None => {
                    let proxy = RemoteRecordProxy::capture(record, allow_tombstones);
                    debug!(
                        "Captured {} from {} for {} (stats: {})",
                        proxy.key(),
                        data_region.full_path(),
                        region.full_path(),
                        proxy.has_stats()
                    );
                    (proxy, true)
                }
            },
        };
        Self {
            region,
            entry,
            started_local,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Decodes a snapshot and binds it to `region` in one step.
    pub fn decode<R: Read>(input: &mut R, region: Arc<dyn Region>) -> Result<Self, EntryError> {
        Ok(SnapshotData::decode(input)?.bind(region))
    }

    /// Whether the record was held on this member when the snapshot was
    /// built. Diagnostic only.
    pub fn was_initially_local(&self) -> bool {
        self.started_local
    }

    pub fn key(&self) -> Result<&str, EntryError> {
        self.check_entry_destroyed()?;
        Ok(self.entry.key())
    }

    /// Never fails and ignores destroyed state.
    pub fn version_tag(&self) -> Option<VersionTag> {
        self.entry.version_tag()
    }

    /// The captured value with sentinels mapped to `None`.
    ///
    /// Encoded values are resolved according to the region's copy-on-read
    /// policy: a private copy per call when enabled, one shared instance
    /// otherwise.
    pub fn raw_value(&self) -> Result<Option<Arc<Value>>, EntryError> {
        match self.entry.value() {
            ValueHolder::Absent | ValueHolder::Token(_) => Ok(None),
            ValueHolder::Serialized(cd) => {
                let resolved = if self.region.is_copy_on_read() {
                    cd.deserialized_writable_copy()?
                } else {
                    cd.deserialized_value()?
                };
                Ok(resolved.into_value())
            }
            ValueHolder::Object(v) => Ok(Some(conditional_copy(Arc::clone(v)))),
        }
    }

    pub fn value(&self) -> Result<Option<Arc<Value>>, EntryError> {
        self.check_entry_destroyed()?;
        self.raw_value()
    }

    pub fn user_attribute(&self) -> Result<Option<Arc<Value>>, EntryError> {
        self.check_entry_destroyed()?;
        Ok(self.region.user_attributes().get(self.entry.key()))
    }

    /// Returns the attribute previously set for this key.
    pub fn set_user_attribute(
        &self,
        value: impl Into<Value>,
    ) -> Result<Option<Arc<Value>>, EntryError> {
        self.check_entry_destroyed()?;
        Ok(self
            .region
            .user_attributes()
            .put(self.entry.key(), Arc::new(value.into())))
    }

    /// See the module docs: `true` is final, `false` is a best guess.
    pub fn is_destroyed(&self) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return true;
        }
        if self.region.is_destroyed() || self.entry.is_removed() {
            self.destroyed.store(true, Ordering::Release);
            trace!("Entry {} observed destroyed", self.entry.key());
            return true;
        }
        false
    }

    pub fn region(&self) -> Result<&Arc<dyn Region>, EntryError> {
        self.check_entry_destroyed()?;
        Ok(&self.region)
    }

    /// Available only when the record kept statistics at capture time and the
    /// region has statistics enabled.
    pub fn statistics(&self) -> Result<EntryStatistics, EntryError> {
        self.check_entry_destroyed()?;
        match self.entry.stats() {
            Some(stats) if self.region.statistics_enabled() => Ok(EntryStatistics {
                hit_count: stats.hit_count,
                miss_count: stats.miss_count,
                last_accessed: stats.last_accessed,
                last_modified: self.entry.last_modified(),
            }),
            _ => Err(EntryError::StatisticsDisabled {
                region: self.region.full_path().to_string(),
            }),
        }
    }

    /// Writes through the region and caches `value` in this snapshot so later
    /// reads on the same instance see it. Returns the region's previous value.
    ///
    /// Blocks for as long as the region's put does.
    pub fn set_value(&mut self, value: impl Into<Value>) -> Result<Option<Arc<Value>>, EntryError> {
        let value = Arc::new(value.into());
        let previous = self.region.put(self.entry.key(), Arc::clone(&value))?;
        self.entry.set_cached_value(ValueHolder::Object(value));
        Ok(previous)
    }

    /// Always `false`: the record behind a snapshot may move after capture.
    pub fn is_local(&self) -> bool {
        false
    }

    /// The carried proxy. It is not a live view of the stored record.
    pub fn region_entry(&self) -> &RemoteRecordProxy {
        &self.entry
    }

    pub fn bind_region(&mut self, region: Arc<dyn Region>) {
        self.region = region;
    }

    pub fn bind_proxy(&mut self, proxy: RemoteRecordProxy) {
        self.entry = proxy;
    }

    pub fn encode<W: Write>(&self, out: &mut W) -> Result<(), EntryError> {
        write_snapshot(&self.entry, out)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EntryError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Detaches the data from the region binding.
    pub fn into_data(self) -> SnapshotData {
        SnapshotData { entry: self.entry }
    }

    fn check_entry_destroyed(&self) -> Result<(), EntryError> {
        if self.is_destroyed() {
            return Err(EntryError::EntryDestroyed {
                key: self.entry.key().to_string(),
            });
        }
        Ok(())
    }
}

// Copy-on-get hook for values that are not kept encoded.
fn conditional_copy(value: Arc<Value>) -> Arc<Value> {
    value
}

fn write_snapshot<W: Write>(entry: &RemoteRecordProxy, out: &mut W) -> Result<(), EntryError> {
    out.write_u8(entry.has_stats() as u8)?;
    entry.encode(out)
}

impl PartialEq for EntrySnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key() == other.entry.key()
    }
}

impl Eq for EntrySnapshot {}

impl Hash for EntrySnapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entry.key().hash(state);
    }
}

impl fmt::Debug for EntrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySnapshot")
            .field("region", &self.region.full_path())
            .field("entry", &self.entry)
            .field("started_local", &self.started_local)
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Display for EntrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_destroyed() {
            write!(f, "EntrySnapshot(#destroyed#{}; version=", self.entry.key())?;
            match self.version_tag() {
                Some(tag) => write!(f, "{tag})"),
                None => write!(f, "none)"),
            }
        } else {
            write!(f, "EntrySnapshot({})", self.entry)
        }
    }
}

/// A decoded snapshot not yet bound to a region.
///
/// Only record-level data is available here. Operations that consult the
/// owning region live on [`EntrySnapshot`], reached through [`bind`](Self::bind).
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotData {
    entry: RemoteRecordProxy,
}

impl SnapshotData {
    pub fn decode<R: Read>(input: &mut R) -> Result<Self, EntryError> {
        let with_stats = input.read_u8()? != 0;
        let entry = RemoteRecordProxy::decode(input, with_stats)?;
        Ok(Self { entry })
    }

    /// Decodes exactly one snapshot; leftover input is malformed.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, EntryError> {
        let data = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(EntryError::Malformed(format!(
                "{} trailing bytes after snapshot",
                bytes.len()
            )));
        }
        Ok(data)
    }

    pub fn key(&self) -> &str {
        self.entry.key()
    }

    pub fn version_tag(&self) -> Option<VersionTag> {
        self.entry.version_tag()
    }

    pub fn proxy(&self) -> &RemoteRecordProxy {
        &self.entry
    }

    pub fn encode<W: Write>(&self, out: &mut W) -> Result<(), EntryError> {
        write_snapshot(&self.entry, out)
    }

    pub fn bind(self, region: Arc<dyn Region>) -> EntrySnapshot {
        EntrySnapshot {
            region,
            entry: self.entry,
            started_local: false,
            destroyed: AtomicBool::new(false),
        }
    }
}

/// Statistics view of a snapshot's record at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStatistics {
    pub hit_count: u64,
    pub miss_count: u64,
    pub last_accessed: u64,
    pub last_modified: u64,
}

impl EntryStatistics {
    /// Hits over total lookups, `0.0` when there were none.
    pub fn hit_ratio(&self) -> f32 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f32 / total as f32
        }
    }
}

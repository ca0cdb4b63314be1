use crate::record::{RecordStats, StoredRecord};
use crate::snapshot::EntrySnapshot;
use crate::types::{EntryError, NodeId};
use crate::value::{CachedDeserializable, Token, Value, ValueHolder};
use crate::version::VersionStamp;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What an entry handle needs from the region that owns its key.
pub trait Region: Send + Sync + fmt::Debug {
    fn full_path(&self) -> &str;

    fn is_destroyed(&self) -> bool;

    fn is_copy_on_read(&self) -> bool;

    fn statistics_enabled(&self) -> bool;

    /// Writes through the region's distributed write path and returns the
    /// previous value.
    fn put(&self, key: &str, value: Arc<Value>) -> Result<Option<Arc<Value>>, EntryError>;

    fn user_attributes(&self) -> &UserAttributes;
}

/// Per-key attributes attached to a region, outside of the replicated data.
///
/// The backing map is created by the first `put`.
#[derive(Debug, Default)]
pub struct UserAttributes {
    map: OnceCell<RwLock<HashMap<String, Arc<Value>>>>,
}

impl UserAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.map.get().is_some()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.map.get()?.read().get(key).cloned()
    }

    /// Returns the value previously stored for `key`.
    pub fn put(&self, key: &str, value: Arc<Value>) -> Option<Arc<Value>> {
        self.map
            .get_or_init(Default::default)
            .write()
            .insert(key.to_string(), value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub full_path: String,
    pub copy_on_read: bool,
    pub statistics_enabled: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            full_path: "/region".to_string(),
            copy_on_read: false,
            statistics_enabled: false,
        }
    }
}

impl RegionConfig {
    pub fn new(full_path: impl Into<String>) -> Self {
        Self {
            full_path: full_path.into(),
            ..Self::default()
        }
    }

    pub fn with_copy_on_read(mut self, enabled: bool) -> Self {
        self.copy_on_read = enabled;
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }
}

/// A record held by a [`LocalRegion`].
#[derive(Debug, Clone)]
pub struct RegionEntry {
    key: String,
    value: ValueHolder,
    version: Option<VersionStamp>,
    last_modified: u64,
    stats: Option<RecordStats>,
}

impl StoredRecord for RegionEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn value(&self) -> ValueHolder {
        self.value.clone()
    }

    fn version_stamp(&self) -> Option<VersionStamp> {
        self.version
    }

    fn is_removed(&self) -> bool {
        self.value.is_tombstone()
    }

    fn last_modified(&self) -> u64 {
        self.last_modified
    }

    fn stats(&self) -> Option<RecordStats> {
        self.stats
    }
}

/// In-memory region hosted by one member.
#[derive(Debug)]
pub struct LocalRegion {
    config: RegionConfig,
    member: NodeId,
    destroyed: AtomicBool,
    region_version: AtomicU64,
    entries: RwLock<HashMap<String, RegionEntry>>,
    user_attributes: UserAttributes,
}

impl LocalRegion {
    pub fn new(config: RegionConfig, member: NodeId) -> Self {
        LocalRegion {
            config,
            member,
            destroyed: AtomicBool::new(false),
            region_version: AtomicU64::new(0),
            entries: RwLock::new(HashMap::new()),
            user_attributes: UserAttributes::new(),
        }
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn member(&self) -> NodeId {
        self.member
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `value` in its encoded form.
    pub fn put_serialized(
        &self,
        key: &str,
        value: CachedDeserializable,
    ) -> Result<Option<Arc<Value>>, EntryError> {
        self.store(key, ValueHolder::Serialized(value))
    }

    /// Reads the current value, counting a hit or a miss when statistics are
    /// enabled.
    pub fn get(&self, key: &str) -> Result<Option<Arc<Value>>, EntryError> {
        self.check_destroyed()?;
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(None);
        };
        let value = entry.value.resolve()?;
        if let Some(stats) = entry.stats.as_mut() {
            stats.last_accessed = now_millis();
            if value.is_some() {
                stats.hit_count += 1;
            } else {
                stats.miss_count += 1;
            }
        }
        Ok(value)
    }

    /// Marks the value invalid; the entry and its version remain.
    pub fn invalidate(&self, key: &str) -> Result<bool, EntryError> {
        self.replace_with_token(key, Token::Invalid)
    }

    pub fn local_invalidate(&self, key: &str) -> Result<bool, EntryError> {
        self.replace_with_token(key, Token::LocalInvalid)
    }

    /// Turns the entry into a tombstone that keeps its version.
    pub fn destroy_entry(&self, key: &str) -> Result<bool, EntryError> {
        self.replace_with_token(key, Token::Tombstone)
    }

    pub fn destroy_region(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            debug!("Region {} destroyed", self.config.full_path);
        }
    }

    /// Clone of the stored record, tombstones included.
    pub fn record(&self, key: &str) -> Option<RegionEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Snapshot of the live entry for `key`. Tombstoned entries read as
    /// missing. Fails once the region is destroyed.
    pub fn entry(self: &Arc<Self>, key: &str) -> Result<Option<EntrySnapshot>, EntryError> {
        self.lookup(key, false)
    }

    /// Like [`entry`](Self::entry) but also returns tombstones, which come
    /// back already destroyed.
    pub fn entry_with_tombstones(
        self: &Arc<Self>,
        key: &str,
    ) -> Result<Option<EntrySnapshot>, EntryError> {
        self.lookup(key, true)
    }

    fn lookup(
        self: &Arc<Self>,
        key: &str,
        allow_tombstones: bool,
    ) -> Result<Option<EntrySnapshot>, EntryError> {
        self.check_destroyed()?;
        let entries = self.entries.read();
        let Some(record) = entries
            .get(key)
            .filter(|e| allow_tombstones || !e.is_removed())
        else {
            return Ok(None);
        };
        let data_region: &LocalRegion = self;
        let region: Arc<dyn Region> = Arc::clone(self) as Arc<dyn Region>;
        Ok(Some(EntrySnapshot::new(
            record,
            data_region,
            region,
            allow_tombstones,
        )))
    }

    fn check_destroyed(&self) -> Result<(), EntryError> {
        if self.is_destroyed() {
            return Err(EntryError::RegionDestroyed {
                path: self.config.full_path.clone(),
            });
        }
        Ok(())
    }

    fn replace_with_token(&self, key: &str, token: Token) -> Result<bool, EntryError> {
        self.check_destroyed()?;
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        let entry_version = next_entry_version(key, entry.version)?;
        let now = now_millis();
        entry.value = ValueHolder::Token(token);
        entry.version = Some(self.next_stamp(entry_version, now));
        entry.last_modified = now;
        debug!("Replaced {} in {} with {:?}", key, self.config.full_path, token);
        Ok(true)
    }

    fn store(&self, key: &str, value: ValueHolder) -> Result<Option<Arc<Value>>, EntryError> {
        self.check_destroyed()?;
        let now = now_millis();
        let mut entries = self.entries.write();
        let entry_version = self.get_next_version(&entries, key)?;
        // Resolved before the write so a failure leaves the entry untouched
        let (previous, stats) = match entries.get(key) {
            Some(old) => (old.value.resolve()?, old.stats),
            None => (None, self.config.statistics_enabled.then(RecordStats::default)),
        };
        let stamp = self.next_stamp(entry_version, now);

        let new_entry = RegionEntry {
            key: key.to_string(),
            value,
            version: Some(stamp),
            last_modified: now,
            stats,
        };
        entries.insert(key.to_string(), new_entry);
        debug!(
            "Stored {} in {} at version {}",
            key,
            self.config.full_path,
            stamp.entry_version()
        );
        Ok(previous)
    }

    fn get_next_version(
        &self,
        entries: &HashMap<String, RegionEntry>,
        key: &str,
    ) -> Result<u32, EntryError> {
        next_entry_version(key, entries.get(key).and_then(|e| e.version))
    }

    fn next_stamp(&self, entry_version: u32, timestamp: u64) -> VersionStamp {
        let region_version = self.region_version.fetch_add(1, Ordering::AcqRel) + 1;
        VersionStamp::new(self.member, entry_version, region_version, timestamp)
    }
}

impl Region for LocalRegion {
    fn full_path(&self) -> &str {
        &self.config.full_path
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn is_copy_on_read(&self) -> bool {
        self.config.copy_on_read
    }

    fn statistics_enabled(&self) -> bool {
        self.config.statistics_enabled
    }

    fn put(&self, key: &str, value: Arc<Value>) -> Result<Option<Arc<Value>>, EntryError> {
        self.store(key, ValueHolder::Object(value))
    }

    fn user_attributes(&self) -> &UserAttributes {
        &self.user_attributes
    }
}

fn next_entry_version(key: &str, current: Option<VersionStamp>) -> Result<u32, EntryError> {
    match current {
        Some(stamp) => stamp
            .entry_version()
            .checked_add(1)
            .ok_or_else(|| EntryError::VersionOverflow {
                key: key.to_string(),
            }),
        None => Ok(1),
    }
}

pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(config: RegionConfig) -> Arc<LocalRegion> {
        Arc::new(LocalRegion::new(config, NodeId::new()))
    }

    #[test]
    fn test_version_increment() {
        let region = region(RegionConfig::new("/orders"));

        region.put("key1", Arc::new(Value::from("a"))).unwrap();
        let first = region.record("key1").unwrap().version_stamp().unwrap();
        assert_eq!(first.entry_version(), 1);

        region.put("key1", Arc::new(Value::from("b"))).unwrap();
        let second = region.record("key1").unwrap().version_stamp().unwrap();
        assert_eq!(second.entry_version(), 2);
        assert!(second.region_version() > first.region_version());
        assert_eq!(second.member(), region.member());
    }

    #[test]
    fn test_put_returns_previous_value() {
        let region = region(RegionConfig::new("/orders"));

        assert_eq!(region.put("k", Arc::new(Value::from("a"))).unwrap(), None);
        let previous = region.put("k", Arc::new(Value::from("b"))).unwrap();
        assert_eq!(previous.as_deref(), Some(&Value::from("a")));
    }

    #[test]
    fn test_destroyed_region_rejects_puts() {
        let region = region(RegionConfig::new("/orders"));
        region.destroy_region();

        let result = region.put("k", Arc::new(Value::from("a")));
        assert!(matches!(result, Err(EntryError::RegionDestroyed { path }) if path == "/orders"));
    }

    #[test]
    fn test_get_counts_hits_and_misses() {
        let region = region(RegionConfig::new("/orders").with_statistics(true));
        region.put("k", Arc::new(Value::from("a"))).unwrap();

        region.get("k").unwrap();
        region.get("k").unwrap();
        region.invalidate("k").unwrap();
        region.get("k").unwrap();

        let stats = region.record("k").unwrap().stats().unwrap();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn test_stats_absent_when_disabled() {
        let region = region(RegionConfig::new("/orders"));
        region.put("k", Arc::new(Value::from("a"))).unwrap();
        assert!(region.record("k").unwrap().stats().is_none());
    }

    #[test]
    fn test_destroy_entry_leaves_tombstone() {
        let region = region(RegionConfig::new("/orders"));
        region.put("k", Arc::new(Value::from("a"))).unwrap();

        assert!(region.destroy_entry("k").unwrap());
        assert!(!region.destroy_entry("missing").unwrap());

        let record = region.record("k").unwrap();
        assert!(record.is_removed());
        assert_eq!(record.version_stamp().unwrap().entry_version(), 2);
        assert!(region.entry("k").unwrap().is_none());
        assert!(region.entry_with_tombstones("k").unwrap().is_some());
    }

    #[test]
    fn test_failed_put_leaves_entry_untouched() {
        let region = region(RegionConfig::new("/orders"));
        region
            .put_serialized("k", CachedDeserializable::from_bytes(vec![0xff; 5]))
            .unwrap();

        let result = region.put("k", Arc::new(Value::from("new")));
        assert!(matches!(result, Err(EntryError::Deserialization(_))));
        let record = region.record("k").unwrap();
        assert!(matches!(record.value(), ValueHolder::Serialized(_)));
        assert_eq!(record.version_stamp().unwrap().entry_version(), 1);
    }

    #[test]
    fn test_destroyed_region_serves_no_entries() {
        let region = region(RegionConfig::new("/orders"));
        region.put("k", Arc::new(Value::from("a"))).unwrap();
        region.destroy_region();

        assert!(matches!(
            region.entry("k"),
            Err(EntryError::RegionDestroyed { .. })
        ));
        assert!(matches!(
            region.entry_with_tombstones("k"),
            Err(EntryError::RegionDestroyed { .. })
        ));
    }

    #[test]
    fn test_entry_version_overflow_is_an_error() {
        let region = region(RegionConfig::new("/orders"));
        region.put("k", Arc::new(Value::from("a"))).unwrap();
        {
            let mut entries = region.entries.write();
            let entry = entries.get_mut("k").unwrap();
            entry.version = Some(VersionStamp::new(region.member(), u32::MAX, 1, 0));
        }

        assert!(matches!(
            region.put("k", Arc::new(Value::from("b"))),
            Err(EntryError::VersionOverflow { key }) if key == "k"
        ));
        assert!(matches!(
            region.invalidate("k"),
            Err(EntryError::VersionOverflow { .. })
        ));
        assert_eq!(region.get("k").unwrap().as_deref(), Some(&Value::from("a")));
    }

    #[test]
    fn test_user_attributes_created_on_first_put() {
        let attrs = UserAttributes::new();
        assert!(!attrs.is_initialized());
        assert_eq!(attrs.get("k"), None);
        assert!(!attrs.is_initialized());

        assert_eq!(attrs.put("k", Arc::new(Value::Int(1))), None);
        assert!(attrs.is_initialized());
        let previous = attrs.put("k", Arc::new(Value::Int(2)));
        assert_eq!(previous.as_deref(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_concurrent_first_writers_share_one_map() {
        let attrs = Arc::new(UserAttributes::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let attrs = Arc::clone(&attrs);
                std::thread::spawn(move || {
                    attrs.put(&format!("k{i}"), Arc::new(Value::Int(i)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for i in 0..8 {
            assert_eq!(attrs.get(&format!("k{i}")).as_deref(), Some(&Value::Int(i)));
        }
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: RegionConfig =
            serde_json::from_str(r#"{"full_path": "/orders", "copy_on_read": true}"#).unwrap();
        assert_eq!(config.full_path, "/orders");
        assert!(config.copy_on_read);
        assert!(!config.statistics_enabled);
    }
}

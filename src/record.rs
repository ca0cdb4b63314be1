//! Stored records and their point-in-time captures.
//!
//! A [`RemoteRecordProxy`] copies everything an entry handle needs out of a
//! [`StoredRecord`] once, so the handle keeps working after the record's
//! bucket moves to another member. Nothing in a proxy is refreshed from its
//! source.

use crate::types::{EntryError, NodeId};
use crate::value::{CachedDeserializable, Token, Value, ValueHolder};
use crate::version::{VersionStamp, VersionTag};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

const HOLDER_ABSENT: u8 = 0;
const HOLDER_OBJECT: u8 = 1;
const HOLDER_SERIALIZED: u8 = 2;
const HOLDER_TOKEN: u8 = 3;

/// The contract every record implementation satisfies.
pub trait StoredRecord {
    fn key(&self) -> &str;

    fn value(&self) -> ValueHolder;

    fn version_stamp(&self) -> Option<VersionStamp>;

    fn is_removed(&self) -> bool;

    fn is_tombstone(&self) -> bool {
        self.value().is_tombstone()
    }

    /// Milliseconds since the Unix epoch.
    fn last_modified(&self) -> u64;

    /// `None` when the record does not keep statistics.
    fn stats(&self) -> Option<RecordStats>;

    /// `Some` when the record is itself an earlier capture.
    fn as_proxy(&self) -> Option<&RemoteRecordProxy> {
        None
    }
}

/// Access counters kept by records that support statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub last_accessed: u64,
}

/// Which proxy shape was captured. Selected once from the source record and
/// carried through to the wire flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Plain,
    WithStats(RecordStats),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecordProxy {
    key: String,
    value: ValueHolder,
    version: Option<VersionStamp>,
    removed: bool,
    last_modified: u64,
    kind: ProxyKind,
}

impl RemoteRecordProxy {
    /// Captures `record` as it is right now.
    ///
    /// With `allow_tombstones` a tombstoned record keeps its tombstone value,
    /// otherwise the value is captured as absent. The removed flag is captured
    /// either way.
    pub fn capture(record: &dyn StoredRecord, allow_tombstones: bool) -> Self {
        let value = match record.value() {
            ValueHolder::Token(Token::Tombstone) if !allow_tombstones => ValueHolder::Absent,
            other => other,
        };
        let kind = match record.stats() {
            Some(stats) => ProxyKind::WithStats(stats),
            None => ProxyKind::Plain,
        };
        Self {
            key: record.key().to_string(),
            value,
            version: record.version_stamp(),
            removed: record.is_removed(),
            last_modified: record.last_modified(),
            kind,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The captured holder, unresolved.
    pub fn value(&self) -> &ValueHolder {
        &self.value
    }

    pub fn version_stamp(&self) -> Option<VersionStamp> {
        self.version
    }

    pub fn version_tag(&self) -> Option<VersionTag> {
        self.version.map(|stamp| stamp.as_version_tag())
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn has_stats(&self) -> bool {
        matches!(self.kind, ProxyKind::WithStats(_))
    }

    pub fn stats(&self) -> Option<RecordStats> {
        match self.kind {
            ProxyKind::WithStats(stats) => Some(stats),
            ProxyKind::Plain => None,
        }
    }

    /// Replaces the captured holder. Local to this proxy only.
    pub fn set_cached_value(&mut self, value: ValueHolder) {
        self.value = value;
    }

    pub fn encode<W: Write>(&self, out: &mut W) -> Result<(), EntryError> {
        write_bytes(out, self.key.as_bytes())?;
        encode_holder(out, &self.value)?;
        out.write_u8(self.removed as u8)?;
        out.write_u64::<BigEndian>(self.last_modified)?;
        match &self.version {
            Some(stamp) => {
                out.write_u8(1)?;
                out.write_all(stamp.member().as_bytes())?;
                out.write_u32::<BigEndian>(stamp.entry_version())?;
                out.write_u64::<BigEndian>(stamp.region_version())?;
                out.write_u64::<BigEndian>(stamp.timestamp())?;
            }
            None => out.write_u8(0)?,
        }
        if let ProxyKind::WithStats(stats) = self.kind {
            out.write_u64::<BigEndian>(stats.hit_count)?;
            out.write_u64::<BigEndian>(stats.miss_count)?;
            out.write_u64::<BigEndian>(stats.last_accessed)?;
        }
        Ok(())
    }

    /// Decodes the fields of a proxy whose shape was already read from the
    /// snapshot flag byte.
    pub fn decode<R: Read>(input: &mut R, with_stats: bool) -> Result<Self, EntryError> {
        let key = String::from_utf8(read_bytes(input)?)
            .map_err(|e| EntryError::Malformed(format!("key is not UTF-8: {e}")))?;
        let value = decode_holder(input)?;
        let removed = input.read_u8()? != 0;
        let last_modified = input.read_u64::<BigEndian>()?;
        let version = match input.read_u8()? {
            0 => None,
            1 => {
                let mut member = [0u8; 16];
                input.read_exact(&mut member)?;
                let entry_version = input.read_u32::<BigEndian>()?;
                let region_version = input.read_u64::<BigEndian>()?;
                let timestamp = input.read_u64::<BigEndian>()?;
                Some(VersionStamp::new(
                    NodeId::from_bytes(member),
                    entry_version,
                    region_version,
                    timestamp,
                ))
            }
            other => {
                return Err(EntryError::Malformed(format!(
                    "invalid version marker {other}"
                )))
            }
        };
        let kind = if with_stats {
            ProxyKind::WithStats(RecordStats {
                hit_count: input.read_u64::<BigEndian>()?,
                miss_count: input.read_u64::<BigEndian>()?,
                last_accessed: input.read_u64::<BigEndian>()?,
            })
        } else {
            ProxyKind::Plain
        };
        Ok(Self {
            key,
            value,
            version,
            removed,
            last_modified,
            kind,
        })
    }
}

impl StoredRecord for RemoteRecordProxy {
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
        self.removed
    }

    fn last_modified(&self) -> u64 {
        self.last_modified
    }

    fn stats(&self) -> Option<RecordStats> {
        RemoteRecordProxy::stats(self)
    }

    fn as_proxy(&self) -> Option<&RemoteRecordProxy> {
        Some(self)
    }
}

impl fmt::Display for RemoteRecordProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteRecordProxy({}; value={}; version=", self.key, self.value)?;
        match self.version_tag() {
            Some(tag) => write!(f, "{tag}")?,
            None => write!(f, "none")?,
        }
        if let ProxyKind::WithStats(stats) = self.kind {
            write!(
                f,
                "; hits={}; misses={}; lastAccessed={}",
                stats.hit_count, stats.miss_count, stats.last_accessed
            )?;
        }
        write!(f, ")")
    }
}

fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> Result<(), EntryError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| EntryError::Malformed(format!("field too large: {} bytes", bytes.len())))?;
    out.write_u32::<BigEndian>(len)?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_bytes<R: Read>(input: &mut R) -> Result<Vec<u8>, EntryError> {
    let len = input.read_u32::<BigEndian>()? as usize;
    let mut buf = Vec::new();
    input.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(EntryError::Malformed(format!(
            "truncated field: expected {len} bytes, got {}",
            buf.len()
        )));
    }
    Ok(buf)
}

fn encode_holder<W: Write>(out: &mut W, holder: &ValueHolder) -> Result<(), EntryError> {
    match holder {
        ValueHolder::Absent => out.write_u8(HOLDER_ABSENT)?,
        ValueHolder::Object(value) => {
            out.write_u8(HOLDER_OBJECT)?;
            let bytes = bincode::serialize(value.as_ref())
                .map_err(|e| EntryError::Malformed(e.to_string()))?;
            write_bytes(out, &bytes)?;
        }
        // Stays encoded; the receiver resolves it on first read.
        ValueHolder::Serialized(cd) => {
            out.write_u8(HOLDER_SERIALIZED)?;
            write_bytes(out, cd.serialized_bytes())?;
        }
        ValueHolder::Token(token) => {
            out.write_u8(HOLDER_TOKEN)?;
            out.write_u8(token.code())?;
        }
    }
    Ok(())
}

fn decode_holder<R: Read>(input: &mut R) -> Result<ValueHolder, EntryError> {
    match input.read_u8()? {
        HOLDER_ABSENT => Ok(ValueHolder::Absent),
        HOLDER_OBJECT => {
            let value: Value = bincode::deserialize(&read_bytes(input)?)
                .map_err(|e| EntryError::Malformed(e.to_string()))?;
            Ok(ValueHolder::Object(Arc::new(value)))
        }
        HOLDER_SERIALIZED => Ok(ValueHolder::Serialized(CachedDeserializable::from_bytes(
            read_bytes(input)?,
        ))),
        HOLDER_TOKEN => Ok(ValueHolder::Token(Token::from_code(input.read_u8()?)?)),
        other => Err(EntryError::Malformed(format!("unknown value tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRecord {
        value: ValueHolder,
        removed: bool,
        stats: Option<RecordStats>,
    }

    impl StoredRecord for FixedRecord {
        fn key(&self) -> &str {
            "k"
        }
        fn value(&self) -> ValueHolder {
            self.value.clone()
        }
        fn version_stamp(&self) -> Option<VersionStamp> {
            None
        }
        fn is_removed(&self) -> bool {
            self.removed
        }
        fn last_modified(&self) -> u64 {
            42
        }
        fn stats(&self) -> Option<RecordStats> {
            self.stats
        }
    }

    #[test]
    fn test_capture_picks_variant_from_source() {
        let counted = FixedRecord {
            stats: Some(RecordStats {
                hit_count: 2,
                miss_count: 1,
                last_accessed: 40,
            }),
            ..plain_record()
        };
        assert!(!RemoteRecordProxy::capture(&plain_record(), false).has_stats());
        let proxy = RemoteRecordProxy::capture(&counted, false);
        assert!(proxy.has_stats());
        assert_eq!(proxy.stats().map(|s| s.hit_count), Some(2));
        assert_eq!(proxy.last_modified(), 42);
    }

    fn plain_record() -> FixedRecord {
        FixedRecord {
            value: ValueHolder::object("v"),
            removed: false,
            stats: None,
        }
    }

    #[test]
    fn test_capture_hides_tombstone_unless_allowed() {
        let tombstone = FixedRecord {
            value: ValueHolder::Token(Token::Tombstone),
            removed: true,
            stats: None,
        };

        let hidden = RemoteRecordProxy::capture(&tombstone, false);
        assert_eq!(hidden.value(), &ValueHolder::Absent);
        assert!(hidden.is_removed());

        let visible = RemoteRecordProxy::capture(&tombstone, true);
        assert!(visible.value().is_tombstone());
        assert!(visible.is_removed());
    }

    #[test]
    fn test_capture_is_not_refreshed() {
        let mut record = plain_record();
        let proxy = RemoteRecordProxy::capture(&record, false);
        record.value = ValueHolder::object("changed");
        record.removed = true;

        assert_eq!(proxy.value(), &ValueHolder::object("v"));
        assert!(!proxy.is_removed());
    }

    #[test]
    fn test_set_cached_value_only_touches_this_proxy() {
        let record = plain_record();
        let mut a = RemoteRecordProxy::capture(&record, false);
        let b = a.clone();
        a.set_cached_value(ValueHolder::object("v2"));

        assert_eq!(a.value(), &ValueHolder::object("v2"));
        assert_eq!(b.value(), &ValueHolder::object("v"));
    }

    #[test]
    fn test_serialized_value_stays_encoded_on_the_wire() {
        let cd = CachedDeserializable::from_value(&Value::Int(7)).unwrap();
        let record = FixedRecord {
            value: ValueHolder::Serialized(cd.clone()),
            removed: false,
            stats: None,
        };
        let proxy = RemoteRecordProxy::capture(&record, false);
        let mut buf = Vec::new();
        proxy.encode(&mut buf).unwrap();

        let decoded = RemoteRecordProxy::decode(&mut buf.as_slice(), false).unwrap();
        match decoded.value() {
            ValueHolder::Serialized(got) => {
                assert_eq!(got.serialized_bytes(), cd.serialized_bytes())
            }
            other => panic!("expected serialized holder, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_value_tag() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"k").unwrap();
        buf.push(9);

        let err = RemoteRecordProxy::decode(&mut buf.as_slice(), false).unwrap_err();
        assert!(matches!(err, EntryError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_truncated_key() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(10).unwrap();
        buf.extend_from_slice(b"abc");

        let err = RemoteRecordProxy::decode(&mut buf.as_slice(), false).unwrap_err();
        assert!(matches!(err, EntryError::Malformed(_)));
    }
}

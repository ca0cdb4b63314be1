use crate::region::{LocalRegion, RegionConfig};
use crate::types::{ClusterMessage, EntryError, NodeId, NodeInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// A cluster member hosting regions and answering entry lookups for them.
pub struct MemberNode {
    /// Node's own information
    pub info: NodeInfo,

    /// Hosted regions by full path
    regions: RwLock<HashMap<String, Arc<LocalRegion>>>,
}

impl MemberNode {
    pub fn new(address: SocketAddr) -> Self {
        MemberNode {
            info: NodeInfo {
                id: NodeId::new(),
                address,
            },
            regions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the region, or returns the existing one with the same path.
    pub fn create_region(&self, config: RegionConfig) -> Arc<LocalRegion> {
        let mut regions = self.regions.write();
        let region = regions
            .entry(config.full_path.clone())
            .or_insert_with(|| Arc::new(LocalRegion::new(config, self.info.id)));
        Arc::clone(region)
    }

    pub fn region(&self, full_path: &str) -> Option<Arc<LocalRegion>> {
        self.regions.read().get(full_path).cloned()
    }

    /// Every request gets exactly one reply.
    pub fn handle_message(&self, message: ClusterMessage) -> ClusterMessage {
        match message {
            ClusterMessage::HeartBeat => ClusterMessage::HeartBeatAck,
            ClusterMessage::EntryRequest {
                region,
                key,
                allow_tombstones,
            } => match self.entry_payload(&region, &key, allow_tombstones) {
                Ok(payload) => ClusterMessage::EntryResponse {
                    member: self.info.id,
                    payload,
                },
                Err(EntryError::RegionNotFound(region)) => ClusterMessage::UnknownRegion { region },
                Err(e) => {
                    warn!("Member {} failed to serve {}: {}", self.info.id, key, e);
                    self.failure(e.to_string())
                }
            },
            other => {
                warn!("Member {} got unexpected request {:?}", self.info.id, other);
                self.failure(format!("unexpected request: {other:?}"))
            }
        }
    }

    fn failure(&self, reason: String) -> ClusterMessage {
        ClusterMessage::RequestFailed {
            member: self.info.id,
            reason,
        }
    }

    /// Snapshot wire bytes for `key`, or `None` when the region has no such
    /// entry.
    pub fn entry_payload(
        &self,
        region: &str,
        key: &str,
        allow_tombstones: bool,
    ) -> Result<Option<Vec<u8>>, EntryError> {
        let local = self
            .region(region)
            .ok_or_else(|| EntryError::RegionNotFound(region.to_string()))?;
        let snapshot = if allow_tombstones {
            local.entry_with_tombstones(key)?
        } else {
            local.entry(key)?
        };
        snapshot.map(|s| s.to_bytes()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotData;
    use crate::value::Value;
    use crate::Region;
    use std::net::{IpAddr, Ipv4Addr};

    fn node() -> MemberNode {
        MemberNode::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080))
    }

    #[test]
    fn test_member_node_creation() {
        let node = node();
        assert_eq!(node.info.address.port(), 8080);
        assert!(node.region("/orders").is_none());
    }

    #[test]
    fn test_create_region_is_idempotent() {
        let node = node();
        let first = node.create_region(RegionConfig::new("/orders"));
        let second = node.create_region(RegionConfig::new("/orders").with_statistics(true));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.member(), node.info.id);
    }

    #[test]
    fn test_heartbeat() {
        assert_eq!(
            node().handle_message(ClusterMessage::HeartBeat),
            ClusterMessage::HeartBeatAck
        );
    }

    #[test]
    fn test_entry_request_returns_snapshot_bytes() {
        let node = node();
        let region = node.create_region(RegionConfig::new("/orders"));
        region.put("k", Arc::new(Value::from("v"))).unwrap();

        let response = node.handle_message(ClusterMessage::EntryRequest {
            region: "/orders".to_string(),
            key: "k".to_string(),
            allow_tombstones: false,
        });
        let ClusterMessage::EntryResponse {
            member,
            payload: Some(payload),
        } = response
        else {
            panic!("expected an entry payload");
        };
        assert_eq!(member, node.info.id);
        let data = SnapshotData::from_bytes(&payload).unwrap();
        assert_eq!(data.key(), "k");
        assert_eq!(data.version_tag().map(|t| t.member), Some(node.info.id));
    }

    #[test]
    fn test_missing_entry_and_region() {
        let node = node();
        node.create_region(RegionConfig::new("/orders"));

        assert_eq!(node.entry_payload("/orders", "missing", false).unwrap(), None);
        assert_eq!(
            node.handle_message(ClusterMessage::EntryRequest {
                region: "/nope".to_string(),
                key: "k".to_string(),
                allow_tombstones: false,
            }),
            ClusterMessage::UnknownRegion {
                region: "/nope".to_string()
            }
        );
    }

    #[test]
    fn test_tombstones_only_served_on_request() {
        let node = node();
        let region = node.create_region(RegionConfig::new("/orders"));
        region.put("k", Arc::new(Value::from("v"))).unwrap();
        region.destroy_entry("k").unwrap();

        assert_eq!(node.entry_payload("/orders", "k", false).unwrap(), None);
        let payload = node.entry_payload("/orders", "k", true).unwrap().unwrap();
        let data = SnapshotData::from_bytes(&payload).unwrap();
        assert!(data.proxy().is_removed());
        assert!(data.proxy().value().is_tombstone());
    }

    #[test]
    fn test_destroyed_region_answers_with_failure() {
        let node = node();
        let region = node.create_region(RegionConfig::new("/orders"));
        region.put("k", Arc::new(Value::from("v"))).unwrap();
        region.destroy_region();

        assert!(matches!(
            node.entry_payload("/orders", "k", false),
            Err(EntryError::RegionDestroyed { .. })
        ));
        let response = node.handle_message(ClusterMessage::EntryRequest {
            region: "/orders".to_string(),
            key: "k".to_string(),
            allow_tombstones: false,
        });
        match response {
            ClusterMessage::RequestFailed { member, reason } => {
                assert_eq!(member, node.info.id);
                assert!(reason.contains("region destroyed"));
            }
            other => panic!("expected a failure reply, got {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_request_gets_a_reply() {
        let node = node();
        let response = node.handle_message(ClusterMessage::HeartBeatAck);
        assert!(matches!(response, ClusterMessage::RequestFailed { .. }));
    }
}

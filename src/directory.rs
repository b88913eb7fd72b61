//! In-memory index of nodes and the services they export.
//!
//! Pure data, no I/O: the bus driver is the only writer, public handles read
//! snapshots through it. Every node record keeps three views of the same
//! service entries:
//!
//! - `services`: insertion order, for enumeration;
//! - `by_service`: service id -> entries ascending by version, so "best
//!   available version" is a last-element read;
//! - `by_port`: port -> entry, the reverse map for demultiplexing.

use std::collections::HashMap;

/// One service announcement as seen on the bus. A service entry is uniquely
/// keyed by `(node, port)`; `(service, version, instance)` is descriptive
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service: u32,
    pub port: u32,
    pub version: u8,
    pub instance: u32,
}

#[derive(Debug, Default)]
pub(crate) struct NodeRecord {
    services: Vec<ServiceInfo>,
    by_service: HashMap<u32, Vec<ServiceInfo>>,
    by_port: HashMap<u32, ServiceInfo>,
    published: bool,
}

impl NodeRecord {
    /// Insert a service entry. Not idempotent: the kernel never announces
    /// the same `(node, port)` twice, so the caller must not either.
    fn insert(&mut self, info: ServiceInfo) {
        self.services.push(info);
        let instances = self.by_service.entry(info.service).or_default();
        // Ascending by version, ties broken by insertion order.
        let at = instances.partition_point(|e| e.version <= info.version);
        instances.insert(at, info);
        self.by_port.insert(info.port, info);
    }

    /// Remove the entry at `port`, if any.
    fn remove_by_port(&mut self, port: u32) -> Option<ServiceInfo> {
        let info = self.by_port.remove(&port)?;
        if let Some(at) = self.services.iter().position(|e| e.port == port) {
            self.services.remove(at);
        }
        if let Some(instances) = self.by_service.get_mut(&info.service) {
            if let Some(at) = instances.iter().position(|e| e.port == port) {
                instances.remove(at);
            }
            if instances.is_empty() {
                self.by_service.remove(&info.service);
            }
        }
        Some(info)
    }

    /// Port of the highest-version entry for `service`.
    pub(crate) fn lookup_port(&self, service: u32) -> Option<u32> {
        self.by_service
            .get(&service)
            .and_then(|instances| instances.last())
            .map(|info| info.port)
    }

    /// Service id announced at `port`.
    pub(crate) fn lookup_service(&self, port: u32) -> Option<u32> {
        self.by_port.get(&port).map(|info| info.service)
    }

    pub(crate) fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    pub(crate) fn has_services(&self) -> bool {
        !self.services.is_empty()
    }

    pub(crate) fn has_all_services(&self, wanted: &[u32]) -> bool {
        wanted
            .iter()
            .all(|service| self.by_service.contains_key(service))
    }

    pub(crate) fn is_published(&self) -> bool {
        self.published
    }
}

/// Result of a [`NodeDirectory::remove_service`] step, consumed by the bus
/// driver to decide on node teardown and diagnostics.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ServiceRemoval {
    Removed {
        info: ServiceInfo,
        node_now_empty: bool,
        node_published: bool,
    },
    UnknownNode,
    UnknownPort,
}

#[derive(Debug, Default)]
pub(crate) struct NodeDirectory {
    nodes: HashMap<u32, NodeRecord>,
}

impl NodeDirectory {
    /// Insert a service entry, creating the node record (unpublished) when
    /// absent. Returns true when the node record was created by this call.
    pub(crate) fn insert_service(&mut self, node_id: u32, info: ServiceInfo) -> bool {
        let created = !self.nodes.contains_key(&node_id);
        self.nodes.entry(node_id).or_default().insert(info);
        created
    }

    /// Remove the service entry at `(node_id, port)`. The emptied node
    /// record is left in place; the caller removes it once its pending
    /// publish state is resolved.
    pub(crate) fn remove_service(&mut self, node_id: u32, port: u32) -> ServiceRemoval {
        let Some(record) = self.nodes.get_mut(&node_id) else {
            return ServiceRemoval::UnknownNode;
        };
        match record.remove_by_port(port) {
            Some(info) => ServiceRemoval::Removed {
                info,
                node_now_empty: !record.has_services(),
                node_published: record.published,
            },
            None => ServiceRemoval::UnknownPort,
        }
    }

    pub(crate) fn get(&self, node_id: u32) -> Option<&NodeRecord> {
        self.nodes.get(&node_id)
    }

    /// The record for `node_id`, unless it is unknown or still unpublished.
    pub(crate) fn get_published(&self, node_id: u32) -> Option<&NodeRecord> {
        self.nodes.get(&node_id).filter(|record| record.published)
    }

    /// Flip `node_id` to published. False when the node is gone or already
    /// published, in which case nothing must be announced.
    pub(crate) fn mark_published(&mut self, node_id: u32) -> bool {
        match self.nodes.get_mut(&node_id) {
            Some(record) if !record.published => {
                record.published = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_node(&mut self, node_id: u32) {
        self.nodes.remove(&node_id);
    }

    /// Snapshot of published node ids.
    pub(crate) fn published_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .nodes
            .iter()
            .filter(|(_, record)| record.published)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

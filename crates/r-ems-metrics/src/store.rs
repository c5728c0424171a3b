//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Per-node, per-group and fleet metrics shared by every adapter task.
//!
//! One `parking_lot::RwLock` guards the whole store. Writers hold it for a single entry;
//! [`MetricsStore::visit`] holds the read side for one complete traversal.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::RwLock;
use r_ems_msg::NodeType;
use serde::Serialize;

use crate::{MetricsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Accumulates deltas.
    Counter,
    /// Holds the last value written.
    Gauge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricEntry {
    pub kind: MetricKind,
    pub help: String,
    pub value: u64,
}

impl MetricEntry {
    fn apply(&mut self, value: u64) {
        match self.kind {
            MetricKind::Counter => self.value = self.value.saturating_add(value),
            MetricKind::Gauge => self.value = value,
        }
    }
}

/// Metrics of one node, with nested per-group sets.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetricSet {
    pub node_type: NodeType,
    pub entries: IndexMap<String, MetricEntry>,
    pub groups: IndexMap<String, IndexMap<String, MetricEntry>>,
}

impl NodeMetricSet {
    fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            entries: IndexMap::new(),
            groups: IndexMap::new(),
        }
    }
}

/// Fleet aggregates refreshed by the manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetCounts {
    pub north_nodes: u64,
    pub north_running: u64,
    pub north_disconnected: u64,
    pub south_nodes: u64,
    pub south_running: u64,
    pub south_disconnected: u64,
}

/// Read-only view handed to [`MetricsStore::visit`].
#[derive(Debug, Serialize)]
pub struct StoreView<'a> {
    pub fleet: FleetCounts,
    pub core_dumped: bool,
    pub uptime_seconds: u64,
    pub nodes: &'a IndexMap<String, NodeMetricSet>,
}

#[derive(Debug, Default)]
struct StoreInner {
    fleet: FleetCounts,
    core_dumped: bool,
    nodes: IndexMap<String, NodeMetricSet>,
}

/// Process-wide metrics collection, constructed once and shared behind an `Arc`.
#[derive(Debug)]
pub struct MetricsStore {
    inner: RwLock<StoreInner>,
    started: Instant,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            started: Instant::now(),
        }
    }

    /// Create the empty metric set of a node.
    pub fn add_node(&self, node: &str, node_type: NodeType) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(node) {
            return Err(MetricsError::DuplicateNode(node.to_owned()));
        }
        inner
            .nodes
            .insert(node.to_owned(), NodeMetricSet::new(node_type));
        Ok(())
    }

    /// Drop every entry and group set of a node. Returns whether the node was present.
    pub fn remove_node(&self, node: &str) -> bool {
        self.inner.write().nodes.shift_remove(node).is_some()
    }

    pub fn register(
        &self,
        node: &str,
        name: &str,
        kind: MetricKind,
        help: &str,
        initial: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let set = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| MetricsError::UnknownNode(node.to_owned()))?;
        insert_entry(&mut set.entries, node, name, kind, help, initial)
    }

    /// Counters add `value`, gauges are replaced by it.
    pub fn update(&self, node: &str, name: &str, value: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| MetricsError::UnknownNode(node.to_owned()))?
            .entries
            .get_mut(name)
            .ok_or_else(|| unknown_metric(node, name))?;
        entry.apply(value);
        Ok(())
    }

    /// Register a metric inside a group set, creating the set on first use.
    pub fn register_group(
        &self,
        node: &str,
        group: &str,
        name: &str,
        kind: MetricKind,
        help: &str,
        initial: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let set = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| MetricsError::UnknownNode(node.to_owned()))?;
        let entries = set.groups.entry(group.to_owned()).or_default();
        insert_entry(entries, node, name, kind, help, initial)
    }

    pub fn update_group(&self, node: &str, group: &str, name: &str, value: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| MetricsError::UnknownNode(node.to_owned()))?
            .groups
            .get_mut(group)
            .and_then(|entries| entries.get_mut(name))
            .ok_or_else(|| unknown_metric(node, &format!("{group}/{name}")))?;
        entry.apply(value);
        Ok(())
    }

    pub fn remove_group(&self, node: &str, group: &str) -> bool {
        self.inner
            .write()
            .nodes
            .get_mut(node)
            .map(|set| set.groups.shift_remove(group).is_some())
            .unwrap_or(false)
    }

    pub fn value(&self, node: &str, name: &str) -> Option<u64> {
        let inner = self.inner.read();
        inner.nodes.get(node)?.entries.get(name).map(|e| e.value)
    }

    pub fn group_value(&self, node: &str, group: &str, name: &str) -> Option<u64> {
        let inner = self.inner.read();
        inner
            .nodes
            .get(node)?
            .groups
            .get(group)?
            .get(name)
            .map(|e| e.value)
    }

    pub fn set_fleet(&self, fleet: FleetCounts) {
        self.inner.write().fleet = fleet;
    }

    /// Latch raised once an adapter task has died.
    pub fn set_core_dumped(&self) {
        self.inner.write().core_dumped = true;
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Run `f` over a consistent view of the whole store.
    ///
    /// The read lock is held while `f` runs: `f` must not block and must not call back into
    /// the store's writers.
    pub fn visit<R>(&self, f: impl FnOnce(&StoreView<'_>) -> R) -> R {
        let inner = self.inner.read();
        let view = StoreView {
            fleet: inner.fleet,
            core_dumped: inner.core_dumped,
            uptime_seconds: self.uptime().as_secs(),
            nodes: &inner.nodes,
        };
        f(&view)
    }
}

fn insert_entry(
    entries: &mut IndexMap<String, MetricEntry>,
    node: &str,
    name: &str,
    kind: MetricKind,
    help: &str,
    initial: u64,
) -> Result<()> {
    if entries.contains_key(name) {
        return Err(MetricsError::DuplicateMetric {
            node: node.to_owned(),
            name: name.to_owned(),
        });
    }
    entries.insert(
        name.to_owned(),
        MetricEntry {
            kind,
            help: help.to_owned(),
            value: initial,
        },
    );
    Ok(())
}

fn unknown_metric(node: &str, name: &str) -> MetricsError {
    MetricsError::UnknownMetric {
        node: node.to_owned(),
        name: name.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(node: &str, node_type: NodeType) -> MetricsStore {
        let store = MetricsStore::new();
        store.add_node(node, node_type).expect("add node");
        store
    }

    #[test]
    fn counters_accumulate_and_gauges_replace() {
        let store = store_with("plc1", NodeType::Driver);
        store
            .register("plc1", "send_bytes", MetricKind::Counter, "bytes sent", 0)
            .unwrap();
        store
            .register("plc1", "last_rtt_ms", MetricKind::Gauge, "round trip", 9999)
            .unwrap();

        for (name, value) in [("send_bytes", 5), ("send_bytes", 3), ("last_rtt_ms", 5), ("last_rtt_ms", 3)] {
            store.update("plc1", name, value).unwrap();
        }
        assert_eq!(store.value("plc1", "send_bytes"), Some(8));
        assert_eq!(store.value("plc1", "last_rtt_ms"), Some(3));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let store = store_with("plc1", NodeType::Driver);
        store
            .register("plc1", "recv_bytes", MetricKind::Counter, "bytes received", 0)
            .unwrap();
        store.update("plc1", "recv_bytes", 4).unwrap();
        let err = store
            .register("plc1", "recv_bytes", MetricKind::Gauge, "again", 0)
            .unwrap_err();
        assert!(matches!(err, MetricsError::DuplicateMetric { .. }));
        assert_eq!(store.value("plc1", "recv_bytes"), Some(4));
        assert!(matches!(
            store.add_node("plc1", NodeType::App),
            Err(MetricsError::DuplicateNode(_))
        ));
    }

    #[test]
    fn removing_a_node_purges_group_metrics() {
        let store = store_with("plc1", NodeType::Driver);
        store.add_node("north", NodeType::App).unwrap();
        store
            .register("plc1", "tag_reads_total", MetricKind::Counter, "reads", 0)
            .unwrap();
        store
            .register_group("plc1", "grp1", "group_tags_total", MetricKind::Gauge, "tags", 3)
            .unwrap();
        store.update_group("plc1", "grp1", "group_tags_total", 4).unwrap();
        assert_eq!(store.group_value("plc1", "grp1", "group_tags_total"), Some(4));

        assert!(store.remove_node("plc1"));
        let names: Vec<String> = store.visit(|view| view.nodes.keys().cloned().collect());
        assert_eq!(names, ["north"]);
        assert!(store.update("plc1", "tag_reads_total", 1).is_err());
        assert_eq!(store.group_value("plc1", "grp1", "group_tags_total"), None);
    }

    #[test]
    fn unknown_targets_are_errors() {
        let store = store_with("plc1", NodeType::Driver);
        assert!(matches!(
            store.update("ghost", "x", 1),
            Err(MetricsError::UnknownNode(_))
        ));
        assert!(matches!(
            store.update("plc1", "x", 1),
            Err(MetricsError::UnknownMetric { .. })
        ));
        assert!(store.update_group("plc1", "grp", "x", 1).is_err());
    }

    #[test]
    fn visit_sees_fleet_and_core_dump_flag() {
        let store = MetricsStore::new();
        store.set_fleet(FleetCounts {
            south_nodes: 2,
            south_running: 1,
            ..FleetCounts::default()
        });
        store.set_core_dumped();
        store.visit(|view| {
            assert_eq!(view.fleet.south_nodes, 2);
            assert_eq!(view.fleet.south_running, 1);
            assert!(view.core_dumped);
            assert!(view.nodes.is_empty());
        });
    }
}

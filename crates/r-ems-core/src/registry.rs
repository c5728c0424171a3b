//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Node registry, subscriptions and the manager task."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Name-keyed directory of live nodes, owned by the manager task.

use indexmap::IndexMap;
use r_ems_adapter::AdapterHandle;
use r_ems_metrics::FleetCounts;
use r_ems_msg::{AdapterState, Endpoint, LinkState, NodeType};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node '{0}' is already registered")]
    Duplicate(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// What the registry needs to know about a running node.
pub trait RuntimeHandle {
    fn node_type(&self) -> NodeType;
    fn state(&self) -> AdapterState;
    fn link(&self) -> LinkState;
}

impl RuntimeHandle for AdapterHandle {
    fn node_type(&self) -> NodeType {
        AdapterHandle::node_type(self)
    }

    fn state(&self) -> AdapterState {
        AdapterHandle::state(self)
    }

    fn link(&self) -> LinkState {
        AdapterHandle::link(self)
    }
}

#[derive(Debug)]
pub struct RegistryEntry<H> {
    pub name: String,
    pub handle: H,
    /// Bound once the adapter announced itself with NodeInit.
    pub endpoint: Option<Endpoint>,
    pub is_static: bool,
    pub is_single: bool,
    pub display: bool,
}

impl<H: RuntimeHandle> RegistryEntry<H> {
    pub fn node_type(&self) -> NodeType {
        self.handle.node_type()
    }

    fn listed(&self) -> bool {
        !self.is_static && self.display
    }
}

#[derive(Debug)]
pub struct NodeRegistry<H> {
    entries: IndexMap<String, RegistryEntry<H>>,
}

impl<H> Default for NodeRegistry<H> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }
}

impl<H: RuntimeHandle> NodeRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Register an ordinary node.
    pub fn add(&mut self, name: &str, handle: H) -> Result<()> {
        self.insert(name, handle, false, false, true)
    }

    /// Register a system node, hidden from listings and aggregates.
    pub fn add_static(&mut self, name: &str, handle: H) -> Result<()> {
        self.insert(name, handle, true, false, false)
    }

    /// Register a node that cannot be deleted.
    pub fn add_single(&mut self, name: &str, handle: H) -> Result<()> {
        self.insert(name, handle, false, true, true)
    }

    fn insert(
        &mut self,
        name: &str,
        handle: H,
        is_static: bool,
        is_single: bool,
        display: bool,
    ) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }
        self.entries.insert(
            name.to_owned(),
            RegistryEntry {
                name: name.to_owned(),
                handle,
                endpoint: None,
                is_static,
                is_single,
                display,
            },
        );
        Ok(())
    }

    /// Drop the entry and hand it back. Stopping the runtime is up to the caller.
    pub fn remove(&mut self, name: &str) -> Option<RegistryEntry<H>> {
        self.entries.shift_remove(name)
    }

    pub fn find(&self, name: &str) -> Option<&H> {
        self.entries.get(name).map(|entry| &entry.handle)
    }

    pub fn entry(&self, name: &str) -> Option<&RegistryEntry<H>> {
        self.entries.get(name)
    }

    /// Bind the transport endpoint of an already registered node.
    ///
    /// # Panics
    ///
    /// Panics when `name` is not registered.
    pub fn update_endpoint(&mut self, name: &str, endpoint: Endpoint) {
        match self.entries.get_mut(name) {
            Some(entry) => entry.endpoint = Some(endpoint),
            None => panic!("update_endpoint on unregistered node '{name}'"),
        }
    }

    /// Displayed, non-static nodes of one class, in registration order.
    pub fn list(&self, node_type: NodeType) -> Vec<&RegistryEntry<H>> {
        self.entries
            .values()
            .filter(|entry| entry.listed() && entry.node_type() == node_type)
            .collect()
    }

    pub fn list_all(&self) -> Vec<&RegistryEntry<H>> {
        self.entries.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_single(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|entry| entry.is_single)
            .unwrap_or(false)
    }

    pub fn is_static(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|entry| entry.is_static)
            .unwrap_or(false)
    }

    pub fn get_endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.entries.get(name).and_then(|entry| entry.endpoint.as_ref())
    }

    /// Bound endpoints of every node of one class, system nodes included.
    pub fn get_endpoints(&self, node_type: NodeType) -> Vec<(&str, &Endpoint)> {
        self.entries
            .values()
            .filter(|entry| entry.node_type() == node_type)
            .filter_map(|entry| entry.endpoint.as_ref().map(|ep| (entry.name.as_str(), ep)))
            .collect()
    }

    /// Fleet counts over displayed, non-static nodes.
    pub fn aggregate_counts(&self) -> FleetCounts {
        let mut counts = FleetCounts::default();
        for entry in self.entries.values().filter(|entry| entry.listed()) {
            let running = entry.handle.state() == AdapterState::Running;
            let disconnected = entry.handle.link() == LinkState::Disconnected;
            let (total, run, disc) = match entry.node_type() {
                NodeType::Driver => (
                    &mut counts.south_nodes,
                    &mut counts.south_running,
                    &mut counts.south_disconnected,
                ),
                NodeType::App => (
                    &mut counts.north_nodes,
                    &mut counts.north_running,
                    &mut counts.north_disconnected,
                ),
            };
            *total += 1;
            *run += u64::from(running);
            *disc += u64::from(disconnected);
        }
        counts
    }

    /// Names of nodes whose runtime task has ended.
    pub fn finished(&self, is_finished: impl Fn(&H) -> bool) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| is_finished(&entry.handle))
            .map(|entry| entry.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ems_msg::{Bus, BusConfig};

    #[derive(Debug)]
    struct FakeHandle {
        node_type: NodeType,
        state: AdapterState,
        link: LinkState,
    }

    impl RuntimeHandle for FakeHandle {
        fn node_type(&self) -> NodeType {
            self.node_type
        }

        fn state(&self) -> AdapterState {
            self.state
        }

        fn link(&self) -> LinkState {
            self.link
        }
    }

    fn driver(state: AdapterState, link: LinkState) -> FakeHandle {
        FakeHandle {
            node_type: NodeType::Driver,
            state,
            link,
        }
    }

    fn app() -> FakeHandle {
        FakeHandle {
            node_type: NodeType::App,
            state: AdapterState::Running,
            link: LinkState::Connected,
        }
    }

    #[test]
    fn duplicate_add_is_rejected_and_keeps_the_first_entry() {
        let mut registry = NodeRegistry::new();
        registry
            .add("plc1", driver(AdapterState::Ready, LinkState::Disconnected))
            .unwrap();
        let err = registry
            .add("plc1", driver(AdapterState::Running, LinkState::Connected))
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("plc1".into()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("plc1").unwrap().state, AdapterState::Ready);
        assert!(registry.add_single("plc1", app()).is_err());
    }

    #[test]
    fn listings_hide_static_nodes() {
        let mut registry = NodeRegistry::new();
        registry
            .add("plc1", driver(AdapterState::Running, LinkState::Connected))
            .unwrap();
        registry.add_single("telemetry-log", app()).unwrap();
        registry.add_static("monitor", app()).unwrap();

        let apps: Vec<_> = registry.list(NodeType::App).iter().map(|e| e.name.clone()).collect();
        assert_eq!(apps, vec!["telemetry-log".to_string()]);
        assert_eq!(registry.list_all().len(), 3);
        assert!(registry.is_single("telemetry-log"));
        assert!(!registry.is_single("plc1"));
        assert!(registry.is_static("monitor"));
    }

    #[test]
    fn endpoints_are_bound_after_registration() {
        let mut bus = Bus::new(BusConfig::default());
        let (endpoint, _socket) = bus.dial();
        let id = endpoint.id();
        let mut registry = NodeRegistry::new();
        registry.add("app1", app()).unwrap();
        registry.add_static("monitor", app()).unwrap();

        assert!(registry.get_endpoint("app1").is_none());
        registry.update_endpoint("app1", endpoint);
        assert_eq!(registry.get_endpoint("app1").map(Endpoint::id), Some(id));
        let bound: Vec<_> = registry.get_endpoints(NodeType::App).into_iter().map(|(n, _)| n).collect();
        assert_eq!(bound, vec!["app1"]);
    }

    #[test]
    #[should_panic(expected = "unregistered node")]
    fn update_endpoint_on_missing_node_panics() {
        let mut bus = Bus::new(BusConfig::default());
        let (endpoint, _socket) = bus.dial();
        let mut registry: NodeRegistry<FakeHandle> = NodeRegistry::new();
        registry.update_endpoint("ghost", endpoint);
    }

    #[test]
    fn aggregate_counts_cover_displayed_nodes() {
        let mut registry = NodeRegistry::new();
        registry
            .add("plc1", driver(AdapterState::Running, LinkState::Connected))
            .unwrap();
        registry
            .add("plc2", driver(AdapterState::Stopped, LinkState::Disconnected))
            .unwrap();
        registry.add("app1", app()).unwrap();
        registry.add_static("monitor", app()).unwrap();

        let counts = registry.aggregate_counts();
        assert_eq!(counts.south_nodes, 2);
        assert_eq!(counts.south_running, 1);
        assert_eq!(counts.south_disconnected, 1);
        assert_eq!(counts.north_nodes, 1);
        assert_eq!(counts.north_running, 1);
        assert_eq!(counts.north_disconnected, 0);

        assert!(registry.remove("plc2").is_some());
        assert!(registry.find("plc2").is_none());
        assert_eq!(registry.aggregate_counts().south_nodes, 1);
    }
}

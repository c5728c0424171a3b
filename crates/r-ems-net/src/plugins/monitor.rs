//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Built-in protocol plugins and the static plugin catalog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use r_ems_adapter::{AdapterCallbacks, Plugin, PluginResult};
use r_ems_msg::{AdapterState, Body, Envelope, LinkState, NodesState};
use tracing::info;

/// Hidden system app that logs node state and link transitions.
#[derive(Debug, Default)]
pub struct Monitor {
    nodes: BTreeMap<String, (AdapterState, LinkState)>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last state seen for `node`.
    pub fn observed(&self, node: &str) -> Option<(AdapterState, LinkState)> {
        self.nodes.get(node).copied()
    }

    fn observe(&mut self, report: &NodesState) {
        for entry in &report.nodes {
            let current = (entry.running, entry.link);
            match self.nodes.insert(entry.node.clone(), current) {
                None => info!(node = %entry.node, state = ?entry.running, link = ?entry.link, "node appeared"),
                Some((state, _)) if state != entry.running => {
                    info!(node = %entry.node, from = ?state, to = ?entry.running, "node state changed")
                }
                Some((_, link)) if link != entry.link => {
                    info!(node = %entry.node, from = ?link, to = ?entry.link, "node link changed")
                }
                Some(_) => {}
            }
        }
        self.nodes
            .retain(|name, _| report.nodes.iter().any(|entry| &entry.node == name));
    }
}

impl Plugin for Monitor {
    fn start(&mut self, _cb: &AdapterCallbacks) -> PluginResult<()> {
        Ok(())
    }

    fn stop(&mut self, _cb: &AdapterCallbacks) -> PluginResult<()> {
        self.nodes.clear();
        Ok(())
    }

    fn apply_setting(&mut self, _cb: &AdapterCallbacks, _setting: &str) -> PluginResult<()> {
        Ok(())
    }

    fn handle_request(&mut self, _cb: &AdapterCallbacks, request: &Envelope) -> PluginResult<()> {
        match &request.body {
            Body::NodesState(report) => self.observe(report),
            Body::NodeDeleted(node) => {
                if self.nodes.remove(&node.node).is_some() {
                    info!(node = %node.node, "node deleted");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

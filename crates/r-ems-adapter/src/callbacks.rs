//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Adapter runtime, lifecycle and plugin capability contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use r_ems_metrics::MetricsStore;
use r_ems_msg::{AdapterState, Body, Envelope, ErrorCode, LinkState, NodeType, Uplink};
use tracing::warn;

/// Lifecycle and link state of one adapter, readable from outside the task.
#[derive(Debug, Default)]
pub struct NodeStatus {
    state: AtomicU8,
    link: AtomicU8,
}

impl NodeStatus {
    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn set_state(&self, state: AdapterState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn link(&self) -> LinkState {
        LinkState::from_u8(self.link.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn set_link(&self, link: LinkState) {
        self.link.store(link as u8, Ordering::Release);
    }
}

/// Services the runtime offers to its plugin.
///
/// Sends never wait: a full uplink is reported as [`ErrorCode::BusSendFailure`] and the frame
/// is dropped.
#[derive(Clone)]
pub struct AdapterCallbacks {
    node: Arc<str>,
    node_type: NodeType,
    uplink: Uplink,
    metrics: Arc<MetricsStore>,
    status: Arc<NodeStatus>,
}

impl AdapterCallbacks {
    pub fn new(
        node: Arc<str>,
        node_type: NodeType,
        uplink: Uplink,
        metrics: Arc<MetricsStore>,
        status: Arc<NodeStatus>,
    ) -> Self {
        Self {
            node,
            node_type,
            uplink,
            metrics,
            status,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Send a new request originated by this node.
    pub fn emit_command(&self, receiver: &str, body: Body) -> Result<(), ErrorCode> {
        let envelope = Envelope::new(&*self.node, receiver, body);
        self.uplink
            .try_send_envelope(&envelope)
            .map_err(|err| err.error_code())
    }

    /// Reply to `request`, keeping its correlation id.
    pub fn emit_response(&self, request: &Envelope, body: Body) -> Result<(), ErrorCode> {
        self.uplink
            .try_send_envelope(&request.reply(body))
            .map_err(|err| err.error_code())
    }

    /// Counters add `value`, gauges take it. Unknown metrics are logged and ignored.
    pub fn update_metric(&self, name: &str, value: u64) {
        if let Err(err) = self.metrics.update(&self.node, name, value) {
            warn!(node = %self.node, metric = name, error = %err, "metric update ignored");
        }
    }

    pub fn update_group_metric(&self, group: &str, name: &str, value: u64) {
        if let Err(err) = self.metrics.update_group(&self.node, group, name, value) {
            warn!(
                node = %self.node,
                group,
                metric = name,
                error = %err,
                "group metric update ignored"
            );
        }
    }

    pub fn set_link(&self, link: LinkState) {
        self.status.set_link(link);
    }

    pub fn link(&self) -> LinkState {
        self.status.link()
    }

    pub fn state(&self) -> AdapterState {
        self.status.state()
    }
}

impl std::fmt::Debug for AdapterCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCallbacks")
            .field("node", &self.node)
            .field("node_type", &self.node_type)
            .finish()
    }
}

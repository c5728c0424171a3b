//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Node registry, subscriptions and the manager task."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The manager task: owns the registry, creates and deletes nodes and routes every frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use r_ems_adapter::metrics::LAST_RTT_MS;
use r_ems_adapter::{Adapter, AdapterHandle, AdapterOptions, PluginCatalog, PluginModule};
use r_ems_common::config::HubConfig;
use r_ems_metrics::MetricsStore;
use r_ems_msg::{
    decode, is_reserved_name, log_message, peek_header, retarget, AddNode, AdapterState, Body,
    Bus, BusConfig, BusCounters, Endpoint, EndpointId, Envelope, ErrorCode, Frame, LinkState,
    MessageDirection, NodeCtl, NodeCtlKind, NodeRef, NodeSetting, NodeStateEntry, NodeType,
    NodesState, Subscription, TransData, API_NODE, MANAGER_NODE, NODE_LIST_MAX,
};
use r_ems_persistence::{NodeRecord, PersistOp, PersistenceBridge};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::NodeRegistry;
use crate::subscriptions::Subscriptions;

const COMMAND_QUEUE_DEPTH: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Failures seen by callers of [`ManagerClient`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("manager is not running")]
    Closed,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0} requests do not name a target node")]
    NoTarget(&'static str),
    #[error("request rejected: {0}")]
    Rejected(ErrorCode),
}

/// Tunables lifted out of [`HubConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub request_timeout: Duration,
    pub state_interval: Duration,
    pub min_group_interval: Duration,
    pub bus: BusConfig,
    pub monitor: bool,
}

impl ManagerOptions {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            request_timeout: config.manager.request_timeout_ms,
            state_interval: config.manager.state_interval_ms,
            min_group_interval: config.adapter.min_group_interval_ms,
            bus: BusConfig {
                capacity: config.adapter.bus_capacity,
                send_timeout: config.adapter.send_timeout_ms,
            },
            monitor: config.manager.monitor,
        }
    }
}

/// Listing row returned by [`ManagerClient::nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub name: String,
    pub plugin: &'static str,
    pub node_type: NodeType,
    pub state: AdapterState,
    pub link: LinkState,
    pub single: bool,
}

/// Why a node is being created.
#[derive(Debug, Clone, Copy)]
enum NodeOrigin {
    /// Built-in or declared in the configuration.
    Declared { auto_start: bool },
    /// Listed in the persisted node records.
    Restored,
    /// Created by an `AddNode` request; starts with no persisted state.
    Added,
}

enum Command {
    Request {
        envelope: Envelope,
        reply: oneshot::Sender<Envelope>,
    },
    Nodes {
        node_type: NodeType,
        reply: oneshot::Sender<Vec<NodeSummary>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Builds the fleet described by a [`HubConfig`] and starts the manager task.
pub struct Manager {
    config: HubConfig,
    catalog: PluginCatalog,
    metrics: Arc<MetricsStore>,
    persistence: PersistenceBridge,
}

impl Manager {
    pub fn new(
        config: HubConfig,
        catalog: PluginCatalog,
        metrics: Arc<MetricsStore>,
        persistence: PersistenceBridge,
    ) -> Self {
        Self {
            config,
            catalog,
            metrics,
            persistence,
        }
    }

    /// Create built-in, declared and persisted nodes, then run the manager task.
    pub async fn start(self) -> Result<ManagerHandle> {
        let options = ManagerOptions::from_config(&self.config);
        let bus = Bus::new(options.bus);
        let bus_counters = bus.counters();
        let mut task = ManagerTask {
            bus,
            registry: NodeRegistry::new(),
            unbound: HashMap::new(),
            subscriptions: Subscriptions::new(),
            catalog: self.catalog,
            metrics: self.metrics,
            persistence: self.persistence,
            options,
            api_pending: HashMap::new(),
            deleting: HashMap::new(),
            next_ctx: 1,
        };
        if let Err(err) = task.populate(&self.config) {
            task.abort_all();
            return Err(err);
        }

        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let join = tokio::spawn(task.run(rx).instrument(info_span!("manager")));
        Ok(ManagerHandle {
            client: ManagerClient {
                commands,
                next_ctx: Arc::new(AtomicU64::new(1)),
                timeout: options.request_timeout,
            },
            task: join,
            bus_counters,
        })
    }
}

/// Cloneable request path into the manager, addressed as the `api` node.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    commands: mpsc::Sender<Command>,
    next_ctx: Arc<AtomicU64>,
    timeout: Duration,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Request { envelope, .. } => f
                .debug_struct("Request")
                .field("msg_type", &envelope.msg_type())
                .field("ctx", &envelope.header.ctx)
                .finish(),
            Command::Nodes { node_type, .. } => {
                f.debug_struct("Nodes").field("node_type", node_type).finish()
            }
            Command::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl ManagerClient {
    /// Send `body` to the node it names (or to the manager) and wait for the reply body.
    pub async fn request(&self, body: Body) -> std::result::Result<Body, ManagerError> {
        let receiver = match &body {
            Body::AddNode(_) | Body::DelNode(_) | Body::Subscribe(_) | Body::Unsubscribe(_) => {
                MANAGER_NODE.to_owned()
            }
            other => other
                .target_node()
                .ok_or(ManagerError::NoTarget(other.msg_type().name()))?
                .to_owned(),
        };
        let ctx = self.next_ctx.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(API_NODE, receiver, body).with_ctx(ctx);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request { envelope, reply })
            .await
            .map_err(|_| ManagerError::Closed)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(envelope)) => Ok(envelope.body),
            Ok(Err(_)) => Err(ManagerError::Closed),
            Err(_) => Err(ManagerError::Timeout(self.timeout)),
        }
    }

    /// [`request`](Self::request) for requests answered with a bare error code.
    pub async fn call(&self, body: Body) -> std::result::Result<(), ManagerError> {
        match self.request(body).await? {
            Body::RespError(resp) => resp.code.into_result().map_err(ManagerError::Rejected),
            other => {
                warn!(msg_type = other.msg_type().name(), "unexpected reply type");
                Err(ManagerError::Rejected(ErrorCode::Internal))
            }
        }
    }

    /// Displayed nodes of one class.
    pub async fn nodes(
        &self,
        node_type: NodeType,
    ) -> std::result::Result<Vec<NodeSummary>, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Nodes { node_type, reply })
            .await
            .map_err(|_| ManagerError::Closed)?;
        rx.await.map_err(|_| ManagerError::Closed)
    }
}

/// Owner of the running manager task.
#[derive(Debug)]
pub struct ManagerHandle {
    client: ManagerClient,
    task: JoinHandle<()>,
    bus_counters: Arc<BusCounters>,
}

impl ManagerHandle {
    pub fn client(&self) -> ManagerClient {
        self.client.clone()
    }

    pub fn bus_counters(&self) -> Arc<BusCounters> {
        Arc::clone(&self.bus_counters)
    }

    /// Uninitialise every node and wait for the manager task to end.
    pub async fn shutdown(self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        if self
            .client
            .commands
            .send(Command::Shutdown { done })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.task.await.context("manager task failed")?;
        info!("manager shutdown complete");
        Ok(())
    }
}

/// Adapter created but not yet announced; frames for it wait here.
struct Unbound {
    endpoint: Endpoint,
    queued: Vec<Bytes>,
}

struct ManagerTask {
    bus: Bus,
    registry: NodeRegistry<AdapterHandle>,
    unbound: HashMap<String, Unbound>,
    subscriptions: Subscriptions,
    catalog: PluginCatalog,
    metrics: Arc<MetricsStore>,
    persistence: PersistenceBridge,
    options: ManagerOptions,
    api_pending: HashMap<u64, oneshot::Sender<Envelope>>,
    /// Nodes waiting for RespNodeUninit, with the DelNode request to answer.
    deleting: HashMap<String, Envelope>,
    next_ctx: u64,
}

impl ManagerTask {
    fn populate(&mut self, config: &HubConfig) -> Result<()> {
        let autoloaded: Vec<PluginModule> = self.catalog.autoloaded().copied().collect();
        for module in autoloaded {
            if module.system && !self.options.monitor {
                continue;
            }
            self.create_node(module.name, module, NodeOrigin::Declared { auto_start: true })
                .map_err(|code| anyhow!("built-in node '{}' not created: {code}", module.name))?;
        }

        for (name, node) in &config.nodes {
            let module = *self
                .catalog
                .get(&node.plugin)
                .with_context(|| format!("node '{name}' uses unknown plugin '{}'", node.plugin))?;
            if module.single || module.system {
                bail!(
                    "node '{name}': plugin '{}' only runs as its built-in instance",
                    module.name
                );
            }
            self.create_node(
                name,
                module,
                NodeOrigin::Declared {
                    auto_start: node.auto_start,
                },
            )
                .map_err(|code| anyhow!("node '{name}' not created: {code}"))?;
            if let Some(setting) = node.setting_json() {
                self.queue_request(
                    name,
                    Body::NodeSetting(NodeSetting {
                        node: name.clone(),
                        setting,
                    }),
                );
            }
        }

        match self.persistence.load_nodes() {
            Ok(records) => {
                for record in records {
                    self.restore_node(&record);
                }
            }
            Err(err) => warn!(error = %err, "persisted nodes not loaded"),
        }

        for sub in &config.subscriptions {
            let subscription = Subscription {
                app: sub.app.clone(),
                driver: sub.driver.clone(),
                group: sub.group.clone(),
            };
            if let Err(code) = self.subscribe(&subscription) {
                warn!(app = %sub.app, driver = %sub.driver, group = %sub.group, %code, "configured subscription skipped");
            }
        }
        info!(
            nodes = self.registry.len(),
            subscriptions = self.subscriptions.len(),
            "manager ready"
        );
        Ok(())
    }

    fn restore_node(&mut self, record: &NodeRecord) {
        if self.registry.contains(&record.node) {
            return;
        }
        match self.catalog.get(&record.plugin).copied() {
            Some(module) if !module.single && !module.system => {
                match self.create_node(&record.node, module, NodeOrigin::Restored) {
                    Ok(()) => info!(node = %record.node, plugin = module.name, "node restored"),
                    Err(code) => warn!(node = %record.node, %code, "persisted node not restored"),
                }
            }
            _ => warn!(node = %record.node, plugin = %record.plugin, "persisted node uses an unavailable plugin"),
        }
    }

    fn abort_all(&mut self) {
        for name in self.registry.names() {
            if let Some(entry) = self.registry.remove(&name) {
                entry.handle.abort();
            }
            self.metrics.remove_node(&name);
        }
        self.unbound.clear();
    }

    fn next_ctx(&mut self) -> u64 {
        let ctx = self.next_ctx;
        self.next_ctx += 1;
        ctx
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.options.state_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                frame = self.bus.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => break,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        debug!("manager loop ended");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Request { envelope, reply } => {
                log_message(MessageDirection::Inbound, envelope.msg_type(), &envelope.header);
                self.api_pending.insert(envelope.header.ctx, reply);
                if envelope.header.receiver == MANAGER_NODE {
                    self.on_manager_request(envelope).await;
                } else {
                    let target = envelope.header.receiver.clone();
                    if let Err(code) = self.send_to(&target, &envelope).await {
                        self.respond(&envelope, Body::error(code)).await;
                    }
                }
            }
            Command::Nodes { node_type, reply } => {
                let nodes = self
                    .registry
                    .list(node_type)
                    .into_iter()
                    .map(|entry| NodeSummary {
                        name: entry.name.clone(),
                        plugin: entry.handle.module().name,
                        node_type,
                        state: entry.handle.state(),
                        link: entry.handle.link(),
                        single: entry.is_single,
                    })
                    .collect();
                let _ = reply.send(nodes);
            }
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let (ty, header) = match peek_header(&frame.bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(endpoint = frame.from, error = %err, "unroutable frame dropped");
                return;
            }
        };
        log_message(MessageDirection::Inbound, ty, &header);

        match header.receiver.as_str() {
            MANAGER_NODE | API_NODE => {
                let envelope = match decode(&frame.bytes) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(sender = %header.sender, error = %err, "undecodable frame dropped");
                        return;
                    }
                };
                if header.receiver == API_NODE {
                    self.complete_api(envelope);
                } else {
                    self.on_manager_message(frame.from, envelope, &frame.bytes).await;
                }
            }
            receiver => {
                let receiver = receiver.to_owned();
                if let Err(code) = self.deliver(&receiver, frame.bytes).await {
                    debug!(sender = %header.sender, receiver = %receiver, %code, "frame not forwarded");
                    if ty.expects_reply() {
                        let reply = Envelope {
                            header: header.swapped(),
                            body: Body::error(code),
                        };
                        if let Err(code) = self.send_to(&header.sender, &reply).await {
                            debug!(node = %header.sender, %code, "routing error not delivered");
                        }
                    }
                }
            }
        }
    }

    async fn on_manager_message(&mut self, from: EndpointId, envelope: Envelope, frame: &Bytes) {
        if envelope.msg_type().expects_reply() {
            self.on_manager_request(envelope).await;
            return;
        }
        match &envelope.body {
            Body::NodeInit(init) => {
                self.bind(from, &envelope.header.sender, init.auto_start)
                    .await
            }
            Body::RespNodeUninit(node) => self.finish_delete(&node.node).await,
            Body::TransData(data) => self.fan_out(data, frame).await,
            Body::RespError(resp) if !resp.code.is_success() => {
                warn!(node = %envelope.header.sender, code = %resp.code, "node rejected manager request");
            }
            _ => debug!(
                msg_type = envelope.msg_type().name(),
                sender = %envelope.header.sender,
                "message for manager ignored"
            ),
        }
    }

    async fn on_manager_request(&mut self, request: Envelope) {
        let outcome = match &request.body {
            Body::AddNode(add) => self.add_node(add),
            Body::DelNode(node) => match self.begin_delete(&request, &node.node).await {
                Ok(()) => return,
                Err(code) => Err(code),
            },
            Body::Subscribe(sub) => self.subscribe(sub),
            Body::Unsubscribe(sub) => {
                if self.subscriptions.unsubscribe(&sub.app, &sub.driver, &sub.group) {
                    info!(app = %sub.app, driver = %sub.driver, group = %sub.group, "unsubscribed");
                }
                Ok(())
            }
            _ => Err(ErrorCode::RequestNotSupported),
        };
        self.respond(&request, Body::error(outcome.into())).await;
    }

    fn add_node(&mut self, add: &AddNode) -> std::result::Result<(), ErrorCode> {
        if add.node.is_empty() || is_reserved_name(&add.node) {
            return Err(ErrorCode::NodeNameInvalid);
        }
        let module = *self.catalog.get(&add.plugin).ok_or(ErrorCode::PluginNotFound)?;
        if module.single || module.system {
            return Err(ErrorCode::PluginNotAllowInstance);
        }
        self.create_node(&add.node, module, NodeOrigin::Added)?;
        // Leftovers of an earlier node with this name go before the new node's records.
        self.persistence.notify(PersistOp::DeleteNode {
            node: add.node.clone(),
        });
        self.persistence.notify(PersistOp::SaveNode(NodeRecord {
            node: add.node.clone(),
            plugin: module.name.to_owned(),
        }));
        Ok(())
    }

    fn create_node(
        &mut self,
        name: &str,
        module: PluginModule,
        origin: NodeOrigin,
    ) -> std::result::Result<(), ErrorCode> {
        if self.registry.contains(name) {
            return Err(ErrorCode::NodeExist);
        }
        let (endpoint, socket) = self.bus.dial();
        let options = AdapterOptions {
            min_group_interval: self.options.min_group_interval,
            auto_start: matches!(origin, NodeOrigin::Declared { auto_start: true }),
            restore: !matches!(origin, NodeOrigin::Added),
        };
        let adapter = Adapter::create(
            name,
            module,
            socket,
            Arc::clone(&self.metrics),
            self.persistence.clone(),
            options,
        )
        .map_err(|err| {
            warn!(node = name, plugin = module.name, error = %err, "node creation failed");
            err.error_code()
        })?;
        let handle = adapter.spawn();
        let added = if module.system {
            self.registry.add_static(name, handle)
        } else if module.single {
            self.registry.add_single(name, handle)
        } else {
            self.registry.add(name, handle)
        };
        if let Err(err) = added {
            error!(node = name, error = %err, "registry rejected new node");
            self.metrics.remove_node(name);
            return Err(ErrorCode::NodeExist);
        }
        self.unbound.insert(
            name.to_owned(),
            Unbound {
                endpoint,
                queued: Vec::new(),
            },
        );
        info!(node = name, plugin = module.name, kind = module.kind.as_str(), "node created");
        Ok(())
    }

    /// Queue a manager-originated request for a node that has not announced itself yet.
    fn queue_request(&mut self, node: &str, body: Body) {
        let envelope = Envelope::new(MANAGER_NODE, node, body).with_ctx(self.next_ctx());
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(node, msg_type = envelope.msg_type().name(), error = %err, "request not encodable");
                return;
            }
        };
        match self.unbound.get_mut(node) {
            Some(pending) => pending.queued.push(frame),
            None => warn!(node, "request for bound or unknown node not queued"),
        }
    }

    async fn bind(&mut self, from: EndpointId, node: &str, auto_start: bool) {
        let Some(pending) = self.unbound.remove(node) else {
            warn!(node, endpoint = from, "node init from unknown or already bound node");
            return;
        };
        if pending.endpoint.id() != from {
            warn!(node, endpoint = from, "node init from foreign endpoint ignored");
            self.unbound.insert(node.to_owned(), pending);
            return;
        }
        let endpoint = pending.endpoint.clone();
        self.registry.update_endpoint(node, pending.endpoint);
        for frame in pending.queued {
            if endpoint.send(frame).await.is_err() {
                warn!(node, "queued request lost");
            }
        }
        if auto_start {
            let ctl = Envelope::new(
                MANAGER_NODE,
                node,
                Body::NodeCtl(NodeCtl {
                    node: node.to_owned(),
                    ctl: NodeCtlKind::Start,
                }),
            )
            .with_ctx(self.next_ctx());
            if endpoint.send_envelope(&ctl).await.is_err() {
                warn!(node, "auto start not delivered");
            }
        }
        info!(node, auto_start, "node bound");
    }

    async fn begin_delete(
        &mut self,
        request: &Envelope,
        node: &str,
    ) -> std::result::Result<(), ErrorCode> {
        if !self.registry.contains(node) || self.deleting.contains_key(node) {
            return Err(ErrorCode::NodeNotExist);
        }
        if self.registry.is_single(node) || self.registry.is_static(node) {
            return Err(ErrorCode::NodeNotAllowDelete);
        }
        let uninit = Envelope::new(
            MANAGER_NODE,
            node,
            Body::NodeUninit(NodeRef {
                node: node.to_owned(),
            }),
        )
        .with_ctx(self.next_ctx());
        self.send_to(node, &uninit).await?;
        self.deleting.insert(node.to_owned(), request.clone());
        Ok(())
    }

    async fn finish_delete(&mut self, node: &str) {
        let Some(request) = self.deleting.remove(node) else {
            debug!(node, "uninit reply without pending delete");
            return;
        };
        let entry = self.registry.remove(node);
        self.metrics.remove_node(node);
        self.unbound.remove(node);
        if let Some(mut entry) = entry {
            if let Err(err) = entry.handle.join().await {
                warn!(node, error = %err, "node task ended abnormally");
            }
        }
        self.subscriptions.drop_node(node);
        self.persistence.notify(PersistOp::DeleteNode {
            node: node.to_owned(),
        });
        self.notify_deleted(node).await;
        info!(node, "node deleted");
        self.respond(&request, Body::error(ErrorCode::Success)).await;
    }

    fn subscribe(&mut self, sub: &Subscription) -> std::result::Result<(), ErrorCode> {
        let app = self.registry.entry(&sub.app).ok_or(ErrorCode::NodeNotExist)?;
        let driver = self
            .registry
            .entry(&sub.driver)
            .ok_or(ErrorCode::NodeNotExist)?;
        if app.node_type() != NodeType::App || driver.node_type() != NodeType::Driver {
            return Err(ErrorCode::GroupNotAllow);
        }
        if self.subscriptions.subscribe(&sub.app, &sub.driver, &sub.group) {
            info!(app = %sub.app, driver = %sub.driver, group = %sub.group, "subscribed");
        }
        Ok(())
    }

    async fn fan_out(&mut self, data: &TransData, frame: &Bytes) {
        for app in self.subscriptions.subscribers(&data.driver, &data.group) {
            let copy = match retarget(frame, &app) {
                Ok(copy) => copy,
                Err(err) => {
                    warn!(app = %app, error = %err, "trans data not retargeted");
                    continue;
                }
            };
            if let Err(code) = self.deliver(&app, copy).await {
                debug!(app = %app, driver = %data.driver, group = %data.group, %code, "trans data not delivered");
            }
        }
    }

    async fn notify_deleted(&mut self, node: &str) {
        let apps = self.app_endpoints();
        for (app, endpoint) in apps {
            if app == node {
                continue;
            }
            let notice = Envelope::new(
                MANAGER_NODE,
                app.as_str(),
                Body::NodeDeleted(NodeRef {
                    node: node.to_owned(),
                }),
            );
            if endpoint.send_envelope(&notice).await.is_err() {
                debug!(app = %app, node, "deletion notice not delivered");
            }
        }
    }

    fn app_endpoints(&self) -> Vec<(String, Endpoint)> {
        self.registry
            .get_endpoints(NodeType::App)
            .into_iter()
            .map(|(name, endpoint)| (name.to_owned(), endpoint.clone()))
            .collect()
    }

    async fn on_tick(&mut self) {
        self.reap().await;
        self.metrics.set_fleet(self.registry.aggregate_counts());
        self.api_pending.retain(|_, reply| !reply.is_closed());

        let nodes: Vec<NodeStateEntry> = [NodeType::Driver, NodeType::App]
            .into_iter()
            .flat_map(|kind| self.registry.list(kind))
            .take(NODE_LIST_MAX)
            .map(|entry| NodeStateEntry {
                node: entry.name.clone(),
                running: entry.handle.state(),
                link: entry.handle.link(),
                rtt_ms: self.metrics.value(&entry.name, LAST_RTT_MS).unwrap_or(0),
            })
            .collect();
        for (app, endpoint) in self.app_endpoints() {
            let report = Envelope::new(
                MANAGER_NODE,
                app.as_str(),
                Body::NodesState(NodesState {
                    nodes: nodes.clone(),
                }),
            );
            if endpoint.send_envelope(&report).await.is_err() {
                debug!(app = %app, "nodes state not delivered");
            }
        }
    }

    /// Remove nodes whose task ended without a delete request.
    async fn reap(&mut self) {
        for name in self.registry.finished(AdapterHandle::is_finished) {
            let Some(mut entry) = self.registry.remove(&name) else {
                continue;
            };
            let expected = self.deleting.contains_key(&name);
            match entry.handle.join().await {
                Err(err) if err.is_panic() => {
                    error!(node = %name, "node task panicked");
                    self.metrics.set_core_dumped();
                }
                Err(err) => warn!(node = %name, error = %err, "node task cancelled"),
                Ok(()) if expected => debug!(node = %name, "deleted node reaped"),
                Ok(()) => warn!(node = %name, "node task ended unexpectedly"),
            }
            self.unbound.remove(&name);
            self.metrics.remove_node(&name);
            self.subscriptions.drop_node(&name);
            self.notify_deleted(&name).await;
            if let Some(request) = self.deleting.remove(&name) {
                self.persistence.notify(PersistOp::DeleteNode { node: name.clone() });
                self.respond(&request, Body::error(ErrorCode::Success)).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        let mut order = Vec::with_capacity(self.registry.len());
        for kind in [NodeType::App, NodeType::Driver] {
            order.extend(
                self.registry
                    .list_all()
                    .into_iter()
                    .filter(|entry| entry.node_type() == kind)
                    .map(|entry| entry.name.clone()),
            );
        }
        for name in order {
            let Some(mut entry) = self.registry.remove(&name) else {
                continue;
            };
            let endpoint = entry
                .endpoint
                .take()
                .or_else(|| self.unbound.remove(&name).map(|pending| pending.endpoint));
            if let Some(endpoint) = endpoint {
                let uninit = Envelope::new(
                    MANAGER_NODE,
                    name.as_str(),
                    Body::NodeUninit(NodeRef { node: name.clone() }),
                )
                .with_ctx(self.next_ctx());
                if endpoint.send_envelope(&uninit).await.is_err() {
                    warn!(node = %name, "uninit not delivered");
                }
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, entry.handle.join()).await {
                Ok(Ok(())) => debug!(node = %name, "node stopped"),
                Ok(Err(err)) => warn!(node = %name, error = %err, "node task failed during shutdown"),
                Err(_) => {
                    warn!(node = %name, "node did not stop in time, aborting");
                    entry.handle.abort();
                }
            }
            self.metrics.remove_node(&name);
        }
        self.unbound.clear();
        self.subscriptions = Subscriptions::new();
        self.api_pending.clear();
        self.metrics.set_fleet(self.registry.aggregate_counts());
        info!("all nodes stopped");
    }

    async fn respond(&mut self, request: &Envelope, body: Body) {
        let reply = request.reply(body);
        let receiver = reply.header.receiver.clone();
        match receiver.as_str() {
            API_NODE => self.complete_api(reply),
            MANAGER_NODE => {}
            _ => {
                if let Err(code) = self.send_to(&receiver, &reply).await {
                    warn!(node = %receiver, %code, "reply not delivered");
                }
            }
        }
    }

    fn complete_api(&mut self, reply: Envelope) {
        let ctx = reply.header.ctx;
        match self.api_pending.remove(&ctx) {
            Some(pending) => {
                if pending.send(reply).is_err() {
                    debug!(ctx, "requester gone before reply");
                }
            }
            None => debug!(ctx, "reply without pending request dropped"),
        }
    }

    async fn send_to(&mut self, node: &str, envelope: &Envelope) -> std::result::Result<(), ErrorCode> {
        let frame = envelope.encode().map_err(|err| {
            warn!(node, msg_type = envelope.msg_type().name(), error = %err, "envelope not encodable");
            err.error_code()
        })?;
        log_message(MessageDirection::Outbound, envelope.msg_type(), &envelope.header);
        self.deliver(node, frame).await
    }

    /// Hand a frame to `node`, parking it while the node is still unbound.
    async fn deliver(&mut self, node: &str, frame: Bytes) -> std::result::Result<(), ErrorCode> {
        if let Some(endpoint) = self.registry.get_endpoint(node) {
            return endpoint
                .send(frame)
                .await
                .map_err(|err| err.error_code());
        }
        match self.unbound.get_mut(node) {
            Some(pending) => {
                pending.queued.push(frame);
                Ok(())
            }
            None => Err(ErrorCode::NodeNotExist),
        }
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Adapter runtime, lifecycle and plugin capability contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! One adapter task: owns a plugin instance, its bus socket and, for drivers, the group
//! and tag state. Events are handled one at a time; the task only suspends on its inbox
//! and on the earliest group deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use r_ems_common::time::{duration_to_millis, unix_millis};
use r_ems_metrics::{MetricsError, MetricsStore};
use r_ems_msg::{
    decode, log_message, peek_header, AdapterSocket, AdapterState, BatchResult, Body, Envelope, ErrorCode,
    GetTag, GroupConfig, GroupList, GroupRef, LinkState, MessageDirection, NodeCtl, NodeInit,
    NodeRef, NodeSetting, NodeStateReport, NodeType, TagAttribute, TagBatch, TagNames, TransData,
    Uplink, WriteTag, MANAGER_NODE,
};
use r_ems_persistence::{PersistOp, PersistenceBridge};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::callbacks::{AdapterCallbacks, NodeStatus};
use crate::driver::{interval_ms, DriverState};
use crate::lifecycle::{check_ctl, on_setting_accepted};
use crate::metrics::{
    register_group_metrics, register_node_metrics, GROUP_LAST_POLL_MS, GROUP_TAGS_TOTAL,
    LAST_RTT_MS, RECV_MSGS_TOTAL, TAG_READS_TOTAL, TAG_READ_ERRORS_TOTAL,
};
use crate::plugin::{Plugin, PluginError, PluginModule};

/// Per-node runtime options.
#[derive(Debug, Clone, Copy)]
pub struct AdapterOptions {
    /// Smallest accepted group interval.
    pub min_group_interval: Duration,
    /// Ask the manager to start the node once it is bound.
    pub auto_start: bool,
    /// Load the persisted setting, groups and state at creation.
    pub restore: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            min_group_interval: Duration::from_millis(100),
            auto_start: false,
            restore: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("plugin init failed: {0}")]
    Plugin(#[from] PluginError),
    #[error("module {0} is declared as a driver but has no driver hooks")]
    NotADriver(&'static str),
}

impl AdapterError {
    /// Code reported to whoever asked for the node.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AdapterError::Metrics(MetricsError::DuplicateNode(_)) => ErrorCode::NodeExist,
            AdapterError::Metrics(_) => ErrorCode::Internal,
            AdapterError::Plugin(err) => err.code,
            AdapterError::NotADriver(_) => ErrorCode::PluginNotFound,
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Adapter created but not yet running as a task.
pub struct Adapter {
    name: Arc<str>,
    module: PluginModule,
    plugin: Box<dyn Plugin>,
    socket: AdapterSocket,
    uplink: Uplink,
    callbacks: AdapterCallbacks,
    status: Arc<NodeStatus>,
    metrics: Arc<MetricsStore>,
    persistence: PersistenceBridge,
    driver: Option<DriverState>,
    setting: Option<String>,
    options: AdapterOptions,
    auto_start: bool,
}

impl Adapter {
    /// Build the node: metrics, plugin instance, persisted setting and groups.
    ///
    /// Nothing is left behind on failure.
    pub fn create(
        name: &str,
        module: PluginModule,
        socket: AdapterSocket,
        metrics: Arc<MetricsStore>,
        persistence: PersistenceBridge,
        options: AdapterOptions,
    ) -> Result<Self, AdapterError> {
        register_node_metrics(&metrics, name, module.kind)?;

        let node: Arc<str> = Arc::from(name);
        let status = Arc::new(NodeStatus::default());
        let uplink = socket.uplink();
        let callbacks = AdapterCallbacks::new(
            Arc::clone(&node),
            module.kind,
            uplink.clone(),
            Arc::clone(&metrics),
            Arc::clone(&status),
        );

        let mut plugin = (module.open)();
        if module.kind == NodeType::Driver && plugin.as_driver().is_none() {
            plugin.close();
            metrics.remove_node(name);
            return Err(AdapterError::NotADriver(module.name));
        }
        if let Err(err) = plugin.init(&callbacks) {
            plugin.close();
            metrics.remove_node(name);
            return Err(err.into());
        }

        let driver = (module.kind == NodeType::Driver).then(DriverState::new);
        let mut adapter = Self {
            name: node,
            module,
            plugin,
            socket,
            uplink,
            callbacks,
            status,
            metrics,
            persistence,
            driver,
            setting: None,
            options,
            auto_start: options.auto_start,
        };
        if options.restore {
            adapter.restore();
        }
        Ok(adapter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AdapterState {
        self.status.state()
    }

    /// Whether the node will ask to be started once bound.
    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    fn restore(&mut self) {
        match self.persistence.load_setting(&self.name) {
            Ok(Some(setting)) => match self.plugin.apply_setting(&self.callbacks, &setting) {
                Ok(()) => {
                    self.status.set_state(on_setting_accepted(self.status.state()));
                    self.setting = Some(setting);
                    debug!(node = %self.name, "persisted setting applied");
                }
                Err(err) => warn!(node = %self.name, error = %err, "persisted setting rejected"),
            },
            Ok(None) => {}
            Err(err) => warn!(node = %self.name, error = %err, "failed to load setting"),
        }

        if self.driver.is_some() {
            self.restore_groups();
        }

        match self.persistence.load_state(&self.name) {
            Ok(Some(AdapterState::Running)) => self.auto_start = true,
            Ok(_) => {}
            Err(err) => warn!(node = %self.name, error = %err, "failed to load state"),
        }
    }

    fn restore_groups(&mut self) {
        let groups = match self.persistence.load_groups(&self.name) {
            Ok(groups) => groups,
            Err(err) => {
                warn!(node = %self.name, error = %err, "failed to load groups");
                return;
            }
        };
        let (Some(driver), Some(hooks)) = (self.driver.as_mut(), self.plugin.as_driver()) else {
            return;
        };
        for record in groups {
            let interval = Duration::from_millis(u64::from(record.interval_ms));
            if let Err(code) = driver.add_group(&record.name, interval) {
                warn!(node = %self.name, group = %record.name, %code, "persisted group skipped");
                continue;
            }
            if let Err(err) = register_group_metrics(&self.metrics, &self.name, &record.name) {
                warn!(node = %self.name, group = %record.name, error = %err, "group metrics not registered");
            }
            for tag in record.tags {
                let name = tag.name.clone();
                if let Err(code) = hooks.validate_tag(&tag).and_then(|()| driver.add_tag(&record.name, tag)) {
                    warn!(node = %self.name, group = %record.name, tag = %name, %code, "persisted tag skipped");
                }
            }
            let count = driver.tag_count(&record.name).unwrap_or(0);
            self.callbacks
                .update_group_metric(&record.name, GROUP_TAGS_TOTAL, count as u64);
        }
    }

    /// Run the adapter on the current runtime inside an `adapter` span.
    pub fn spawn(self) -> AdapterHandle {
        let span = info_span!("adapter", node = %self.name, plugin = self.module.name);
        let node = Arc::clone(&self.name);
        let module = self.module;
        let status = Arc::clone(&self.status);
        let task = tokio::spawn(self.run().instrument(span));
        AdapterHandle {
            node,
            module,
            status,
            task,
        }
    }

    async fn run(mut self) {
        info!(state = ?self.status.state(), "adapter started");
        let init = Envelope::new(
            &*self.name,
            MANAGER_NODE,
            Body::NodeInit(NodeInit {
                node: self.name.to_string(),
                auto_start: self.auto_start,
            }),
        );
        if let Err(err) = self.uplink.send_envelope(&init).await {
            warn!(error = %err, "node init not delivered");
        }

        loop {
            let deadline = self.driver.as_ref().and_then(DriverState::next_deadline);
            tokio::select! {
                frame = self.socket.recv() => match frame {
                    Some(frame) => {
                        if let Flow::Exit = self.on_frame(frame).await {
                            break;
                        }
                    }
                    None => {
                        warn!("inbox closed, shutting adapter down");
                        self.teardown();
                        break;
                    }
                },
                _ = wait_until(deadline) => self.poll_due().await,
            }
        }
        info!("adapter stopped");
    }

    async fn on_frame(&mut self, frame: Bytes) -> Flow {
        let envelope = match decode(&frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "undecodable frame");
                reject_malformed(&self.uplink, &frame).await;
                return Flow::Continue;
            }
        };
        log_message(MessageDirection::Inbound, envelope.msg_type(), &envelope.header);
        self.dispatch(envelope).await
    }

    async fn dispatch(&mut self, request: Envelope) -> Flow {
        let outcome = match &request.body {
            Body::NodeUninit(_) => {
                self.teardown();
                let body = Body::RespNodeUninit(NodeRef {
                    node: self.name.to_string(),
                });
                reply(&self.uplink, &request, body).await;
                return Flow::Exit;
            }
            Body::NodeSetting(setting) => Body::error(self.apply_setting(setting)),
            Body::GetNodeSetting(_) => match &self.setting {
                Some(setting) => Body::RespGetNodeSetting(NodeSetting {
                    node: self.name.to_string(),
                    setting: setting.clone(),
                }),
                None => Body::error(ErrorCode::NodeSettingNotFound),
            },
            Body::NodeCtl(ctl) => Body::error(self.node_ctl(ctl)),
            Body::GetNodeState(_) => Body::RespGetNodeState(NodeStateReport {
                running: self.status.state(),
                link: self.status.link(),
                rtt_ms: self.metrics.value(&self.name, LAST_RTT_MS).unwrap_or(0),
            }),
            Body::AddGroup(config) => Body::error(self.add_group(config)),
            Body::UpdateGroup(config) => Body::error(self.update_group(config)),
            Body::DelGroup(group) => Body::error(self.del_group(group)),
            Body::GetGroup(_) => match &self.driver {
                Some(driver) => Body::RespGetGroup(GroupList {
                    groups: driver.group_list(),
                }),
                None => Body::error(ErrorCode::GroupNotAllow),
            },
            Body::AddTag(batch) => Body::RespAddTag(self.put_tags(batch, false)),
            Body::UpdateTag(batch) => Body::RespUpdateTag(self.put_tags(batch, true)),
            Body::DelTag(names) => Body::RespDelTag(self.del_tags(names)),
            Body::GetTag(get) => self.get_tags(get),
            Body::ReadGroup(group) => self.read_group(group),
            Body::WriteTag(write) => Body::error(self.write_tag(write)),
            Body::TransData(_) => {
                if self.module.kind == NodeType::App {
                    self.callbacks.update_metric(RECV_MSGS_TOTAL, 1);
                }
                self.pass_through(&request);
                return Flow::Continue;
            }
            Body::RespError(_)
            | Body::RespNodeUninit(_)
            | Body::RespGetNodeSetting(_)
            | Body::RespGetNodeState(_)
            | Body::RespGetGroup(_)
            | Body::RespAddTag(_)
            | Body::RespUpdateTag(_)
            | Body::RespDelTag(_)
            | Body::RespGetTag(_)
            | Body::NodesState(_)
            | Body::NodeDeleted(_) => {
                self.pass_through(&request);
                return Flow::Continue;
            }
            Body::NodeInit(_)
            | Body::AddNode(_)
            | Body::DelNode(_)
            | Body::Subscribe(_)
            | Body::Unsubscribe(_) => Body::error(ErrorCode::RequestNotSupported),
        };
        reply(&self.uplink, &request, outcome).await;
        Flow::Continue
    }


    fn pass_through(&mut self, request: &Envelope) {
        if let Err(err) = self.plugin.handle_request(&self.callbacks, request) {
            warn!(msg_type = request.msg_type().name(), error = %err, "plugin rejected message");
        }
    }

    fn set_state(&mut self, next: AdapterState) {
        let previous = self.status.state();
        if previous == next {
            return;
        }
        self.status.set_state(next);
        self.persistence.notify(PersistOp::SaveState {
            node: self.name.to_string(),
            state: next,
        });
        info!(from = ?previous, to = ?next, "adapter state changed");
    }

    fn apply_setting(&mut self, setting: &NodeSetting) -> ErrorCode {
        if let Err(err) = self.plugin.apply_setting(&self.callbacks, &setting.setting) {
            warn!(error = %err, "setting rejected");
            return err.code;
        }
        let next = on_setting_accepted(self.status.state());
        self.set_state(next);
        self.setting = Some(setting.setting.clone());
        self.persistence.notify(PersistOp::SaveSetting {
            node: self.name.to_string(),
            setting: setting.setting.clone(),
        });
        ErrorCode::Success
    }

    fn node_ctl(&mut self, ctl: &NodeCtl) -> ErrorCode {
        let relaxed = self.module.single || self.module.system;
        let next = match check_ctl(self.status.state(), ctl.ctl, relaxed) {
            Ok(next) => next,
            Err(code) => return code,
        };
        let outcome = match next {
            AdapterState::Running => self.plugin.start(&self.callbacks),
            _ => self.plugin.stop(&self.callbacks),
        };
        if let Err(err) = outcome {
            warn!(ctl = ?ctl.ctl, error = %err, "plugin refused control request");
            return err.code;
        }
        self.set_state(next);
        if let Some(driver) = self.driver.as_mut() {
            match next {
                AdapterState::Running => driver.arm_all(Instant::now()),
                _ => driver.clear_deadlines(),
            }
        }
        ErrorCode::Success
    }

    fn check_interval(&self, interval_ms: u32) -> Result<Duration, ErrorCode> {
        let interval = Duration::from_millis(u64::from(interval_ms));
        if interval < self.options.min_group_interval {
            return Err(ErrorCode::GroupParameterInvalid);
        }
        Ok(interval)
    }

    fn add_group(&mut self, config: &GroupConfig) -> ErrorCode {
        let interval = match self.check_interval(config.interval_ms) {
            Ok(interval) => interval,
            Err(code) => return code,
        };
        let running = self.status.state() == AdapterState::Running;
        let Some(driver) = self.driver.as_mut() else {
            return ErrorCode::GroupNotAllow;
        };
        if let Err(code) = driver.add_group(&config.group, interval) {
            return code;
        }
        if running {
            driver.arm(&config.group, Instant::now());
        }
        if let Err(err) = register_group_metrics(&self.metrics, &self.name, &config.group) {
            warn!(group = %config.group, error = %err, "group metrics not registered");
        }
        self.persistence.notify(PersistOp::SaveGroup {
            node: self.name.to_string(),
            group: config.group.clone(),
            interval_ms: interval_ms(interval),
        });
        ErrorCode::Success
    }

    fn update_group(&mut self, config: &GroupConfig) -> ErrorCode {
        let interval = match self.check_interval(config.interval_ms) {
            Ok(interval) => interval,
            Err(code) => return code,
        };
        let running = self.status.state() == AdapterState::Running;
        let Some(driver) = self.driver.as_mut() else {
            return ErrorCode::GroupNotAllow;
        };
        if let Err(code) = driver.update_group(&config.group, interval) {
            return code;
        }
        if running {
            driver.arm(&config.group, Instant::now());
        }
        self.persistence.notify(PersistOp::SaveGroup {
            node: self.name.to_string(),
            group: config.group.clone(),
            interval_ms: interval_ms(interval),
        });
        ErrorCode::Success
    }

    fn del_group(&mut self, group: &GroupRef) -> ErrorCode {
        let Some(driver) = self.driver.as_mut() else {
            return ErrorCode::GroupNotAllow;
        };
        if let Err(code) = driver.del_group(&group.group) {
            return code;
        }
        self.metrics.remove_group(&self.name, &group.group);
        self.persistence.notify(PersistOp::DeleteGroup {
            node: self.name.to_string(),
            group: group.group.clone(),
        });
        ErrorCode::Success
    }

    /// Add or update tags in order, stopping at the first failure.
    fn put_tags(&mut self, batch: &TagBatch, update: bool) -> BatchResult {
        let (Some(driver), Some(hooks)) = (self.driver.as_mut(), self.plugin.as_driver()) else {
            return BatchResult {
                index: 0,
                code: ErrorCode::GroupNotAllow,
            };
        };
        let mut result = BatchResult {
            index: 0,
            code: ErrorCode::Success,
        };
        for tag in &batch.tags {
            let outcome = hooks.validate_tag(tag).and_then(|()| {
                if update {
                    driver.update_tag(&batch.group, tag.clone())
                } else {
                    driver.add_tag(&batch.group, tag.clone())
                }
            });
            if let Err(code) = outcome {
                result.code = code;
                break;
            }
            self.persistence.notify(PersistOp::SaveTag {
                node: self.name.to_string(),
                group: batch.group.clone(),
                tag: tag.clone(),
            });
            result.index += 1;
        }
        if let Ok(count) = driver.tag_count(&batch.group) {
            self.callbacks
                .update_group_metric(&batch.group, GROUP_TAGS_TOTAL, count as u64);
        }
        result
    }

    fn del_tags(&mut self, names: &TagNames) -> BatchResult {
        let Some(driver) = self.driver.as_mut() else {
            return BatchResult {
                index: 0,
                code: ErrorCode::GroupNotAllow,
            };
        };
        let mut result = BatchResult {
            index: 0,
            code: ErrorCode::Success,
        };
        for name in &names.names {
            if let Err(code) = driver.del_tag(&names.group, name) {
                result.code = code;
                break;
            }
            self.persistence.notify(PersistOp::DeleteTag {
                node: self.name.to_string(),
                group: names.group.clone(),
                tag: name.clone(),
            });
            result.index += 1;
        }
        if let Ok(count) = driver.tag_count(&names.group) {
            self.callbacks
                .update_group_metric(&names.group, GROUP_TAGS_TOTAL, count as u64);
        }
        result
    }

    fn get_tags(&self, get: &GetTag) -> Body {
        let Some(driver) = &self.driver else {
            return Body::error(ErrorCode::GroupNotAllow);
        };
        match driver.tag_page(&get.group, usize::from(get.offset)) {
            Ok(page) => Body::RespGetTag(page),
            Err(code) => Body::error(code),
        }
    }

    fn read_group(&self, group: &GroupRef) -> Body {
        let Some(driver) = &self.driver else {
            return Body::error(ErrorCode::GroupNotAllow);
        };
        match driver.cached_values(&group.group) {
            Ok(values) => Body::TransData(TransData {
                driver: self.name.to_string(),
                group: group.group.clone(),
                values,
            }),
            Err(code) => Body::error(code),
        }
    }

    fn write_tag(&mut self, write: &WriteTag) -> ErrorCode {
        let state = self.status.state();
        let (Some(driver), Some(hooks)) = (self.driver.as_ref(), self.plugin.as_driver()) else {
            return ErrorCode::GroupNotAllow;
        };
        let tag = match driver.tag(&write.group, &write.tag) {
            Ok(tag) => tag,
            Err(code) => return code,
        };
        if !tag.attribute.contains(TagAttribute::WRITE) {
            return ErrorCode::TagAttributeNotSupport;
        }
        if state != AdapterState::Running {
            return ErrorCode::NodeNotRunning;
        }
        match hooks.write_tag(&self.callbacks, tag, &write.value) {
            Ok(()) => ErrorCode::Success,
            Err(code) => code,
        }
    }

    async fn poll_due(&mut self) {
        let due = match self.driver.as_mut() {
            Some(driver) => driver.take_due(Instant::now()),
            None => return,
        };
        for group in due {
            self.poll_group(&group).await;
        }
    }

    async fn poll_group(&mut self, group: &str) {
        if self.status.state() != AdapterState::Running {
            return;
        }
        let started = Instant::now();
        let (outcome, reads, errors) = {
            let (Some(driver), Some(hooks)) = (self.driver.as_mut(), self.plugin.as_driver())
            else {
                return;
            };
            let Some(mut ctx) = driver.poll_context(group) else {
                return;
            };
            let outcome = hooks.poll_group(&self.callbacks, &mut ctx);
            let (reads, errors) = ctx.counts();
            (outcome, reads, errors)
        };
        if let Err(err) = outcome {
            warn!(group, error = %err, "group poll failed");
        }

        self.callbacks
            .update_metric(LAST_RTT_MS, duration_to_millis(started.elapsed()));
        self.callbacks.update_metric(TAG_READS_TOTAL, reads);
        self.callbacks.update_metric(TAG_READ_ERRORS_TOTAL, errors);
        self.callbacks
            .update_group_metric(group, GROUP_LAST_POLL_MS, unix_millis());

        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let count = driver.tag_count(group).unwrap_or(0);
        let values = driver.cached_values(group).unwrap_or_default();
        driver.arm(group, Instant::now());
        self.callbacks
            .update_group_metric(group, GROUP_TAGS_TOTAL, count as u64);

        if values.is_empty() {
            return;
        }
        let data = Envelope::new(
            &*self.name,
            MANAGER_NODE,
            Body::TransData(TransData {
                driver: self.name.to_string(),
                group: group.to_owned(),
                values,
            }),
        );
        if let Err(err) = self.uplink.send_envelope(&data).await {
            warn!(group, error = %err, "group data not delivered");
        }
    }

    /// Stop reading, disarm timers, then unwind the plugin.
    fn teardown(&mut self) {
        self.socket.close();
        if let Some(driver) = self.driver.as_mut() {
            driver.clear_deadlines();
        }
        if self.status.state() == AdapterState::Running {
            if let Err(err) = self.plugin.stop(&self.callbacks) {
                warn!(error = %err, "plugin stop failed during shutdown");
            }
            self.status.set_state(AdapterState::Stopped);
        }
        if let Err(err) = self.plugin.uninit(&self.callbacks) {
            warn!(error = %err, "plugin uninit failed");
        }
        self.plugin.close();
        self.status.set_link(LinkState::Disconnected);
    }
}

async fn reply(uplink: &Uplink, request: &Envelope, body: Body) {
    if let Err(err) = uplink.send_envelope(&request.reply(body)).await {
        warn!(
            msg_type = request.msg_type().name(),
            requester = %request.header.sender,
            error = %err,
            "reply not delivered"
        );
    }
}

/// Answer a request whose body could not be decoded, when its header is intact.
async fn reject_malformed(uplink: &Uplink, frame: &[u8]) {
    let Ok((ty, header)) = peek_header(frame) else {
        return;
    };
    if !ty.expects_reply() {
        return;
    }
    let error = Envelope {
        header: header.swapped(),
        body: Body::error(ErrorCode::Internal),
    };
    if let Err(err) = uplink.send_envelope(&error).await {
        warn!(msg_type = ty.name(), requester = %header.sender, error = %err, "reply not delivered");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Manager-side view of a spawned adapter.
#[derive(Debug)]
pub struct AdapterHandle {
    node: Arc<str>,
    module: PluginModule,
    status: Arc<NodeStatus>,
    task: JoinHandle<()>,
}

impl AdapterHandle {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn module(&self) -> &PluginModule {
        &self.module
    }

    pub fn node_type(&self) -> NodeType {
        self.module.kind
    }

    pub fn state(&self) -> AdapterState {
        self.status.state()
    }

    pub fn link(&self) -> LinkState {
        self.status.link()
    }

    /// True once the task returned or panicked.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the task to end. Call at most once.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn adapter_task_future_is_send() {
        let _ = |adapter: Adapter| assert_send(&adapter.run());
        let _ = |uplink: Uplink, request: Envelope| {
            assert_send(&reply(&uplink, &request, Body::error(ErrorCode::Success)))
        };
        let _ = |uplink: Uplink, frame: Bytes| assert_send(&reject_malformed(&uplink, &frame));
    }
}

//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Built-in protocol plugins and the static plugin catalog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! `telemetry-log` app: subscribes to driver groups and logs the data it receives.

use r_ems_adapter::{AdapterCallbacks, Plugin, PluginError, PluginResult};
use r_ems_msg::{Body, Envelope, ErrorCode, Subscription, MANAGER_NODE};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupSelector {
    pub driver: String,
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TelemetryLogSetting {
    #[serde(default)]
    pub subscriptions: Vec<GroupSelector>,
}

#[derive(Debug, Default)]
pub struct TelemetryLog {
    setting: TelemetryLogSetting,
    running: bool,
    received: u64,
}

impl TelemetryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data messages logged so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn send_all(&self, cb: &AdapterCallbacks, subscribe: bool) -> PluginResult<()> {
        for selector in &self.setting.subscriptions {
            let subscription = Subscription {
                app: cb.node_name().to_owned(),
                driver: selector.driver.clone(),
                group: selector.group.clone(),
            };
            let body = if subscribe {
                Body::Subscribe(subscription)
            } else {
                Body::Unsubscribe(subscription)
            };
            cb.emit_command(MANAGER_NODE, body).map_err(|code| {
                PluginError::new(
                    code,
                    format!("subscription change for {}/{} not sent", selector.driver, selector.group),
                )
            })?;
        }
        Ok(())
    }
}

impl Plugin for TelemetryLog {
    fn start(&mut self, cb: &AdapterCallbacks) -> PluginResult<()> {
        self.send_all(cb, true)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self, cb: &AdapterCallbacks) -> PluginResult<()> {
        self.running = false;
        self.send_all(cb, false)
    }

    fn apply_setting(&mut self, cb: &AdapterCallbacks, setting: &str) -> PluginResult<()> {
        let parsed: TelemetryLogSetting = serde_json::from_str(setting).map_err(|err| {
            PluginError::new(ErrorCode::NodeSettingInvalid, format!("telemetry-log setting: {err}"))
        })?;
        if self.running {
            self.send_all(cb, false)?;
        }
        self.setting = parsed;
        if self.running {
            self.send_all(cb, true)?;
        }
        info!(subscriptions = self.setting.subscriptions.len(), "telemetry-log setting applied");
        Ok(())
    }

    fn handle_request(&mut self, _cb: &AdapterCallbacks, request: &Envelope) -> PluginResult<()> {
        match &request.body {
            Body::TransData(data) => {
                self.received += 1;
                info!(driver = %data.driver, group = %data.group, tags = data.values.len(), "telemetry");
                for value in &data.values {
                    debug!(driver = %data.driver, group = %data.group, tag = %value.tag, value = ?value.value, "tag value");
                }
            }
            Body::RespError(resp) if !resp.code.is_success() => {
                warn!(code = %resp.code, sender = %request.header.sender, "request rejected");
            }
            Body::NodeDeleted(node) => {
                let before = self.setting.subscriptions.len();
                self.setting.subscriptions.retain(|s| s.driver != node.node);
                if self.setting.subscriptions.len() != before {
                    info!(driver = %node.node, "subscriptions to deleted driver dropped");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::callbacks;
    use r_ems_msg::{decode, NodeRef, NodeType, TransData};

    #[tokio::test]
    async fn start_and_stop_toggle_subscriptions() {
        let (cb, mut bus, _metrics) = callbacks("telemetry-log", NodeType::App);
        let mut app = TelemetryLog::new();
        app.apply_setting(&cb, r#"{"subscriptions":[{"driver":"plc1","group":"grp1"}]}"#)
            .unwrap();
        app.start(&cb).unwrap();
        app.stop(&cb).unwrap();

        let first = decode(&bus.recv().await.unwrap().bytes).unwrap();
        assert_eq!(first.header.receiver, MANAGER_NODE);
        assert_eq!(
            first.body,
            Body::Subscribe(Subscription {
                app: "telemetry-log".into(),
                driver: "plc1".into(),
                group: "grp1".into(),
            })
        );
        let second = decode(&bus.recv().await.unwrap().bytes).unwrap();
        assert!(matches!(second.body, Body::Unsubscribe(_)));
    }

    #[tokio::test]
    async fn data_is_counted_and_deleted_drivers_forgotten() {
        let (cb, _bus, _metrics) = callbacks("telemetry-log", NodeType::App);
        let mut app = TelemetryLog::new();
        app.apply_setting(&cb, r#"{"subscriptions":[{"driver":"plc1","group":"grp1"}]}"#)
            .unwrap();

        let data = Envelope::new(
            MANAGER_NODE,
            "telemetry-log",
            Body::TransData(TransData {
                driver: "plc1".into(),
                group: "grp1".into(),
                values: vec![],
            }),
        );
        app.handle_request(&cb, &data).unwrap();
        assert_eq!(app.received(), 1);

        let deleted = Envelope::new(
            MANAGER_NODE,
            "telemetry-log",
            Body::NodeDeleted(NodeRef { node: "plc1".into() }),
        );
        app.handle_request(&cb, &deleted).unwrap();
        assert!(app.setting.subscriptions.is_empty());
        assert!(app.apply_setting(&cb, "not json").is_err());
    }
}

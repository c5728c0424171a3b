//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Built-in protocol plugins and the static plugin catalog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Built-in plugins compiled into the hub.

pub mod file;
pub mod modbus;
pub mod monitor;
pub mod telemetry_log;

use r_ems_adapter::{Plugin, PluginCatalog, PluginModule};
use r_ems_msg::NodeType;

pub use file::FileDriver;
pub use modbus::ModbusDriver;
pub use monitor::Monitor;
pub use telemetry_log::TelemetryLog;

pub const MODBUS_TCP: &str = "modbus-tcp";
pub const FILE: &str = "file";
pub const TELEMETRY_LOG: &str = "telemetry-log";
pub const MONITOR: &str = "monitor";

fn open_modbus() -> Box<dyn Plugin> {
    Box::new(ModbusDriver::new())
}

fn open_file() -> Box<dyn Plugin> {
    Box::new(FileDriver::new())
}

fn open_telemetry_log() -> Box<dyn Plugin> {
    Box::new(TelemetryLog::new())
}

fn open_monitor() -> Box<dyn Plugin> {
    Box::new(Monitor::new())
}

/// Every plugin module shipped with the hub.
pub fn builtin_modules() -> [PluginModule; 4] {
    [
        PluginModule {
            name: MODBUS_TCP,
            description: "Modbus TCP driver over an in-process register bank",
            kind: NodeType::Driver,
            single: false,
            system: false,
            open: open_modbus,
        },
        PluginModule {
            name: FILE,
            description: "Reads and writes tag values as file contents",
            kind: NodeType::Driver,
            single: false,
            system: false,
            open: open_file,
        },
        PluginModule {
            name: TELEMETRY_LOG,
            description: "Logs data from subscribed driver groups",
            kind: NodeType::App,
            single: true,
            system: false,
            open: open_telemetry_log,
        },
        PluginModule {
            name: MONITOR,
            description: "Tracks node state transitions",
            kind: NodeType::App,
            single: false,
            system: true,
            open: open_monitor,
        },
    ]
}

pub fn builtin_catalog() -> PluginCatalog {
    PluginCatalog::new(builtin_modules())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use r_ems_adapter::metrics::register_node_metrics;
    use r_ems_adapter::{AdapterCallbacks, DriverPlugin, DriverState, NodeStatus};
    use r_ems_metrics::MetricsStore;
    use r_ems_msg::{Bus, BusConfig, NodeType, Tag, TagValue};
    use std::time::Duration;

    /// Callbacks wired to a fresh bus; keep the bus alive to read what the plugin sends.
    pub fn callbacks(node: &str, node_type: NodeType) -> (AdapterCallbacks, Bus, Arc<MetricsStore>) {
        let mut bus = Bus::new(BusConfig::default());
        let (_endpoint, socket) = bus.dial();
        let metrics = Arc::new(MetricsStore::new());
        register_node_metrics(&metrics, node, node_type).unwrap();
        let cb = AdapterCallbacks::new(
            Arc::from(node),
            node_type,
            socket.uplink(),
            Arc::clone(&metrics),
            Arc::new(NodeStatus::default()),
        );
        (cb, bus, metrics)
    }

    /// Poll `tags` once as group "grp" and return what landed in the cache.
    pub fn poll(driver: &mut dyn DriverPlugin, cb: &AdapterCallbacks, tags: &[Tag]) -> Vec<TagValue> {
        let mut state = DriverState::new();
        state.add_group("grp", Duration::from_millis(100)).unwrap();
        for tag in tags {
            state.add_tag("grp", tag.clone()).unwrap();
        }
        let mut ctx = state.poll_context("grp").unwrap();
        driver.poll_group(cb, &mut ctx).unwrap();
        drop(ctx);
        state.cached_values("grp").unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_every_builtin() {
        let catalog = builtin_catalog();
        let names: Vec<_> = catalog.iter().map(|m| m.name).collect();
        assert_eq!(names, vec![MODBUS_TCP, FILE, TELEMETRY_LOG, MONITOR]);
        let autoloaded: Vec<_> = catalog.autoloaded().map(|m| m.name).collect();
        assert_eq!(autoloaded, vec![TELEMETRY_LOG, MONITOR]);
        assert!(catalog.get("opcua").is_none());
    }

    #[test]
    fn driver_modules_expose_driver_hooks() {
        for module in builtin_modules() {
            let mut plugin = (module.open)();
            assert_eq!(
                plugin.as_driver().is_some(),
                module.kind == NodeType::Driver,
                "{}",
                module.name
            );
        }
    }
}

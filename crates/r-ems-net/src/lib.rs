//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Built-in protocol plugins and the static plugin catalog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Protocol plugins linked into the hub binary and the catalog that names them.

pub mod plugins;

pub use plugins::{
    builtin_catalog, builtin_modules, FileDriver, ModbusDriver, Monitor, TelemetryLog, FILE,
    MODBUS_TCP, MONITOR, TELEMETRY_LOG,
};

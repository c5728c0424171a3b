//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Adapter runtime, lifecycle and plugin capability contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Capability contract between the adapter runtime and protocol plugins.
//!
//! Every hook is synchronous and runs on the adapter task: a hook must return promptly and
//! leave long device I/O to its own scheduling. Driver plugins additionally expose
//! [`DriverPlugin`] through [`Plugin::as_driver`].

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use r_ems_msg::{Envelope, ErrorCode, NodeType, Tag, Value};

use crate::callbacks::AdapterCallbacks;

/// Failure reported by a plugin hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct PluginError {
    pub code: ErrorCode,
    pub message: String,
}

impl PluginError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ErrorCode> for PluginError {
    fn from(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.to_string(),
        }
    }
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Lifecycle hooks shared by driver and app plugins.
pub trait Plugin: Send {
    /// First hook after the module opened the plugin.
    fn init(&mut self, _cb: &AdapterCallbacks) -> PluginResult<()> {
        Ok(())
    }

    /// Last hook before the plugin is closed.
    fn uninit(&mut self, _cb: &AdapterCallbacks) -> PluginResult<()> {
        Ok(())
    }

    /// Release resources held since the module opened the plugin.
    fn close(&mut self) {}

    fn start(&mut self, cb: &AdapterCallbacks) -> PluginResult<()>;

    fn stop(&mut self, cb: &AdapterCallbacks) -> PluginResult<()>;

    /// Validate and apply a JSON setting. Rejection leaves the previous setting active.
    fn apply_setting(&mut self, cb: &AdapterCallbacks, setting: &str) -> PluginResult<()>;

    /// Receives responses, data and notifications addressed to the node.
    fn handle_request(&mut self, _cb: &AdapterCallbacks, _request: &Envelope) -> PluginResult<()> {
        Ok(())
    }

    fn as_driver(&mut self) -> Option<&mut dyn DriverPlugin> {
        None
    }
}

/// Hooks only driver plugins provide.
pub trait DriverPlugin {
    /// Check that the plugin can serve `tag`.
    fn validate_tag(&mut self, tag: &Tag) -> Result<(), ErrorCode>;

    /// Read the tags of one due group and store the results in `ctx`.
    fn poll_group(&mut self, cb: &AdapterCallbacks, ctx: &mut PollContext<'_>) -> PluginResult<()>;

    fn write_tag(&mut self, cb: &AdapterCallbacks, tag: &Tag, value: &Value) -> Result<(), ErrorCode>;
}

/// View of one group handed to [`DriverPlugin::poll_group`].
pub struct PollContext<'a> {
    group: &'a str,
    tags: &'a IndexMap<String, Tag>,
    values: &'a mut HashMap<String, Value>,
    reads: u64,
    errors: u64,
}

impl<'a> PollContext<'a> {
    pub(crate) fn new(
        group: &'a str,
        tags: &'a IndexMap<String, Tag>,
        values: &'a mut HashMap<String, Value>,
    ) -> Self {
        Self {
            group,
            tags,
            values,
            reads: 0,
            errors: 0,
        }
    }

    pub fn group(&self) -> &'a str {
        self.group
    }

    /// Tags of the group, in insertion order.
    pub fn tags(&self) -> &'a IndexMap<String, Tag> {
        self.tags
    }

    /// Record the latest value (or read error) of a tag. Unknown names are ignored.
    pub fn set_value(&mut self, tag: &str, value: Value) {
        if !self.tags.contains_key(tag) {
            return;
        }
        self.reads += 1;
        if value.is_error() {
            self.errors += 1;
        }
        self.values.insert(tag.to_owned(), value);
    }

    /// Values recorded during this poll, and how many of them were read errors.
    pub fn counts(&self) -> (u64, u64) {
        (self.reads, self.errors)
    }
}

/// Catalog entry: a statically linked plugin implementation.
#[derive(Clone, Copy)]
pub struct PluginModule {
    /// Key used by `AddNode` and node declarations.
    pub name: &'static str,
    pub description: &'static str,
    pub kind: NodeType,
    /// Instantiated once at manager start under the module name; cannot be deleted.
    pub single: bool,
    /// System node created at manager start and hidden from listings and aggregates.
    pub system: bool,
    pub open: fn() -> Box<dyn Plugin>,
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("single", &self.single)
            .field("system", &self.system)
            .finish()
    }
}

/// Modules available to the manager, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    modules: IndexMap<&'static str, PluginModule>,
}

impl PluginCatalog {
    pub fn new(modules: impl IntoIterator<Item = PluginModule>) -> Self {
        Self {
            modules: modules.into_iter().map(|m| (m.name, m)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PluginModule> {
        self.modules.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginModule> {
        self.modules.values()
    }

    /// Modules the manager instantiates on its own at start.
    pub fn autoloaded(&self) -> impl Iterator<Item = &PluginModule> {
        self.modules.values().filter(|m| m.single || m.system)
    }
}

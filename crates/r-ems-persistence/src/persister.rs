//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use r_ems_msg::{AdapterState, Tag};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Node declaration restored at manager start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: String,
    pub plugin: String,
}

/// Persisted group with its tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub interval_ms: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Storage contract for node configuration.
///
/// Loads run synchronously while a node is created. Writes are only ever issued through a
/// [`crate::PersistenceBridge`], so implementations may block.
pub trait Persister: Send + Sync {
    fn load_nodes(&self) -> Result<Vec<NodeRecord>>;
    fn save_node(&self, record: &NodeRecord) -> Result<()>;
    /// Remove everything stored for `node`.
    fn delete_node(&self, node: &str) -> Result<()>;

    fn load_setting(&self, node: &str) -> Result<Option<String>>;
    fn save_setting(&self, node: &str, setting: &str) -> Result<()>;

    fn load_state(&self, node: &str) -> Result<Option<AdapterState>>;
    fn save_state(&self, node: &str, state: AdapterState) -> Result<()>;

    fn load_groups(&self, node: &str) -> Result<Vec<GroupRecord>>;
    /// Create the group or update its interval, keeping its tags.
    fn save_group(&self, node: &str, group: &str, interval_ms: u32) -> Result<()>;
    fn delete_group(&self, node: &str, group: &str) -> Result<()>;
    /// Insert or replace one tag of an existing group.
    fn save_tag(&self, node: &str, group: &str, tag: &Tag) -> Result<()>;
    fn delete_tag(&self, node: &str, group: &str, tag: &str) -> Result<()>;
}

/// Persister that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersister;

impl Persister for NoopPersister {
    fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(Vec::new())
    }

    fn save_node(&self, _record: &NodeRecord) -> Result<()> {
        Ok(())
    }

    fn delete_node(&self, _node: &str) -> Result<()> {
        Ok(())
    }

    fn load_setting(&self, _node: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn save_setting(&self, _node: &str, _setting: &str) -> Result<()> {
        Ok(())
    }

    fn load_state(&self, _node: &str) -> Result<Option<AdapterState>> {
        Ok(None)
    }

    fn save_state(&self, _node: &str, _state: AdapterState) -> Result<()> {
        Ok(())
    }

    fn load_groups(&self, _node: &str) -> Result<Vec<GroupRecord>> {
        Ok(Vec::new())
    }

    fn save_group(&self, _node: &str, _group: &str, _interval_ms: u32) -> Result<()> {
        Ok(())
    }

    fn delete_group(&self, _node: &str, _group: &str) -> Result<()> {
        Ok(())
    }

    fn save_tag(&self, _node: &str, _group: &str, _tag: &Tag) -> Result<()> {
        Ok(())
    }

    fn delete_tag(&self, _node: &str, _group: &str, _tag: &str) -> Result<()> {
        Ok(())
    }
}

/// One queued write.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    SaveNode(NodeRecord),
    DeleteNode { node: String },
    SaveSetting { node: String, setting: String },
    SaveState { node: String, state: AdapterState },
    SaveGroup { node: String, group: String, interval_ms: u32 },
    DeleteGroup { node: String, group: String },
    SaveTag { node: String, group: String, tag: Tag },
    DeleteTag { node: String, group: String, tag: String },
}

impl PersistOp {
    pub fn node(&self) -> &str {
        match self {
            PersistOp::SaveNode(record) => &record.node,
            PersistOp::DeleteNode { node }
            | PersistOp::SaveSetting { node, .. }
            | PersistOp::SaveState { node, .. }
            | PersistOp::SaveGroup { node, .. }
            | PersistOp::DeleteGroup { node, .. }
            | PersistOp::SaveTag { node, .. }
            | PersistOp::DeleteTag { node, .. } => node,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PersistOp::SaveNode(_) => "save_node",
            PersistOp::DeleteNode { .. } => "delete_node",
            PersistOp::SaveSetting { .. } => "save_setting",
            PersistOp::SaveState { .. } => "save_state",
            PersistOp::SaveGroup { .. } => "save_group",
            PersistOp::DeleteGroup { .. } => "delete_group",
            PersistOp::SaveTag { .. } => "save_tag",
            PersistOp::DeleteTag { .. } => "delete_tag",
        }
    }

    /// Execute this write against `persister`.
    pub fn apply(&self, persister: &dyn Persister) -> Result<()> {
        match self {
            PersistOp::SaveNode(record) => persister.save_node(record),
            PersistOp::DeleteNode { node } => persister.delete_node(node),
            PersistOp::SaveSetting { node, setting } => persister.save_setting(node, setting),
            PersistOp::SaveState { node, state } => persister.save_state(node, *state),
            PersistOp::SaveGroup {
                node,
                group,
                interval_ms,
            } => persister.save_group(node, group, *interval_ms),
            PersistOp::DeleteGroup { node, group } => persister.delete_group(node, group),
            PersistOp::SaveTag { node, group, tag } => persister.save_tag(node, group, tag),
            PersistOp::DeleteTag { node, group, tag } => persister.delete_tag(node, group, tag),
        }
    }
}

//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus envelope model, codec, and in-process transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Message model shared by the manager, the adapters and their plugins.
//!
//! Every string field has a fixed wire width that includes a terminating zero, so the
//! longest accepted value is one byte shorter than the width constant.

use serde::{Deserialize, Serialize};

use crate::error_code::ErrorCode;

/// Wire width of node names.
pub const NODE_NAME_LEN: usize = 128;
/// Wire width of group names.
pub const GROUP_NAME_LEN: usize = 128;
/// Wire width of tag names.
pub const TAG_NAME_LEN: usize = 128;
/// Wire width of tag addresses.
pub const TAG_ADDRESS_LEN: usize = 128;
/// Wire width of tag descriptions.
pub const TAG_DESCRIPTION_LEN: usize = 128;
/// Wire width of plugin module names.
pub const PLUGIN_NAME_LEN: usize = 64;
/// Wire width of node settings.
pub const SETTING_LEN: usize = 2048;
/// Wire width of string values.
pub const VALUE_STR_LEN: usize = 128;
/// Maximum tags carried by one add/update/delete/get batch.
pub const TAG_BATCH_MAX: usize = 16;
/// Maximum groups carried by one group listing.
pub const GROUP_LIST_MAX: usize = 64;
/// Maximum nodes carried by one nodes-state broadcast.
pub const NODE_LIST_MAX: usize = 64;

/// Reserved name of the manager endpoint.
pub const MANAGER_NODE: &str = "manager";
/// Reserved name used for requests issued through the manager handle.
pub const API_NODE: &str = "api";

/// Returns true for names no node may take.
pub fn is_reserved_name(name: &str) -> bool {
    name == MANAGER_NODE || name == API_NODE
}

/// Finite set of message types known to this build.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::FromRepr,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u16)]
pub enum MsgType {
    RespError = 1,
    NodeInit = 2,
    NodeUninit = 3,
    RespNodeUninit = 4,
    AddNode = 5,
    DelNode = 6,
    NodeDeleted = 7,
    NodeSetting = 10,
    GetNodeSetting = 11,
    RespGetNodeSetting = 12,
    NodeCtl = 13,
    GetNodeState = 14,
    RespGetNodeState = 15,
    NodesState = 16,
    AddGroup = 20,
    UpdateGroup = 21,
    DelGroup = 22,
    GetGroup = 23,
    RespGetGroup = 24,
    AddTag = 30,
    RespAddTag = 31,
    UpdateTag = 32,
    RespUpdateTag = 33,
    DelTag = 34,
    RespDelTag = 35,
    GetTag = 36,
    RespGetTag = 37,
    ReadGroup = 40,
    WriteTag = 41,
    TransData = 42,
    Subscribe = 50,
    Unsubscribe = 51,
}

impl MsgType {
    /// Numeric tag written in the envelope header.
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// Resolve a header tag, `None` when this build does not know it.
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::from_repr(tag)
    }

    /// Stable snake_case name used in logs.
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether the receiver answers this type with exactly one reply.
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            MsgType::RespError
                | MsgType::NodeInit
                | MsgType::RespNodeUninit
                | MsgType::NodeDeleted
                | MsgType::RespGetNodeSetting
                | MsgType::RespGetNodeState
                | MsgType::NodesState
                | MsgType::RespGetGroup
                | MsgType::RespAddTag
                | MsgType::RespUpdateTag
                | MsgType::RespDelTag
                | MsgType::RespGetTag
                | MsgType::TransData
        )
    }
}

/// Driver (south) or app (north) node class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Driver,
    App,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Driver => "driver",
            NodeType::App => "app",
        }
    }
}

/// Lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AdapterState {
    #[default]
    Init = 0,
    Ready = 1,
    Running = 2,
    Stopped = 3,
}

impl AdapterState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(AdapterState::Init),
            1 => Some(AdapterState::Ready),
            2 => Some(AdapterState::Running),
            3 => Some(AdapterState::Stopped),
            _ => None,
        }
    }
}

/// Device connectivity reported by the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LinkState {
    #[default]
    Disconnected = 0,
    Connected = 1,
}

impl LinkState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(LinkState::Disconnected),
            1 => Some(LinkState::Connected),
            _ => None,
        }
    }
}

/// Start/stop command carried by [`NodeCtl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeCtlKind {
    Start = 0,
    Stop = 1,
}

/// Data type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::FromRepr)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DataType {
    Int8 = 1,
    Uint8 = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    Int64 = 7,
    Uint64 = 8,
    Float = 9,
    Double = 10,
    Bit = 11,
    Bool = 12,
    String = 13,
}

/// Bit set of tag access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagAttribute(pub u8);

impl TagAttribute {
    pub const READ: TagAttribute = TagAttribute(0x01);
    pub const WRITE: TagAttribute = TagAttribute(0x02);
    pub const SUBSCRIBE: TagAttribute = TagAttribute(0x04);
    pub const READ_WRITE: TagAttribute = TagAttribute(0x03);

    pub fn contains(self, other: TagAttribute) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One addressable data point of a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub attribute: TagAttribute,
    #[serde(default)]
    pub precision: u8,
}

impl Tag {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        data_type: DataType,
        attribute: TagAttribute,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            description: String::new(),
            data_type,
            attribute,
            precision: 0,
        }
    }
}

/// Tag value as read from or written to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Read failed with the given code.
    Error(ErrorCode),
}

impl Value {
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }
}

/// Name/value pair inside a [`TransData`] payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TagValue {
    pub tag: String,
    pub value: Value,
}

/// Fixed-width envelope header fields other than the type tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub sender: String,
    pub receiver: String,
    /// Request correlation id, copied unchanged into replies.
    pub ctx: u64,
}

impl Header {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            ctx: 0,
        }
    }

    /// Header for the reply to this one.
    pub fn swapped(&self) -> Header {
        Header {
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            ctx: self.ctx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub node: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespError {
    pub code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInit {
    pub node: String,
    pub auto_start: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNode {
    pub node: String,
    pub plugin: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSetting {
    pub node: String,
    pub setting: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCtl {
    pub node: String,
    pub ctl: NodeCtlKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStateReport {
    pub running: AdapterState,
    pub link: LinkState,
    pub rtt_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateEntry {
    pub node: String,
    pub running: AdapterState,
    pub link: LinkState,
    pub rtt_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodesState {
    pub nodes: Vec<NodeStateEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    pub driver: String,
    pub group: String,
    pub interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub driver: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub interval_ms: u32,
    pub tag_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupList {
    pub groups: Vec<GroupInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagBatch {
    pub driver: String,
    pub group: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagNames {
    pub driver: String,
    pub group: String,
    pub names: Vec<String>,
}

/// Outcome of a batch operation: `index` entries succeeded before `code` stopped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub index: u16,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTag {
    pub driver: String,
    pub group: String,
    pub offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagPage {
    /// Number of tags in the group, independent of paging.
    pub total: u16,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteTag {
    pub driver: String,
    pub group: String,
    pub tag: String,
    pub value: Value,
}

/// Stream payload: the only body whose size depends on an element count.
#[derive(Debug, Clone, PartialEq)]
pub struct TransData {
    pub driver: String,
    pub group: String,
    pub values: Vec<TagValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription {
    pub app: String,
    pub driver: String,
    pub group: String,
}

/// Type-indexed message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    RespError(RespError),
    NodeInit(NodeInit),
    NodeUninit(NodeRef),
    RespNodeUninit(NodeRef),
    AddNode(AddNode),
    DelNode(NodeRef),
    NodeDeleted(NodeRef),
    NodeSetting(NodeSetting),
    GetNodeSetting(NodeRef),
    RespGetNodeSetting(NodeSetting),
    NodeCtl(NodeCtl),
    GetNodeState(NodeRef),
    RespGetNodeState(NodeStateReport),
    NodesState(NodesState),
    AddGroup(GroupConfig),
    UpdateGroup(GroupConfig),
    DelGroup(GroupRef),
    GetGroup(NodeRef),
    RespGetGroup(GroupList),
    AddTag(TagBatch),
    RespAddTag(BatchResult),
    UpdateTag(TagBatch),
    RespUpdateTag(BatchResult),
    DelTag(TagNames),
    RespDelTag(BatchResult),
    GetTag(GetTag),
    RespGetTag(TagPage),
    ReadGroup(GroupRef),
    WriteTag(WriteTag),
    TransData(TransData),
    Subscribe(Subscription),
    Unsubscribe(Subscription),
}

impl Body {
    /// Type tag matching this body.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Body::RespError(_) => MsgType::RespError,
            Body::NodeInit(_) => MsgType::NodeInit,
            Body::NodeUninit(_) => MsgType::NodeUninit,
            Body::RespNodeUninit(_) => MsgType::RespNodeUninit,
            Body::AddNode(_) => MsgType::AddNode,
            Body::DelNode(_) => MsgType::DelNode,
            Body::NodeDeleted(_) => MsgType::NodeDeleted,
            Body::NodeSetting(_) => MsgType::NodeSetting,
            Body::GetNodeSetting(_) => MsgType::GetNodeSetting,
            Body::RespGetNodeSetting(_) => MsgType::RespGetNodeSetting,
            Body::NodeCtl(_) => MsgType::NodeCtl,
            Body::GetNodeState(_) => MsgType::GetNodeState,
            Body::RespGetNodeState(_) => MsgType::RespGetNodeState,
            Body::NodesState(_) => MsgType::NodesState,
            Body::AddGroup(_) => MsgType::AddGroup,
            Body::UpdateGroup(_) => MsgType::UpdateGroup,
            Body::DelGroup(_) => MsgType::DelGroup,
            Body::GetGroup(_) => MsgType::GetGroup,
            Body::RespGetGroup(_) => MsgType::RespGetGroup,
            Body::AddTag(_) => MsgType::AddTag,
            Body::RespAddTag(_) => MsgType::RespAddTag,
            Body::UpdateTag(_) => MsgType::UpdateTag,
            Body::RespUpdateTag(_) => MsgType::RespUpdateTag,
            Body::DelTag(_) => MsgType::DelTag,
            Body::RespDelTag(_) => MsgType::RespDelTag,
            Body::GetTag(_) => MsgType::GetTag,
            Body::RespGetTag(_) => MsgType::RespGetTag,
            Body::ReadGroup(_) => MsgType::ReadGroup,
            Body::WriteTag(_) => MsgType::WriteTag,
            Body::TransData(_) => MsgType::TransData,
            Body::Subscribe(_) => MsgType::Subscribe,
            Body::Unsubscribe(_) => MsgType::Unsubscribe,
        }
    }

    /// Node a request is addressed to, when the body names one.
    ///
    /// Requests without a target node (subscriptions, node management) go to the manager.
    pub fn target_node(&self) -> Option<&str> {
        match self {
            Body::NodeSetting(b) => Some(&b.node),
            Body::GetNodeSetting(b) | Body::GetNodeState(b) | Body::GetGroup(b) => Some(&b.node),
            Body::NodeCtl(b) => Some(&b.node),
            Body::AddGroup(b) | Body::UpdateGroup(b) => Some(&b.driver),
            Body::DelGroup(b) | Body::ReadGroup(b) => Some(&b.driver),
            Body::AddTag(b) | Body::UpdateTag(b) => Some(&b.driver),
            Body::DelTag(b) => Some(&b.driver),
            Body::GetTag(b) => Some(&b.driver),
            Body::WriteTag(b) => Some(&b.driver),
            _ => None,
        }
    }

    pub fn error(code: ErrorCode) -> Body {
        Body::RespError(RespError { code })
    }
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub body: Body,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, body: Body) -> Self {
        Self {
            header: Header::new(sender, receiver),
            body,
        }
    }

    pub fn with_ctx(mut self, ctx: u64) -> Self {
        self.header.ctx = ctx;
        self
    }

    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    /// Reply addressed back to the sender of this envelope.
    pub fn reply(&self, body: Body) -> Envelope {
        Envelope {
            header: self.header.swapped(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn type_tags_are_unique_and_resolvable() {
        let mut seen = std::collections::HashSet::new();
        for ty in MsgType::iter() {
            assert!(seen.insert(ty.tag()), "duplicate tag for {:?}", ty);
            assert_eq!(MsgType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(MsgType::from_tag(0), None);
        assert_eq!(MsgType::TransData.name(), "trans_data");
        assert!(MsgType::ReadGroup.expects_reply());
        assert!(!MsgType::RespGetTag.expects_reply());
        assert!(!MsgType::TransData.expects_reply());
    }

    #[test]
    fn reply_swaps_sender_and_receiver() {
        let request = Envelope::new(
            "app1",
            "plc1",
            Body::ReadGroup(GroupRef {
                driver: "plc1".into(),
                group: "grp1".into(),
            }),
        )
        .with_ctx(42);
        let reply = request.reply(Body::error(ErrorCode::Success));
        assert_eq!(reply.header.sender, "plc1");
        assert_eq!(reply.header.receiver, "app1");
        assert_eq!(reply.header.ctx, 42);
        assert_eq!(reply.msg_type(), MsgType::RespError);
    }

    #[test]
    fn tag_attribute_contains() {
        assert!(TagAttribute::READ_WRITE.contains(TagAttribute::WRITE));
        assert!(!TagAttribute::READ.contains(TagAttribute::WRITE));
    }
}

//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus envelope model, codec, and in-process transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Binary framing of [`Envelope`]s.
//!
//! A frame is a fixed header followed by a type-indexed body. Every body has a fixed size
//! except [`MsgType::TransData`], which is `base + count * element` bytes with `count` stored
//! as the last field of the base part. Integers are little-endian, strings are zero padded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error_code::ErrorCode;
use crate::types::*;

/// Header layout: type tag, sender, receiver, ctx.
pub const HEADER_LEN: usize = 2 + NODE_NAME_LEN + NODE_NAME_LEN + 8;
const RECEIVER_OFFSET: usize = 2 + NODE_NAME_LEN;

const VALUE_SIZE: usize = 1 + VALUE_STR_LEN;
const TAG_RECORD_SIZE: usize = TAG_NAME_LEN + TAG_ADDRESS_LEN + TAG_DESCRIPTION_LEN + 3;
const TAG_VALUE_SIZE: usize = TAG_NAME_LEN + VALUE_SIZE;
const GROUP_REF_SIZE: usize = NODE_NAME_LEN + GROUP_NAME_LEN;
const GROUP_INFO_SIZE: usize = GROUP_NAME_LEN + 4 + 2;
const NODE_STATE_SIZE: usize = NODE_NAME_LEN + 1 + 1 + 8;

const VALUE_INT: u8 = 1;
const VALUE_FLOAT: u8 = 2;
const VALUE_BOOL: u8 = 3;
const VALUE_STR: u8 = 4;
const VALUE_ERROR: u8 = 5;

/// Errors raised while framing or parsing envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("field {field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("field {field} contains a zero byte")]
    InteriorNul { field: &'static str },
    #[error("{field} carries {len} entries, limit is {max}")]
    TooManyElements {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("frame of {0} bytes is shorter than its fixed part")]
    Truncated(usize),
    #[error("{msg_type} body is {actual} bytes, expected {expected}")]
    LengthMismatch {
        msg_type: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field {field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
    #[error("field {field} holds invalid value {value}")]
    InvalidField { field: &'static str, value: i64 },
    #[error("unknown message type tag {0}")]
    UnknownType(u16),
}

impl CodecError {
    /// Wire code reported to a requester whose message could not be framed.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CodecError::FieldTooLong { .. } | CodecError::TooManyElements { .. } => {
                ErrorCode::PayloadTooLarge
            }
            _ => ErrorCode::Internal,
        }
    }
}

/// Size class of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    Fixed(usize),
    /// `base` bytes whose last two hold the element count, then `count * element` bytes.
    Stream { base: usize, element: usize },
}

/// Body size for every known type.
pub fn body_size(ty: MsgType) -> BodySize {
    let fixed = match ty {
        MsgType::RespError => 4,
        MsgType::NodeInit | MsgType::NodeCtl => NODE_NAME_LEN + 1,
        MsgType::NodeUninit
        | MsgType::RespNodeUninit
        | MsgType::DelNode
        | MsgType::NodeDeleted
        | MsgType::GetNodeSetting
        | MsgType::GetNodeState
        | MsgType::GetGroup => NODE_NAME_LEN,
        MsgType::AddNode => NODE_NAME_LEN + PLUGIN_NAME_LEN,
        MsgType::NodeSetting | MsgType::RespGetNodeSetting => NODE_NAME_LEN + SETTING_LEN,
        MsgType::RespGetNodeState => 1 + 1 + 8,
        MsgType::NodesState => 2 + NODE_LIST_MAX * NODE_STATE_SIZE,
        MsgType::AddGroup | MsgType::UpdateGroup => GROUP_REF_SIZE + 4,
        MsgType::DelGroup | MsgType::ReadGroup => GROUP_REF_SIZE,
        MsgType::RespGetGroup => 2 + GROUP_LIST_MAX * GROUP_INFO_SIZE,
        MsgType::AddTag | MsgType::UpdateTag => GROUP_REF_SIZE + 2 + TAG_BATCH_MAX * TAG_RECORD_SIZE,
        MsgType::DelTag => GROUP_REF_SIZE + 2 + TAG_BATCH_MAX * TAG_NAME_LEN,
        MsgType::RespAddTag | MsgType::RespUpdateTag | MsgType::RespDelTag => 2 + 4,
        MsgType::GetTag => GROUP_REF_SIZE + 2,
        MsgType::RespGetTag => 2 + 2 + TAG_BATCH_MAX * TAG_RECORD_SIZE,
        MsgType::WriteTag => GROUP_REF_SIZE + TAG_NAME_LEN + VALUE_SIZE,
        MsgType::Subscribe | MsgType::Unsubscribe => NODE_NAME_LEN + GROUP_REF_SIZE,
        MsgType::TransData => {
            return BodySize::Stream {
                base: GROUP_REF_SIZE + 2,
                element: TAG_VALUE_SIZE,
            }
        }
    };
    BodySize::Fixed(fixed)
}

/// Exact encoded body length of `body`.
pub fn body_len(body: &Body) -> usize {
    match body_size(body.msg_type()) {
        BodySize::Fixed(size) => size,
        BodySize::Stream { base, element } => match body {
            Body::TransData(data) => base + data.values.len() * element,
            _ => base,
        },
    }
}

impl Envelope {
    /// Frame this envelope.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(&self.header, &self.body)
    }
}

/// Frame a header and body. The type tag is derived from the body variant.
pub fn encode(header: &Header, body: &Body) -> Result<Bytes, CodecError> {
    let ty = body.msg_type();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len(body));
    buf.put_u16_le(ty.tag());
    put_str(&mut buf, "sender", &header.sender, NODE_NAME_LEN)?;
    put_str(&mut buf, "receiver", &header.receiver, NODE_NAME_LEN)?;
    buf.put_u64_le(header.ctx);
    encode_body(&mut buf, body)?;
    debug_assert_eq!(buf.len(), HEADER_LEN + body_len(body));
    Ok(buf.freeze())
}

/// Parse a frame back into an envelope.
///
/// # Panics
///
/// Panics when the type tag is not part of this build's message set. Frames only ever
/// originate from code compiled against the same set, so an unknown tag means a version
/// mismatch and no layout can be assumed for the body.
pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    let (ty, header) = match peek_header(frame) {
        Err(CodecError::UnknownType(tag)) => {
            panic!("unknown message type tag {tag}: frame built against a different message set")
        }
        other => other?,
    };
    let mut body = &frame[HEADER_LEN..];
    let expected = match body_size(ty) {
        BodySize::Fixed(size) => size,
        BodySize::Stream { base, element } => {
            if body.len() < base {
                return Err(CodecError::Truncated(frame.len()));
            }
            let count = u16::from_le_bytes([body[base - 2], body[base - 1]]) as usize;
            base + count * element
        }
    };
    if body.len() != expected {
        return Err(CodecError::LengthMismatch {
            msg_type: ty.name(),
            expected,
            actual: body.len(),
        });
    }
    let body = decode_body(ty, &mut body)?;
    Ok(Envelope { header, body })
}

/// Read the type and header of a frame without touching the body.
///
/// Unlike [`decode`], an unknown tag is reported as [`CodecError::UnknownType`] so a router
/// can drop the frame without interpreting it.
pub fn peek_header(frame: &[u8]) -> Result<(MsgType, Header), CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::Truncated(frame.len()));
    }
    let mut buf = frame;
    let tag = buf.get_u16_le();
    let ty = MsgType::from_tag(tag).ok_or(CodecError::UnknownType(tag))?;
    let sender = get_str(&mut buf, "sender", NODE_NAME_LEN)?;
    let receiver = get_str(&mut buf, "receiver", NODE_NAME_LEN)?;
    let ctx = buf.get_u64_le();
    Ok((
        ty,
        Header {
            sender,
            receiver,
            ctx,
        },
    ))
}

/// Copy of `frame` with the receiver field replaced.
pub fn retarget(frame: &[u8], receiver: &str) -> Result<Bytes, CodecError> {
    if frame.len() < HEADER_LEN {
        return Err(CodecError::Truncated(frame.len()));
    }
    let mut field = BytesMut::with_capacity(NODE_NAME_LEN);
    put_str(&mut field, "receiver", receiver, NODE_NAME_LEN)?;
    let mut out = BytesMut::from(frame);
    out[RECEIVER_OFFSET..RECEIVER_OFFSET + NODE_NAME_LEN].copy_from_slice(&field);
    Ok(out.freeze())
}

fn encode_body(buf: &mut BytesMut, body: &Body) -> Result<(), CodecError> {
    match body {
        Body::RespError(b) => buf.put_i32_le(b.code.code()),
        Body::NodeInit(b) => {
            put_str(buf, "node", &b.node, NODE_NAME_LEN)?;
            buf.put_u8(u8::from(b.auto_start));
        }
        Body::NodeUninit(b)
        | Body::RespNodeUninit(b)
        | Body::DelNode(b)
        | Body::NodeDeleted(b)
        | Body::GetNodeSetting(b)
        | Body::GetNodeState(b)
        | Body::GetGroup(b) => put_str(buf, "node", &b.node, NODE_NAME_LEN)?,
        Body::AddNode(b) => {
            put_str(buf, "node", &b.node, NODE_NAME_LEN)?;
            put_str(buf, "plugin", &b.plugin, PLUGIN_NAME_LEN)?;
        }
        Body::NodeSetting(b) | Body::RespGetNodeSetting(b) => {
            put_str(buf, "node", &b.node, NODE_NAME_LEN)?;
            put_str(buf, "setting", &b.setting, SETTING_LEN)?;
        }
        Body::NodeCtl(b) => {
            put_str(buf, "node", &b.node, NODE_NAME_LEN)?;
            buf.put_u8(b.ctl as u8);
        }
        Body::RespGetNodeState(b) => {
            buf.put_u8(b.running as u8);
            buf.put_u8(b.link as u8);
            buf.put_u64_le(b.rtt_ms);
        }
        Body::NodesState(b) => {
            put_count(buf, "nodes", b.nodes.len(), NODE_LIST_MAX)?;
            for entry in &b.nodes {
                put_str(buf, "node", &entry.node, NODE_NAME_LEN)?;
                buf.put_u8(entry.running as u8);
                buf.put_u8(entry.link as u8);
                buf.put_u64_le(entry.rtt_ms);
            }
            buf.put_bytes(0, (NODE_LIST_MAX - b.nodes.len()) * NODE_STATE_SIZE);
        }
        Body::AddGroup(b) | Body::UpdateGroup(b) => {
            put_group_ref(buf, &b.driver, &b.group)?;
            buf.put_u32_le(b.interval_ms);
        }
        Body::DelGroup(b) | Body::ReadGroup(b) => put_group_ref(buf, &b.driver, &b.group)?,
        Body::RespGetGroup(b) => {
            put_count(buf, "groups", b.groups.len(), GROUP_LIST_MAX)?;
            for group in &b.groups {
                put_str(buf, "group", &group.name, GROUP_NAME_LEN)?;
                buf.put_u32_le(group.interval_ms);
                buf.put_u16_le(group.tag_count);
            }
            buf.put_bytes(0, (GROUP_LIST_MAX - b.groups.len()) * GROUP_INFO_SIZE);
        }
        Body::AddTag(b) | Body::UpdateTag(b) => {
            put_group_ref(buf, &b.driver, &b.group)?;
            put_tags(buf, &b.tags)?;
        }
        Body::DelTag(b) => {
            put_group_ref(buf, &b.driver, &b.group)?;
            put_count(buf, "names", b.names.len(), TAG_BATCH_MAX)?;
            for name in &b.names {
                put_str(buf, "tag", name, TAG_NAME_LEN)?;
            }
            buf.put_bytes(0, (TAG_BATCH_MAX - b.names.len()) * TAG_NAME_LEN);
        }
        Body::RespAddTag(b) | Body::RespUpdateTag(b) | Body::RespDelTag(b) => {
            buf.put_u16_le(b.index);
            buf.put_i32_le(b.code.code());
        }
        Body::GetTag(b) => {
            put_group_ref(buf, &b.driver, &b.group)?;
            buf.put_u16_le(b.offset);
        }
        Body::RespGetTag(b) => {
            buf.put_u16_le(b.total);
            put_tags(buf, &b.tags)?;
        }
        Body::WriteTag(b) => {
            put_group_ref(buf, &b.driver, &b.group)?;
            put_str(buf, "tag", &b.tag, TAG_NAME_LEN)?;
            put_value(buf, &b.value)?;
        }
        Body::TransData(b) => {
            put_group_ref(buf, &b.driver, &b.group)?;
            put_count(buf, "values", b.values.len(), u16::MAX as usize)?;
            for item in &b.values {
                put_str(buf, "tag", &item.tag, TAG_NAME_LEN)?;
                put_value(buf, &item.value)?;
            }
        }
        Body::Subscribe(b) | Body::Unsubscribe(b) => {
            put_str(buf, "app", &b.app, NODE_NAME_LEN)?;
            put_group_ref(buf, &b.driver, &b.group)?;
        }
    }
    Ok(())
}

fn decode_body(ty: MsgType, buf: &mut &[u8]) -> Result<Body, CodecError> {
    let body = match ty {
        MsgType::RespError => Body::RespError(RespError {
            code: get_code(buf)?,
        }),
        MsgType::NodeInit => Body::NodeInit(NodeInit {
            node: get_str(buf, "node", NODE_NAME_LEN)?,
            auto_start: buf.get_u8() != 0,
        }),
        MsgType::NodeUninit => Body::NodeUninit(get_node_ref(buf)?),
        MsgType::RespNodeUninit => Body::RespNodeUninit(get_node_ref(buf)?),
        MsgType::DelNode => Body::DelNode(get_node_ref(buf)?),
        MsgType::NodeDeleted => Body::NodeDeleted(get_node_ref(buf)?),
        MsgType::GetNodeSetting => Body::GetNodeSetting(get_node_ref(buf)?),
        MsgType::GetNodeState => Body::GetNodeState(get_node_ref(buf)?),
        MsgType::GetGroup => Body::GetGroup(get_node_ref(buf)?),
        MsgType::AddNode => Body::AddNode(AddNode {
            node: get_str(buf, "node", NODE_NAME_LEN)?,
            plugin: get_str(buf, "plugin", PLUGIN_NAME_LEN)?,
        }),
        MsgType::NodeSetting => Body::NodeSetting(get_setting(buf)?),
        MsgType::RespGetNodeSetting => Body::RespGetNodeSetting(get_setting(buf)?),
        MsgType::NodeCtl => {
            let node = get_str(buf, "node", NODE_NAME_LEN)?;
            let ctl = match buf.get_u8() {
                0 => NodeCtlKind::Start,
                1 => NodeCtlKind::Stop,
                other => {
                    return Err(CodecError::InvalidField {
                        field: "ctl",
                        value: i64::from(other),
                    })
                }
            };
            Body::NodeCtl(NodeCtl { node, ctl })
        }
        MsgType::RespGetNodeState => Body::RespGetNodeState(NodeStateReport {
            running: get_state(buf)?,
            link: get_link(buf)?,
            rtt_ms: buf.get_u64_le(),
        }),
        MsgType::NodesState => {
            let count = get_count(buf, "nodes", NODE_LIST_MAX)?;
            let mut nodes = Vec::with_capacity(count);
            for _ in 0..count {
                nodes.push(NodeStateEntry {
                    node: get_str(buf, "node", NODE_NAME_LEN)?,
                    running: get_state(buf)?,
                    link: get_link(buf)?,
                    rtt_ms: buf.get_u64_le(),
                });
            }
            buf.advance((NODE_LIST_MAX - count) * NODE_STATE_SIZE);
            Body::NodesState(NodesState { nodes })
        }
        MsgType::AddGroup => Body::AddGroup(get_group_config(buf)?),
        MsgType::UpdateGroup => Body::UpdateGroup(get_group_config(buf)?),
        MsgType::DelGroup => Body::DelGroup(get_group_ref(buf)?),
        MsgType::ReadGroup => Body::ReadGroup(get_group_ref(buf)?),
        MsgType::RespGetGroup => {
            let count = get_count(buf, "groups", GROUP_LIST_MAX)?;
            let mut groups = Vec::with_capacity(count);
            for _ in 0..count {
                groups.push(GroupInfo {
                    name: get_str(buf, "group", GROUP_NAME_LEN)?,
                    interval_ms: buf.get_u32_le(),
                    tag_count: buf.get_u16_le(),
                });
            }
            buf.advance((GROUP_LIST_MAX - count) * GROUP_INFO_SIZE);
            Body::RespGetGroup(GroupList { groups })
        }
        MsgType::AddTag => Body::AddTag(get_tag_batch(buf)?),
        MsgType::UpdateTag => Body::UpdateTag(get_tag_batch(buf)?),
        MsgType::DelTag => {
            let GroupRef { driver, group } = get_group_ref(buf)?;
            let count = get_count(buf, "names", TAG_BATCH_MAX)?;
            let mut names = Vec::with_capacity(count);
            for _ in 0..count {
                names.push(get_str(buf, "tag", TAG_NAME_LEN)?);
            }
            buf.advance((TAG_BATCH_MAX - count) * TAG_NAME_LEN);
            Body::DelTag(TagNames {
                driver,
                group,
                names,
            })
        }
        MsgType::RespAddTag => Body::RespAddTag(get_batch_result(buf)?),
        MsgType::RespUpdateTag => Body::RespUpdateTag(get_batch_result(buf)?),
        MsgType::RespDelTag => Body::RespDelTag(get_batch_result(buf)?),
        MsgType::GetTag => {
            let GroupRef { driver, group } = get_group_ref(buf)?;
            Body::GetTag(GetTag {
                driver,
                group,
                offset: buf.get_u16_le(),
            })
        }
        MsgType::RespGetTag => {
            let total = buf.get_u16_le();
            Body::RespGetTag(TagPage {
                total,
                tags: get_tags(buf)?,
            })
        }
        MsgType::WriteTag => {
            let GroupRef { driver, group } = get_group_ref(buf)?;
            Body::WriteTag(WriteTag {
                driver,
                group,
                tag: get_str(buf, "tag", TAG_NAME_LEN)?,
                value: get_value(buf)?,
            })
        }
        MsgType::TransData => {
            let GroupRef { driver, group } = get_group_ref(buf)?;
            let count = buf.get_u16_le() as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(TagValue {
                    tag: get_str(buf, "tag", TAG_NAME_LEN)?,
                    value: get_value(buf)?,
                });
            }
            Body::TransData(TransData {
                driver,
                group,
                values,
            })
        }
        MsgType::Subscribe => Body::Subscribe(get_subscription(buf)?),
        MsgType::Unsubscribe => Body::Unsubscribe(get_subscription(buf)?),
    };
    Ok(body)
}

fn put_str(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
    width: usize,
) -> Result<(), CodecError> {
    let raw = value.as_bytes();
    if raw.len() >= width {
        return Err(CodecError::FieldTooLong {
            field,
            len: raw.len(),
            max: width - 1,
        });
    }
    if raw.contains(&0) {
        return Err(CodecError::InteriorNul { field });
    }
    buf.put_slice(raw);
    buf.put_bytes(0, width - raw.len());
    Ok(())
}

fn put_count(
    buf: &mut BytesMut,
    field: &'static str,
    len: usize,
    max: usize,
) -> Result<(), CodecError> {
    if len > max {
        return Err(CodecError::TooManyElements { field, len, max });
    }
    buf.put_u16_le(len as u16);
    Ok(())
}

fn put_group_ref(buf: &mut BytesMut, driver: &str, group: &str) -> Result<(), CodecError> {
    put_str(buf, "driver", driver, NODE_NAME_LEN)?;
    put_str(buf, "group", group, GROUP_NAME_LEN)
}

fn put_tags(buf: &mut BytesMut, tags: &[Tag]) -> Result<(), CodecError> {
    put_count(buf, "tags", tags.len(), TAG_BATCH_MAX)?;
    for tag in tags {
        put_str(buf, "tag", &tag.name, TAG_NAME_LEN)?;
        put_str(buf, "address", &tag.address, TAG_ADDRESS_LEN)?;
        put_str(buf, "description", &tag.description, TAG_DESCRIPTION_LEN)?;
        buf.put_u8(tag.data_type as u8);
        buf.put_u8(tag.attribute.0);
        buf.put_u8(tag.precision);
    }
    buf.put_bytes(0, (TAG_BATCH_MAX - tags.len()) * TAG_RECORD_SIZE);
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Int(v) => {
            buf.put_u8(VALUE_INT);
            buf.put_i64_le(*v);
            buf.put_bytes(0, VALUE_STR_LEN - 8);
        }
        Value::Float(v) => {
            buf.put_u8(VALUE_FLOAT);
            buf.put_f64_le(*v);
            buf.put_bytes(0, VALUE_STR_LEN - 8);
        }
        Value::Bool(v) => {
            buf.put_u8(VALUE_BOOL);
            buf.put_u8(u8::from(*v));
            buf.put_bytes(0, VALUE_STR_LEN - 1);
        }
        Value::Str(v) => {
            buf.put_u8(VALUE_STR);
            put_str(buf, "value", v, VALUE_STR_LEN)?;
        }
        Value::Error(code) => {
            buf.put_u8(VALUE_ERROR);
            buf.put_i32_le(code.code());
            buf.put_bytes(0, VALUE_STR_LEN - 4);
        }
    }
    Ok(())
}

fn get_str(buf: &mut &[u8], field: &'static str, width: usize) -> Result<String, CodecError> {
    let raw = &buf[..width];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
    let value = std::str::from_utf8(&raw[..end])
        .map_err(|_| CodecError::InvalidUtf8 { field })?
        .to_owned();
    buf.advance(width);
    Ok(value)
}

fn get_count(buf: &mut &[u8], field: &'static str, max: usize) -> Result<usize, CodecError> {
    let len = buf.get_u16_le() as usize;
    if len > max {
        return Err(CodecError::TooManyElements { field, len, max });
    }
    Ok(len)
}

fn get_code(buf: &mut &[u8]) -> Result<ErrorCode, CodecError> {
    let raw = buf.get_i32_le();
    ErrorCode::from_code(raw).ok_or(CodecError::InvalidField {
        field: "code",
        value: i64::from(raw),
    })
}

fn get_state(buf: &mut &[u8]) -> Result<AdapterState, CodecError> {
    let raw = buf.get_u8();
    AdapterState::from_u8(raw).ok_or(CodecError::InvalidField {
        field: "running",
        value: i64::from(raw),
    })
}

fn get_link(buf: &mut &[u8]) -> Result<LinkState, CodecError> {
    let raw = buf.get_u8();
    LinkState::from_u8(raw).ok_or(CodecError::InvalidField {
        field: "link",
        value: i64::from(raw),
    })
}

fn get_node_ref(buf: &mut &[u8]) -> Result<NodeRef, CodecError> {
    Ok(NodeRef {
        node: get_str(buf, "node", NODE_NAME_LEN)?,
    })
}

fn get_setting(buf: &mut &[u8]) -> Result<NodeSetting, CodecError> {
    Ok(NodeSetting {
        node: get_str(buf, "node", NODE_NAME_LEN)?,
        setting: get_str(buf, "setting", SETTING_LEN)?,
    })
}

fn get_group_ref(buf: &mut &[u8]) -> Result<GroupRef, CodecError> {
    Ok(GroupRef {
        driver: get_str(buf, "driver", NODE_NAME_LEN)?,
        group: get_str(buf, "group", GROUP_NAME_LEN)?,
    })
}

fn get_group_config(buf: &mut &[u8]) -> Result<GroupConfig, CodecError> {
    let GroupRef { driver, group } = get_group_ref(buf)?;
    Ok(GroupConfig {
        driver,
        group,
        interval_ms: buf.get_u32_le(),
    })
}

fn get_tags(buf: &mut &[u8]) -> Result<Vec<Tag>, CodecError> {
    let count = get_count(buf, "tags", TAG_BATCH_MAX)?;
    let mut tags = Vec::with_capacity(count);
    for _ in 0..count {
        let name = get_str(buf, "tag", TAG_NAME_LEN)?;
        let address = get_str(buf, "address", TAG_ADDRESS_LEN)?;
        let description = get_str(buf, "description", TAG_DESCRIPTION_LEN)?;
        let raw_type = buf.get_u8();
        let data_type = DataType::from_repr(raw_type).ok_or(CodecError::InvalidField {
            field: "type",
            value: i64::from(raw_type),
        })?;
        tags.push(Tag {
            name,
            address,
            description,
            data_type,
            attribute: TagAttribute(buf.get_u8()),
            precision: buf.get_u8(),
        });
    }
    buf.advance((TAG_BATCH_MAX - count) * TAG_RECORD_SIZE);
    Ok(tags)
}

fn get_tag_batch(buf: &mut &[u8]) -> Result<TagBatch, CodecError> {
    let GroupRef { driver, group } = get_group_ref(buf)?;
    Ok(TagBatch {
        driver,
        group,
        tags: get_tags(buf)?,
    })
}

fn get_batch_result(buf: &mut &[u8]) -> Result<BatchResult, CodecError> {
    Ok(BatchResult {
        index: buf.get_u16_le(),
        code: get_code(buf)?,
    })
}

fn get_value(buf: &mut &[u8]) -> Result<Value, CodecError> {
    let kind = buf.get_u8();
    let mut payload = &buf[..VALUE_STR_LEN];
    let value = match kind {
        VALUE_INT => Value::Int(payload.get_i64_le()),
        VALUE_FLOAT => Value::Float(payload.get_f64_le()),
        VALUE_BOOL => Value::Bool(payload.get_u8() != 0),
        VALUE_STR => Value::Str(get_str(&mut payload, "value", VALUE_STR_LEN)?),
        VALUE_ERROR => Value::Error(get_code(&mut payload)?),
        other => {
            return Err(CodecError::InvalidField {
                field: "value",
                value: i64::from(other),
            })
        }
    };
    buf.advance(VALUE_STR_LEN);
    Ok(value)
}

fn get_subscription(buf: &mut &[u8]) -> Result<Subscription, CodecError> {
    let app = get_str(buf, "app", NODE_NAME_LEN)?;
    let GroupRef { driver, group } = get_group_ref(buf)?;
    Ok(Subscription { app, driver, group })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    fn group_ref() -> GroupRef {
        GroupRef {
            driver: "plc1".into(),
            group: "grp1".into(),
        }
    }

    fn sample_tag(name: &str) -> Tag {
        Tag {
            description: "boiler pressure".into(),
            precision: 2,
            ..Tag::new(name, "1!400001", DataType::Uint16, TagAttribute::READ_WRITE)
        }
    }

    fn node(name: &str) -> NodeRef {
        NodeRef { node: name.into() }
    }

    fn one_of_each() -> Vec<Body> {
        let batch = BatchResult {
            index: 3,
            code: ErrorCode::TagExist,
        };
        let subscription = Subscription {
            app: "north".into(),
            driver: "plc1".into(),
            group: "grp1".into(),
        };
        let setting = NodeSetting {
            node: "plc1".into(),
            setting: r#"{"host":"10.0.0.7","port":502,"timeout":3000}"#.into(),
        };
        vec![
            Body::error(ErrorCode::NodeNotReady),
            Body::NodeInit(NodeInit {
                node: "plc1".into(),
                auto_start: true,
            }),
            Body::NodeUninit(node("plc1")),
            Body::RespNodeUninit(node("plc1")),
            Body::AddNode(AddNode {
                node: "plc2".into(),
                plugin: "modbus-tcp".into(),
            }),
            Body::DelNode(node("plc2")),
            Body::NodeDeleted(node("plc2")),
            Body::NodeSetting(setting.clone()),
            Body::GetNodeSetting(node("plc1")),
            Body::RespGetNodeSetting(setting),
            Body::NodeCtl(NodeCtl {
                node: "plc1".into(),
                ctl: NodeCtlKind::Stop,
            }),
            Body::GetNodeState(node("plc1")),
            Body::RespGetNodeState(NodeStateReport {
                running: AdapterState::Running,
                link: LinkState::Connected,
                rtt_ms: 17,
            }),
            Body::NodesState(NodesState {
                nodes: vec![NodeStateEntry {
                    node: "plc1".into(),
                    running: AdapterState::Stopped,
                    link: LinkState::Disconnected,
                    rtt_ms: 9999,
                }],
            }),
            Body::AddGroup(GroupConfig {
                driver: "plc1".into(),
                group: "grp1".into(),
                interval_ms: 200,
            }),
            Body::UpdateGroup(GroupConfig {
                driver: "plc1".into(),
                group: "grp1".into(),
                interval_ms: 500,
            }),
            Body::DelGroup(group_ref()),
            Body::GetGroup(node("plc1")),
            Body::RespGetGroup(GroupList {
                groups: vec![GroupInfo {
                    name: "grp1".into(),
                    interval_ms: 200,
                    tag_count: 4,
                }],
            }),
            Body::AddTag(TagBatch {
                driver: "plc1".into(),
                group: "grp1".into(),
                tags: vec![sample_tag("pressure"), sample_tag("flow")],
            }),
            Body::RespAddTag(batch),
            Body::UpdateTag(TagBatch {
                driver: "plc1".into(),
                group: "grp1".into(),
                tags: vec![sample_tag("pressure")],
            }),
            Body::RespUpdateTag(batch),
            Body::DelTag(TagNames {
                driver: "plc1".into(),
                group: "grp1".into(),
                names: vec!["pressure".into()],
            }),
            Body::RespDelTag(batch),
            Body::GetTag(GetTag {
                driver: "plc1".into(),
                group: "grp1".into(),
                offset: 16,
            }),
            Body::RespGetTag(TagPage {
                total: 40,
                tags: vec![sample_tag("flow")],
            }),
            Body::ReadGroup(group_ref()),
            Body::WriteTag(WriteTag {
                driver: "plc1".into(),
                group: "grp1".into(),
                tag: "setpoint".into(),
                value: Value::Float(21.5),
            }),
            Body::TransData(TransData {
                driver: "plc1".into(),
                group: "grp1".into(),
                values: vec![TagValue {
                    tag: "pressure".into(),
                    value: Value::Int(-12),
                }],
            }),
            Body::Subscribe(subscription.clone()),
            Body::Unsubscribe(subscription),
        ]
    }

    #[test]
    fn every_type_round_trips() {
        let bodies = one_of_each();
        let covered: HashSet<MsgType> = bodies.iter().map(Body::msg_type).collect();
        for ty in MsgType::iter() {
            assert!(covered.contains(&ty), "no sample for {:?}", ty);
        }

        for body in bodies {
            let header = Header {
                sender: "app1".into(),
                receiver: "plc1".into(),
                ctx: 7,
            };
            let frame = encode(&header, &body).expect("encode");
            assert_eq!(frame.len(), HEADER_LEN + body_len(&body));
            if let BodySize::Fixed(size) = body_size(body.msg_type()) {
                assert_eq!(frame.len(), HEADER_LEN + size);
            }
            let decoded = decode(&frame).expect("decode");
            assert_eq!(decoded.header, header);
            assert_eq!(decoded.body, body);
        }
    }

    #[test]
    fn stream_size_follows_element_count() {
        let values: Vec<TagValue> = (0..5)
            .map(|i| TagValue {
                tag: format!("t{i}"),
                value: if i % 2 == 0 {
                    Value::Str(format!("v{i}"))
                } else {
                    Value::Error(ErrorCode::FileNotExist)
                },
            })
            .collect();
        let env = Envelope::new(
            "plc1",
            MANAGER_NODE,
            Body::TransData(TransData {
                driver: "plc1".into(),
                group: "grp1".into(),
                values: values.clone(),
            }),
        );
        let frame = env.encode().expect("encode");
        let BodySize::Stream { base, element } = body_size(MsgType::TransData) else {
            panic!("trans data must be a stream type");
        };
        assert_eq!(frame.len(), HEADER_LEN + base + 5 * element);

        let decoded = decode(&frame).expect("decode");
        match decoded.body {
            Body::TransData(data) => assert_eq!(data.values, values),
            other => panic!("unexpected body {:?}", other),
        }

        let empty = Envelope::new(
            "plc1",
            MANAGER_NODE,
            Body::TransData(TransData {
                driver: "plc1".into(),
                group: "grp1".into(),
                values: Vec::new(),
            }),
        )
        .encode()
        .expect("encode");
        assert_eq!(empty.len(), HEADER_LEN + base);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let frame = Envelope::new(
            "plc1",
            MANAGER_NODE,
            Body::TransData(TransData {
                driver: "plc1".into(),
                group: "grp1".into(),
                values: vec![TagValue {
                    tag: "a".into(),
                    value: Value::Bool(true),
                }],
            }),
        )
        .encode()
        .expect("encode");
        let err = decode(&frame[..frame.len() - 1]).expect_err("short frame");
        assert!(matches!(err, CodecError::LengthMismatch { .. }));
    }

    #[test]
    #[should_panic(expected = "unknown message type tag")]
    fn unknown_type_tag_is_fatal() {
        let mut frame = Envelope::new("a", "b", Body::GetGroup(node("b")))
            .encode()
            .expect("encode")
            .to_vec();
        frame[0] = 0xff;
        frame[1] = 0xff;
        let _ = decode(&frame);
    }

    #[test]
    fn peek_reports_unknown_type_without_panicking() {
        let mut frame = Envelope::new("a", "b", Body::GetGroup(node("b")))
            .encode()
            .expect("encode")
            .to_vec();
        frame[0] = 0xff;
        frame[1] = 0xff;
        assert_eq!(peek_header(&frame), Err(CodecError::UnknownType(0xffff)));
    }

    #[test]
    fn oversized_fields_are_validation_errors() {
        let long = "x".repeat(NODE_NAME_LEN);
        let err = Envelope::new(long, "b", Body::GetGroup(node("b")))
            .encode()
            .expect_err("name too long");
        assert_eq!(err.error_code(), ErrorCode::PayloadTooLarge);

        let tags = (0..=TAG_BATCH_MAX)
            .map(|i| sample_tag(&format!("t{i}")))
            .collect();
        let err = Envelope::new(
            "a",
            "plc1",
            Body::AddTag(TagBatch {
                driver: "plc1".into(),
                group: "grp1".into(),
                tags,
            }),
        )
        .encode()
        .expect_err("batch too large");
        assert!(matches!(err, CodecError::TooManyElements { field: "tags", .. }));
    }

    #[test]
    fn retarget_rewrites_only_the_receiver() {
        let env = Envelope::new("plc1", MANAGER_NODE, Body::ReadGroup(group_ref())).with_ctx(9);
        let frame = env.encode().expect("encode");
        let moved = retarget(&frame, "north").expect("retarget");
        let (ty, header) = peek_header(&moved).expect("peek");
        assert_eq!(ty, MsgType::ReadGroup);
        assert_eq!(header.sender, "plc1");
        assert_eq!(header.receiver, "north");
        assert_eq!(header.ctx, 9);
        assert_eq!(&moved[HEADER_LEN..], &frame[HEADER_LEN..]);
    }
}

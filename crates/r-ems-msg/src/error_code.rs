//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus envelope model, codec, and in-process transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Typed outcome codes carried in error and batch-result envelopes.
///
/// The numeric values are part of the wire format and must stay stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error, strum::FromRepr,
)]
#[repr(i32)]
pub enum ErrorCode {
    /// Request completed successfully.
    #[error("success")]
    Success = 0,
    /// Unexpected internal failure.
    #[error("internal error")]
    Internal = 1001,
    /// A string or batch exceeded the fixed wire capacity.
    #[error("payload too large")]
    PayloadTooLarge = 1002,
    /// The request did not complete within its deadline.
    #[error("request timed out")]
    RequestTimeout = 1003,
    /// The request could not be delivered on the bus.
    #[error("bus send failure")]
    BusSendFailure = 1004,
    /// The message type is not accepted by the receiving node.
    #[error("request not supported")]
    RequestNotSupported = 1005,

    /// A node with the same name already exists.
    #[error("node already exists")]
    NodeExist = 2001,
    /// The addressed node does not exist.
    #[error("node does not exist")]
    NodeNotExist = 2002,
    /// The plugin rejected the supplied setting.
    #[error("node setting invalid")]
    NodeSettingInvalid = 2003,
    /// No setting has been applied to the node yet.
    #[error("node setting not found")]
    NodeSettingNotFound = 2004,
    /// The node has not been configured and cannot start.
    #[error("node not ready")]
    NodeNotReady = 2005,
    /// The node is already running.
    #[error("node is running")]
    NodeIsRunning = 2006,
    /// The node has never been started.
    #[error("node not running")]
    NodeNotRunning = 2007,
    /// The node is already stopped.
    #[error("node is stopped")]
    NodeIsStopped = 2008,
    /// System nodes cannot be removed.
    #[error("node not allowed to be deleted")]
    NodeNotAllowDelete = 2009,
    /// The node name is empty or reserved.
    #[error("node name invalid")]
    NodeNameInvalid = 2010,
    /// The plugin reported a start or stop failure.
    #[error("node control failed")]
    NodeCtlFailure = 2011,

    /// A group with the same name already exists.
    #[error("group already exists")]
    GroupExist = 2101,
    /// The addressed group does not exist.
    #[error("group does not exist")]
    GroupNotExist = 2102,
    /// The group parameters are out of range.
    #[error("group parameter invalid")]
    GroupParameterInvalid = 2103,
    /// Group operations are not allowed on this node type.
    #[error("group operation not allowed")]
    GroupNotAllow = 2104,

    /// A tag with the same name already exists in the group.
    #[error("tag already exists")]
    TagExist = 2201,
    /// The addressed tag does not exist.
    #[error("tag does not exist")]
    TagNotExist = 2202,
    /// The tag attribute is not supported by the plugin.
    #[error("tag attribute not supported")]
    TagAttributeNotSupport = 2203,
    /// The tag data type is not supported by the plugin.
    #[error("tag type not supported")]
    TagTypeNotSupport = 2204,
    /// The tag address cannot be parsed by the plugin.
    #[error("tag address format invalid")]
    TagAddressFormatInvalid = 2205,
    /// The tag name is empty.
    #[error("tag name invalid")]
    TagNameInvalid = 2206,
    /// The written value does not fit the tag type.
    #[error("tag value invalid")]
    TagValueInvalid = 2207,

    /// The plugin module is not present in the catalog.
    #[error("plugin not found")]
    PluginNotFound = 2301,
    /// The plugin failed to write to the device.
    #[error("plugin write failure")]
    PluginWriteFailure = 2302,
    /// The plugin is not connected to its device.
    #[error("plugin disconnected")]
    PluginDisconnected = 2303,
    /// The module only runs as its built-in instance.
    #[error("plugin does not allow new instances")]
    PluginNotAllowInstance = 2304,

    /// The file behind a tag does not exist.
    #[error("file does not exist")]
    FileNotExist = 2401,
    /// The file behind a tag could not be opened.
    #[error("file open failure")]
    FileOpenFailure = 2402,
    /// The file behind a tag could not be read.
    #[error("file read failure")]
    FileReadFailure = 2403,
    /// The file behind a tag exceeds the configured length.
    #[error("file too long")]
    FileTooLong = 2404,
}

impl ErrorCode {
    /// Numeric wire value.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Resolve a numeric wire value.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::from_repr(code)
    }

    /// Whether the code reports success.
    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Convert a success code into `Ok(())` and everything else into `Err(self)`.
    pub fn into_result(self) -> Result<(), ErrorCode> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<Result<(), ErrorCode>> for ErrorCode {
    fn from(result: Result<(), ErrorCode>) -> Self {
        match result {
            Ok(()) => ErrorCode::Success,
            Err(code) => code,
        }
    }
}

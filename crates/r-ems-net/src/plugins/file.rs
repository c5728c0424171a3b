//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Built-in protocol plugins and the static plugin catalog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! `file` driver: every tag is a file path whose content is read as a string.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::Path;

use r_ems_adapter::metrics::{RECV_BYTES, SEND_BYTES};
use r_ems_adapter::{AdapterCallbacks, DriverPlugin, Plugin, PluginError, PluginResult, PollContext};
use r_ems_msg::{DataType, ErrorCode, LinkState, Tag, TagAttribute, Value, VALUE_STR_LEN};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FileSetting {
    /// Longest file content accepted, in bytes.
    pub file_length: usize,
}

#[derive(Debug, Default)]
pub struct FileDriver {
    setting: Option<FileSetting>,
}

impl FileDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn file_length(&self) -> usize {
        self.setting.map(|s| s.file_length).unwrap_or(VALUE_STR_LEN - 1)
    }

    fn read_tag(&self, tag: &Tag) -> Value {
        if tag.attribute.contains(TagAttribute::WRITE) {
            return Value::Error(ErrorCode::TagAttributeNotSupport);
        }
        let path = Path::new(&tag.address);
        if !path.exists() {
            return Value::Error(ErrorCode::FileNotExist);
        }
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %tag.address, error = %err, "file open failed");
                return Value::Error(ErrorCode::FileOpenFailure);
            }
        };
        let limit = self.file_length();
        let mut content = Vec::with_capacity(limit + 1);
        // One byte past the limit tells an oversized file apart from an exact fit.
        match file.by_ref().take(limit as u64 + 1).read_to_end(&mut content) {
            Ok(0) => Value::Error(ErrorCode::FileReadFailure),
            Ok(read) if read > limit => Value::Error(ErrorCode::FileTooLong),
            Ok(_) => Value::Str(String::from_utf8_lossy(&content).into_owned()),
            Err(err) => {
                warn!(path = %tag.address, error = %err, "file read failed");
                Value::Error(ErrorCode::FileReadFailure)
            }
        }
    }
}

impl Plugin for FileDriver {
    fn start(&mut self, cb: &AdapterCallbacks) -> PluginResult<()> {
        cb.set_link(LinkState::Connected);
        Ok(())
    }

    fn stop(&mut self, cb: &AdapterCallbacks) -> PluginResult<()> {
        cb.set_link(LinkState::Disconnected);
        Ok(())
    }

    fn apply_setting(&mut self, _cb: &AdapterCallbacks, setting: &str) -> PluginResult<()> {
        let parsed: FileSetting = serde_json::from_str(setting).map_err(|err| {
            PluginError::new(ErrorCode::NodeSettingInvalid, format!("file setting: {err}"))
        })?;
        if parsed.file_length == 0 || parsed.file_length >= VALUE_STR_LEN {
            return Err(PluginError::new(
                ErrorCode::NodeSettingInvalid,
                format!("file_length must be between 1 and {}", VALUE_STR_LEN - 1),
            ));
        }
        info!(file_length = parsed.file_length, "file setting applied");
        self.setting = Some(parsed);
        Ok(())
    }

    fn as_driver(&mut self) -> Option<&mut dyn DriverPlugin> {
        Some(self)
    }
}

impl DriverPlugin for FileDriver {
    fn validate_tag(&mut self, tag: &Tag) -> Result<(), ErrorCode> {
        if tag.data_type != DataType::String {
            return Err(ErrorCode::TagTypeNotSupport);
        }
        if tag.address.is_empty() {
            return Err(ErrorCode::TagAddressFormatInvalid);
        }
        Ok(())
    }

    fn poll_group(&mut self, cb: &AdapterCallbacks, ctx: &mut PollContext<'_>) -> PluginResult<()> {
        let mut received = 0;
        for (name, tag) in ctx.tags() {
            let value = self.read_tag(tag);
            if let Value::Str(content) = &value {
                received += content.len() as u64;
            }
            ctx.set_value(name, value);
        }
        cb.update_metric(RECV_BYTES, received);
        Ok(())
    }

    fn write_tag(&mut self, cb: &AdapterCallbacks, tag: &Tag, value: &Value) -> Result<(), ErrorCode> {
        let Value::Str(content) = value else {
            return Err(ErrorCode::TagValueInvalid);
        };
        if content.len() > self.file_length() {
            return Err(ErrorCode::FileTooLong);
        }
        match fs::write(&tag.address, content) {
            Ok(()) => {
                cb.update_metric(SEND_BYTES, content.len() as u64);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ErrorCode::FileNotExist),
            Err(err) => {
                warn!(path = %tag.address, error = %err, "file write failed");
                Err(ErrorCode::PluginWriteFailure)
            }
        }
    }
}

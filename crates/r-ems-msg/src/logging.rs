//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus envelope model, codec, and in-process transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tracing::debug;

use crate::types::{Header, MsgType};

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope queued on the bus.
    Outbound,
    /// Envelope taken off the bus and decoded.
    Inbound,
    /// Frame relayed by the manager without decoding the body.
    Forwarded,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, msg_type: MsgType, header: &Header) {
    debug!(
        msg_type = msg_type.name(),
        sender = %header.sender,
        receiver = %header.receiver,
        ctx = header.ctx,
        direction = ?direction,
        "messaging activity"
    );
}

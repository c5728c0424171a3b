//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus envelope model, codec, and in-process transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
pub mod codec;
pub mod error_code;
pub mod logging;
pub mod transport;
pub mod types;

use std::time::Duration;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures on the bus send path.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The envelope could not be framed.
    #[error("codec error: {0}")]
    Codec(#[from] codec::CodecError),
    /// The receiving queue stayed full past the deadline.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    /// The receiving queue is full.
    #[error("queue full")]
    QueueFull,
    /// The receiving side is gone.
    #[error("endpoint closed")]
    Closed,
}

impl MessagingError {
    /// Wire code reported to a requester whose message was lost here.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MessagingError::Codec(err) => err.error_code(),
            _ => ErrorCode::BusSendFailure,
        }
    }
}

pub use codec::{decode, encode, peek_header, retarget, CodecError, HEADER_LEN};
pub use error_code::ErrorCode;
pub use logging::{log_message, MessageDirection};
pub use transport::{
    AdapterSocket, Bus, BusConfig, BusCounters, Endpoint, EndpointId, Frame, MessagingMetrics,
    Uplink,
};
pub use types::*;

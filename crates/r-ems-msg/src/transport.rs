//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus envelope model, codec, and in-process transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-process bus between the manager and the adapter tasks.
//!
//! Every adapter owns one [`AdapterSocket`]: a private inbox fed by the manager's
//! [`Endpoint`] and an [`Uplink`] into the manager's shared queue. All queues are bounded and
//! every send either completes within [`BusConfig::send_timeout`] or fails; a failed send is
//! counted as dropped and never retried here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::logging::{log_message, MessageDirection};
use crate::types::Envelope;
use crate::{MessagingError, Result};

/// Bus-local identity of a dialed endpoint, stable for the lifetime of the socket.
pub type EndpointId = u64;

/// Frame travelling towards the manager, tagged with the endpoint it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: EndpointId,
    pub bytes: Bytes,
}

/// Queue sizing and send deadline shared by every endpoint of a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub capacity: usize,
    pub send_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            send_timeout: Duration::from_millis(1000),
        }
    }
}

/// Snapshot of bus activity used by the metrics endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessagingMetrics {
    /// Frames accepted by a queue.
    pub sent: u64,
    /// Frames taken off the manager queue.
    pub received: u64,
    /// Frames lost to a full or closed queue.
    pub dropped: u64,
}

/// Shared bus counters.
#[derive(Debug, Default)]
pub struct BusCounters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl BusCounters {
    pub fn snapshot(&self) -> MessagingMetrics {
        MessagingMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record<T, E>(&self, outcome: &std::result::Result<T, E>) {
        let counter = if outcome.is_ok() {
            &self.sent
        } else {
            &self.dropped
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Manager side of the bus: owns the shared uplink queue and hands out sockets.
pub struct Bus {
    uplink_tx: mpsc::Sender<Frame>,
    uplink_rx: mpsc::Receiver<Frame>,
    next_id: EndpointId,
    config: BusConfig,
    counters: Arc<BusCounters>,
}

impl Bus {
    pub fn new(config: BusConfig) -> Self {
        let (uplink_tx, uplink_rx) = mpsc::channel(config.capacity.max(1));
        Self {
            uplink_tx,
            uplink_rx,
            next_id: 1,
            config,
            counters: Arc::new(BusCounters::default()),
        }
    }

    pub fn config(&self) -> BusConfig {
        self.config
    }

    pub fn counters(&self) -> Arc<BusCounters> {
        Arc::clone(&self.counters)
    }

    /// Create a connected pair: the manager keeps the [`Endpoint`], the adapter the socket.
    pub fn dial(&mut self) -> (Endpoint, AdapterSocket) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, inbox) = mpsc::channel(self.config.capacity.max(1));
        let endpoint = Endpoint {
            id,
            tx,
            config: self.config,
            counters: Arc::clone(&self.counters),
        };
        let socket = AdapterSocket {
            id,
            inbox,
            uplink: Uplink {
                from: id,
                tx: self.uplink_tx.clone(),
                config: self.config,
                counters: Arc::clone(&self.counters),
            },
        };
        (endpoint, socket)
    }

    /// Next frame sent by any adapter.
    pub async fn recv(&mut self) -> Option<Frame> {
        let frame = self.uplink_rx.recv().await;
        if frame.is_some() {
            self.counters.received.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }
}

/// Manager handle on one adapter inbox.
#[derive(Debug, Clone)]
pub struct Endpoint {
    id: EndpointId,
    tx: mpsc::Sender<Bytes>,
    config: BusConfig,
    counters: Arc<BusCounters>,
}

impl Endpoint {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Whether the adapter side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a frame, waiting at most the configured send timeout.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        let outcome = bounded_send(&self.tx, frame, self.config.send_timeout).await;
        self.counters.record(&outcome);
        if let Err(err) = &outcome {
            warn!(endpoint = self.id, error = %err, "frame to adapter dropped");
        }
        outcome
    }

    /// Encode, log and queue an envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        log_message(MessageDirection::Outbound, envelope.msg_type(), &envelope.header);
        self.send(frame).await
    }
}

/// Adapter side of the bus.
#[derive(Debug)]
pub struct AdapterSocket {
    id: EndpointId,
    inbox: mpsc::Receiver<Bytes>,
    uplink: Uplink,
}

impl AdapterSocket {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Next frame addressed to this adapter, `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbox.recv().await
    }

    /// Stop accepting frames. Frames already queued are discarded with the socket.
    pub fn close(&mut self) {
        self.inbox.close();
    }

    pub fn uplink(&self) -> Uplink {
        self.uplink.clone()
    }
}

/// Sending half towards the manager, cloneable into plugin callbacks.
#[derive(Debug, Clone)]
pub struct Uplink {
    from: EndpointId,
    tx: mpsc::Sender<Frame>,
    config: BusConfig,
    counters: Arc<BusCounters>,
}

impl Uplink {
    /// Queue a frame, waiting at most the configured send timeout.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        let frame = Frame {
            from: self.from,
            bytes,
        };
        let outcome = bounded_send(&self.tx, frame, self.config.send_timeout).await;
        self.counters.record(&outcome);
        if let Err(err) = &outcome {
            warn!(endpoint = self.from, error = %err, "frame to manager dropped");
        }
        outcome
    }

    /// Queue a frame without waiting; a full queue is reported immediately.
    pub fn try_send(&self, bytes: Bytes) -> Result<()> {
        let frame = Frame {
            from: self.from,
            bytes,
        };
        let outcome = self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => MessagingError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MessagingError::Closed,
        });
        self.counters.record(&outcome);
        if let Err(err) = &outcome {
            warn!(endpoint = self.from, error = %err, "frame to manager dropped");
        }
        outcome
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        log_message(MessageDirection::Outbound, envelope.msg_type(), &envelope.header);
        self.send(frame).await
    }

    pub fn try_send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.encode()?;
        log_message(MessageDirection::Outbound, envelope.msg_type(), &envelope.header);
        self.try_send(frame)
    }
}

async fn bounded_send<T>(tx: &mpsc::Sender<T>, item: T, deadline: Duration) -> Result<()> {
    match tokio::time::timeout(deadline, tx.send(item)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(MessagingError::Closed),
        Err(_) => Err(MessagingError::SendTimeout(deadline)),
    }
}

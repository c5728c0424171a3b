//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::persister::{GroupRecord, NodeRecord, NoopPersister, PersistOp, Persister};
use crate::Result;
use r_ems_msg::AdapterState;

/// Default depth of the write queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Cloneable handle used by the manager and adapters.
///
/// Writes are queued without waiting and applied in order by a dedicated thread; a full
/// queue or a failing write is logged and otherwise ignored. Loads go straight to the
/// persister.
#[derive(Clone)]
pub struct PersistenceBridge {
    persister: Arc<dyn Persister>,
    tx: Option<mpsc::Sender<PersistOp>>,
}

/// Owner of the writer thread.
pub struct PersistenceWriter {
    handle: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Wait for the thread to drain its queue. Returns once every bridge clone is dropped.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("persistence writer thread panicked");
        }
    }
}

impl PersistenceBridge {
    /// Bridge that stores nothing and spawns no thread.
    pub fn disabled() -> Self {
        Self {
            persister: Arc::new(NoopPersister),
            tx: None,
        }
    }

    /// Start the writer thread for `persister`.
    pub fn spawn(
        persister: Arc<dyn Persister>,
        depth: usize,
    ) -> std::io::Result<(Self, PersistenceWriter)> {
        let (tx, mut rx) = mpsc::channel::<PersistOp>(depth.max(1));
        let writer_persister = Arc::clone(&persister);
        let handle = std::thread::Builder::new()
            .name("r-ems-persist".into())
            .spawn(move || {
                while let Some(op) = rx.blocking_recv() {
                    match op.apply(writer_persister.as_ref()) {
                        Ok(()) => debug!(node = op.node(), op = op.kind(), "persisted"),
                        Err(err) => warn!(
                            node = op.node(),
                            op = op.kind(),
                            error = %err,
                            "persistence write failed"
                        ),
                    }
                }
                debug!("persistence writer stopped");
            })?;
        Ok((
            Self {
                persister,
                tx: Some(tx),
            },
            PersistenceWriter { handle },
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a write. Never blocks and never fails the caller.
    pub fn notify(&self, op: PersistOp) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(op) {
            let (reason, op) = match err {
                mpsc::error::TrySendError::Full(op) => ("queue full", op),
                mpsc::error::TrySendError::Closed(op) => ("writer stopped", op),
            };
            warn!(node = op.node(), op = op.kind(), reason, "persistence write dropped");
        }
    }

    pub fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.persister.load_nodes()
    }

    pub fn load_setting(&self, node: &str) -> Result<Option<String>> {
        self.persister.load_setting(node)
    }

    pub fn load_state(&self, node: &str) -> Result<Option<AdapterState>> {
        self.persister.load_state(node)
    }

    pub fn load_groups(&self, node: &str) -> Result<Vec<GroupRecord>> {
        self.persister.load_groups(node)
    }
}

impl std::fmt::Debug for PersistenceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceBridge")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

//! Request correlation: ID allocation and the pending-reply table.
//!
//! Every outgoing request gets a process-unique monotonic ID and a oneshot
//! completion slot registered here before the socket write, so a reply that
//! races the write can never be lost. The connection loop is the only
//! completer: it matches incoming `id` frames, expires deadlines during its
//! purge step, and drops the whole table on shutdown. The oneshot sender is
//! consumed on use, which makes complete-exactly-once structural rather than
//! a discipline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use tokio::sync::{Mutex, oneshot};

use crate::error::QuikError;
use crate::protocol::Frame;

struct Pending {
    deadline: Instant,
    timeout_ms: u64,
    tx: oneshot::Sender<Result<Frame, QuikError>>,
}

/// Shared table of in-flight requests.
pub(crate) struct PendingTable {
    counter: AtomicU64,
    map: Mutex<AHashMap<u64, Pending>>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self { counter: AtomicU64::new(0), map: Mutex::new(AHashMap::new()) }
    }

    /// Allocates the next request ID. IDs start at 1 and are never reused.
    pub(crate) fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a reply slot for `id` with an absolute deadline `timeout` from now.
    pub(crate) async fn register(&self, id: u64, timeout: Duration) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            deadline: Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
            tx,
        };
        self.map.lock().await.insert(id, pending);
        PendingReply { id, rx }
    }

    /// Removes a registration whose socket write failed; the holder already
    /// has the error in hand.
    pub(crate) async fn discard(&self, id: u64) {
        self.map.lock().await.remove(&id);
    }

    /// Completes the request `id` with a received frame. Returns false when
    /// no such request is pending (unknown ID, already timed out, or already
    /// completed).
    pub(crate) async fn complete(&self, id: u64, frame: Frame) -> bool {
        let pending = self.map.lock().await.remove(&id);
        match pending {
            Some(p) => {
                // Send fails only if the holder dropped the reply meanwhile.
                let _ = p.tx.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Drops abandoned entries and fails expired ones with a timeout error.
    pub(crate) async fn purge(&self) {
        let now = Instant::now();
        let mut map = self.map.lock().await;
        let stale: Vec<u64> = map
            .iter()
            .filter(|(_, p)| p.tx.is_closed() || p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(p) = map.remove(&id) {
                if p.deadline <= now {
                    let _ = p.tx.send(Err(QuikError::Timeout { id, timeout_ms: p.timeout_ms }));
                }
            }
        }
    }

    /// Drops every remaining entry so holders observe a connection-closed
    /// failure. Returns how many were dropped.
    pub(crate) async fn close_all(&self) -> usize {
        let mut map = self.map.lock().await;
        let dropped = map.len();
        map.clear();
        dropped
    }
}

/// The caller's handle to one in-flight request.
///
/// Await it with [`recv`](Self::recv) or poll it without blocking with
/// [`try_recv`](Self::try_recv). Dropping the handle abandons the request;
/// the table forgets it on the next purge.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Result<Frame, QuikError>>,
}

impl PendingReply {
    /// The correlation ID this reply is registered under.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the outcome: the response frame, a timeout error after the
    /// deadline passed, or a connection-closed error if the connection shut
    /// down first.
    pub async fn recv(self) -> Result<Frame, QuikError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(QuikError::ConnectionClosed),
        }
    }

    /// Non-blocking poll for step-style consumers. Returns `None` while the
    /// request is still in flight.
    pub fn try_recv(&mut self) -> Option<Result<Frame, QuikError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(QuikError::ConnectionClosed)),
        }
    }
}

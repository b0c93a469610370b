// Cross-server acknowledgement tracking

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Tracks pending acknowledgements for group mutations executed on remote
/// servers.
///
/// Correlation ids are process-local and monotonic. A pending ack completes
/// when the matching ack arrives or when the timeout elapses; the timeout
/// path completes successfully because the caller cannot distinguish an
/// unknown connection from a network partition. Disposal completes every
/// outstanding ack.
pub struct AckTracker {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    timeout: Duration,
}

/// Handle for one pending acknowledgement.
pub struct PendingAck {
    correlation_id: u64,
    receiver: oneshot::Receiver<()>,
}

impl PendingAck {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }
}

impl AckTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a new pending ack and hand back its awaitable handle.
    pub fn register(&self) -> PendingAck {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(correlation_id, sender);
        PendingAck {
            correlation_id,
            receiver,
        }
    }

    /// Complete a pending ack. Repeated or late completions are ignored.
    pub fn complete(&self, correlation_id: u64) {
        let sender = self.pending.lock().remove(&correlation_id);
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Wait for the ack or its timeout. Both outcomes complete the caller.
    pub async fn wait(&self, pending: PendingAck) {
        let correlation_id = pending.correlation_id;
        if tokio::time::timeout(self.timeout, pending.receiver)
            .await
            .is_err()
        {
            self.pending.lock().remove(&correlation_id);
            tracing::debug!("ack {} timed out", correlation_id);
        }
    }

    /// Complete every outstanding ack, releasing their waiters.
    pub fn dispose(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, sender) in drained {
            let _ = sender.send(());
        }
    }
}

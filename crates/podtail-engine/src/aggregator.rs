use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podtail_types::LogRecord;

/// One consumer's view of the merged log output.
///
/// Records arrive in arrival order across streams (per-stream order is
/// exact; no global timestamp order is promised) with full provenance
/// attached. The buffer is bounded: when the consumer lags, producers
/// pause instead of dropping records or growing without limit.
pub struct Subscription {
    id: u64,
    records: mpsc::Receiver<LogRecord>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        records: mpsc::Receiver<LogRecord>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            records,
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next record, or `None` once the subscription is cancelled (or
    /// the engine shut down) and the buffer is drained.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        self.records.recv().await
    }

    /// Stop this subscription: its streams close and their concurrency
    /// slots free up. Other subscriptions are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Dropping the receiver alone would stop producers eventually;
        // cancelling makes teardown prompt and deterministic.
        self.cancel.cancel();
    }
}

/// Bounded fan-in channel for one subscription.
pub(crate) fn channel(
    id: u64,
    capacity: usize,
    cancel: CancellationToken,
) -> (mpsc::Sender<LogRecord>, Subscription) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Subscription::new(id, rx, cancel))
}

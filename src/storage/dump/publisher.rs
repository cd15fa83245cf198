//! Write-side of the dump pipeline.

use crate::models::PersistedRecord;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

/// Accepts records from the write path and queues them for the subscriber.
///
/// [`dump`](Self::dump) only enqueues. [`close`](Self::close) drops the sender, which
/// is the subscriber's signal to drain and finish.
#[derive(Debug)]
pub struct DumpPublisher {
    sender: Mutex<Option<UnboundedSender<PersistedRecord>>>,
}

impl DumpPublisher {
    pub(super) const fn new(sender: UnboundedSender<PersistedRecord>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<UnboundedSender<PersistedRecord>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a record. Returns `false` if the pipeline is closed and the record was
    /// dropped.
    pub fn dump(&self, record: PersistedRecord) -> bool {
        let sent = {
            let guard = self.lock();
            match guard.as_ref() {
                Some(sender) => sender.send(record).map_err(|e| (e.0, "subscriber_gone")),
                None => Err((record, "closed")),
            }
        };

        match sent {
            Ok(()) => true,
            Err((record, reason)) => {
                tracing::warn!(
                    kind = %record.kind(),
                    name = record.name(),
                    reason,
                    "Dump pipeline not accepting records, dropping record"
                );
                metrics::counter!("metricstore_dump_dropped_total", "reason" => reason)
                    .increment(1);
                false
            },
        }
    }

    /// Closes the queue. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.lock().take().is_some()
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

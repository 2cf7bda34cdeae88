use super::MetricsStore;
use crate::{error::Result, models::Record};
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Persisted,
    Buffered,
}

/// Store writer that rides out transient write failures.
///
/// Records that cannot be written are held in a bounded FIFO and replayed in
/// their original order before any newer record reaches the store. When the
/// FIFO is full the oldest buffered record is dropped.
pub struct BufferedWriter {
    store: Arc<dyn MetricsStore>,
    pending: VecDeque<Record>,
    capacity: usize,
    dropped: u64,
}

impl BufferedWriter {
    pub fn new(store: Arc<dyn MetricsStore>, capacity: usize) -> Self {
        Self {
            store,
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Replays buffered records oldest first, stopping at the first failure.
    pub async fn flush(&mut self) -> Result<usize> {
        let mut flushed = 0;
        while let Some(record) = self.pending.front() {
            self.store.append(record).await?;
            self.pending.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, "flushed buffered records");
        }
        Ok(flushed)
    }

    /// Writes `record` after any buffered backlog, buffering it on a transient failure.
    ///
    /// Non-transient errors are returned and the record is not kept.
    pub async fn write(&mut self, record: Record) -> Result<Delivery> {
        if !self.pending.is_empty() {
            if let Err(err) = self.flush().await {
                if !err.is_transient() {
                    return Err(err);
                }
                self.enqueue(record);
                return Ok(Delivery::Buffered);
            }
        }

        match self.store.append(&record).await {
            Ok(_) => Ok(Delivery::Persisted),
            Err(err) if err.is_transient() => {
                warn!(error = %err, kind = ?record.kind(), "store write failed; buffering record");
                self.enqueue(record);
                Ok(Delivery::Buffered)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn write_all(&mut self, records: impl IntoIterator<Item = Record>) -> Result<usize> {
        let mut buffered = 0;
        for record in records {
            if self.write(record).await? == Delivery::Buffered {
                buffered += 1;
            }
        }
        Ok(buffered)
    }

    fn enqueue(&mut self, record: Record) {
        if self.pending.len() == self.capacity {
            if let Some(lost) = self.pending.pop_front() {
                self.dropped += 1;
                warn!(
                    kind = ?lost.kind(),
                    capacity = self.capacity,
                    dropped_total = self.dropped,
                    "write buffer full; dropping oldest record"
                );
            }
        }
        self.pending.push_back(record);
    }
}

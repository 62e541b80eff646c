//! Sample sinks and the per-channel writer task that feeds them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{ArchiveError, Result};
use crate::pv_name::PvName;
use crate::sample::Sample;

/// Append-only receiver of samples. One instance is shared by every channel.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Durably accept one sample for `pv`.
    async fn append(&self, pv: &PvName, sample: &Sample) -> Result<()>;
}

/// Sink that keeps everything in memory, grouped by PV.
#[derive(Default)]
pub struct MemorySink {
    samples: Mutex<HashMap<PvName, Vec<Sample>>>,
    fail_next: AtomicU32,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` appends with a write failure.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Samples received for `pv`, in arrival order.
    pub fn samples(&self, pv: &PvName) -> Vec<Sample> {
        self.samples
            .lock()
            .map(|m| m.get(pv).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Total samples held across all PVs.
    pub fn total(&self) -> usize {
        self.samples
            .lock()
            .map(|m| m.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    async fn append(&self, pv: &PvName, sample: &Sample) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ArchiveError::WriteFailure {
                pv: pv.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let mut samples = self.samples.lock().map_err(|_| ArchiveError::WriteFailure {
            pv: pv.to_string(),
            reason: "sink lock poisoned".to_string(),
        })?;
        samples.entry(pv.clone()).or_default().push(sample.clone());
        Ok(())
    }
}

/// Counters maintained by a [`SinkWriter`].
#[derive(Debug, Default)]
pub struct WriterStats {
    written: AtomicU64,
    failed: AtomicU64,
}

impl WriterStats {
    /// Samples the sink accepted.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Samples the sink rejected.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Ordered, bounded hand-off from a channel to the shared sink.
///
/// Appends run on their own task so slow sink I/O never holds up the
/// channel's state handling. Samples reach the sink in queue order. Queuing
/// never waits: when the sink falls `depth` samples behind, new samples are
/// refused with [`ArchiveError::QueueFull`].
pub struct SinkWriter {
    pv: PvName,
    depth: usize,
    tx: mpsc::Sender<Sample>,
    task: JoinHandle<()>,
}

impl SinkWriter {
    /// Spawn the writer task for `pv`.
    pub fn spawn(
        pv: PvName,
        sink: Arc<dyn SampleSink>,
        depth: usize,
        stats: Arc<WriterStats>,
    ) -> Self {
        let depth = depth.max(1);
        let (tx, mut rx) = mpsc::channel::<Sample>(depth);
        let task_pv = pv.clone();
        let task = tokio::spawn(async move {
            let pv = task_pv;
            while let Some(sample) = rx.recv().await {
                match sink.append(&pv, &sample).await {
                    Ok(()) => {
                        stats.written.fetch_add(1, Ordering::Relaxed);
                        trace!(pv = %pv, ts = %sample.timestamp, "sample written");
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(pv = %pv, ts = %sample.timestamp, error = %e, "dropping sample");
                    }
                }
            }
        });
        Self {
            pv,
            depth,
            tx,
            task,
        }
    }

    /// Queue a sample without waiting.
    pub fn try_push(&self, sample: Sample) -> Result<()> {
        self.tx.try_send(sample).map_err(|e| match e {
            TrySendError::Full(_) => ArchiveError::QueueFull {
                pv: self.pv.to_string(),
                depth: self.depth,
            },
            TrySendError::Closed(_) => ArchiveError::Shutdown,
        })
    }

    /// Stop accepting samples and wait until everything queued is appended.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

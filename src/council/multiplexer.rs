//! Stream multiplexer: N labeled model streams merged into one sequence.
//!
//! Each council member streams its answer independently; the consumer wants a
//! single totally-ordered sequence of `(model, chunk)` pairs it can forward
//! to an SSE client. [`StreamMux::fan_out`] spawns one task per model, each
//! writing into a bounded channel, and [`StreamMux::next`] drains the merged
//! sequence until every worker has terminated.
//!
//! Guarantees:
//!
//! - Intra-source order is the worker's emission order (task + channel FIFO).
//! - Inter-source order is wall-clock arrival; no fairness promises.
//! - Every worker is announced with exactly one [`StreamChunk::Start`] before
//!   its first content chunk; a failing worker produces `Start` then `Error`.
//! - The merged sequence ends after the last worker's terminal chunk.
//! - Dropping the mux aborts every outstanding worker task, which in turn
//!   drops in-flight upstream requests. Workers that already terminated are
//!   unaffected; late output from unabortable workers is discarded at the
//!   closed channel.
//!
//! The mux never retries a worker; retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::council::provider::{ChatMessage, Provider, StreamChunk};

use futures_util::StreamExt;

/// Bounded capacity of the merged channel. When the consumer lags, workers
/// block here, which throttles their upstream reads.
const MERGED_CHANNEL_CAPACITY: usize = 64;

/// Internal per-worker message. `Complete` is the bookkeeping marker that
/// lets the mux count down terminated workers; it is never surfaced.
enum WorkerEvent {
    Chunk(StreamChunk),
    Complete,
}

/// Merged view over N per-model chunk streams.
pub struct StreamMux {
    rx: mpsc::Receiver<(String, WorkerEvent)>,
    workers: Vec<JoinHandle<()>>,
    active: usize,
}

impl StreamMux {
    /// Spawn one streaming worker per model and return the merged sequence.
    pub fn fan_out(
        provider: Arc<dyn Provider>,
        models: &[String],
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MERGED_CHANNEL_CAPACITY);
        let mut workers = Vec::with_capacity(models.len());

        for model in models {
            let tx = tx.clone();
            let provider = provider.clone();
            let model = model.clone();
            let messages = messages.to_vec();

            workers.push(tokio::spawn(async move {
                // A failed send means the consumer is gone; stop immediately.
                if tx
                    .send((model.clone(), WorkerEvent::Chunk(StreamChunk::Start)))
                    .await
                    .is_err()
                {
                    return;
                }

                let mut chunks = provider.stream(&model, messages, timeout).await;
                while let Some(chunk) = chunks.next().await {
                    let terminal = chunk.is_terminal();
                    if tx
                        .send((model.clone(), WorkerEvent::Chunk(chunk)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if terminal {
                        break;
                    }
                }

                let _ = tx.send((model, WorkerEvent::Complete)).await;
            }));
        }

        StreamMux {
            rx,
            workers,
            active: models.len(),
        }
    }

    /// Next merged `(model, chunk)` pair, or `None` once every worker has
    /// terminated.
    pub async fn next(&mut self) -> Option<(String, StreamChunk)> {
        while self.active > 0 {
            match self.rx.recv().await {
                Some((model, WorkerEvent::Chunk(chunk))) => return Some((model, chunk)),
                Some((_, WorkerEvent::Complete)) => {
                    self.active -= 1;
                }
                None => return None,
            }
        }
        None
    }
}

impl Drop for StreamMux {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

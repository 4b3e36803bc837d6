//! Cache Worker - producer half of the chunk handshake
//!
//! For each task a worker attaches the named channel, resolves the key and
//! streams the content through the channel one chunk at a time:
//!
//! ```text
//! read ≤ max_chunk ─▶ publish(len, last) ─▶ post producer-ready ─▶ wait consumer-ready ─┐
//!      ▲                                                                                │
//!      └──────────────────────────────── until last ────────────────────────────────────┘
//! ```
//!
//! A miss is a zero-length last chunk. A zero-length first chunk is never
//! acknowledged by the consumer, so the worker does not wait after it.

use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use super::queue::TransferTask;
use super::store::ContentStore;
use super::DaemonContext;
use crate::error::{Error, Result};
use crate::metrics;
use crate::shm::SharedChannel;

/// How a task ended from the producer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Content streamed; the consumer acknowledged every chunk
    Served { bytes: u64, chunks: usize },
    /// Key not resolvable; miss signal sent
    Miss,
}

/// Worker thread body: drain the queue until it is closed.
pub(crate) fn worker_loop(id: usize, ctx: &DaemonContext) {
    info!(worker = id, "Cache worker started");

    while let Some(task) = ctx.queue.pop() {
        let span = info_span!("task", worker = id, channel = %task.channel, key = %task.key);
        let _enter = span.enter();

        debug!(capacity = task.capacity, "Handling task");
        match serve_task(&task, ctx.store.as_ref(), ctx.config.delay) {
            Ok(TaskOutcome::Served { bytes, chunks }) => {
                metrics::CACHE_TASKS_TOTAL.with_label_values(&["hit"]).inc();
                debug!(bytes, chunks, "Task served");
            }
            Ok(TaskOutcome::Miss) => {
                metrics::CACHE_TASKS_TOTAL.with_label_values(&["miss"]).inc();
                warn!("Cache miss");
            }
            Err(e @ Error::ChannelAttach { .. }) => {
                metrics::CACHE_TASKS_TOTAL
                    .with_label_values(&["attach_failed"])
                    .inc();
                error!("{}", e);
            }
            Err(Error::TransferAbandoned) => {
                metrics::CACHE_TASKS_TOTAL
                    .with_label_values(&["abandoned"])
                    .inc();
                warn!("Proxy abandoned the transfer");
            }
            Err(e) => {
                metrics::CACHE_TASKS_TOTAL.with_label_values(&["error"]).inc();
                error!("Task aborted: {}", e);
            }
        }
    }

    info!(worker = id, "Cache worker exiting");
}

/// Perform the producer half of one transfer.
///
/// A read error aborts the loop without a last-chunk signal.
pub fn serve_task(
    task: &TransferTask,
    store: &dyn ContentStore,
    delay: Duration,
) -> Result<TaskOutcome> {
    let mut channel = SharedChannel::attach(&task.channel, task.capacity)?;
    let mut writer = channel.writer();

    if !delay.is_zero() {
        thread::sleep(delay);
    }

    let resolved = store
        .resolve(&task.key)
        .and_then(|handle| match handle {
            Some(handle) => handle.size().map(|size| Some((handle, size))),
            None => Ok(None),
        });

    let (handle, total) = match resolved {
        Ok(Some(found)) => found,
        Ok(None) => {
            writer.publish_miss()?;
            return Ok(TaskOutcome::Miss);
        }
        Err(e) => {
            warn!("Resolution failed, reporting miss: {}", e);
            writer.publish_miss()?;
            return Ok(TaskOutcome::Miss);
        }
    };

    writer.set_total_size(total);
    let max_chunk = writer.capacity();
    let mut offset = 0u64;
    let mut chunks = 0usize;

    loop {
        let n = handle.read_at(writer.buf(), offset)?;
        offset += n as u64;

        let last = n < max_chunk || offset >= total;
        writer.publish(n, last)?;
        chunks += 1;
        debug!(len = n, last, "Published chunk");

        if chunks == 1 && n == 0 {
            break;
        }
        writer.wait_consumed()?;
        if last {
            break;
        }
    }

    Ok(TaskOutcome::Served {
        bytes: offset,
        chunks,
    })
}

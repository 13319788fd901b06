//! Congestion-aware outbound write path
//!
//! Every outbound frame is accounted for when it is submitted and then
//! drained to the transport by a single writer task, so frames hit the wire
//! in submission order. When the backlog reaches the congestion ceiling at a
//! key frame, frames stamped before that key frame are dropped instead of
//! sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::Error;
use crate::stats::BandwidthSampler;
use crate::transport::Transport;

#[derive(Debug, Default)]
struct AccountState {
    queued_bytes: i64,
    /// Events stamped before this are ignored
    clear_at: Option<Instant>,
    /// Drop frames older than `clear_boundary`
    should_clear_on_next_keyframe: bool,
    clear_boundary: Option<Instant>,
}

/// Bytes submitted but not yet handed to the transport
#[derive(Debug)]
pub struct CongestionAccount {
    max_congestion_bytes: usize,
    state: Mutex<AccountState>,
}

impl CongestionAccount {
    pub fn new(max_congestion_bytes: usize) -> Self {
        Self {
            max_congestion_bytes,
            state: Mutex::new(AccountState::default()),
        }
    }

    pub fn max_congestion_bytes(&self) -> usize {
        self.max_congestion_bytes
    }

    /// Current backlog in bytes
    pub fn queued(&self) -> usize {
        self.state.lock().queued_bytes.max(0) as usize
    }

    /// Whether `at` predates the last reset
    pub fn is_stale(&self, at: Instant) -> bool {
        is_stale(&self.state.lock(), at)
    }

    /// Account a newly submitted frame
    ///
    /// Returns the new backlog, or `None` if the frame predates the last
    /// reset. A key frame re-arms the drop rule: armed if the backlog is at
    /// or above the ceiling, with this frame's time as the boundary.
    pub fn on_frame_queued(&self, size: usize, is_keyframe: bool, at: Instant) -> Option<usize> {
        let mut state = self.state.lock();
        if is_stale(&state, at) {
            return None;
        }

        state.queued_bytes += size as i64;
        let queued = state.queued_bytes.max(0) as usize;

        if is_keyframe {
            state.should_clear_on_next_keyframe = queued >= self.max_congestion_bytes;
            state.clear_boundary = Some(at);
            if state.should_clear_on_next_keyframe {
                tracing::debug!(queued = queued, max = self.max_congestion_bytes, "Congestion ceiling reached at key frame");
            }
        }

        Some(queued)
    }

    /// Release `bytes` from the backlog; ignored for frames before the last reset
    pub fn decrease(&self, bytes: usize, at: Instant) -> usize {
        let mut state = self.state.lock();
        if !is_stale(&state, at) {
            state.queued_bytes -= bytes as i64;
        }
        state.queued_bytes.max(0) as usize
    }

    /// Whether a frame stamped `at` should be dropped
    pub fn should_abandon(&self, at: Instant) -> bool {
        let state = self.state.lock();
        state.should_clear_on_next_keyframe && state.clear_boundary.is_some_and(|boundary| at < boundary)
    }

    /// Zero the backlog and ignore everything stamped before now
    pub fn reset(&self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&self, at: Instant) {
        let mut state = self.state.lock();
        *state = AccountState {
            clear_at: Some(at),
            ..AccountState::default()
        };
    }
}

fn is_stale(state: &AccountState, at: Instant) -> bool {
    state.clear_at.is_some_and(|clear_at| at < clear_at)
}

/// A frame waiting for the writer
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub timestamp: Instant,
}

/// Called with every transport write failure
pub type WriteErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

struct Writer {
    transport: Arc<dyn Transport>,
    account: Arc<CongestionAccount>,
    sampler: Arc<BandwidthSampler>,
    writable: Arc<Notify>,
    stop: Arc<AtomicBool>,
    retry_timeout: Duration,
    on_error: WriteErrorCallback,
}

/// Submission side of the serialized writer
pub struct WritePath {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    account: Arc<CongestionAccount>,
    sampler: Arc<BandwidthSampler>,
    writable: Arc<Notify>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WritePath {
    /// Start the writer task; must be called within a Tokio runtime
    pub fn spawn(
        transport: Arc<dyn Transport>,
        account: Arc<CongestionAccount>,
        sampler: Arc<BandwidthSampler>,
        retry_timeout: Duration,
        on_error: WriteErrorCallback,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writable = Arc::new(Notify::new());
        let stop = Arc::new(AtomicBool::new(false));

        let writer = Writer {
            transport,
            account: account.clone(),
            sampler: sampler.clone(),
            writable: writable.clone(),
            stop: stop.clone(),
            retry_timeout,
            on_error,
        };
        let task = tokio::spawn(writer.run(rx));

        Self {
            tx,
            account,
            sampler,
            writable,
            stop,
            task,
        }
    }

    /// Account for `data` and queue it behind everything already submitted
    ///
    /// Returns `false` if the frame was discarded: empty, stamped before the
    /// last reset, or the writer has stopped.
    pub fn submit(&self, data: Bytes, is_keyframe: bool, timestamp: Instant) -> bool {
        if data.is_empty() || self.stop.load(Ordering::Acquire) {
            return false;
        }

        let Some(queued) = self.account.on_frame_queued(data.len(), is_keyframe, timestamp) else {
            tracing::trace!(size = data.len(), "Discarding frame from before reset");
            return false;
        };
        self.sampler.will_send(queued);

        self.tx
            .send(OutboundFrame {
                data,
                is_keyframe,
                timestamp,
            })
            .is_ok()
    }

    /// Transport became writable again
    pub fn notify_writable(&self) {
        self.writable.notify_one();
    }

    /// Stop the writer; frames still queued are dropped
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
        self.writable.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn account(&self) -> &Arc<CongestionAccount> {
        &self.account
    }
}

impl Drop for WritePath {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.task.abort();
    }
}

impl Writer {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<OutboundFrame>) {
        while let Some(frame) = rx.recv().await {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.account.is_stale(frame.timestamp) {
                continue;
            }
            self.drain(frame).await;
        }
        tracing::debug!("Writer stopped");
    }

    /// Write one frame fully, or until it is abandoned
    async fn drain(&self, frame: OutboundFrame) {
        let size = frame.data.len();
        let mut total_sent = 0;

        while total_sent < size {
            if self.stop.load(Ordering::Acquire) {
                return;
            }

            // Reset while this frame was in flight; the rest must not reach
            // the next connection
            if self.account.is_stale(frame.timestamp) {
                tracing::debug!(dropped = size - total_sent, "Dropping frame from before reset");
                return;
            }

            if self.account.should_abandon(frame.timestamp) {
                let remaining = size - total_sent;
                self.sampler.did_send(0);
                let queued = self.account.decrease(remaining, frame.timestamp);
                self.sampler.will_send(queued);
                tracing::debug!(
                    dropped = remaining,
                    keyframe = frame.is_keyframe,
                    queued = queued,
                    "Abandoning frame older than congestion boundary"
                );
                return;
            }

            match self.transport.write(&frame.data[total_sent..]) {
                Ok(sent) => {
                    total_sent += sent;
                    self.sampler.did_send(sent);
                    let queued = self.account.decrease(sent, frame.timestamp);
                    self.sampler.will_send(queued);

                    if sent == 0 {
                        // Bounded wait; retry either way
                        let _ = timeout(self.retry_timeout, self.writable.notified()).await;
                    }
                }
                Err(e) => {
                    let remaining = size - total_sent;
                    self.account.decrease(remaining, frame.timestamp);
                    tracing::error!(error = %e, dropped = remaining, "Transport write failed");
                    (self.on_error)(e);
                    return;
                }
            }
        }
    }
}

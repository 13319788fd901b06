//! Throughput sampling and adaptive bitrate recommendation
//!
//! Every tick the sampler turns the bytes the writer managed to send into a
//! detected rate, and the latest backlog observation into a predicted rate.
//! Backlog observations feed a short growth trend that drives the
//! [`BitrateVector`]; throughput at each recovery from a decrease is kept as a
//! pivot, and the mean of the pivots is the sustainable rate estimate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Throughput samples kept
pub const THROUGHPUT_WINDOW: usize = 30;

/// Backlog observations scored for the growth trend
pub const GROWTH_WINDOW: usize = 3;

/// Pivots averaged into the sustainable estimate
pub const PIVOT_WINDOW: usize = 5;

/// Minimum time after a decrease before increasing again
pub const SETTLEMENT_PERIOD: Duration = Duration::from_secs(30);

/// Minimum time between two increases
pub const INCREASE_INTERVAL: Duration = Duration::from_secs(10);

/// Recommended bitrate direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitrateVector {
    Decrease,
    #[default]
    Hold,
    Increase,
}

impl BitrateVector {
    /// `-1`, `0` or `+1`
    pub fn as_i8(self) -> i8 {
        match self {
            BitrateVector::Decrease => -1,
            BitrateVector::Hold => 0,
            BitrateVector::Increase => 1,
        }
    }
}

/// Result of one sampling tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BitrateReport {
    pub vector: BitrateVector,
    /// Mean of the recorded pivots
    pub sustainable_bytes_per_sec: f64,
    /// Bytes actually sent per second over the tick
    pub detected_bytes_per_sec: f64,
    /// Backlog per second over the tick
    pub predicted_bytes_per_sec: f64,
}

/// Bounded window; newest at the front, oldest evicted from the back
#[derive(Debug, Clone)]
struct SampleWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Copy> SampleWindow<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, item: T) {
        self.items.push_front(item);
        self.items.truncate(self.capacity);
    }

    fn latest(&self) -> Option<T> {
        self.items.front().copied()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    /// Oldest to newest
    fn chronological(&self) -> impl Iterator<Item = T> + '_ {
        self.items.iter().rev().copied()
    }
}

impl SampleWindow<f64> {
    fn mean(&self) -> f64 {
        if self.items.is_empty() {
            0.0
        } else {
            self.items.iter().sum::<f64>() / self.items.len() as f64
        }
    }
}

/// Accumulators written from the send path
#[derive(Debug)]
struct Counters {
    sent_bytes: u64,
    queued_bytes: Option<u64>,
    last_tick: Instant,
}

/// Trend state only touched by ticks
#[derive(Debug)]
struct Windows {
    throughput: SampleWindow<f64>,
    growth: SampleWindow<u64>,
    pivots: SampleWindow<f64>,
    previous_vector: BitrateVector,
    last_turndown: Option<Instant>,
    last_increase: Option<Instant>,
}

impl Windows {
    fn new() -> Self {
        Self {
            throughput: SampleWindow::new(THROUGHPUT_WINDOW),
            growth: SampleWindow::new(GROWTH_WINDOW),
            pivots: SampleWindow::new(PIVOT_WINDOW),
            previous_vector: BitrateVector::Hold,
            last_turndown: None,
            last_increase: None,
        }
    }

    /// +1 for every observation smaller than the one before, -1 for larger
    fn growth_score(&self) -> i32 {
        let observations: Vec<u64> = self.growth.chronological().collect();
        observations
            .windows(2)
            .map(|pair| match pair[1].cmp(&pair[0]) {
                std::cmp::Ordering::Less => 1,
                std::cmp::Ordering::Greater => -1,
                std::cmp::Ordering::Equal => 0,
            })
            .sum()
    }

    fn increase_allowed(&self, now: Instant) -> bool {
        match self.last_turndown {
            None => true,
            Some(turndown) => {
                now.saturating_duration_since(turndown) >= SETTLEMENT_PERIOD
                    && self
                        .last_increase
                        .map_or(true, |increase| now.saturating_duration_since(increase) >= INCREASE_INTERVAL)
            }
        }
    }

    fn vector_for(&mut self, queued: u64, now: Instant) -> BitrateVector {
        self.growth.push(queued);

        if self.growth_score() < 0 {
            self.last_turndown = Some(now);
            BitrateVector::Decrease
        } else if self.increase_allowed(now) {
            self.last_increase = Some(now);
            BitrateVector::Increase
        } else {
            BitrateVector::Hold
        }
    }
}

/// Periodic throughput sampler
///
/// `did_send` and `will_send` are cheap and may be called from any thread.
#[derive(Debug)]
pub struct BandwidthSampler {
    counters: Mutex<Counters>,
    windows: Mutex<Windows>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BandwidthSampler {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Sampler whose first tick measures from `start`
    pub fn starting_at(start: Instant) -> Self {
        Self {
            counters: Mutex::new(Counters {
                sent_bytes: 0,
                queued_bytes: None,
                last_tick: start,
            }),
            windows: Mutex::new(Windows::new()),
            task: Mutex::new(None),
        }
    }

    /// Record bytes handed to the transport (zero for an abandoned frame)
    pub fn did_send(&self, bytes: usize) {
        self.counters.lock().sent_bytes += bytes as u64;
    }

    /// Record the current backlog; replaces any earlier observation
    pub fn will_send(&self, queued_bytes: usize) {
        self.counters.lock().queued_bytes = Some(queued_bytes as u64);
    }

    /// Sample now
    pub fn tick(&self) -> BitrateReport {
        self.tick_at(Instant::now())
    }

    /// Sample at `now`, draining the accumulators
    pub fn tick_at(&self, now: Instant) -> BitrateReport {
        let (sent, queued, elapsed) = {
            let mut counters = self.counters.lock();
            let elapsed = now.saturating_duration_since(counters.last_tick).as_secs_f64();
            counters.last_tick = now;
            let sent = std::mem::take(&mut counters.sent_bytes);
            (sent, counters.queued_bytes.take(), elapsed)
        };

        let per_second = |bytes: u64| if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };
        let detected = per_second(sent);
        let predicted = queued.map(per_second).unwrap_or(0.0);

        let mut windows = self.windows.lock();
        windows.throughput.push(detected);

        let vector = match queued {
            Some(queued) => {
                let vector = windows.vector_for(queued, now);
                if windows.previous_vector == BitrateVector::Decrease && vector != BitrateVector::Decrease {
                    if let Some(turn) = windows.throughput.latest() {
                        windows.pivots.push(turn);
                    }
                }
                if detected > windows.pivots.mean() {
                    windows.pivots.push(detected);
                }
                windows.previous_vector = vector;
                vector
            }
            None => BitrateVector::Hold,
        };

        let report = BitrateReport {
            vector,
            sustainable_bytes_per_sec: windows.pivots.mean(),
            detected_bytes_per_sec: detected,
            predicted_bytes_per_sec: predicted,
        };

        tracing::trace!(
            vector = vector.as_i8(),
            detected = detected,
            predicted = predicted,
            sustainable = report.sustainable_bytes_per_sec,
            samples = windows.throughput.len(),
            "Bandwidth tick"
        );

        report
    }

    /// Drop all counters and trend state
    pub fn clear(&self) {
        {
            let mut counters = self.counters.lock();
            counters.sent_bytes = 0;
            counters.queued_bytes = None;
            counters.last_tick = Instant::now();
        }
        let mut windows = self.windows.lock();
        windows.throughput.clear();
        windows.growth.clear();
        windows.pivots.clear();
        windows.previous_vector = BitrateVector::Hold;
        windows.last_turndown = None;
        windows.last_increase = None;
    }

    /// Tick every `interval` and hand each report to `callback`
    ///
    /// Replaces any sampling task already running.
    pub fn spawn<F>(self: &Arc<Self>, interval: Duration, callback: F)
    where
        F: Fn(BitrateReport) + Send + Sync + 'static,
    {
        let sampler = Arc::downgrade(self);
        self.counters.lock().last_tick = Instant::now();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sampler) = sampler.upgrade() else {
                    break;
                };
                callback(sampler.tick());
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sampling task, if any
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Whether a sampling task is running
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Default for BandwidthSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BandwidthSampler {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

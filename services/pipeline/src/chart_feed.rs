//! Fixed-duration decimated window feeding the live chart.
//!
//! Raw samples land in a small ring at sensor rate. A display tick takes the
//! most recent one (last value wins) and appends a point to each of the six
//! channels, evicting the oldest point once the window is full.

use crate::config::ChartConfig;
use crate::sample::Sample;
use crate::ticker::Ticker;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Seconds of history shown
pub const WINDOW_SECONDS: u32 = 5;

/// Points appended per second
pub const DISPLAY_HZ: u32 = 10;

/// Nominal sensor sample rate
pub const SENSOR_HZ: u32 = 50;

/// Raw ring capacity as a multiple of the decimation factor
const RAW_RING_FACTOR: usize = 3;

const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// One plotted point: seconds from the left edge and the channel value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    pub t: f64,
    pub value: f32,
}

/// Points appended by one display tick, one per channel in the order
/// accel x, y, z then gyro x, y, z.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartUpdate {
    pub points: [ChartPoint; 6],
    /// Points per channel after the update
    pub len: usize,
}

struct FeedState {
    raw: VecDeque<Sample>,
    channels: [VecDeque<ChartPoint>; 6],
}

/// Window downsampler for the live chart.
pub struct ChartFeed {
    max_points: usize,
    decimation: usize,
    raw_capacity: usize,
    spacing: f64,
    state: Mutex<FeedState>,
    ticker: Ticker,
    updates: broadcast::Sender<ChartUpdate>,
}

impl ChartFeed {
    pub fn new(config: &ChartConfig) -> Self {
        let max_points = config.max_points().max(1);
        let decimation = config.decimation();
        let raw_capacity = decimation * RAW_RING_FACTOR;
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            max_points,
            decimation,
            raw_capacity,
            spacing: config.point_spacing_secs(),
            state: Mutex::new(FeedState {
                raw: VecDeque::with_capacity(raw_capacity + 1),
                channels: std::array::from_fn(|_| VecDeque::with_capacity(max_points)),
            }),
            ticker: Ticker::new("chart", config.tick_interval()),
            updates,
        }
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChartUpdate> {
        self.updates.subscribe()
    }

    /// Push one sample into the raw ring. Never blocks on I/O.
    pub fn add(&self, sample: &Sample) {
        let mut state = self.state.lock();
        state.raw.push_back(*sample);
        while state.raw.len() > self.raw_capacity {
            state.raw.pop_front();
        }
    }

    /// Append the latest sample to every channel. Returns `None` when no
    /// sample is buffered.
    pub fn tick(&self) -> Option<ChartUpdate> {
        let update = {
            let mut state = self.state.lock();
            let latest = state.raw.back().copied()?;
            let values = latest.channels();

            let mut points = [ChartPoint { t: 0.0, value: 0.0 }; 6];
            for (i, channel) in state.channels.iter_mut().enumerate() {
                if channel.len() >= self.max_points {
                    channel.pop_front();
                    for (index, point) in channel.iter_mut().enumerate() {
                        point.t = index as f64 * self.spacing;
                    }
                }
                let point = ChartPoint {
                    t: channel.len() as f64 * self.spacing,
                    value: values[i],
                };
                channel.push_back(point);
                points[i] = point;
            }

            let excess = state.raw.len().saturating_sub(self.decimation);
            state.raw.drain(..excess);

            ChartUpdate {
                points,
                len: state.channels[0].len(),
            }
        };

        trace!(len = update.len, "Chart tick");
        let _ = self.updates.send(update.clone());
        Some(update)
    }

    /// Start the display tick. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        if self.ticker.start(move || {
            let feed = weak.upgrade();
            async move {
                if let Some(feed) = feed {
                    feed.tick();
                }
            }
        }) {
            debug!(decimation = self.decimation, "Chart feed started");
        }
    }

    /// Stop the display tick. Buffers are kept. Idempotent.
    pub fn stop(&self) {
        if self.ticker.stop() {
            debug!("Chart feed stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }

    /// Copies of the six channel buffers in display order.
    pub fn snapshot(&self) -> [Vec<ChartPoint>; 6] {
        let state = self.state.lock();
        std::array::from_fn(|i| state.channels[i].iter().copied().collect())
    }

    /// Points currently held per channel.
    pub fn len(&self) -> usize {
        self.state.lock().channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every channel buffer and the raw ring.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.raw.clear();
        for channel in state.channels.iter_mut() {
            channel.clear();
        }
    }

    /// Stop and clear.
    pub fn release(&self) {
        self.stop();
        self.clear();
    }

    #[cfg(test)]
    fn raw_len(&self) -> usize {
        self.state.lock().raw.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(value: f32) -> Sample {
        Sample {
            device_timestamp: value as u32,
            accel_x: value,
            accel_y: value + 1.0,
            accel_z: value + 2.0,
            gyro_x: value + 3.0,
            gyro_y: value + 4.0,
            gyro_z: value + 5.0,
            voltage: 3.7,
            received_at: 0,
            calibrated: false,
        }
    }

    fn feed() -> ChartFeed {
        ChartFeed::new(&ChartConfig::default())
    }

    #[test]
    fn test_empty_tick_is_noop() {
        let feed = feed();
        assert!(feed.tick().is_none());
        assert!(feed.is_empty());
    }

    #[test]
    fn test_last_value_wins() {
        let feed = feed();
        for v in 0..5 {
            feed.add(&sample(v as f32));
        }
        let update = feed.tick().unwrap();
        assert_eq!(update.len, 1);
        assert_eq!(update.points[0], ChartPoint { t: 0.0, value: 4.0 });
        assert_eq!(update.points[5].value, 9.0);
    }

    #[test]
    fn test_raw_ring_is_bounded_and_trimmed() {
        let feed = feed();
        for v in 0..40 {
            feed.add(&sample(v as f32));
        }
        assert_eq!(feed.raw_len(), 15);
        feed.tick();
        assert_eq!(feed.raw_len(), 5);
    }

    #[test]
    fn test_window_capped_with_exact_time_axis() {
        let feed = feed();
        // 60 ticks at the sensor rate: 300 raw samples, 5 per display point
        let mut v = 0;
        for _ in 0..60 {
            for _ in 0..5 {
                feed.add(&sample(v as f32));
                v += 1;
            }
            feed.tick();
        }
        assert!(v > feed.max_points() * 5);

        let snapshot = feed.snapshot();
        for channel in &snapshot {
            assert_eq!(channel.len(), feed.max_points());
            for (i, point) in channel.iter().enumerate() {
                assert_eq!(point.t, i as f64 * 0.1);
            }
        }
        // Newest point at the right edge
        assert_eq!(snapshot[0].last().unwrap().value, 299.0);
        assert_eq!(snapshot[0].first().unwrap().value, 54.0);
    }

    #[test]
    fn test_clear_and_release() {
        let feed = feed();
        feed.add(&sample(1.0));
        feed.tick();
        feed.clear();
        assert!(feed.is_empty());
        assert!(feed.tick().is_none());
        feed.release();
        assert!(!feed.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_publishes_updates() {
        let feed = Arc::new(feed());
        let mut rx = feed.subscribe();
        feed.start();
        feed.start();
        assert!(feed.is_running());

        feed.add(&sample(7.0));
        tokio::time::sleep(Duration::from_millis(350)).await;
        feed.stop();

        let mut updates = 0;
        while let Ok(update) = rx.try_recv() {
            assert_eq!(update.points[0].value, 7.0);
            updates += 1;
        }
        assert_eq!(updates, 3);
        assert_eq!(feed.len(), 3);
    }
}

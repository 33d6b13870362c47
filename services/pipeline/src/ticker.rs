//! Cancellable periodic task used by the chart, flush and upload ticks.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A repeating task with idempotent start and stop.
///
/// The first tick fires one period after `start`. A tick that is in
/// progress when `stop` is called runs to completion.
pub struct Ticker {
    name: &'static str,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl Ticker {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            running: Mutex::new(None),
        }
    }

    /// Start ticking. Returns false if the ticker was already running.
    pub fn start<F, Fut>(&self, on_tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(None, on_tick)
    }

    /// Like `start`, but `wake` also triggers an immediate tick.
    pub fn start_with_wake<F, Fut>(&self, wake: Arc<Notify>, on_tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(Some(wake), on_tick)
    }

    fn spawn<F, Fut>(&self, wake: Option<Arc<Notify>>, mut on_tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let period = self.period;
        let name = self.name;

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let woken = async {
                    match &wake {
                        Some(wake) => wake.notified().await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = interval.tick() => on_tick().await,
                    _ = woken => on_tick().await,
                }
            }
            debug!(ticker = name, "Ticker stopped");
        });

        debug!(ticker = name, period_ms = period.as_millis() as u64, "Ticker started");
        *running = Some(Running { token, handle });
        true
    }

    /// Stop ticking. Returns false if the ticker was not running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(r) => {
                r.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.token.is_cancelled() && !r.handle.is_finished())
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(r) = self.running.get_mut().take() {
            r.token.cancel();
        }
    }
}

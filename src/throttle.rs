use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Paces callers according to the cost the server reports per call.
#[async_trait]
pub trait Throttle: Send + Sync {
    async fn throttle(&self, cost: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

#[async_trait]
impl Throttle for Unthrottled {
    async fn throttle(&self, _cost: f64) {}
}

#[derive(Debug)]
struct Window {
    started: Instant,
    consumed: f64,
}

/// Keeps the request units consumed per window under a budget.
///
/// All workers share one window. A caller that pushes the window over budget
/// sleeps out the rest of it while holding the lock, so every other worker's
/// next report waits behind it.
#[derive(Debug)]
pub struct RequestUnitThrottler {
    budget: f64,
    window: Duration,
    state: Mutex<Window>,
}

impl RequestUnitThrottler {
    pub fn per_second(budget: f64) -> Self {
        Self::new(budget, Duration::from_secs(1))
    }

    pub fn new(budget: f64, window: Duration) -> Self {
        Self {
            budget,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                consumed: 0.0,
            }),
        }
    }
}

#[async_trait]
impl Throttle for RequestUnitThrottler {
    async fn throttle(&self, cost: f64) {
        if self.budget <= 0.0 {
            return;
        }
        let mut window = self.state.lock().await;
        if window.started.elapsed() >= self.window {
            window.started = Instant::now();
            window.consumed = 0.0;
        }
        window.consumed += cost.max(0.0);
        let elapsed = window.started.elapsed();
        if window.consumed >= self.budget {
            let pause = self.window.saturating_sub(elapsed);
            debug!(
                consumed = window.consumed,
                budget = self.budget,
                pause_ms = pause.as_millis() as u64,
                "budget reached; pausing"
            );
            tokio::time::sleep(pause).await;
            window.started = Instant::now();
            window.consumed = 0.0;
        }
    }
}

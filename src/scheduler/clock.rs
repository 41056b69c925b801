// src/scheduler/clock.rs
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic time source for the event loop. The two-stage wait keeps the
/// loop accurate without pinning a core: `sleep_until` may hand the thread
/// back to the OS and undershoot, `spin_until` burns the last stretch.
pub trait Clock {
    fn now(&mut self) -> Instant;
    /// Coarse wait; may return before `deadline`.
    fn sleep_until(&mut self, deadline: Instant);
    /// Exact wait; returns at or fractionally after `deadline`.
    fn spin_until(&mut self, deadline: Instant);
}

/// Real wall-clock implementation.
#[derive(Debug, Clone)]
pub struct SystemClock {
    /// How much of the tail of every wait is busy-waited.
    pub spin_window: Duration,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { spin_window: Duration::from_micros(200) }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&mut self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&mut self, deadline: Instant) {
        let target = deadline - self.spin_window;
        loop {
            let now = Instant::now();
            if now >= target {
                return;
            }
            std::thread::sleep(target - now);
        }
    }

    fn spin_until(&mut self, deadline: Instant) {
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Test clock: waiting advances simulated time instantly. Cloned handles
/// share the same timeline, so a test can read the clock the scheduler is
/// driving.
#[derive(Debug, Clone)]
pub struct SimClock {
    now: Arc<Mutex<Instant>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self { now: Arc::new(Mutex::new(Instant::now())) }
    }

    pub fn current(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now(&mut self) -> Instant {
        self.current()
    }

    fn sleep_until(&mut self, deadline: Instant) {
        let mut now = self.now.lock().unwrap();
        if deadline > *now {
            *now = deadline;
        }
    }

    fn spin_until(&mut self, deadline: Instant) {
        self.sleep_until(deadline);
    }
}

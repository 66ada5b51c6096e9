/// Simulation clock supplied by the host loop
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    /// Monotonic tick time in seconds
    time: f64,
    /// Duration of the most recent tick
    delta: f32,
    /// Configured server tick rate in Hz (0 = uncapped)
    max_tick_rate: f32,
}

impl SimClock {
    pub fn new(max_tick_rate: f32) -> Self {
        Self {
            time: 0.0,
            delta: 0.0,
            max_tick_rate,
        }
    }

    /// Clock positioned at an explicit time (tests, replays)
    pub fn at(time: f64, delta: f32, max_tick_rate: f32) -> Self {
        Self {
            time,
            delta,
            max_tick_rate,
        }
    }

    /// Advance by one tick
    pub fn advance(&mut self, delta: f32) {
        debug_assert!(delta >= 0.0, "clock must be monotonic");
        self.delta = delta.max(0.0);
        self.time += self.delta as f64;
    }

    #[inline]
    pub fn now(&self) -> f64 {
        self.time
    }

    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta
    }

    /// Per-tick time budget, bounding the candidate-list throttle jitter
    pub fn server_tick_time(&self) -> f32 {
        if self.max_tick_rate > 0.0 {
            1.0 / self.max_tick_rate
        } else {
            self.delta
        }
    }
}

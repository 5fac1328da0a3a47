use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Display-refresh tick for the client reactor. Each tick is one opportunity
/// to recompute the viewport and run one bounded render batch; missed ticks
/// are skipped rather than replayed in a burst.
pub struct FrameClock {
    interval: Interval,
}

impl FrameClock {
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn ticks_are_spaced_by_the_period() {
        let started = Instant::now();
        let mut clock = FrameClock::new(Duration::from_millis(5));
        clock.tick().await;
        clock.tick().await;
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[test_timeout::timeout]
    fn zero_period_is_raised_to_one_millisecond() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        assert_eq!(FrameClock::new(Duration::ZERO).period(), Duration::from_millis(1));
    }
}

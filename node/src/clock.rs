use beecam_common::naming::Stamp;
use chrono::{Datelike, Local, NaiveDateTime};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Wall clock plus time since boot.
pub trait Clock: Send + Sync {
    /// Local time, `None` until the clock has been synchronized.
    fn now(&self) -> Option<NaiveDateTime>;
    fn uptime(&self) -> Duration;

    fn stamp(&self) -> Stamp {
        Stamp {
            wall: self.now(),
            uptime: self.uptime(),
        }
    }
}

/// System clock. Times before `min_valid_year` count as "not yet set",
/// which is what an RTC reads before the first NTP sync.
pub struct SystemClock {
    booted: Instant,
    min_valid_year: i32,
}

impl SystemClock {
    pub fn new(min_valid_year: i32) -> Self {
        Self {
            booted: Instant::now(),
            min_valid_year,
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Option<NaiveDateTime> {
        let now = Local::now().naive_local();
        (now.year() >= self.min_valid_year).then_some(now)
    }

    fn uptime(&self) -> Duration {
        self.booted.elapsed()
    }
}

/// Poll the clock until it reports a valid time or the retries run out.
/// Returns whether the clock is synchronized.
pub async fn wait_for_time_sync(clock: &dyn Clock, retries: u32, interval: Duration) -> bool {
    for attempt in 1..=retries {
        if let Some(now) = clock.now() {
            info!(time = %now, "system time is set");
            return true;
        }
        info!(attempt, retries, "waiting for system time to be set");
        tokio::time::sleep(interval).await;
    }
    let synced = clock.now().is_some();
    if !synced {
        warn!("system time not synchronized, filenames fall back to uptime");
    }
    synced
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Clock whose readings are set by the test.
    pub struct ManualClock {
        pub wall: Mutex<Option<NaiveDateTime>>,
        pub uptime: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn unsynced() -> Self {
            Self {
                wall: Mutex::new(None),
                uptime: Mutex::new(Duration::from_secs(7)),
            }
        }

        pub fn at(wall: NaiveDateTime) -> Self {
            let clock = Self::unsynced();
            *clock.wall.lock().unwrap() = Some(wall);
            clock
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Option<NaiveDateTime> {
            *self.wall.lock().unwrap()
        }

        fn uptime(&self) -> Duration {
            *self.uptime.lock().unwrap()
        }
    }
}

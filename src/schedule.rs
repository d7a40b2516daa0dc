//! Waiting for the alarm time
//!
//! The wall clock is polled once per minute, right after each minute
//! boundary, so the alarm fires within the first second of its minute.

use std::fmt;
use std::time::Duration;

use chrono::{Local, Timelike};

use crate::threading::{sleep_cancellable, CancelToken};

/// Hour and minute of the day the alarm rings at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmTime {
    pub hour: u32,
    pub minute: u32,
}

impl AlarmTime {
    pub fn is_due<T: Timelike>(&self, now: &T) -> bool {
        now.hour() == self.hour && now.minute() == self.minute
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Time left until the start of the next minute.
pub fn delay_until_next_check<T: Timelike>(now: &T) -> Duration {
    // leap seconds report second() == 59 with extra nanoseconds
    let second = now.second().min(59) as u64;
    let nanos = (now.nanosecond() % 1_000_000_000) as u64;
    Duration::from_secs(60 - second) - Duration::from_nanos(nanos)
}

/// Block until the local time matches `alarm`.
///
/// Returns `false` if `cancel` fired first.
pub fn wait_for_alarm(alarm: AlarmTime, cancel: &CancelToken) -> bool {
    wait_with(alarm, Local::now, |delay| sleep_cancellable(delay, cancel))
}

fn wait_with<T, C, S>(alarm: AlarmTime, mut clock: C, mut sleep: S) -> bool
where
    T: Timelike,
    C: FnMut() -> T,
    S: FnMut(Duration) -> bool,
{
    log::info!("waiting for alarm at {}", alarm);
    loop {
        let now = clock();
        if alarm.is_due(&now) {
            return true;
        }
        let delay = delay_until_next_check(&now);
        log::debug!(
            "{:02}:{:02}:{:02}, next check in {:?}",
            now.hour(),
            now.minute(),
            now.second(),
            delay
        );
        if !sleep(delay) {
            log::info!("alarm wait cancelled");
            return false;
        }
    }
}

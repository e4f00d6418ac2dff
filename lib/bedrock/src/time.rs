//! Clocks. Agents deal exclusively in monotonic nanoseconds; wall-clock
//! time appears only in file headers and error-log entries.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime};

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process. All agent
/// deadlines and liveness timeouts are computed against this clock.
#[inline]
pub fn nano_clock() -> i64 {
    let start = PROCESS_START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as i64
}

/// Milliseconds elapsed since 1970-01-01.
#[inline]
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as i64
}

/// Seconds elapsed since 1970-01-01.
#[inline]
pub fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs() as i64
}

/// A clock sampled once per duty cycle so hot loops do not call into the
/// OS for every timestamp comparison.
pub struct CachedNanoClock {
    now_ns: i64,
}

impl CachedNanoClock {
    #[inline]
    pub fn new() -> CachedNanoClock {
        CachedNanoClock { now_ns: nano_clock() }
    }

    #[inline]
    pub fn update(&mut self) -> i64 {
        self.now_ns = nano_clock();
        self.now_ns
    }

    #[inline]
    pub fn now_ns(&self) -> i64 {
        self.now_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nano_clock_is_monotonic() {
        let a = nano_clock();
        let b = nano_clock();
        assert!(b >= a);
    }

    #[test]
    fn test_cached_clock_advances_on_update() {
        let mut clock = CachedNanoClock::new();
        let first = clock.now_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(clock.update() > first);
        assert_eq!(clock.update(), clock.now_ns());
    }

    #[test]
    fn test_epoch() {
        // Repository written well after 2020.
        assert!(epoch_secs() > 1_577_836_800);
        assert!(epoch_ms() > 1_577_836_800_000);
    }
}

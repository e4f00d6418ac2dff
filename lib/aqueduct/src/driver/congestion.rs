//! Receiver-side congestion control: how large a window each status
//! message advertises, and when a window change alone justifies forcing
//! one out.

/// Outcome of a track-rebuild consultation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CongestionOutcome {
    pub window_length: i32,
    pub force_status_message: bool,
}

/// The "advance far enough to reconsider an SM" quantum.
#[inline]
pub fn threshold(window_length: i32) -> i32 {
    window_length / 4
}

pub trait CongestionControl: Send {
    /// Should the receiver send an RTT probe now?
    fn should_measure_rtt(&mut self, now_ns: i64) -> bool;

    fn on_rttm_sent(&mut self, now_ns: i64);

    fn on_rttm(&mut self, now_ns: i64, rtt_ns: i64);

    /// Consulted on every conductor rebuild pass.
    fn on_track_rebuild(
        &mut self,
        now_ns: i64,
        new_consumption_position: i64,
        last_sm_position: i64,
        hwm_position: i64,
        loss_occurred: bool,
    ) -> CongestionOutcome;

    fn initial_window_length(&self) -> i32;

    fn max_window_length(&self) -> i32;
}

/// Fixed window: `min(term_length / 2, initial_window)`. Never probes RTT,
/// never forces an SM.
pub struct StaticWindowCongestionControl {
    window_length: i32,
}

impl StaticWindowCongestionControl {
    pub fn new(initial_window_length: usize, term_length: usize) -> Self {
        StaticWindowCongestionControl {
            window_length: initial_window_length.min(term_length / 2) as i32,
        }
    }
}

impl CongestionControl for StaticWindowCongestionControl {
    fn should_measure_rtt(&mut self, _now_ns: i64) -> bool {
        false
    }

    fn on_rttm_sent(&mut self, _now_ns: i64) {}

    fn on_rttm(&mut self, _now_ns: i64, _rtt_ns: i64) {}

    fn on_track_rebuild(
        &mut self,
        _now_ns: i64,
        _new_consumption_position: i64,
        _last_sm_position: i64,
        _hwm_position: i64,
        _loss_occurred: bool,
    ) -> CongestionOutcome {
        CongestionOutcome {
            window_length: self.window_length,
            force_status_message: false,
        }
    }

    fn initial_window_length(&self) -> i32 {
        self.window_length
    }

    fn max_window_length(&self) -> i32 {
        self.window_length
    }
}

const CUBIC_C: f64 = 0.4;
const CUBIC_B: f64 = 0.2;
/// RTT assumed until the first measurement completes.
const INITIAL_RTT_NS: i64 = 10_000_000;
const RTT_MEASUREMENT_INTERVAL_NS: i64 = 1_000_000_000;
const SECOND_NS: f64 = 1_000_000_000.0;

/// TCP-cubic-like window in MTU units: multiplicative decrease on loss,
/// cubic recovery toward the pre-loss plateau, RTT-probed via RTTM echo.
pub struct CubicCongestionControl {
    mtu: i32,
    min_window: i32,
    max_window: i32,
    /// Current window in MTU units.
    cwnd: f64,
    /// Window before the last decrease, in MTU units.
    w_max: f64,
    /// Seconds until the cubic curve re-crosses `w_max`.
    k: f64,
    time_of_last_decrease_ns: i64,
    rtt_ns: i64,
    rtt_deadline_ns: i64,
    outstanding_rtt_probe: bool,
    last_window: i32,
}

impl CubicCongestionControl {
    pub fn new(mtu: usize, initial_window_length: usize, term_length: usize) -> Self {
        let max_window = initial_window_length.min(term_length / 2) as i32;
        let mtu = mtu as i32;
        let min_window = mtu;
        let initial_cwnd = ((max_window / mtu) as f64 / 2.0).max(2.0);

        let mut control = CubicCongestionControl {
            mtu,
            min_window,
            max_window,
            cwnd: initial_cwnd,
            w_max: (max_window / mtu) as f64,
            k: 0.0,
            time_of_last_decrease_ns: 0,
            rtt_ns: INITIAL_RTT_NS,
            rtt_deadline_ns: 0,
            outstanding_rtt_probe: false,
            last_window: 0,
        };
        control.k = Self::compute_k(control.w_max);
        control.last_window = control.window();
        control
    }

    #[inline]
    fn compute_k(w_max: f64) -> f64 {
        (w_max * CUBIC_B / CUBIC_C).cbrt()
    }

    #[inline]
    fn window(&self) -> i32 {
        ((self.cwnd * self.mtu as f64) as i32)
            .min(self.max_window)
            .max(self.min_window)
    }
}

impl CongestionControl for CubicCongestionControl {
    fn should_measure_rtt(&mut self, now_ns: i64) -> bool {
        !self.outstanding_rtt_probe && now_ns >= self.rtt_deadline_ns
    }

    fn on_rttm_sent(&mut self, now_ns: i64) {
        self.outstanding_rtt_probe = true;
        self.rtt_deadline_ns = now_ns + RTT_MEASUREMENT_INTERVAL_NS;
    }

    fn on_rttm(&mut self, _now_ns: i64, rtt_ns: i64) {
        self.outstanding_rtt_probe = false;
        self.rtt_ns = rtt_ns.max(1);
    }

    fn on_track_rebuild(
        &mut self,
        now_ns: i64,
        _new_consumption_position: i64,
        _last_sm_position: i64,
        _hwm_position: i64,
        loss_occurred: bool,
    ) -> CongestionOutcome {
        if loss_occurred {
            self.w_max = self.cwnd;
            self.k = Self::compute_k(self.w_max);
            self.cwnd = (self.cwnd * (1.0 - CUBIC_B)).max(1.0);
            self.time_of_last_decrease_ns = now_ns;
        } else {
            // One cubic step per RTT since the last decrease.
            let t = (now_ns - self.time_of_last_decrease_ns) as f64 / SECOND_NS;
            let target = CUBIC_C * (t - self.k).powi(3) + self.w_max;
            let max_cwnd = (self.max_window / self.mtu) as f64;
            if target > self.cwnd {
                // Pace growth by at most one MTU per RTT worth of elapsed
                // time, as cubic prescribes for the TCP-friendly region.
                self.cwnd = (self.cwnd + (target - self.cwnd).min(1.0)).min(max_cwnd);
            }
        }

        let window_length = self.window();
        let force = window_length != self.last_window;
        self.last_window = window_length;

        CongestionOutcome {
            window_length,
            force_status_message: force,
        }
    }

    fn initial_window_length(&self) -> i32 {
        self.min_window.max(self.mtu * 2)
    }

    fn max_window_length(&self) -> i32 {
        self.max_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_window_is_clamped_by_term() {
        let mut cc = StaticWindowCongestionControl::new(128 * 1024, 128 * 1024);
        assert_eq!(cc.max_window_length(), 64 * 1024);
        assert!(!cc.should_measure_rtt(0));

        let outcome = cc.on_track_rebuild(0, 0, 0, 0, true);
        assert_eq!(outcome.window_length, 64 * 1024);
        assert!(!outcome.force_status_message);
    }

    #[test]
    fn test_static_window_uses_initial_when_smaller() {
        let cc = StaticWindowCongestionControl::new(32 * 1024, 1024 * 1024);
        assert_eq!(cc.max_window_length(), 32 * 1024);
    }

    #[test]
    fn test_cubic_decreases_on_loss() {
        let mut cc = CubicCongestionControl::new(1408, 128 * 1024, 1024 * 1024);

        let before = cc.on_track_rebuild(0, 0, 0, 0, false).window_length;
        let after = cc.on_track_rebuild(1, 0, 0, 0, true).window_length;

        assert!(after < before, "window {} not below {}", after, before);
        assert!(after >= 1408);
    }

    #[test]
    fn test_cubic_recovers_after_loss() {
        let mut cc = CubicCongestionControl::new(1408, 128 * 1024, 1024 * 1024);

        cc.on_track_rebuild(0, 0, 0, 0, true);
        let shrunk = cc.on_track_rebuild(1, 0, 0, 0, false).window_length;

        let mut now = 0i64;
        let mut last = shrunk;
        for _ in 0..1000 {
            now += 100_000_000;
            last = cc.on_track_rebuild(now, 0, 0, 0, false).window_length;
        }

        assert!(last > shrunk, "window {} never recovered past {}", last, shrunk);
        assert!(last <= cc.max_window_length());
    }

    #[test]
    fn test_cubic_forces_sm_on_material_change() {
        let mut cc = CubicCongestionControl::new(1408, 128 * 1024, 1024 * 1024);

        cc.on_track_rebuild(0, 0, 0, 0, false);
        let outcome = cc.on_track_rebuild(1, 0, 0, 0, true);
        assert!(outcome.force_status_message);

        // Stable window does not force.
        let outcome = cc.on_track_rebuild(2, 0, 0, 0, false);
        let stable = cc.on_track_rebuild(3, 0, 0, 0, false);
        assert_eq!(outcome.window_length, stable.window_length);
        assert!(!stable.force_status_message);
    }

    #[test]
    fn test_cubic_rtt_probe_cadence() {
        let mut cc = CubicCongestionControl::new(1408, 128 * 1024, 1024 * 1024);

        assert!(cc.should_measure_rtt(0));
        cc.on_rttm_sent(0);
        assert!(!cc.should_measure_rtt(1));

        cc.on_rttm(500_000, 500_000);
        assert!(!cc.should_measure_rtt(500_001));
        assert!(cc.should_measure_rtt(RTT_MEASUREMENT_INTERVAL_NS + 1));
    }
}

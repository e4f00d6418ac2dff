use crate::concurrent::buffer::AtomicBuffer;
use crate::logbuffer::gap_scanner::{self, Gap};

/// How long to sit on a detected gap before asking for feedback, giving
/// reordered datagrams a chance to fill it quietly.
pub trait FeedbackDelayGenerator: Send {
    fn generate_delay_ns(&mut self) -> i64;

    /// True for receivers that should NAK the moment a gap is seen.
    fn should_feedback_immediately(&self) -> bool {
        false
    }
}

pub struct StaticDelayGenerator {
    delay_ns: i64,
    immediate: bool,
}

impl StaticDelayGenerator {
    pub fn new(delay_ns: i64, immediate: bool) -> StaticDelayGenerator {
        StaticDelayGenerator { delay_ns, immediate }
    }
}

impl FeedbackDelayGenerator for StaticDelayGenerator {
    fn generate_delay_ns(&mut self) -> i64 {
        self.delay_ns
    }

    fn should_feedback_immediately(&self) -> bool {
        self.immediate
    }
}

/// Tracks the first gap of a partially rebuilt term and decides when it
/// has aged enough to warrant feedback (a NAK, or a local gap fill on
/// unreliable streams).
pub struct LossDetector {
    delay_generator: Box<dyn FeedbackDelayGenerator>,
    active_gap: Option<Gap>,
    deadline_ns: i64,
}

impl LossDetector {
    pub fn new(delay_generator: Box<dyn FeedbackDelayGenerator>) -> LossDetector {
        LossDetector {
            delay_generator,
            active_gap: None,
            deadline_ns: 0,
        }
    }

    /// Scan the term between the rebuild offset and the high-water offset.
    /// Returns `(loss_found, gap_to_report)`: `loss_found` is true when any
    /// gap exists; the gap is returned only when its feedback timer fired.
    pub fn scan(
        &mut self,
        term: &AtomicBuffer,
        term_id: i32,
        rebuild_offset: usize,
        hwm_offset: usize,
        now_ns: i64,
    ) -> (bool, Option<Gap>) {
        match gap_scanner::scan_for_gap(term, term_id, rebuild_offset, hwm_offset) {
            None => {
                self.active_gap = None;
                (false, None)
            }
            Some(gap) => {
                if self.active_gap != Some(gap) {
                    self.active_gap = Some(gap);
                    if self.delay_generator.should_feedback_immediately() {
                        self.deadline_ns = now_ns;
                    } else {
                        self.deadline_ns = now_ns + self.delay_generator.generate_delay_ns();
                    }
                }

                if now_ns >= self.deadline_ns {
                    // Re-arm so an unanswered NAK is repeated.
                    self.deadline_ns = now_ns + self.delay_generator.generate_delay_ns();
                    (true, Some(gap))
                } else {
                    (true, None)
                }
            }
        }
    }
}

//! Sender-side flow control: turn the stream of status messages from
//! receivers into a single sender limit.

use crate::NULL_VALUE;

/// Strategy consulted by the sender on every status message and once per
/// duty cycle for receiver-timeout housekeeping.
pub trait FlowControl: Send {
    /// A status message arrived. `position` is the flow-controlled
    /// position it advertises and `window` the receiver window beyond it.
    /// Returns the new sender limit.
    fn on_status_message(
        &mut self,
        receiver_id: i64,
        position: i64,
        window: i32,
        group_tag: Option<i64>,
        now_ns: i64,
        current_limit: i64,
    ) -> i64;

    /// Periodic housekeeping; drops receivers silent past the timeout and
    /// returns the possibly revised limit.
    fn on_idle(&mut self, now_ns: i64, current_limit: i64) -> i64;

    /// True while enough receivers are tracked for the stream to count as
    /// connected.
    fn has_required_receivers(&self) -> bool;
}

struct TrackedReceiver {
    receiver_id: i64,
    last_position: i64,
    last_position_plus_window: i64,
    time_of_last_sm_ns: i64,
}

fn track(
    receivers: &mut Vec<TrackedReceiver>,
    receiver_id: i64,
    position: i64,
    window: i32,
    now_ns: i64,
) {
    match receivers.iter_mut().find(|r| r.receiver_id == receiver_id) {
        Some(receiver) => {
            receiver.last_position = position.max(receiver.last_position);
            receiver.last_position_plus_window = position + window as i64;
            receiver.time_of_last_sm_ns = now_ns;
        }
        None => receivers.push(TrackedReceiver {
            receiver_id,
            last_position: position,
            last_position_plus_window: position + window as i64,
            time_of_last_sm_ns: now_ns,
        }),
    }
}

fn min_limit(receivers: &[TrackedReceiver]) -> Option<i64> {
    receivers
        .iter()
        .map(|r| r.last_position_plus_window)
        .min()
}

fn evict_silent(receivers: &mut Vec<TrackedReceiver>, now_ns: i64, timeout_ns: i64) {
    receivers.retain(|r| now_ns - r.time_of_last_sm_ns < timeout_ns);
}

/// Unicast: the limit is the minimum across every receiver that has
/// spoken recently.
pub struct UnicastFlowControl {
    receivers: Vec<TrackedReceiver>,
    receiver_timeout_ns: i64,
}

impl UnicastFlowControl {
    pub fn new(receiver_timeout_ns: i64) -> UnicastFlowControl {
        UnicastFlowControl {
            receivers: Vec::new(),
            receiver_timeout_ns,
        }
    }
}

impl FlowControl for UnicastFlowControl {
    fn on_status_message(
        &mut self,
        receiver_id: i64,
        position: i64,
        window: i32,
        _group_tag: Option<i64>,
        now_ns: i64,
        _current_limit: i64,
    ) -> i64 {
        track(&mut self.receivers, receiver_id, position, window, now_ns);
        min_limit(&self.receivers).expect("receiver was just tracked")
    }

    fn on_idle(&mut self, now_ns: i64, current_limit: i64) -> i64 {
        evict_silent(&mut self.receivers, now_ns, self.receiver_timeout_ns);
        min_limit(&self.receivers).unwrap_or(current_limit)
    }

    fn has_required_receivers(&self) -> bool {
        !self.receivers.is_empty()
    }
}

/// Multicast min: identical aggregation, but the group can legitimately
/// shrink to zero without the limit collapsing (the stream idles at the
/// last limit until receivers return).
pub struct MinMulticastFlowControl {
    receivers: Vec<TrackedReceiver>,
    receiver_timeout_ns: i64,
}

impl MinMulticastFlowControl {
    pub fn new(receiver_timeout_ns: i64) -> MinMulticastFlowControl {
        MinMulticastFlowControl {
            receivers: Vec::new(),
            receiver_timeout_ns,
        }
    }
}

impl FlowControl for MinMulticastFlowControl {
    fn on_status_message(
        &mut self,
        receiver_id: i64,
        position: i64,
        window: i32,
        _group_tag: Option<i64>,
        now_ns: i64,
        _current_limit: i64,
    ) -> i64 {
        track(&mut self.receivers, receiver_id, position, window, now_ns);
        min_limit(&self.receivers).expect("receiver was just tracked")
    }

    fn on_idle(&mut self, now_ns: i64, current_limit: i64) -> i64 {
        evict_silent(&mut self.receivers, now_ns, self.receiver_timeout_ns);
        min_limit(&self.receivers).unwrap_or(current_limit)
    }

    fn has_required_receivers(&self) -> bool {
        !self.receivers.is_empty()
    }
}

/// Tagged multicast: only receivers carrying the matching group tag pace
/// the stream, and the stream is connected only once `group_min_size`
/// of them are present.
pub struct TaggedMulticastFlowControl {
    receivers: Vec<TrackedReceiver>,
    group_tag: i64,
    group_min_size: usize,
    receiver_timeout_ns: i64,
}

impl TaggedMulticastFlowControl {
    pub fn new(group_tag: i64, group_min_size: usize, receiver_timeout_ns: i64) -> Self {
        TaggedMulticastFlowControl {
            receivers: Vec::new(),
            group_tag,
            group_min_size,
            receiver_timeout_ns,
        }
    }
}

impl FlowControl for TaggedMulticastFlowControl {
    fn on_status_message(
        &mut self,
        receiver_id: i64,
        position: i64,
        window: i32,
        group_tag: Option<i64>,
        now_ns: i64,
        current_limit: i64,
    ) -> i64 {
        if group_tag == Some(self.group_tag) {
            track(&mut self.receivers, receiver_id, position, window, now_ns);
        }
        min_limit(&self.receivers).unwrap_or(current_limit)
    }

    fn on_idle(&mut self, now_ns: i64, current_limit: i64) -> i64 {
        evict_silent(&mut self.receivers, now_ns, self.receiver_timeout_ns);
        min_limit(&self.receivers).unwrap_or(current_limit)
    }

    fn has_required_receivers(&self) -> bool {
        self.receivers.len() >= self.group_min_size
    }
}

/// Receiver id carried in our own outbound status messages.
#[inline]
pub fn null_receiver_id() -> i64 {
    NULL_VALUE
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: i32 = 64 * 1024;
    const TIMEOUT: i64 = 2_000_000_000;

    #[test]
    fn test_unicast_single_receiver_sets_limit() {
        let mut fc = UnicastFlowControl::new(TIMEOUT);
        let limit = fc.on_status_message(1, 1000, WINDOW, None, 0, 0);

        assert_eq!(limit, 1000 + WINDOW as i64);
        assert!(fc.has_required_receivers());
    }

    #[test]
    fn test_unicast_min_across_receivers() {
        let mut fc = UnicastFlowControl::new(TIMEOUT);
        fc.on_status_message(1, 5000, WINDOW, None, 0, 0);
        let limit = fc.on_status_message(2, 1000, WINDOW, None, 0, 0);

        assert_eq!(limit, 1000 + WINDOW as i64);
    }

    #[test]
    fn test_unicast_silent_receiver_is_evicted() {
        let mut fc = UnicastFlowControl::new(TIMEOUT);
        fc.on_status_message(1, 1000, WINDOW, None, 0, 0);
        fc.on_status_message(2, 9000, WINDOW, None, TIMEOUT - 1, 0);

        // Receiver 1 is now past the timeout; the limit recovers to
        // receiver 2's window.
        let limit = fc.on_idle(TIMEOUT + 1, 0);
        assert_eq!(limit, 9000 + WINDOW as i64);
        assert!(fc.has_required_receivers());

        // And with everyone silent the limit holds at its last value.
        let limit = fc.on_idle(TIMEOUT * 3, limit);
        assert_eq!(limit, 9000 + WINDOW as i64);
        assert!(!fc.has_required_receivers());
    }

    #[test]
    fn test_tagged_ignores_foreign_tags() {
        let mut fc = TaggedMulticastFlowControl::new(7, 1, TIMEOUT);

        let limit = fc.on_status_message(1, 1000, WINDOW, Some(9), 0, 0);
        assert_eq!(limit, 0);
        assert!(!fc.has_required_receivers());

        let limit = fc.on_status_message(2, 2000, WINDOW, Some(7), 0, 0);
        assert_eq!(limit, 2000 + WINDOW as i64);
        assert!(fc.has_required_receivers());
    }

    #[test]
    fn test_tagged_group_min_size_gates_connection() {
        let mut fc = TaggedMulticastFlowControl::new(7, 2, TIMEOUT);

        fc.on_status_message(1, 1000, WINDOW, Some(7), 0, 0);
        assert!(!fc.has_required_receivers());

        fc.on_status_message(2, 1000, WINDOW, Some(7), 0, 0);
        assert!(fc.has_required_receivers());
    }

    #[test]
    fn test_multicast_min_tracks_slowest() {
        let mut fc = MinMulticastFlowControl::new(TIMEOUT);
        fc.on_status_message(1, 10_000, WINDOW, None, 0, 0);
        fc.on_status_message(2, 4_000, WINDOW, None, 0, 0);
        let limit = fc.on_status_message(1, 12_000, WINDOW, None, 0, 0);

        assert_eq!(limit, 4_000 + WINDOW as i64);
    }
}

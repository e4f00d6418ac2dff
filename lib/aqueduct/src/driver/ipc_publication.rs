use crate::concurrent::position::Position;
use crate::driver::system_counters::SystemCounters;
use crate::logbuffer::log::LogBuffers;
use crate::logbuffer::{descriptor, unblocker};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpcPublicationState {
    Active,
    Inactive,
    Linger,
    Done,
}

/// Shared-memory publication: same log invariants as the network flavour
/// with no sender, no loss and no flow control. The publisher limit tracks
/// the slowest subscriber plus the term window. Conductor-owned outright,
/// so fields are plain.
pub struct IpcPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub term_window_length: usize,
    pub position_bits_to_shift: u32,

    log: Arc<LogBuffers>,
    pub publisher_limit: Position,
    pub publisher_position: Position,
    counters: Arc<SystemCounters>,

    state: IpcPublicationState,
    time_of_last_state_change_ns: i64,

    // Blocked-producer detection.
    last_consumer_position: i64,
    time_of_last_consumer_update_ns: i64,
    clean_position: i64,
}

const CLEAN_INCREMENT: usize = 16 * 1024;

impl IpcPublication {
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        term_window_length: usize,
        log: Arc<LogBuffers>,
        publisher_limit: Position,
        publisher_position: Position,
        counters: Arc<SystemCounters>,
        now_ns: i64,
    ) -> IpcPublication {
        let term_length = log.term_length();

        IpcPublication {
            registration_id,
            session_id,
            stream_id,
            initial_term_id,
            term_length,
            term_window_length,
            position_bits_to_shift: descriptor::position_bits_to_shift(term_length),
            log,
            publisher_limit,
            publisher_position,
            counters,
            state: IpcPublicationState::Active,
            time_of_last_state_change_ns: now_ns,
            last_consumer_position: 0,
            time_of_last_consumer_update_ns: now_ns,
            clean_position: 0,
        }
    }

    #[inline]
    pub fn log_file(&self) -> String {
        self.log.path().display().to_string()
    }

    #[inline]
    pub fn log(&self) -> &Arc<LogBuffers> {
        &self.log
    }

    #[inline]
    pub fn state(&self) -> IpcPublicationState {
        self.state
    }

    pub fn set_state(&mut self, state: IpcPublicationState, now_ns: i64) {
        self.state = state;
        self.time_of_last_state_change_ns = now_ns;
    }

    #[inline]
    pub fn time_of_last_state_change_ns(&self) -> i64 {
        self.time_of_last_state_change_ns
    }

    pub fn producer_position(&self) -> i64 {
        let metadata = self.log.metadata();
        let term_count = descriptor::active_term_count(&metadata);
        let index = descriptor::index_by_term_count(term_count as i64);
        let raw_tail = descriptor::raw_tail_volatile(&metadata, index);

        descriptor::compute_position(
            descriptor::term_id_from_raw_tail(raw_tail),
            descriptor::term_offset_from_raw_tail(raw_tail, self.term_length),
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }

    /// Limit the publisher to one window past the slowest subscriber.
    /// Returns true when the limit moved.
    pub fn update_publisher_limit(&mut self, min_subscriber_position: i64) -> bool {
        self.publisher_position.set_ordered(self.producer_position());

        let proposed = min_subscriber_position + self.term_window_length as i64;
        if self.publisher_limit.get() != proposed {
            self.publisher_limit.set_ordered(proposed);
            true
        } else {
            false
        }
    }

    /// Zero retired term space behind the slowest subscriber, bounded per
    /// conductor cycle.
    pub fn clean_buffer(&mut self, consumed_position: i64) {
        let target = consumed_position - self.term_length as i64;
        if target <= self.clean_position {
            return;
        }

        let index = descriptor::index_by_position(self.clean_position, self.position_bits_to_shift);
        let offset = descriptor::compute_term_offset_from_position(
            self.clean_position,
            self.position_bits_to_shift,
        ) as usize;
        let length = CLEAN_INCREMENT
            .min(self.term_length - offset)
            .min((target - self.clean_position) as usize);

        self.log.term_buffer(index).set_memory(offset, length, 0);
        self.clean_position += length as i64;
    }

    /// Track consumer progress for blocked-producer detection.
    pub fn on_consumer_position(&mut self, min_subscriber_position: i64, now_ns: i64) {
        if min_subscriber_position != self.last_consumer_position {
            self.last_consumer_position = min_subscriber_position;
            self.time_of_last_consumer_update_ns = now_ns;
        }
    }

    /// A producer is possibly blocked only when it sits ahead of the
    /// consumers AND the consumers have stalled past the timeout. The term
    /// count alone is not enough: it also moves during a legitimate
    /// rotation.
    pub fn is_possibly_blocked(&self, now_ns: i64, unblock_timeout_ns: i64) -> bool {
        let producer = self.producer_position();
        producer > self.last_consumer_position
            && now_ns - self.time_of_last_consumer_update_ns >= unblock_timeout_ns
    }

    /// Pad over the stalled claim at the consumer position.
    pub fn unblock(&mut self) -> bool {
        let consumer_position = self.last_consumer_position;
        let producer_position = self.producer_position();
        if producer_position <= consumer_position {
            return false;
        }

        let index = descriptor::index_by_position(consumer_position, self.position_bits_to_shift);
        let blocked_offset = descriptor::compute_term_offset_from_position(
            consumer_position,
            self.position_bits_to_shift,
        ) as usize;
        let term_id = descriptor::compute_term_id_from_position(
            consumer_position,
            self.position_bits_to_shift,
            self.initial_term_id,
        );

        let term_begin = consumer_position - blocked_offset as i64;
        let tail_offset =
            ((producer_position - term_begin).min(self.term_length as i64)).max(0) as usize;

        let unblocked = unblocker::unblock(
            &self.log.term_buffer(index),
            blocked_offset,
            tail_offset,
            term_id,
            self.session_id,
            self.stream_id,
        )
        .is_some();

        if unblocked {
            self.counters.unblocked_publications.increment();
        }

        unblocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::concurrent::counters::{CountersManager, COUNTER_LENGTH, METADATA_LENGTH};
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;
    use crate::logbuffer::frame;

    struct Fixture {
        _dir: tempfile::TempDir,
        _metadata: OwnedBuffer,
        _values: OwnedBuffer,
        publication: IpcPublication,
    }

    fn make_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            LogBuffers::create(&dir.path().join("ipc.logbuffer"), TERM_MIN_LENGTH, 0, 1408, 9)
                .unwrap(),
        );

        let metadata = OwnedBuffer::new(64 * METADATA_LENGTH);
        let values = OwnedBuffer::new(64 * COUNTER_LENGTH);
        let mut manager = CountersManager::new(metadata.buffer(), values.buffer(), 0);
        let counters = Arc::new(SystemCounters::allocate(&mut manager, 0).unwrap());
        let pub_lim_id = manager.allocate(1, &[], "pub-lmt", 0).unwrap();
        let pub_lim = manager.position(pub_lim_id);
        let pub_pos_id = manager.allocate(12, &[], "pub-pos", 0).unwrap();
        let pub_pos = manager.position(pub_pos_id);

        let publication = IpcPublication::new(
            9,
            7,
            1001,
            0,
            TERM_MIN_LENGTH / 2,
            log,
            pub_lim,
            pub_pos,
            counters,
            0,
        );

        Fixture {
            _dir: dir,
            _metadata: metadata,
            _values: values,
            publication,
        }
    }

    #[test]
    fn test_limit_tracks_slowest_subscriber() {
        let mut fixture = make_fixture();

        assert!(fixture.publication.update_publisher_limit(1024));
        assert_eq!(
            fixture.publication.publisher_limit.get(),
            1024 + (TERM_MIN_LENGTH / 2) as i64
        );
        assert!(!fixture.publication.update_publisher_limit(1024));
    }

    #[test]
    fn test_blocked_detection_needs_both_conditions() {
        let mut fixture = make_fixture();
        let timeout = 1_000;

        // Producer ahead, consumers fresh: not blocked.
        let metadata = fixture.publication.log().metadata();
        metadata.put_i64(descriptor::tail_counter_offset(0), descriptor::pack_tail(0, 256));
        fixture.publication.on_consumer_position(0, 0);
        assert!(!fixture.publication.is_possibly_blocked(500, timeout));

        // Consumers stalled past the timeout: blocked.
        assert!(fixture.publication.is_possibly_blocked(1_500, timeout));

        // Consumer moved: timer resets.
        fixture.publication.on_consumer_position(128, 1_600);
        assert!(!fixture.publication.is_possibly_blocked(2_000, timeout));
    }

    #[test]
    fn test_unblock_pads_claim() {
        let mut fixture = make_fixture();

        let metadata = fixture.publication.log().metadata();
        metadata.put_i64(descriptor::tail_counter_offset(0), descriptor::pack_tail(0, 512));
        fixture.publication.on_consumer_position(0, 0);

        assert!(fixture.publication.unblock());

        let term = fixture.publication.log().term_buffer(0);
        assert!(frame::is_padding_frame(&term, 0));
        assert_eq!(frame::frame_length_volatile(&term, 0), 512);
    }

    #[test]
    fn test_state_machine() {
        let mut fixture = make_fixture();
        assert_eq!(fixture.publication.state(), IpcPublicationState::Active);

        fixture.publication.set_state(IpcPublicationState::Inactive, 5);
        assert_eq!(fixture.publication.state(), IpcPublicationState::Inactive);
        assert_eq!(fixture.publication.time_of_last_state_change_ns(), 5);
    }
}

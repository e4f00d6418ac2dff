use crate::concurrent::position::Position;
use crate::driver::congestion::{threshold, CongestionControl};
use crate::driver::loss_detector::LossDetector;
use crate::driver::system_counters::SystemCounters;
use crate::logbuffer::log::LogBuffers;
use crate::logbuffer::{descriptor, frame, rebuilder};
use crate::protocol;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

/// Receive-side image lifecycle. The receiver drives ACTIVE→INACTIVE on
/// loss of activity; the conductor drives the tail of the machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ImageState {
    Init = 0,
    Active = 1,
    Inactive = 2,
    Linger = 3,
    Done = 4,
}

impl ImageState {
    #[inline]
    fn from_u32(raw: u32) -> ImageState {
        match raw {
            0 => ImageState::Init,
            1 => ImageState::Active,
            2 => ImageState::Inactive,
            3 => ImageState::Linger,
            _ => ImageState::Done,
        }
    }
}

/// Liveness and end-of-stream tracking for one transport feeding this
/// image (several when the subscription is multi-destination).
pub struct ImageConnection {
    in_use: AtomicBool,
    eos: AtomicBool,
    eos_position: AtomicI64,
    time_of_last_frame_ns: AtomicI64,
}

impl ImageConnection {
    fn new() -> ImageConnection {
        ImageConnection {
            in_use: AtomicBool::new(false),
            eos: AtomicBool::new(false),
            eos_position: AtomicI64::new(crate::NULL_POSITION),
            time_of_last_frame_ns: AtomicI64::new(0),
        }
    }
}

pub const MAX_CONNECTIONS: usize = 4;

/// Per-source inbound stream state: the rebuilt term log, flow-control
/// window bookkeeping and the two-counter channels through which the
/// conductor hands SM and loss work to the receiver.
///
/// Thread roles: the receiver inserts packets and emits SM/NAK; the
/// conductor rebuild-tracks, consults congestion control and manages
/// lifecycle. Every cross-role field is atomic.
pub struct PublicationImage {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub mtu: usize,
    pub position_bits_to_shift: u32,
    pub reliable: bool,
    pub source_identity: String,

    log: Arc<LogBuffers>,
    hwm_position: Position,
    rebuild_position: Position,
    counters: Arc<SystemCounters>,

    state: AtomicU32,
    time_of_last_packet_ns: AtomicI64,
    time_of_last_state_change_ns: AtomicI64,

    // Status-message release channel (conductor → receiver).
    begin_sm_change: AtomicI64,
    end_sm_change: AtomicI64,
    next_sm_position: AtomicI64,
    next_sm_window: AtomicI64,
    last_sm_change_applied: AtomicI64,
    time_of_last_sm_schedule_ns: AtomicI64,

    // Window state maintained by the receiver as SMs go out.
    last_sm_position: AtomicI64,
    last_sm_window_limit: AtomicI64,
    next_receiver_window: AtomicI64,

    // Loss release channel (conductor → receiver).
    begin_loss_change: AtomicI64,
    end_loss_change: AtomicI64,
    loss_term_id: AtomicI64,
    loss_term_offset: AtomicI64,
    loss_length: AtomicI64,
    last_loss_change_applied: AtomicI64,

    // RTT measurement plumbing (conductor ⇄ receiver).
    rtt_measure_requested: AtomicBool,
    rtt_pending: AtomicBool,
    last_rtt_ns: AtomicI64,

    connections: [ImageConnection; MAX_CONNECTIONS],
    is_end_of_stream: AtomicBool,
    end_of_stream_position: AtomicI64,
    clean_position: AtomicI64,
}

/// Zeroing behind the consumers is bounded per conductor cycle.
const CLEAN_INCREMENT: usize = 16 * 1024;

impl PublicationImage {
    pub fn new(
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        initial_term_offset: i32,
        initial_window_length: i32,
        reliable: bool,
        source_identity: String,
        log: Arc<LogBuffers>,
        hwm_position: Position,
        rebuild_position: Position,
        counters: Arc<SystemCounters>,
        now_ns: i64,
    ) -> PublicationImage {
        let term_length = log.term_length();
        let bits = descriptor::position_bits_to_shift(term_length);
        let initial_position =
            descriptor::compute_position(active_term_id, initial_term_offset, bits, initial_term_id);

        hwm_position.set_ordered(initial_position);
        rebuild_position.set_ordered(initial_position);

        let image = PublicationImage {
            correlation_id,
            session_id,
            stream_id,
            initial_term_id,
            term_length,
            mtu: descriptor::mtu_length(&log.metadata()),
            position_bits_to_shift: bits,
            reliable,
            source_identity,
            log,
            hwm_position,
            rebuild_position,
            counters,
            state: AtomicU32::new(ImageState::Init as u32),
            time_of_last_packet_ns: AtomicI64::new(now_ns),
            time_of_last_state_change_ns: AtomicI64::new(now_ns),
            begin_sm_change: AtomicI64::new(-1),
            end_sm_change: AtomicI64::new(-1),
            next_sm_position: AtomicI64::new(initial_position),
            next_sm_window: AtomicI64::new(initial_window_length as i64),
            last_sm_change_applied: AtomicI64::new(-1),
            time_of_last_sm_schedule_ns: AtomicI64::new(now_ns),
            last_sm_position: AtomicI64::new(initial_position),
            last_sm_window_limit: AtomicI64::new(initial_position + initial_window_length as i64),
            next_receiver_window: AtomicI64::new(initial_window_length as i64),
            begin_loss_change: AtomicI64::new(-1),
            end_loss_change: AtomicI64::new(-1),
            loss_term_id: AtomicI64::new(0),
            loss_term_offset: AtomicI64::new(0),
            loss_length: AtomicI64::new(0),
            last_loss_change_applied: AtomicI64::new(-1),
            rtt_measure_requested: AtomicBool::new(false),
            rtt_pending: AtomicBool::new(false),
            last_rtt_ns: AtomicI64::new(0),
            connections: [
                ImageConnection::new(),
                ImageConnection::new(),
                ImageConnection::new(),
                ImageConnection::new(),
            ],
            is_end_of_stream: AtomicBool::new(false),
            end_of_stream_position: AtomicI64::new(i64::MAX),
            clean_position: AtomicI64::new(initial_position),
        };

        image.connections[0].in_use.store(true, Ordering::Release);
        image
    }

    #[inline]
    pub fn log_file(&self) -> String {
        self.log.path().display().to_string()
    }

    /// Remove the backing file once the image reaches end of life.
    #[inline]
    pub fn delete_log(&self) {
        self.log.delete_file();
    }

    #[inline]
    pub fn state(&self) -> ImageState {
        ImageState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ImageState, now_ns: i64) {
        self.time_of_last_state_change_ns.store(now_ns, Ordering::Relaxed);
        self.state.store(state as u32, Ordering::Release);
    }

    #[inline]
    pub fn time_of_last_state_change_ns(&self) -> i64 {
        self.time_of_last_state_change_ns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn activate(&self, now_ns: i64) {
        self.set_state(ImageState::Active, now_ns);
    }

    /// Receiver: drop from dispatch and hand lifecycle to the conductor.
    #[inline]
    pub fn if_active_go_inactive(&self, now_ns: i64) {
        if self.state() == ImageState::Active {
            self.set_state(ImageState::Inactive, now_ns);
        }
    }

    #[inline]
    pub fn hwm_position(&self) -> i64 {
        self.hwm_position.get_volatile()
    }

    #[inline]
    pub fn rebuild_position(&self) -> i64 {
        self.rebuild_position.get_volatile()
    }

    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.is_end_of_stream.load(Ordering::Acquire)
    }

    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        self.end_of_stream_position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_activity(&self, now_ns: i64, timeout_ns: i64) -> bool {
        now_ns - self.time_of_last_packet_ns.load(Ordering::Acquire) < timeout_ns
    }

    /// Receiver keeps dispatching to this image while it is live and the
    /// stream has not both ended and been fully rebuilt.
    pub fn has_activity_and_not_end_of_stream(&self, now_ns: i64, timeout_ns: i64) -> bool {
        if !self.has_activity(now_ns, timeout_ns) {
            return false;
        }
        if self.is_end_of_stream()
            && self.rebuild_position.get_volatile() >= self.end_of_stream_position()
        {
            return false;
        }
        true
    }

    /// Attach an additional transport (multi-destination subscription).
    /// Returns the transport index, or `None` when the table is full.
    pub fn add_connection(&self) -> Option<usize> {
        for (index, connection) in self.connections.iter().enumerate() {
            if !connection.in_use.load(Ordering::Acquire) {
                connection.eos.store(false, Ordering::Relaxed);
                connection.in_use.store(true, Ordering::Release);
                return Some(index);
            }
        }
        None
    }

    // --- Receiver thread ---------------------------------------------------

    /// Insert one DATA/PAD/heartbeat frame. Returns bytes accepted.
    pub fn insert_packet(
        &self,
        term_id: i32,
        term_offset: i32,
        packet: &[u8],
        transport_index: usize,
        now_ns: i64,
    ) -> usize {
        let packet_position = descriptor::compute_position(
            term_id,
            term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let is_heartbeat = protocol::is_heartbeat(packet, packet.len());
        let is_padding = protocol::header::frame_type(packet) == protocol::HDR_TYPE_PAD;

        // A PAD travels as header-only but its length field covers the
        // whole padded region; the wire bytes alone gate flow control.
        let proposed_position = if is_heartbeat {
            packet_position
        } else {
            packet_position + packet.len() as i64
        };
        let advance_position = if is_padding {
            packet_position
                + frame::aligned_frame_length(protocol::header::frame_length(packet)) as i64
        } else {
            proposed_position
        };

        if proposed_position > self.last_sm_window_limit.load(Ordering::Acquire) {
            self.counters.flow_control_over_runs.increment();
            return 0;
        }

        let last_sm_position = self.last_sm_position.load(Ordering::Acquire);
        if packet_position < last_sm_position {
            // A late retransmit inside the previous window is still
            // useful; anything older is an under-run.
            let tolerance = self.next_receiver_window.load(Ordering::Acquire);
            if last_sm_position - packet_position > tolerance {
                self.counters.flow_control_under_runs.increment();
                return 0;
            }
        }

        self.time_of_last_packet_ns.store(now_ns, Ordering::Release);
        if let Some(connection) = self.connections.get(transport_index) {
            connection.time_of_last_frame_ns.store(now_ns, Ordering::Release);
        }

        if is_heartbeat {
            self.counters.heartbeats_received.increment();
            if protocol::is_end_of_stream(packet) {
                self.on_end_of_stream(transport_index, packet_position);
            }
            self.hwm_position.propose_max_ordered(packet_position);
            return 0;
        }

        let index = descriptor::index_by_term(self.initial_term_id, term_id);
        rebuilder::insert(&self.log.term_buffer(index), term_offset as usize, packet);
        self.hwm_position.propose_max_ordered(advance_position);

        packet.len()
    }

    fn on_end_of_stream(&self, transport_index: usize, packet_position: i64) {
        if let Some(connection) = self.connections.get(transport_index) {
            connection.eos.store(true, Ordering::Release);
            connection.eos_position.store(packet_position, Ordering::Release);
        }

        let mut all_eos = true;
        let mut max_eos_position = packet_position;
        for connection in self.connections.iter() {
            if connection.in_use.load(Ordering::Acquire) {
                if !connection.eos.load(Ordering::Acquire) {
                    all_eos = false;
                } else {
                    max_eos_position =
                        max_eos_position.max(connection.eos_position.load(Ordering::Acquire));
                }
            }
        }

        if all_eos {
            self.end_of_stream_position.store(max_eos_position, Ordering::Release);
            self.is_end_of_stream.store(true, Ordering::Release);
            descriptor::set_end_of_stream_position(&self.log.metadata(), max_eos_position);
        }
    }

    /// Receiver: collect a scheduled status message if one is pending and
    /// was published completely. Updates the window bookkeeping on the
    /// assumption the caller sends it.
    pub fn poll_status_message(&self, now_ns: i64) -> Option<(i64, i32)> {
        let end = self.end_sm_change.load(Ordering::Acquire);
        if end == self.last_sm_change_applied.load(Ordering::Relaxed) {
            return None;
        }

        let position = self.next_sm_position.load(Ordering::Acquire);
        let window = self.next_sm_window.load(Ordering::Acquire);

        if self.begin_sm_change.load(Ordering::Acquire) != end {
            // Conductor is mid-publish; pick it up next cycle.
            return None;
        }

        self.last_sm_change_applied.store(end, Ordering::Relaxed);
        self.last_sm_position.store(position, Ordering::Release);
        self.last_sm_window_limit.store(position + window, Ordering::Release);
        self.next_receiver_window.store(window, Ordering::Release);
        self.time_of_last_packet_ns.store(now_ns, Ordering::Release);
        self.counters.status_messages_sent.increment();

        Some((position, window as i32))
    }

    /// Receiver: collect pending loss feedback. Reliable images get the
    /// gap back for a NAK; unreliable ones have it padded over locally.
    pub fn poll_loss(&self) -> Option<(i32, i32, i32)> {
        let end = self.end_loss_change.load(Ordering::Acquire);
        if end == self.last_loss_change_applied.load(Ordering::Relaxed) {
            return None;
        }

        let term_id = self.loss_term_id.load(Ordering::Acquire) as i32;
        let term_offset = self.loss_term_offset.load(Ordering::Acquire) as i32;
        let length = self.loss_length.load(Ordering::Acquire) as i32;

        if self.begin_loss_change.load(Ordering::Acquire) != end {
            return None;
        }

        self.last_loss_change_applied.store(end, Ordering::Relaxed);

        if self.reliable {
            self.counters.naks_sent.increment();
            Some((term_id, term_offset, length))
        } else {
            self.fill_gap(term_id, term_offset, length);
            None
        }
    }

    fn fill_gap(&self, term_id: i32, term_offset: i32, length: i32) {
        let index = descriptor::index_by_term(self.initial_term_id, term_id);
        let term = self.log.term_buffer(index);
        frame::write_header(
            &term,
            term_offset as usize,
            protocol::HDR_TYPE_PAD,
            protocol::BEGIN_AND_END_FLAGS,
            term_offset,
            self.session_id,
            self.stream_id,
            term_id,
        );
        frame::set_frame_length_ordered(&term, term_offset as usize, length);
    }

    /// Receiver: should an RTT probe go out now?
    pub fn take_rtt_measure_request(&self) -> bool {
        self.rtt_measure_requested.swap(false, Ordering::AcqRel)
    }

    /// Receiver: a reply to our probe came back.
    pub fn on_rtt_reply(&self, now_ns: i64, echo_timestamp_ns: i64, reception_delta_ns: i64) {
        let rtt = (now_ns - echo_timestamp_ns - reception_delta_ns).max(0);
        self.last_rtt_ns.store(rtt, Ordering::Release);
        self.rtt_pending.store(true, Ordering::Release);
    }

    // --- Conductor thread --------------------------------------------------

    /// Advance the rebuild position over newly contiguous frames, detect
    /// loss and decide whether a status message is due.
    pub fn track_rebuild(
        &self,
        now_ns: i64,
        sm_timeout_ns: i64,
        min_subscriber_position: i64,
        max_subscriber_position: i64,
        congestion: &mut dyn CongestionControl,
        loss_detector: &mut LossDetector,
    ) {
        if self.rtt_pending.swap(false, Ordering::AcqRel) {
            congestion.on_rttm(now_ns, self.last_rtt_ns.load(Ordering::Acquire));
        }
        if congestion.should_measure_rtt(now_ns) {
            congestion.on_rttm_sent(now_ns);
            self.rtt_measure_requested.store(true, Ordering::Release);
        }

        let hwm = self.hwm_position.get_volatile();
        let rebuild_position = self.rebuild_position.get().max(max_subscriber_position);

        let index = descriptor::index_by_position(rebuild_position, self.position_bits_to_shift);
        let rebuild_offset =
            descriptor::compute_term_offset_from_position(rebuild_position, self.position_bits_to_shift)
                as usize;
        let term_id = descriptor::compute_term_id_from_position(
            rebuild_position,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let term = self.log.term_buffer(index);

        // High-water offset within this term.
        let term_begin = rebuild_position - rebuild_offset as i64;
        let hwm_offset = ((hwm - term_begin).min(self.term_length as i64).max(0)) as usize;

        let (loss_found, gap) =
            loss_detector.scan(&term, term_id, rebuild_offset, hwm_offset, now_ns);

        // Contiguous advance up to the first gap (or the hwm).
        let contiguous_limit = gap.map(|g| g.term_offset).unwrap_or(hwm_offset);
        let mut new_offset = rebuild_offset;
        while new_offset < contiguous_limit {
            let frame_length = frame::frame_length_volatile(&term, new_offset);
            if frame_length <= 0 {
                break;
            }
            new_offset += frame::aligned_frame_length(frame_length) as usize;
        }
        self.rebuild_position
            .propose_max_ordered(term_begin + new_offset as i64);

        if let Some(gap) = gap {
            self.publish_loss(gap.term_id, gap.term_offset as i32, gap.length as i32);
        }

        let outcome = congestion.on_track_rebuild(
            now_ns,
            min_subscriber_position,
            self.next_sm_position.load(Ordering::Relaxed),
            hwm,
            loss_found,
        );

        let sm_due = outcome.force_status_message
            || now_ns - self.time_of_last_sm_schedule_ns.load(Ordering::Relaxed) > sm_timeout_ns
            || min_subscriber_position
                > self.next_sm_position.load(Ordering::Relaxed) + threshold(outcome.window_length) as i64;

        if sm_due {
            self.schedule_status_message(now_ns, min_subscriber_position, outcome.window_length);
        }
    }

    /// Two-stage release so the receiver never reads a torn
    /// (position, window) pair.
    pub fn schedule_status_message(&self, now_ns: i64, position: i64, window: i32) {
        let change = self.begin_sm_change.load(Ordering::Relaxed) + 1;
        self.begin_sm_change.store(change, Ordering::Release);
        self.next_sm_position.store(position, Ordering::Release);
        self.next_sm_window.store(window as i64, Ordering::Release);
        self.end_sm_change.store(change, Ordering::Release);
        self.time_of_last_sm_schedule_ns.store(now_ns, Ordering::Relaxed);
    }

    fn publish_loss(&self, term_id: i32, term_offset: i32, length: i32) {
        let change = self.begin_loss_change.load(Ordering::Relaxed) + 1;
        self.begin_loss_change.store(change, Ordering::Release);
        self.loss_term_id.store(term_id as i64, Ordering::Release);
        self.loss_term_offset.store(term_offset as i64, Ordering::Release);
        self.loss_length.store(length as i64, Ordering::Release);
        self.end_loss_change.store(change, Ordering::Release);
    }

    /// Zero retired term space a bounded chunk at a time, keeping
    /// `clean_position >= consumed - term_length` so a term is always
    /// zeroed before its next cycle of reuse.
    pub fn clean_buffer(&self, consumed_position: i64) {
        let clean = self.clean_position.load(Ordering::Relaxed);
        let target = consumed_position - self.term_length as i64;
        if target <= clean {
            return;
        }

        let index = descriptor::index_by_position(clean, self.position_bits_to_shift);
        let offset =
            descriptor::compute_term_offset_from_position(clean, self.position_bits_to_shift) as usize;
        let length = CLEAN_INCREMENT
            .min(self.term_length - offset)
            .min((target - clean) as usize);

        self.log.term_buffer(index).set_memory(offset, length, 0);
        self.clean_position.store(clean + length as i64, Ordering::Relaxed);
    }

    /// Have all subscribers consumed everything that was rebuilt?
    pub fn is_drained(&self, subscriber_positions: &[Position]) -> bool {
        let rebuild = self.rebuild_position.get_volatile();
        subscriber_positions
            .iter()
            .all(|position| position.get_volatile() >= rebuild)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::concurrent::counters::{CountersManager, CountersReader, COUNTER_LENGTH, METADATA_LENGTH};
    use crate::driver::congestion::StaticWindowCongestionControl;
    use crate::driver::loss_detector::StaticDelayGenerator;
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;

    const SESSION_ID: i32 = 7;
    const STREAM_ID: i32 = 1001;
    const INITIAL_TERM_ID: i32 = 3;
    const WINDOW: i32 = 128 * 1024;

    struct Fixture {
        _dir: tempfile::TempDir,
        _metadata: OwnedBuffer,
        _values: OwnedBuffer,
        reader: CountersReader,
        counters: Arc<SystemCounters>,
        image: PublicationImage,
    }

    fn make_fixture(reliable: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            LogBuffers::create(
                &dir.path().join("image.logbuffer"),
                TERM_MIN_LENGTH,
                INITIAL_TERM_ID,
                1408,
                99,
            )
            .unwrap(),
        );

        let metadata = OwnedBuffer::new(64 * METADATA_LENGTH);
        let values = OwnedBuffer::new(64 * COUNTER_LENGTH);
        let mut manager = CountersManager::new(metadata.buffer(), values.buffer(), 0);
        let counters = Arc::new(SystemCounters::allocate(&mut manager, 0).unwrap());
        let hwm_id = manager.allocate(3, &[], "rcv-hwm", 0).unwrap();
        let rebuild_id = manager.allocate(5, &[], "rcv-pos", 0).unwrap();
        let reader = CountersReader::new(metadata.buffer(), values.buffer());

        let image = PublicationImage::new(
            99,
            SESSION_ID,
            STREAM_ID,
            INITIAL_TERM_ID,
            INITIAL_TERM_ID,
            0,
            WINDOW,
            reliable,
            "127.0.0.1:54321".to_string(),
            log,
            manager.position(hwm_id),
            manager.position(rebuild_id),
            counters.clone(),
            0,
        );

        Fixture {
            _dir: dir,
            _metadata: metadata,
            _values: values,
            reader,
            counters,
            image,
        }
    }

    fn data_frame(term_id: i32, term_offset: i32, payload_len: usize) -> Vec<u8> {
        let frame_length = protocol::header::LENGTH + payload_len;
        let mut packet = vec![7u8; frame_length];
        protocol::header::encode(
            &mut packet,
            protocol::HDR_TYPE_DATA,
            protocol::BEGIN_AND_END_FLAGS,
            frame_length as i32,
            term_offset,
            SESSION_ID,
            STREAM_ID,
            term_id,
        );
        packet
    }

    fn heartbeat(term_id: i32, term_offset: i32, flags: u8) -> Vec<u8> {
        let mut packet = vec![0u8; protocol::header::LENGTH];
        protocol::header::encode(
            &mut packet,
            protocol::HDR_TYPE_DATA,
            flags,
            protocol::header::LENGTH as i32,
            term_offset,
            SESSION_ID,
            STREAM_ID,
            term_id,
        );
        packet
    }

    #[test]
    fn test_insert_advances_hwm() {
        let fixture = make_fixture(true);
        let packet = data_frame(INITIAL_TERM_ID, 0, 96);

        let accepted = fixture.image.insert_packet(INITIAL_TERM_ID, 0, &packet, 0, 1);

        assert_eq!(accepted, packet.len());
        assert_eq!(fixture.image.hwm_position(), packet.len() as i64);
    }

    #[test]
    fn test_overrun_is_rejected_and_counted() {
        let fixture = make_fixture(true);
        // Two terms ahead: position 163840, well past the 131072 window.
        let packet = data_frame(INITIAL_TERM_ID + 2, 32768, 96);

        let accepted = fixture
            .image
            .insert_packet(INITIAL_TERM_ID + 2, 32768, &packet, 0, 1);

        assert_eq!(accepted, 0);
        assert_eq!(fixture.image.hwm_position(), 0);
        assert_eq!(
            fixture
                .reader
                .counter_value(fixture.counters.flow_control_over_runs.id()),
            1
        );
    }

    #[test]
    fn test_track_rebuild_advances_over_contiguous_prefix() {
        let fixture = make_fixture(true);
        let image = &fixture.image;

        let first = data_frame(INITIAL_TERM_ID, 0, 96);
        let second = data_frame(INITIAL_TERM_ID, 128, 96);
        image.insert_packet(INITIAL_TERM_ID, 0, &first, 0, 1);
        image.insert_packet(INITIAL_TERM_ID, 128, &second, 0, 1);

        let mut cc = StaticWindowCongestionControl::new(WINDOW as usize, TERM_MIN_LENGTH);
        let mut loss = LossDetector::new(Box::new(StaticDelayGenerator::new(0, true)));
        image.track_rebuild(2, 200_000_000, 0, 0, &mut cc, &mut loss);

        assert_eq!(image.rebuild_position(), 256);
    }

    #[test]
    fn test_gap_is_published_and_nakked_when_reliable() {
        let fixture = make_fixture(true);
        let image = &fixture.image;

        let first = data_frame(INITIAL_TERM_ID, 0, 96);
        let third = data_frame(INITIAL_TERM_ID, 256, 96);
        image.insert_packet(INITIAL_TERM_ID, 0, &first, 0, 1);
        image.insert_packet(INITIAL_TERM_ID, 256, &third, 0, 1);

        let mut cc = StaticWindowCongestionControl::new(WINDOW as usize, TERM_MIN_LENGTH);
        let mut loss = LossDetector::new(Box::new(StaticDelayGenerator::new(0, true)));
        image.track_rebuild(2, 200_000_000, 0, 0, &mut cc, &mut loss);

        // Rebuild halts at the gap; the gap is released to the receiver.
        assert_eq!(image.rebuild_position(), 128);
        assert_eq!(image.poll_loss(), Some((INITIAL_TERM_ID, 128, 128)));
        // Consumed exactly once.
        assert_eq!(image.poll_loss(), None);
    }

    #[test]
    fn test_gap_is_filled_locally_when_unreliable() {
        let fixture = make_fixture(false);
        let image = &fixture.image;

        let first = data_frame(INITIAL_TERM_ID, 0, 96);
        let third = data_frame(INITIAL_TERM_ID, 256, 96);
        image.insert_packet(INITIAL_TERM_ID, 0, &first, 0, 1);
        image.insert_packet(INITIAL_TERM_ID, 256, &third, 0, 1);

        let mut cc = StaticWindowCongestionControl::new(WINDOW as usize, TERM_MIN_LENGTH);
        let mut loss = LossDetector::new(Box::new(StaticDelayGenerator::new(0, true)));
        image.track_rebuild(2, 200_000_000, 0, 0, &mut cc, &mut loss);

        assert_eq!(image.poll_loss(), None);

        // The pad is in place; the next pass rebuilds through it.
        image.track_rebuild(3, 200_000_000, 0, 0, &mut cc, &mut loss);
        assert_eq!(image.rebuild_position(), 256 + 128);
    }

    #[test]
    fn test_status_message_release_protocol() {
        let fixture = make_fixture(true);
        let image = &fixture.image;

        assert_eq!(image.poll_status_message(1), None);

        image.schedule_status_message(2, 4096, WINDOW);
        assert_eq!(image.poll_status_message(3), Some((4096, WINDOW)));
        // Single consumption per schedule.
        assert_eq!(image.poll_status_message(4), None);

        // Window bookkeeping moved with the SM.
        let packet = data_frame(INITIAL_TERM_ID, 0, 96);
        let accepted = image.insert_packet(INITIAL_TERM_ID, 0, &packet, 0, 5);
        assert_eq!(accepted, packet.len(), "late frame within window tolerated");
    }

    #[test]
    fn test_eos_across_transports() {
        let fixture = make_fixture(true);
        let image = &fixture.image;
        let second = image.add_connection().unwrap();

        image.insert_packet(INITIAL_TERM_ID, 0, &heartbeat(INITIAL_TERM_ID, 0, protocol::EOS_FLAG), 0, 1);
        assert!(!image.is_end_of_stream());

        image.insert_packet(
            INITIAL_TERM_ID,
            0,
            &heartbeat(INITIAL_TERM_ID, 0, protocol::EOS_FLAG),
            second,
            2,
        );
        assert!(image.is_end_of_stream());
        assert_eq!(image.end_of_stream_position(), 0);
    }

    #[test]
    fn test_state_machine_transitions() {
        let fixture = make_fixture(true);
        let image = &fixture.image;

        assert_eq!(image.state(), ImageState::Init);
        image.activate(1);
        assert_eq!(image.state(), ImageState::Active);

        image.if_active_go_inactive(2);
        assert_eq!(image.state(), ImageState::Inactive);
        assert_eq!(image.time_of_last_state_change_ns(), 2);

        // Idempotent once out of ACTIVE.
        image.if_active_go_inactive(3);
        assert_eq!(image.time_of_last_state_change_ns(), 2);
    }

    #[test]
    fn test_activity_tracking() {
        let fixture = make_fixture(true);
        let image = &fixture.image;
        let timeout = 1_000;

        let packet = data_frame(INITIAL_TERM_ID, 0, 96);
        image.insert_packet(INITIAL_TERM_ID, 0, &packet, 0, 100);

        assert!(image.has_activity(500, timeout));
        assert!(!image.has_activity(2_000, timeout));
    }
}

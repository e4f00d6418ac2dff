use crate::concurrent::position::Position;
use crate::driver::destination::DestinationTracker;
use crate::driver::endpoint::UdpTransport;
use crate::driver::system_counters::SystemCounters;
use crate::logbuffer::log::LogBuffers;
use crate::logbuffer::{descriptor, scanner, unblocker};
use crate::protocol;
use crate::error::DriverResult;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PublicationState {
    Active = 0,
    /// Last external reference dropped; followers get to catch up.
    Draining = 1,
    /// Fully drained (or timed out); held for late joiners.
    Linger = 2,
    Done = 3,
}

impl PublicationState {
    #[inline]
    fn from_u32(raw: u32) -> PublicationState {
        match raw {
            0 => PublicationState::Active,
            1 => PublicationState::Draining,
            2 => PublicationState::Linger,
            _ => PublicationState::Done,
        }
    }
}

/// Zeroing behind the consumer is bounded per duty cycle so a large term
/// never stalls the conductor.
const CLEAN_INCREMENT: usize = 16 * 1024;

/// Timer state the sender keeps per publication, outside the shared
/// struct because only the sender thread touches it.
pub struct SenderTimers {
    pub time_of_last_heartbeat_ns: i64,
    pub time_of_last_setup_ns: i64,
}

impl SenderTimers {
    pub fn new() -> SenderTimers {
        SenderTimers {
            time_of_last_heartbeat_ns: i64::MIN / 2,
            time_of_last_setup_ns: i64::MIN / 2,
        }
    }
}

/// Outbound stream state shared between the sender (send path) and the
/// conductor (lifecycle, limits, cleaning). All cross-thread fields are
/// atomics; strategy objects live with the sender.
pub struct NetworkPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub term_length: usize,
    pub term_window_length: usize,
    pub mtu: usize,
    pub ttl: u32,
    pub position_bits_to_shift: u32,

    log: Arc<LogBuffers>,
    pub publisher_limit: Position,
    pub publisher_position: Position,
    pub sender_position: Position,
    pub sender_limit: Position,
    counters: Arc<SystemCounters>,

    state: AtomicU32,
    time_of_last_state_change_ns: AtomicI64,
    time_of_last_sm_ns: AtomicI64,
    has_receivers: AtomicBool,
    has_initial_connection: AtomicBool,
    trigger_setup: AtomicBool,
    is_end_of_stream: AtomicBool,
    has_sender_released: AtomicBool,
    clean_position: AtomicI64,
}

impl NetworkPublication {
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        term_window_length: usize,
        ttl: u32,
        log: Arc<LogBuffers>,
        publisher_limit: Position,
        publisher_position: Position,
        sender_position: Position,
        sender_limit: Position,
        counters: Arc<SystemCounters>,
        now_ns: i64,
    ) -> NetworkPublication {
        let term_length = log.term_length();
        let mtu = descriptor::mtu_length(&log.metadata());

        NetworkPublication {
            registration_id,
            session_id,
            stream_id,
            initial_term_id,
            term_length,
            term_window_length,
            mtu,
            ttl,
            position_bits_to_shift: descriptor::position_bits_to_shift(term_length),
            log,
            publisher_limit,
            publisher_position,
            sender_position,
            sender_limit,
            counters,
            state: AtomicU32::new(PublicationState::Active as u32),
            time_of_last_state_change_ns: AtomicI64::new(now_ns),
            time_of_last_sm_ns: AtomicI64::new(now_ns),
            has_receivers: AtomicBool::new(false),
            has_initial_connection: AtomicBool::new(false),
            trigger_setup: AtomicBool::new(false),
            is_end_of_stream: AtomicBool::new(false),
            has_sender_released: AtomicBool::new(false),
            clean_position: AtomicI64::new(0),
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
    pub fn state(&self) -> PublicationState {
        PublicationState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PublicationState, now_ns: i64) {
        self.time_of_last_state_change_ns.store(now_ns, Ordering::Relaxed);
        self.state.store(state as u32, Ordering::Release);
    }

    #[inline]
    pub fn time_of_last_state_change_ns(&self) -> i64 {
        self.time_of_last_state_change_ns.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn time_of_last_status_message_ns(&self) -> i64 {
        self.time_of_last_sm_ns.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_receivers(&self) -> bool {
        self.has_receivers.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_sender_released(&self) -> bool {
        self.has_sender_released.load(Ordering::Acquire)
    }

    /// Sender: final act before dropping its entry.
    #[inline]
    pub fn sender_release(&self) {
        self.has_sender_released.store(true, Ordering::Release);
    }

    /// Conductor: the stream is ending; the sender advertises EOS on its
    /// heartbeats from here on.
    #[inline]
    pub fn signal_end_of_stream(&self) {
        self.is_end_of_stream.store(true, Ordering::Release);
    }

    /// Stream position the publisher has claimed up to.
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

    // --- Sender thread -----------------------------------------------------

    /// One duty-cycle send pass: stream new bytes within the window, else
    /// keep the stream alive with setup/heartbeat emission.
    pub fn send(
        &self,
        transport: &UdpTransport,
        destinations: &mut DestinationTracker,
        timers: &mut SenderTimers,
        setup_interval_ns: i64,
        heartbeat_interval_ns: i64,
        now_ns: i64,
    ) -> DriverResult<usize> {
        let snd_pos = self.sender_position.get();
        let limit = self.sender_limit.get_volatile();
        let term_offset =
            descriptor::compute_term_offset_from_position(snd_pos, self.position_bits_to_shift) as usize;
        let available_window = (limit - snd_pos).max(0) as usize;

        let mut bytes_sent = 0;

        if available_window > 0 {
            let index = descriptor::index_by_position(snd_pos, self.position_bits_to_shift);
            let term = self.log.term_buffer(index);
            let outcome =
                scanner::scan_for_availability(&term, term_offset, available_window.min(self.mtu));

            if outcome.available > 0 {
                let sent = destinations.send(
                    transport,
                    term.as_slice(term_offset, outcome.available),
                    now_ns,
                )?;

                if sent == outcome.available {
                    bytes_sent = sent;
                    self.sender_position
                        .set_ordered(snd_pos + (outcome.available + outcome.padding) as i64);
                } else {
                    self.counters.short_sends.increment();
                }
            }
        }

        if bytes_sent == 0 {
            self.send_control_frames(
                transport,
                destinations,
                timers,
                setup_interval_ns,
                heartbeat_interval_ns,
                now_ns,
                snd_pos,
            )?;
        }

        Ok(bytes_sent)
    }

    fn send_control_frames(
        &self,
        transport: &UdpTransport,
        destinations: &mut DestinationTracker,
        timers: &mut SenderTimers,
        setup_interval_ns: i64,
        heartbeat_interval_ns: i64,
        now_ns: i64,
        snd_pos: i64,
    ) -> DriverResult<()> {
        let term_id = descriptor::compute_term_id_from_position(
            snd_pos,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let term_offset =
            descriptor::compute_term_offset_from_position(snd_pos, self.position_bits_to_shift);

        let setup_wanted = !self.has_initial_connection.load(Ordering::Acquire)
            || self.trigger_setup.load(Ordering::Acquire);
        if setup_wanted && now_ns - timers.time_of_last_setup_ns >= setup_interval_ns {
            timers.time_of_last_setup_ns = now_ns;
            self.trigger_setup.store(false, Ordering::Release);

            let mut buf = [0u8; protocol::setup::LENGTH];
            protocol::setup::encode(
                &mut buf,
                self.session_id,
                self.stream_id,
                term_id,
                term_offset,
                self.initial_term_id,
                self.term_length as i32,
                self.mtu as i32,
                self.ttl as i32,
            );
            destinations.send(transport, &buf, now_ns)?;
            self.counters.setups_sent.increment();
            return Ok(());
        }

        if self.has_initial_connection.load(Ordering::Acquire)
            && now_ns - timers.time_of_last_heartbeat_ns >= heartbeat_interval_ns
        {
            timers.time_of_last_heartbeat_ns = now_ns;

            let flags = if self.is_end_of_stream.load(Ordering::Acquire) {
                protocol::BEGIN_AND_END_FLAGS | protocol::EOS_FLAG
            } else {
                protocol::BEGIN_AND_END_FLAGS
            };

            let mut buf = [0u8; protocol::header::LENGTH];
            protocol::header::encode(
                &mut buf,
                protocol::HDR_TYPE_DATA,
                flags,
                protocol::header::LENGTH as i32,
                term_offset,
                self.session_id,
                self.stream_id,
                term_id,
            );
            destinations.send(transport, &buf, now_ns)?;
            self.counters.heartbeats_sent.increment();
        }

        Ok(())
    }

    /// Sender: a status message was attributed to this publication. The
    /// caller already ran it through flow control; `new_limit` is the
    /// outcome.
    pub fn on_status_message(&self, new_limit: i64, elicit_setup: bool, now_ns: i64) {
        self.time_of_last_sm_ns.store(now_ns, Ordering::Release);
        self.has_initial_connection.store(true, Ordering::Release);
        self.has_receivers.store(true, Ordering::Release);
        descriptor::set_is_connected(&self.log.metadata(), true);
        self.counters.status_messages_received.increment();

        if elicit_setup {
            self.trigger_setup.store(true, Ordering::Release);
        }

        if new_limit > self.sender_limit.get() {
            self.sender_limit.set_ordered(new_limit);
        }
    }

    /// Sender: flow-control housekeeping concluded nobody is listening.
    pub fn on_receivers_gone(&self) {
        self.has_receivers.store(false, Ordering::Release);
        descriptor::set_is_connected(&self.log.metadata(), false);
    }

    /// Sender: retransmit `[term_offset, term_offset + length)` of
    /// `term_id`, chunked on frame boundaries within the MTU.
    pub fn retransmit(
        &self,
        transport: &UdpTransport,
        destinations: &mut DestinationTracker,
        term_id: i32,
        term_offset: i32,
        length: i32,
        now_ns: i64,
    ) -> DriverResult<usize> {
        self.counters.naks_received.increment();

        let nak_position = descriptor::compute_position(
            term_id,
            term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let snd_pos = self.sender_position.get();

        // Nothing sent there yet, or the term has already been recycled.
        if nak_position >= snd_pos || snd_pos - nak_position > 2 * self.term_length as i64 {
            return Ok(0);
        }

        let index = descriptor::index_by_term(self.initial_term_id, term_id);
        let term = self.log.term_buffer(index);
        let resend_end = (term_offset as usize + length as usize).min(self.term_length);

        let mut offset = term_offset as usize;
        let mut bytes = 0;
        while offset < resend_end {
            let outcome =
                scanner::scan_for_availability(&term, offset, self.mtu.min(resend_end - offset));
            if outcome.available == 0 {
                break;
            }

            let sent = destinations.send(transport, term.as_slice(offset, outcome.available), now_ns)?;
            if sent < outcome.available {
                self.counters.short_sends.increment();
                break;
            }

            bytes += sent;
            offset += outcome.available + outcome.padding;
        }

        if bytes > 0 {
            self.counters.retransmits_sent.increment();
            self.counters.retransmitted_bytes.get_and_add(bytes as i64);
        }

        Ok(bytes)
    }

    /// Sender: answer an RTT probe; replies are handed to flow control by
    /// the caller.
    pub fn on_rtt_measurement(
        &self,
        transport: &UdpTransport,
        src: &std::net::SocketAddr,
        echo_timestamp_ns: i64,
        is_reply: bool,
        now_ns: i64,
    ) -> DriverResult<()> {
        if is_reply {
            return Ok(());
        }

        let mut buf = [0u8; protocol::rttm::LENGTH];
        protocol::rttm::encode(
            &mut buf,
            protocol::REPLY_FLAG,
            self.session_id,
            self.stream_id,
            echo_timestamp_ns,
            now_ns - echo_timestamp_ns,
            crate::NULL_VALUE,
        );
        transport.send_to(&buf, src)?;

        Ok(())
    }

    // --- Conductor thread --------------------------------------------------

    /// Refresh the publisher-facing counters. Returns true when the limit
    /// moved (work was done).
    pub fn update_publisher_limit(&self) -> bool {
        let snd_pos = self.sender_position.get_volatile();
        self.publisher_position.set_ordered(self.producer_position());

        // Publishers may run one window ahead of the sender, connected or
        // not; an unconnected stream is bounded the same way.
        let proposed = snd_pos + self.term_window_length as i64;

        if self.publisher_limit.get() != proposed {
            self.publisher_limit.set_ordered(proposed);
            true
        } else {
            false
        }
    }

    /// Zero retired term space a bounded chunk at a time, keeping
    /// `clean_position >= consumed - term_length`.
    pub fn clean_buffer(&self, consumed_position: i64) {
        let clean = self.clean_position.load(Ordering::Relaxed);
        let target = consumed_position - self.term_length as i64;
        if target <= clean {
            return;
        }

        let index = descriptor::index_by_position(clean, self.position_bits_to_shift);
        let offset =
            descriptor::compute_term_offset_from_position(clean, self.position_bits_to_shift) as usize;
        let length = (CLEAN_INCREMENT)
            .min(self.term_length - offset)
            .min((target - clean) as usize);

        self.log.term_buffer(index).set_memory(offset, length, 0);
        self.clean_position.store(clean + length as i64, Ordering::Relaxed);
    }

    /// Conductor back-pressure escape: pad over a stalled claim at the
    /// sender position so the stream can advance.
    pub fn unblock_at_consumer_position(&self) -> bool {
        let consumer_position = self.sender_position.get_volatile();
        let producer_position = self.producer_position();
        if producer_position <= consumer_position {
            return false;
        }

        let index = descriptor::index_by_position(consumer_position, self.position_bits_to_shift);
        let blocked_offset =
            descriptor::compute_term_offset_from_position(consumer_position, self.position_bits_to_shift)
                as usize;
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
    use crate::logbuffer::appender::TermAppender;
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;
    use crate::logbuffer::frame;

    const SESSION_ID: i32 = 7;
    const STREAM_ID: i32 = 1001;
    const INITIAL_TERM_ID: i32 = 0;
    const WINDOW: usize = TERM_MIN_LENGTH / 2;

    struct Fixture {
        _dir: tempfile::TempDir,
        _metadata: OwnedBuffer,
        _values: OwnedBuffer,
        publication: NetworkPublication,
        transport: UdpTransport,
        receiver: UdpTransport,
        destinations: DestinationTracker,
        timers: SenderTimers,
    }

    fn make_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            LogBuffers::create(
                &dir.path().join("pub.logbuffer"),
                TERM_MIN_LENGTH,
                INITIAL_TERM_ID,
                1408,
                5,
            )
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
        let snd_pos_id = manager.allocate(2, &[], "snd-pos", 0).unwrap();
        let snd_pos = manager.position(snd_pos_id);
        let snd_lmt_id = manager.allocate(9, &[], "snd-lmt", 0).unwrap();
        let snd_lmt = manager.position(snd_lmt_id);

        let publication = NetworkPublication::new(
            5,
            SESSION_ID,
            STREAM_ID,
            INITIAL_TERM_ID,
            WINDOW,
            0,
            log,
            pub_lim,
            pub_pos,
            snd_pos,
            snd_lmt,
            counters,
            0,
        );

        let transport = UdpTransport::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver = UdpTransport::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let destinations = DestinationTracker::single(receiver.local_addr());

        Fixture {
            _dir: dir,
            _metadata: metadata,
            _values: values,
            publication,
            transport,
            receiver,
            destinations,
            timers: SenderTimers::new(),
        }
    }

    fn append(publication: &NetworkPublication, payload_len: usize) {
        let appender = TermAppender::new(
            publication.log().term_buffer(0),
            publication.log().metadata(),
            0,
        );
        appender
            .append_unfragmented(SESSION_ID, STREAM_ID, &vec![5u8; payload_len], 1376)
            .unwrap();
    }

    fn recv_one(receiver: &UdpTransport) -> Option<Vec<u8>> {
        let mut buf = [0u8; 2048];
        for _ in 0..1000 {
            if let Some((len, _)) = receiver.recv_from(&mut buf).unwrap() {
                return Some(buf[..len].to_vec());
            }
            std::thread::yield_now();
        }
        None
    }

    #[test]
    fn test_send_streams_appended_frames() {
        let mut fixture = make_fixture();
        append(&fixture.publication, 100);

        fixture.publication.sender_limit.set_ordered(WINDOW as i64);
        let sent = fixture
            .publication
            .send(&fixture.transport, &mut fixture.destinations, &mut fixture.timers, 0, 0, 1)
            .unwrap();

        let aligned = frame::aligned_frame_length((frame::HEADER_LENGTH + 100) as i32) as usize;
        assert_eq!(sent, aligned);
        assert_eq!(fixture.publication.sender_position.get(), aligned as i64);

        let datagram = recv_one(&fixture.receiver).expect("frame on the wire");
        assert_eq!(protocol::header::session_id(&datagram), SESSION_ID);
        assert_eq!(protocol::header::frame_length(&datagram), (frame::HEADER_LENGTH + 100) as i32);
    }

    #[test]
    fn test_send_respects_sender_limit() {
        let mut fixture = make_fixture();
        append(&fixture.publication, 100);

        // Window closed: nothing flows, and with no connection yet the
        // publication emits a SETUP instead.
        let sent = fixture
            .publication
            .send(
                &fixture.transport,
                &mut fixture.destinations,
                &mut fixture.timers,
                1_000_000,
                1_000_000,
                1,
            )
            .unwrap();

        assert_eq!(sent, 0);
        let datagram = recv_one(&fixture.receiver).expect("setup expected");
        assert_eq!(protocol::header::frame_type(&datagram), protocol::HDR_TYPE_SETUP);
        assert_eq!(protocol::setup::term_length(&datagram), TERM_MIN_LENGTH as i32);
    }

    #[test]
    fn test_heartbeat_after_connection() {
        let mut fixture = make_fixture();
        fixture.publication.on_status_message(WINDOW as i64, false, 1);

        let sent = fixture
            .publication
            .send(
                &fixture.transport,
                &mut fixture.destinations,
                &mut fixture.timers,
                1_000_000,
                1_000_000,
                2_000_000,
            )
            .unwrap();

        assert_eq!(sent, 0);
        let datagram = recv_one(&fixture.receiver).expect("heartbeat expected");
        assert!(protocol::is_heartbeat(&datagram, datagram.len()));
        assert!(!protocol::is_end_of_stream(&datagram));
    }

    #[test]
    fn test_eos_heartbeat_when_draining() {
        let mut fixture = make_fixture();
        fixture.publication.on_status_message(WINDOW as i64, false, 1);
        fixture.publication.signal_end_of_stream();

        fixture
            .publication
            .send(
                &fixture.transport,
                &mut fixture.destinations,
                &mut fixture.timers,
                1_000_000,
                1_000_000,
                2_000_000,
            )
            .unwrap();

        let datagram = recv_one(&fixture.receiver).expect("heartbeat expected");
        assert!(protocol::is_end_of_stream(&datagram));
    }

    #[test]
    fn test_retransmit_covers_nak_range_in_frame_chunks() {
        let mut fixture = make_fixture();
        for _ in 0..10 {
            append(&fixture.publication, 1000);
        }
        let aligned = frame::aligned_frame_length((frame::HEADER_LENGTH + 1000) as i32) as i64;

        // Pretend everything went out already.
        fixture.publication.sender_position.set_ordered(10 * aligned);

        let bytes = fixture
            .publication
            .retransmit(
                &fixture.transport,
                &mut fixture.destinations,
                INITIAL_TERM_ID,
                (3 * aligned) as i32,
                aligned as i32,
                1,
            )
            .unwrap();

        assert_eq!(bytes, aligned as usize);
        let datagram = recv_one(&fixture.receiver).expect("retransmit expected");
        assert_eq!(protocol::header::term_offset(&datagram), (3 * aligned) as i32);
    }

    #[test]
    fn test_retransmit_beyond_sender_position_is_ignored() {
        let mut fixture = make_fixture();
        append(&fixture.publication, 1000);

        let bytes = fixture
            .publication
            .retransmit(
                &fixture.transport,
                &mut fixture.destinations,
                INITIAL_TERM_ID,
                0,
                1024,
                1,
            )
            .unwrap();

        assert_eq!(bytes, 0);
    }

    #[test]
    fn test_publisher_limit_follows_sender_position() {
        let fixture = make_fixture();
        fixture.publication.sender_position.set_ordered(4096);

        assert!(fixture.publication.update_publisher_limit());
        assert_eq!(fixture.publication.publisher_limit.get(), 4096 + WINDOW as i64);
        // Unchanged on the second pass.
        assert!(!fixture.publication.update_publisher_limit());
    }

    #[test]
    fn test_unblock_pads_stalled_claim() {
        let fixture = make_fixture();

        // A publisher claimed 256 bytes at position 0 and died before
        // committing: tail advanced, frame length still zero.
        let metadata = fixture.publication.log().metadata();
        metadata.put_i64(descriptor::tail_counter_offset(0), descriptor::pack_tail(0, 256));

        assert!(fixture.publication.unblock_at_consumer_position());

        let term = fixture.publication.log().term_buffer(0);
        assert!(frame::is_padding_frame(&term, 0));
        assert_eq!(frame::frame_length_volatile(&term, 0), 256);

        // Idempotent: next check finds a committed pad.
        assert!(!fixture.publication.unblock_at_consumer_position());
    }

    #[test]
    fn test_state_machine() {
        let fixture = make_fixture();
        let publication = &fixture.publication;

        assert_eq!(publication.state(), PublicationState::Active);
        publication.set_state(PublicationState::Draining, 5);
        assert_eq!(publication.state(), PublicationState::Draining);
        assert_eq!(publication.time_of_last_state_change_ns(), 5);

        assert!(!publication.has_sender_released());
        publication.sender_release();
        assert!(publication.has_sender_released());
    }
}

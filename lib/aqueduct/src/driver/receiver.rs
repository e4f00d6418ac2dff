use crate::concurrent::spsc::{CommandProducer, CommandQueue};
use crate::driver::agent::Agent;
use crate::driver::conductor::ConductorCommand;
use crate::driver::context::DriverContext;
use crate::driver::dispatcher::{DataOutcome, DataPacketDispatcher, SetupOutcome};
use crate::driver::endpoint::ReceiveChannelEndpoint;
use crate::driver::image::PublicationImage;
use crate::driver::system_counters::SystemCounters;
use crate::error::DriverResult;
use crate::logbuffer::descriptor;
use crate::protocol;
use bedrock::logging;
use bedrock::time::CachedNanoClock;
use std::net::SocketAddr;
use std::sync::Arc;

/// Commands the conductor queues onto the receiver.
pub enum ReceiverCommand {
    RegisterEndpoint {
        endpoint: Arc<ReceiveChannelEndpoint>,
    },
    CloseEndpoint {
        endpoint_id: usize,
    },
    AddSubscription {
        endpoint_id: usize,
        stream_id: i32,
    },
    AddSubscriptionSession {
        endpoint_id: usize,
        stream_id: i32,
        session_id: i32,
    },
    RemoveSubscription {
        endpoint_id: usize,
        stream_id: i32,
    },
    RemoveSubscriptionSession {
        endpoint_id: usize,
        stream_id: i32,
        session_id: i32,
    },
    NewPublicationImage {
        endpoint_id: usize,
        image: Arc<PublicationImage>,
        control_address: SocketAddr,
    },
}

struct EndpointEntry {
    endpoint: Arc<ReceiveChannelEndpoint>,
    dispatcher: DataPacketDispatcher,
}

struct ImageEntry {
    image: Arc<PublicationImage>,
    endpoint_id: usize,
    /// SM/NAK destination per transport index.
    control_addresses: Vec<SocketAddr>,
}

struct PendingSetup {
    endpoint_id: usize,
    stream_id: i32,
    session_id: i32,
    source: SocketAddr,
    deadline_ns: i64,
    /// Re-elicit on expiry instead of abandoning (explicit-control MDS).
    periodic: bool,
}

/// The receiver agent: drains its command queue, polls every data
/// transport, hands frames to the per-endpoint dispatcher and works
/// through per-image SM/NAK/RTT housekeeping.
pub struct Receiver {
    commands: CommandQueue<ReceiverCommand>,
    conductor_proxy: CommandProducer<ConductorCommand>,
    poll: mio::Poll,
    events: mio::Events,
    endpoints: Vec<EndpointEntry>,
    images: Vec<ImageEntry>,
    pending_setups: Vec<PendingSetup>,
    image_liveness_timeout_ns: i64,
    pending_setups_timeout_ns: i64,
    no_interest_timeout_ns: i64,
    clock: CachedNanoClock,
    counters: Arc<SystemCounters>,
    recv_buf: Box<[u8; 64 * 1024]>,
    send_buf: Box<[u8; 128]>,
    log: logging::Logger,
}

impl Receiver {
    pub fn new(
        ctx: &DriverContext,
        commands: CommandQueue<ReceiverCommand>,
        conductor_proxy: CommandProducer<ConductorCommand>,
        counters: Arc<SystemCounters>,
        log: &logging::Logger,
    ) -> Receiver {
        Receiver {
            commands,
            conductor_proxy,
            poll: mio::Poll::new().expect("receiver poll creation failed"),
            events: mio::Events::with_capacity(1024),
            endpoints: Vec::new(),
            images: Vec::new(),
            pending_setups: Vec::new(),
            image_liveness_timeout_ns: ctx.image_liveness_timeout_ns,
            pending_setups_timeout_ns: ctx.pending_setups_timeout_ns,
            no_interest_timeout_ns: ctx.dispatcher_no_interest_timeout_ns,
            clock: CachedNanoClock::new(),
            counters,
            recv_buf: Box::new([0u8; 64 * 1024]),
            send_buf: Box::new([0u8; 128]),
            log: log.new(logging::o!()),
        }
    }

    fn drain_commands(&mut self, now_ns: i64) -> usize {
        let mut pending = Vec::new();
        let count = self.commands.drain(|cmd| pending.push(cmd), 16);
        for cmd in pending {
            self.on_command(cmd, now_ns);
        }
        count
    }

    fn on_command(&mut self, cmd: ReceiverCommand, now_ns: i64) {
        match cmd {
            ReceiverCommand::RegisterEndpoint { endpoint } => {
                logging::debug!(self.log, "receive endpoint registered";
                                "context" => "on_command",
                                "endpoint_id" => endpoint.id,
                                "local" => %endpoint.transport.local_addr());
                if endpoint
                    .transport
                    .register(&self.poll, mio::Token(endpoint.id))
                    .is_err()
                {
                    self.counters.errors.increment();
                }
                self.endpoints.push(EndpointEntry {
                    endpoint,
                    dispatcher: DataPacketDispatcher::new(),
                });
            }
            ReceiverCommand::CloseEndpoint { endpoint_id } => {
                if let Some(entry) = self.endpoints.iter().find(|e| e.endpoint.id == endpoint_id) {
                    let _ = entry.endpoint.transport.deregister(&self.poll);
                }
                self.images.retain(|entry| {
                    if entry.endpoint_id == endpoint_id {
                        entry.image.if_active_go_inactive(now_ns);
                        false
                    } else {
                        true
                    }
                });
                self.pending_setups.retain(|p| p.endpoint_id != endpoint_id);
                self.endpoints.retain(|e| e.endpoint.id != endpoint_id);
            }
            ReceiverCommand::AddSubscription {
                endpoint_id,
                stream_id,
            } => {
                if let Some(entry) = self.endpoint_entry(endpoint_id) {
                    entry.dispatcher.add_subscription(stream_id);
                }
            }
            ReceiverCommand::AddSubscriptionSession {
                endpoint_id,
                stream_id,
                session_id,
            } => {
                if let Some(entry) = self.endpoint_entry(endpoint_id) {
                    entry.dispatcher.add_subscription_session(stream_id, session_id);
                }
            }
            ReceiverCommand::RemoveSubscription {
                endpoint_id,
                stream_id,
            } => {
                let removed = match self.endpoint_entry(endpoint_id) {
                    Some(entry) => entry.dispatcher.remove_subscription(stream_id),
                    None => Vec::new(),
                };
                for image in removed {
                    image.if_active_go_inactive(now_ns);
                    self.images
                        .retain(|e| e.image.correlation_id != image.correlation_id);
                }
            }
            ReceiverCommand::RemoveSubscriptionSession {
                endpoint_id,
                stream_id,
                session_id,
            } => {
                let removed = self.endpoint_entry(endpoint_id).and_then(|entry| {
                    entry
                        .dispatcher
                        .remove_subscription_session(stream_id, session_id)
                });
                if let Some(image) = removed {
                    image.if_active_go_inactive(now_ns);
                    self.images
                        .retain(|e| e.image.correlation_id != image.correlation_id);
                }
            }
            ReceiverCommand::NewPublicationImage {
                endpoint_id,
                image,
                control_address,
            } => {
                image.activate(now_ns);
                if let Some(entry) = self.endpoint_entry(endpoint_id) {
                    entry.dispatcher.set_image(
                        image.stream_id,
                        image.session_id,
                        image.clone(),
                        0,
                    );
                }
                self.pending_setups.retain(|p| {
                    !(p.endpoint_id == endpoint_id
                        && p.stream_id == image.stream_id
                        && p.session_id == image.session_id)
                });
                self.counters.images_created.increment();
                self.images.push(ImageEntry {
                    image,
                    endpoint_id,
                    control_addresses: vec![control_address],
                });
            }
        }
    }

    fn endpoint_entry(&mut self, endpoint_id: usize) -> Option<&mut EndpointEntry> {
        self.endpoints
            .iter_mut()
            .find(|e| e.endpoint.id == endpoint_id)
    }

    /// One zero-timeout select across every registered transport; ready
    /// sockets are drained to dry (edge triggers demand it).
    fn poll_transports(&mut self, now_ns: i64) -> DriverResult<usize> {
        self.poll
            .poll(&mut self.events, Some(std::time::Duration::from_millis(0)))?;

        let ready: Vec<usize> = self.events.iter().map(|event| event.token().0).collect();
        let mut work_count = 0;

        for endpoint_id in ready {
            let index = match self.endpoints.iter().position(|e| e.endpoint.id == endpoint_id) {
                Some(index) => index,
                None => continue,
            };

            loop {
                let endpoint = self.endpoints[index].endpoint.clone();
                let datagram = {
                    let buf: &mut [u8] = &mut self.recv_buf[..];
                    endpoint.transport.recv_from(buf)?
                };
                let (len, src) = match datagram {
                    Some(d) => d,
                    None => break,
                };

                work_count += self.on_frame(index, len, src, now_ns);
            }
        }

        Ok(work_count)
    }

    fn on_frame(&mut self, endpoint_index: usize, len: usize, src: SocketAddr, now_ns: i64) -> usize {
        if len < protocol::header::LENGTH {
            self.counters.invalid_packets.increment();
            return 0;
        }

        let frame = self.recv_buf[..len].to_vec();
        if protocol::header::version(&frame) != protocol::PROTOCOL_VERSION {
            self.counters.invalid_packets.increment();
            return 0;
        }

        let session_id = protocol::header::session_id(&frame);
        let stream_id = protocol::header::stream_id(&frame);

        match protocol::header::frame_type(&frame) {
            protocol::HDR_TYPE_DATA | protocol::HDR_TYPE_PAD => {
                let endpoint_id = self.endpoints[endpoint_index].endpoint.id;
                let outcome = self.endpoints[endpoint_index].dispatcher.on_data(
                    session_id,
                    stream_id,
                    &frame,
                    0,
                    now_ns,
                );
                match outcome {
                    DataOutcome::Dispatched(bytes) => bytes,
                    DataOutcome::ElicitSetup => {
                        self.elicit_setup(endpoint_index, session_id, stream_id, src, now_ns);
                        self.pending_setups.push(PendingSetup {
                            endpoint_id,
                            stream_id,
                            session_id,
                            source: src,
                            deadline_ns: now_ns + self.pending_setups_timeout_ns,
                            periodic: false,
                        });
                        1
                    }
                    DataOutcome::Dropped => 0,
                }
            }
            protocol::HDR_TYPE_SETUP => {
                if len < protocol::setup::LENGTH {
                    self.counters.invalid_packets.increment();
                    return 0;
                }
                self.on_setup(endpoint_index, &frame, src, now_ns);
                1
            }
            protocol::HDR_TYPE_RTTM => {
                if len < protocol::rttm::LENGTH || !protocol::rttm::is_reply(&frame) {
                    return 0;
                }
                if let Some(entry) = self
                    .images
                    .iter()
                    .find(|e| e.image.session_id == session_id && e.image.stream_id == stream_id)
                {
                    entry.image.on_rtt_reply(
                        now_ns,
                        protocol::rttm::echo_timestamp_ns(&frame),
                        protocol::rttm::reception_delta_ns(&frame),
                    );
                }
                1
            }
            _ => {
                self.counters.invalid_packets.increment();
                0
            }
        }
    }

    fn on_setup(&mut self, endpoint_index: usize, frame: &[u8], src: SocketAddr, now_ns: i64) {
        let session_id = protocol::header::session_id(frame);
        let stream_id = protocol::header::stream_id(frame);
        let endpoint_id = self.endpoints[endpoint_index].endpoint.id;

        match self.endpoints[endpoint_index]
            .dispatcher
            .on_setup(session_id, stream_id, now_ns)
        {
            SetupOutcome::CreateImage => {
                // An image may already exist via another endpoint of a
                // multi-destination subscription; attach rather than ask
                // for a duplicate.
                if let Some(entry_index) = self.images.iter().position(|e| {
                    e.image.session_id == session_id && e.image.stream_id == stream_id
                }) {
                    if let Some(transport_index) = self.images[entry_index].image.add_connection() {
                        let image = self.images[entry_index].image.clone();
                        self.images[entry_index].control_addresses.push(src);
                        self.endpoints[endpoint_index].dispatcher.set_image(
                            stream_id,
                            session_id,
                            image,
                            transport_index,
                        );
                    }
                    return;
                }

                let command = ConductorCommand::CreatePublicationImage {
                    endpoint_id,
                    session_id,
                    stream_id,
                    initial_term_id: protocol::setup::initial_term_id(frame),
                    active_term_id: protocol::header::term_id(frame),
                    term_offset: protocol::header::term_offset(frame),
                    term_length: protocol::setup::term_length(frame),
                    mtu: protocol::setup::mtu(frame),
                    source: src,
                };
                if self.conductor_proxy.offer(command).is_err() {
                    self.counters.back_pressure_events.increment();
                }
            }
            SetupOutcome::Ignored => (),
        }
    }

    /// Ask the source for a SETUP with a flagged status message.
    fn elicit_setup(
        &mut self,
        endpoint_index: usize,
        session_id: i32,
        stream_id: i32,
        src: SocketAddr,
        now_ns: i64,
    ) {
        let buf: &mut [u8] = &mut self.send_buf[..];
        let len = protocol::status_message::encode(
            buf,
            protocol::SEND_SETUP_FLAG,
            session_id,
            stream_id,
            0,
            0,
            0,
            crate::NULL_VALUE,
            None,
        );

        let endpoint = &self.endpoints[endpoint_index].endpoint;
        let _ = endpoint.transport.send_to(&self.send_buf[..len], &src);
        let _ = now_ns;
    }

    fn image_housekeeping(&mut self, now_ns: i64) -> usize {
        let mut work_count = 0;

        // Reverse iteration allows unordered removal.
        for index in (0..self.images.len()).rev() {
            let keep = {
                let entry = &self.images[index];
                entry
                    .image
                    .has_activity_and_not_end_of_stream(now_ns, self.image_liveness_timeout_ns)
            };

            if !keep {
                let entry = self.images.swap_remove(index);
                entry.image.if_active_go_inactive(now_ns);
                let removal_deadline_ns = now_ns + self.image_liveness_timeout_ns;
                if let Some(endpoint_entry) = self.endpoint_entry(entry.endpoint_id) {
                    endpoint_entry.dispatcher.remove_image(
                        entry.image.stream_id,
                        entry.image.session_id,
                        removal_deadline_ns,
                    );
                }
                logging::debug!(self.log, "image removed from dispatch";
                                "context" => "image_housekeeping",
                                "session_id" => entry.image.session_id,
                                "stream_id" => entry.image.stream_id);
                continue;
            }

            work_count += self.image_protocol_work(index, now_ns);
        }

        work_count
    }

    fn image_protocol_work(&mut self, index: usize, now_ns: i64) -> usize {
        let mut work_count = 0;
        let entry = &self.images[index];
        let image = entry.image.clone();
        let endpoint = match self
            .endpoints
            .iter()
            .find(|e| e.endpoint.id == entry.endpoint_id)
        {
            Some(e) => e.endpoint.clone(),
            None => return 0,
        };
        let destinations = entry.control_addresses.clone();

        if let Some((position, window)) = image.poll_status_message(now_ns) {
            let term_id = descriptor::compute_term_id_from_position(
                position,
                image.position_bits_to_shift,
                image.initial_term_id,
            );
            let term_offset = descriptor::compute_term_offset_from_position(
                position,
                image.position_bits_to_shift,
            );

            let buf: &mut [u8] = &mut self.send_buf[..];
            let len = protocol::status_message::encode(
                buf,
                0,
                image.session_id,
                image.stream_id,
                term_id,
                term_offset,
                window,
                image.correlation_id,
                None,
            );
            for dst in destinations.iter() {
                let _ = endpoint.transport.send_to(&self.send_buf[..len], dst);
            }
            work_count += 1;
        }

        if let Some((term_id, term_offset, length)) = image.poll_loss() {
            let buf: &mut [u8] = &mut self.send_buf[..];
            let len = protocol::nak::encode(
                buf,
                image.session_id,
                image.stream_id,
                term_id,
                term_offset,
                length,
            );
            for dst in destinations.iter() {
                let _ = endpoint.transport.send_to(&self.send_buf[..len], dst);
            }
            work_count += 1;
        }

        if image.take_rtt_measure_request() {
            let buf: &mut [u8] = &mut self.send_buf[..];
            let len = protocol::rttm::encode(
                buf,
                0,
                image.session_id,
                image.stream_id,
                now_ns,
                0,
                image.correlation_id,
            );
            for dst in destinations.iter() {
                let _ = endpoint.transport.send_to(&self.send_buf[..len], dst);
            }
            work_count += 1;
        }

        work_count
    }

    fn check_pending_setups(&mut self, now_ns: i64) {
        for index in (0..self.pending_setups.len()).rev() {
            if now_ns < self.pending_setups[index].deadline_ns {
                continue;
            }

            let pending = if self.pending_setups[index].periodic {
                let p = &mut self.pending_setups[index];
                p.deadline_ns = now_ns + self.pending_setups_timeout_ns;
                Some((p.endpoint_id, p.session_id, p.stream_id, p.source))
            } else {
                let p = self.pending_setups.swap_remove(index);
                if let Some(entry) = self.endpoint_entry(p.endpoint_id) {
                    entry.dispatcher.remove_pending_setup(p.stream_id, p.session_id);
                }
                None
            };

            if let Some((endpoint_id, session_id, stream_id, src)) = pending {
                if let Some(endpoint_index) =
                    self.endpoints.iter().position(|e| e.endpoint.id == endpoint_id)
                {
                    self.elicit_setup(endpoint_index, session_id, stream_id, src, now_ns);
                }
            }
        }
    }
}

impl Agent for Receiver {
    fn name(&self) -> &'static str {
        "receiver"
    }

    fn do_work(&mut self) -> DriverResult<usize> {
        let now_ns = self.clock.update();

        let mut work_count = self.drain_commands(now_ns);
        work_count += self.poll_transports(now_ns)?;
        work_count += self.image_housekeeping(now_ns);
        self.check_pending_setups(now_ns);

        for entry in self.endpoints.iter_mut() {
            entry
                .dispatcher
                .housekeeping(now_ns, self.no_interest_timeout_ns);
        }

        Ok(work_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::concurrent::counters::{CountersManager, COUNTER_LENGTH, METADATA_LENGTH};
    use crate::concurrent::position::Position;
    use crate::driver::endpoint::{UdpChannel, UdpTransport};
    use crate::driver::resolver::StdNameResolver;
    use crate::driver::uri::ChannelUri;
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;
    use crate::logbuffer::log::LogBuffers;

    struct Harness {
        _metadata: OwnedBuffer,
        _values: OwnedBuffer,
        receiver: Receiver,
        receiver_proxy: CommandProducer<ReceiverCommand>,
        conductor_queue: CommandQueue<ConductorCommand>,
        publisher: UdpTransport,
        endpoint_addr: SocketAddr,
        counters: Arc<SystemCounters>,
        manager: CountersManager,
    }

    fn make_harness() -> Harness {
        let metadata = OwnedBuffer::new(128 * METADATA_LENGTH);
        let values = OwnedBuffer::new(128 * COUNTER_LENGTH);
        let mut manager = CountersManager::new(metadata.buffer(), values.buffer(), 0);
        let counters = Arc::new(SystemCounters::allocate(&mut manager, 0).unwrap());

        let channel = UdpChannel::resolve(
            ChannelUri::parse("aqueduct:udp?endpoint=127.0.0.1:0").unwrap(),
            &mut StdNameResolver::new(),
        )
        .unwrap();
        let status_id = manager.allocate(7, &[], "rcv-status", 0).unwrap();
        let status = manager.position(status_id);
        let endpoint = Arc::new(ReceiveChannelEndpoint::new(0, channel, status).unwrap());
        let endpoint_addr = endpoint.transport.local_addr();

        let ctx = DriverContext::default();
        let commands = CommandQueue::new(64);
        let receiver_proxy = commands.producer();
        let conductor_queue = CommandQueue::new(64);
        let conductor_proxy = conductor_queue.producer();

        receiver_proxy
            .offer(ReceiverCommand::RegisterEndpoint { endpoint })
            .ok()
            .unwrap();

        let receiver = Receiver::new(
            &ctx,
            commands,
            conductor_proxy,
            counters.clone(),
            &bedrock::logging::null_logger(),
        );

        Harness {
            _metadata: metadata,
            _values: values,
            receiver,
            receiver_proxy,
            conductor_queue,
            publisher: UdpTransport::bind(&"127.0.0.1:0".parse().unwrap()).unwrap(),
            endpoint_addr,
            counters,
            manager,
        }
    }

    fn setup_frame(session_id: i32, stream_id: i32) -> Vec<u8> {
        let mut buf = vec![0u8; protocol::setup::LENGTH];
        protocol::setup::encode(
            &mut buf,
            session_id,
            stream_id,
            0,
            0,
            0,
            TERM_MIN_LENGTH as i32,
            1408,
            0,
        );
        buf
    }

    fn data_frame(session_id: i32, stream_id: i32, payload_len: usize) -> Vec<u8> {
        let frame_length = protocol::header::LENGTH + payload_len;
        let mut packet = vec![9u8; frame_length];
        protocol::header::encode(
            &mut packet,
            protocol::HDR_TYPE_DATA,
            protocol::BEGIN_AND_END_FLAGS,
            frame_length as i32,
            0,
            session_id,
            stream_id,
            0,
        );
        packet
    }

    fn pump(receiver: &mut Receiver, rounds: usize) {
        for _ in 0..rounds {
            receiver.do_work().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_setup_triggers_image_creation_request() {
        let mut harness = make_harness();
        harness
            .receiver_proxy
            .offer(ReceiverCommand::AddSubscription {
                endpoint_id: 0,
                stream_id: 1001,
            })
            .ok()
            .unwrap();

        harness
            .publisher
            .send_to(&setup_frame(42, 1001), &harness.endpoint_addr)
            .unwrap();
        pump(&mut harness.receiver, 10);

        let mut created = Vec::new();
        harness.conductor_queue.drain(|cmd| created.push(cmd), 16);

        match created.as_slice() {
            [ConductorCommand::CreatePublicationImage {
                session_id,
                stream_id,
                term_length,
                mtu,
                ..
            }] => {
                assert_eq!(*session_id, 42);
                assert_eq!(*stream_id, 1001);
                assert_eq!(*term_length, TERM_MIN_LENGTH as i32);
                assert_eq!(*mtu, 1408);
            }
            other => panic!("expected one create-image command, got {}", other.len()),
        }
    }

    #[test]
    fn test_data_before_setup_elicits_sm() {
        let mut harness = make_harness();
        harness
            .receiver_proxy
            .offer(ReceiverCommand::AddSubscription {
                endpoint_id: 0,
                stream_id: 1001,
            })
            .ok()
            .unwrap();

        harness
            .publisher
            .send_to(&data_frame(42, 1001, 64), &harness.endpoint_addr)
            .unwrap();
        pump(&mut harness.receiver, 10);

        // The eliciting SM lands back at the publisher with the flag set.
        let mut buf = [0u8; 128];
        let mut response = None;
        for _ in 0..2000 {
            if let Some((len, _)) = harness.publisher.recv_from(&mut buf).unwrap() {
                response = Some(buf[..len].to_vec());
                break;
            }
            std::thread::yield_now();
        }

        let sm = response.expect("eliciting SM expected");
        assert_eq!(protocol::header::frame_type(&sm), protocol::HDR_TYPE_SM);
        assert!(protocol::header::flags(&sm) & protocol::SEND_SETUP_FLAG != 0);
    }

    #[test]
    fn test_image_receives_data_and_sends_scheduled_sm() {
        let mut harness = make_harness();
        harness
            .receiver_proxy
            .offer(ReceiverCommand::AddSubscription {
                endpoint_id: 0,
                stream_id: 1001,
            })
            .ok()
            .unwrap();

        // Hand-build the image the conductor would create.
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            LogBuffers::create(&dir.path().join("img.logbuffer"), TERM_MIN_LENGTH, 0, 1408, 77)
                .unwrap(),
        );
        let hwm_id = harness.manager.allocate(3, &[], "hwm", 0).unwrap();
        let hwm: Position = harness.manager.position(hwm_id);
        let rebuild_id = harness.manager.allocate(5, &[], "pos", 0).unwrap();
        let rebuild: Position = harness.manager.position(rebuild_id);
        let image = Arc::new(PublicationImage::new(
            77,
            42,
            1001,
            0,
            0,
            0,
            128 * 1024,
            true,
            "test".to_string(),
            log,
            hwm,
            rebuild,
            harness.counters.clone(),
            0,
        ));

        harness
            .receiver_proxy
            .offer(ReceiverCommand::NewPublicationImage {
                endpoint_id: 0,
                image: image.clone(),
                control_address: harness.publisher.local_addr(),
            })
            .ok()
            .unwrap();

        let frame = data_frame(42, 1001, 64);
        harness
            .publisher
            .send_to(&frame, &harness.endpoint_addr)
            .unwrap();
        pump(&mut harness.receiver, 10);

        assert_eq!(image.hwm_position(), frame.len() as i64);

        // A scheduled SM is picked up and sent to the control address.
        image.schedule_status_message(1, 0, 128 * 1024);
        pump(&mut harness.receiver, 5);

        let mut buf = [0u8; 128];
        let mut found_sm = false;
        for _ in 0..2000 {
            if let Some((len, _)) = harness.publisher.recv_from(&mut buf).unwrap() {
                if protocol::header::frame_type(&buf[..len]) == protocol::HDR_TYPE_SM {
                    assert_eq!(
                        protocol::status_message::receiver_window_length(&buf[..len]),
                        128 * 1024
                    );
                    found_sm = true;
                    break;
                }
            }
            std::thread::yield_now();
        }
        assert!(found_sm, "status message expected at the publisher");
    }

    #[test]
    fn test_unknown_stream_counts_nothing_and_drops() {
        let mut harness = make_harness();

        harness
            .publisher
            .send_to(&data_frame(42, 9999, 64), &harness.endpoint_addr)
            .unwrap();
        pump(&mut harness.receiver, 5);

        // No interest: silently dropped, not an invalid packet.
        let reader = crate::concurrent::counters::CountersReader::new(
            harness._metadata.buffer(),
            harness._values.buffer(),
        );
        assert_eq!(reader.counter_value(harness.counters.invalid_packets.id()), 0);
    }

    #[test]
    fn test_runt_frame_is_invalid() {
        let mut harness = make_harness();

        harness
            .publisher
            .send_to(&[1, 2, 3], &harness.endpoint_addr)
            .unwrap();
        pump(&mut harness.receiver, 5);

        let reader = crate::concurrent::counters::CountersReader::new(
            harness._metadata.buffer(),
            harness._values.buffer(),
        );
        assert_eq!(reader.counter_value(harness.counters.invalid_packets.id()), 1);
    }
}

use crate::concurrent::spsc::{CommandProducer, CommandQueue};
use crate::driver::conductor::ConductorCommand;
use crate::driver::context::DriverContext;
use crate::driver::destination::DestinationTracker;
use crate::driver::endpoint::SendChannelEndpoint;
use crate::driver::flow_control::FlowControl;
use crate::driver::publication::{NetworkPublication, SenderTimers};
use crate::driver::system_counters::SystemCounters;
use crate::driver::agent::Agent;
use crate::error::{DriverResult, ErrorUtils};
use crate::logbuffer::descriptor;
use crate::protocol;
use bedrock::logging;
use bedrock::time::CachedNanoClock;
use std::net::SocketAddr;
use std::sync::Arc;

/// Commands the conductor queues onto the sender.
pub enum SenderCommand {
    AddPublication {
        publication: Arc<NetworkPublication>,
        endpoint: Arc<SendChannelEndpoint>,
        flow_control: Box<dyn FlowControl>,
        destinations: DestinationTracker,
    },
    RemovePublication {
        registration_id: i64,
    },
    AddDestination {
        registration_id: i64,
        destination_registration_id: i64,
        address: SocketAddr,
    },
    RemoveDestination {
        registration_id: i64,
        address: SocketAddr,
    },
    /// Outcome of a conductor-side re-resolution.
    UpdateDestinationAddress {
        registration_id: i64,
        address: SocketAddr,
    },
}

struct PublicationEntry {
    publication: Arc<NetworkPublication>,
    endpoint: Arc<SendChannelEndpoint>,
    flow_control: Box<dyn FlowControl>,
    destinations: DestinationTracker,
    timers: SenderTimers,
    had_receivers: bool,
}

/// The sender agent: polls publications round-robin for outbound frames,
/// drains its command queue, and at a controlled cadence reads the control
/// traffic (SM/NAK/RTTM) arriving on its endpoints.
pub struct Sender {
    commands: CommandQueue<SenderCommand>,
    conductor_proxy: CommandProducer<ConductorCommand>,
    entries: Vec<PublicationEntry>,
    round_robin_index: usize,
    duty_cycle_counter: u32,
    duty_cycle_ratio: u32,
    control_poll_deadline_ns: i64,
    re_resolution_deadline_ns: i64,
    status_message_read_timeout_ns: i64,
    re_resolution_interval_ns: i64,
    setup_interval_ns: i64,
    heartbeat_interval_ns: i64,
    clock: CachedNanoClock,
    counters: Arc<SystemCounters>,
    recv_buf: Box<[u8; 64 * 1024]>,
    log: logging::Logger,
}

impl Sender {
    pub fn new(
        ctx: &DriverContext,
        commands: CommandQueue<SenderCommand>,
        conductor_proxy: CommandProducer<ConductorCommand>,
        counters: Arc<SystemCounters>,
        log: &logging::Logger,
    ) -> Sender {
        Sender {
            commands,
            conductor_proxy,
            entries: Vec::new(),
            round_robin_index: 0,
            duty_cycle_counter: 0,
            duty_cycle_ratio: ctx.duty_cycle_ratio,
            control_poll_deadline_ns: 0,
            re_resolution_deadline_ns: 0,
            status_message_read_timeout_ns: ctx.status_message_read_timeout_ns,
            re_resolution_interval_ns: ctx.re_resolution_check_interval_ns,
            setup_interval_ns: ctx.setup_interval_ns,
            heartbeat_interval_ns: ctx.heartbeat_interval_ns,
            clock: CachedNanoClock::new(),
            counters,
            recv_buf: Box::new([0u8; 64 * 1024]),
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

    fn on_command(&mut self, cmd: SenderCommand, now_ns: i64) {
        match cmd {
            SenderCommand::AddPublication {
                publication,
                endpoint,
                flow_control,
                destinations,
            } => {
                logging::debug!(self.log, "publication added to sender";
                                "context" => "on_command",
                                "registration_id" => publication.registration_id,
                                "session_id" => publication.session_id,
                                "stream_id" => publication.stream_id);
                self.entries.push(PublicationEntry {
                    publication,
                    endpoint,
                    flow_control,
                    destinations,
                    timers: SenderTimers::new(),
                    had_receivers: false,
                });
            }
            SenderCommand::RemovePublication { registration_id } => {
                if let Some(index) = self
                    .entries
                    .iter()
                    .position(|e| e.publication.registration_id == registration_id)
                {
                    let entry = self.entries.swap_remove(index);
                    entry.publication.sender_release();
                    logging::debug!(self.log, "publication removed from sender";
                                    "context" => "on_command",
                                    "registration_id" => registration_id);
                }
            }
            SenderCommand::AddDestination {
                registration_id,
                destination_registration_id,
                address,
            } => {
                if let Some(entry) = self.entry_by_registration(registration_id) {
                    entry
                        .destinations
                        .add_destination(destination_registration_id, address, now_ns);
                }
            }
            SenderCommand::RemoveDestination {
                registration_id,
                address,
            } => {
                if let Some(entry) = self.entry_by_registration(registration_id) {
                    entry.destinations.remove_destination(&address);
                }
            }
            SenderCommand::UpdateDestinationAddress {
                registration_id,
                address,
            } => {
                if let Some(entry) = self.entry_by_registration(registration_id) {
                    entry.destinations.update_single_address(address);
                }
                self.counters.resolution_changes.increment();
            }
        }
    }

    fn entry_by_registration(&mut self, registration_id: i64) -> Option<&mut PublicationEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.publication.registration_id == registration_id)
    }

    /// Read SM/NAK/RTTM from every endpoint socket until dry.
    fn poll_control_transports(&mut self, now_ns: i64) -> DriverResult<usize> {
        let mut work_count = 0;

        // Endpoints are shared across entries; poll each socket once.
        let mut polled: Vec<usize> = Vec::new();
        for index in 0..self.entries.len() {
            let endpoint = self.entries[index].endpoint.clone();
            if polled.contains(&endpoint.id) {
                continue;
            }
            polled.push(endpoint.id);

            loop {
                let datagram = {
                    let buf: &mut [u8] = &mut self.recv_buf[..];
                    match endpoint.transport.recv_from(buf)? {
                        Some((len, src)) => Some((len, src)),
                        None => None,
                    }
                };
                let (len, src) = match datagram {
                    Some(d) => d,
                    None => break,
                };

                self.on_control_frame(endpoint.id, len, src, now_ns);
                work_count += 1;
            }
        }

        Ok(work_count)
    }

    fn on_control_frame(&mut self, endpoint_id: usize, len: usize, src: SocketAddr, now_ns: i64) {
        if len < protocol::header::LENGTH {
            self.counters.invalid_packets.increment();
            return;
        }

        let frame = self.recv_buf[..len].to_vec();
        if protocol::header::version(&frame) != protocol::PROTOCOL_VERSION {
            self.counters.invalid_packets.increment();
            return;
        }

        let session_id = protocol::header::session_id(&frame);
        let stream_id = protocol::header::stream_id(&frame);

        let entry = match self.entries.iter_mut().find(|e| {
            e.endpoint.id == endpoint_id
                && e.publication.session_id == session_id
                && e.publication.stream_id == stream_id
        }) {
            Some(entry) => entry,
            None => return,
        };

        match protocol::header::frame_type(&frame) {
            protocol::HDR_TYPE_SM => {
                if len < protocol::status_message::LENGTH {
                    self.counters.invalid_packets.increment();
                    return;
                }

                let publication = &entry.publication;
                let position = descriptor::compute_position(
                    protocol::header::term_id(&frame),
                    protocol::header::term_offset(&frame),
                    publication.position_bits_to_shift,
                    publication.initial_term_id,
                );
                let window = protocol::status_message::receiver_window_length(&frame);
                let receiver_id = protocol::status_message::receiver_id(&frame);
                let group_tag = protocol::status_message::group_tag(&frame);
                let elicit_setup =
                    protocol::header::flags(&frame) & protocol::SEND_SETUP_FLAG != 0;

                let new_limit = entry.flow_control.on_status_message(
                    receiver_id,
                    position,
                    window,
                    group_tag,
                    now_ns,
                    publication.sender_limit.get(),
                );
                publication.on_status_message(new_limit, elicit_setup, now_ns);
                entry.destinations.on_status_message(receiver_id, src, now_ns);
                entry.had_receivers = true;
            }
            protocol::HDR_TYPE_NAK => {
                if len < protocol::nak::LENGTH {
                    self.counters.invalid_packets.increment();
                    return;
                }

                let result = entry.publication.retransmit(
                    &entry.endpoint.transport,
                    &mut entry.destinations,
                    protocol::header::term_id(&frame),
                    protocol::header::term_offset(&frame),
                    protocol::nak::gap_length(&frame),
                    now_ns,
                );
                if result.has_failed() {
                    self.counters.errors.increment();
                }
            }
            protocol::HDR_TYPE_RTTM => {
                if len < protocol::rttm::LENGTH {
                    self.counters.invalid_packets.increment();
                    return;
                }

                let _ = entry.publication.on_rtt_measurement(
                    &entry.endpoint.transport,
                    &src,
                    protocol::rttm::echo_timestamp_ns(&frame),
                    protocol::rttm::is_reply(&frame),
                    now_ns,
                );
            }
            _ => self.counters.invalid_packets.increment(),
        }
    }

    fn flow_control_housekeeping(&mut self, now_ns: i64) {
        for entry in self.entries.iter_mut() {
            let new_limit = entry
                .flow_control
                .on_idle(now_ns, entry.publication.sender_limit.get());
            if new_limit > entry.publication.sender_limit.get() {
                entry.publication.sender_limit.set_ordered(new_limit);
            }

            if entry.had_receivers && !entry.flow_control.has_required_receivers() {
                entry.had_receivers = false;
                entry.publication.on_receivers_gone();
            }
        }
    }

    fn request_re_resolution(&mut self, now_ns: i64) {
        if now_ns < self.re_resolution_deadline_ns {
            return;
        }
        self.re_resolution_deadline_ns = now_ns + self.re_resolution_interval_ns;

        for entry in self.entries.iter() {
            if let Some(endpoint_name) = entry.endpoint.udp_channel.uri.endpoint() {
                // Literal addresses never change; only names re-resolve.
                if endpoint_name.parse::<SocketAddr>().is_err() {
                    let _ = self.conductor_proxy.offer(ConductorCommand::ReResolveEndpoint {
                        registration_id: entry.publication.registration_id,
                        endpoint_name: endpoint_name.to_string(),
                    });
                }
            }
        }
    }
}

impl Agent for Sender {
    fn name(&self) -> &'static str {
        "sender"
    }

    fn do_work(&mut self) -> DriverResult<usize> {
        let now_ns = self.clock.update();
        let mut work_count = self.drain_commands(now_ns);

        let mut bytes_sent = 0;
        let mut failed: Vec<i64> = Vec::new();
        let entry_count = self.entries.len();
        if entry_count > 0 {
            let start = self.round_robin_index % entry_count;
            self.round_robin_index = self.round_robin_index.wrapping_add(1);

            for i in 0..entry_count {
                let index = (start + i) % entry_count;
                let entry = &mut self.entries[index];
                match entry.publication.send(
                    &entry.endpoint.transport,
                    &mut entry.destinations,
                    &mut entry.timers,
                    self.setup_interval_ns,
                    self.heartbeat_interval_ns,
                    now_ns,
                ) {
                    Ok(sent) => bytes_sent += sent,
                    Err(crate::error::DriverError::Wait) => (),
                    Err(err) => {
                        // Hard I/O tears this publication down, not the
                        // whole agent.
                        logging::error!(self.log, "publication send failed";
                                        "context" => "do_work",
                                        "registration_id" => entry.publication.registration_id,
                                        "error" => ?err);
                        entry
                            .endpoint
                            .status
                            .set_ordered(crate::driver::endpoint::STATUS_ERRORED);
                        self.counters.errors.increment();
                        failed.push(entry.publication.registration_id);
                    }
                }
            }
        }
        for registration_id in failed {
            self.on_command(SenderCommand::RemovePublication { registration_id }, now_ns);
        }
        work_count += bytes_sent;

        self.duty_cycle_counter += 1;
        if self.duty_cycle_counter >= self.duty_cycle_ratio
            || bytes_sent == 0
            || now_ns >= self.control_poll_deadline_ns
        {
            self.duty_cycle_counter = 0;
            self.control_poll_deadline_ns = now_ns + self.status_message_read_timeout_ns / 2;
            work_count += self.poll_control_transports(now_ns)?;
            self.flow_control_housekeeping(now_ns);
        }

        self.request_re_resolution(now_ns);

        Ok(work_count)
    }
}

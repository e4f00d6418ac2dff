use crate::concurrent::broadcast::BroadcastTransmitter;
use crate::concurrent::counters::{self, CountersManager};
use crate::concurrent::errorlog::DistinctErrorLog;
use crate::concurrent::position::Position;
use crate::concurrent::ring_buffer::OneToOneRingBuffer;
use crate::concurrent::spsc::{CommandProducer, CommandQueue};
use crate::driver::agent::Agent;
use crate::driver::commands::*;
use crate::driver::congestion::{CongestionControl, CubicCongestionControl, StaticWindowCongestionControl};
use crate::driver::context::DriverContext;
use crate::driver::destination::DestinationTracker;
use crate::driver::endpoint::{ReceiveChannelEndpoint, SendChannelEndpoint, UdpChannel};
use crate::driver::flow_control::{
    FlowControl, MinMulticastFlowControl, TaggedMulticastFlowControl, UnicastFlowControl,
};
use crate::driver::image::{ImageState, PublicationImage};
use crate::driver::ipc_publication::{IpcPublication, IpcPublicationState};
use crate::driver::loss_detector::{LossDetector, StaticDelayGenerator};
use crate::driver::publication::{NetworkPublication, PublicationState};
use crate::driver::receiver::ReceiverCommand;
use crate::driver::resolver::{DriverNameResolver, NameResolver, StdNameResolver};
use crate::driver::sender::SenderCommand;
use crate::driver::system_counters::SystemCounters;
use crate::driver::uri::{ChannelUri, CongestionControlKind, ControlMode, Media};
use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::logbuffer::descriptor;
use crate::logbuffer::log::LogBuffers;
use bedrock::logging;
use bedrock::time::{epoch_ms, CachedNanoClock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Commands posted to the conductor by the receiver and sender agents.
pub enum ConductorCommand {
    CreatePublicationImage {
        endpoint_id: usize,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: i32,
        term_length: i32,
        mtu: i32,
        source: SocketAddr,
    },
    ReResolveEndpoint {
        registration_id: i64,
        endpoint_name: String,
    },
}

struct ClientSession {
    client_id: i64,
    deadline_ns: i64,
    heartbeat_counter_id: i32,
    heartbeat: Position,
}

struct PublicationLink {
    registration_id: i64,
    client_id: i64,
    publication_id: i64,
    is_ipc: bool,
}

struct SubscriptionLink {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    is_ipc: bool,
    endpoint_id: Option<usize>,
    session_id: Option<i32>,
    reliable: bool,
    tether: bool,
    cc: CongestionControlKind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum TetherState {
    Active,
    Linger { deadline_ns: i64 },
    Resting { deadline_ns: i64 },
}

struct SubscriberPosition {
    link_registration_id: i64,
    counter_id: i32,
    position: Position,
    tether: bool,
    state: TetherState,
}

struct NetworkPublicationEntry {
    publication: Arc<NetworkPublication>,
    canonical: String,
    endpoint_id: usize,
    is_exclusive: bool,
    ref_count: usize,
    counter_ids: [i32; 4],
    last_consumer_position: i64,
    time_of_last_consumer_change_ns: i64,
}

struct IpcPublicationEntry {
    publication: IpcPublication,
    is_exclusive: bool,
    ref_count: usize,
    counter_ids: [i32; 2],
    subscriber_positions: Vec<SubscriberPosition>,
}

struct ImageEntry {
    image: Arc<PublicationImage>,
    endpoint_id: usize,
    congestion: Box<dyn CongestionControl>,
    loss_detector: LossDetector,
    counter_ids: [i32; 2],
    subscriber_positions: Vec<SubscriberPosition>,
}

struct SendEndpointEntry {
    endpoint: Arc<SendChannelEndpoint>,
    ref_count: usize,
    status_counter_id: i32,
}

struct ReceiveEndpointEntry {
    endpoint: Arc<ReceiveChannelEndpoint>,
    ref_count: usize,
    status_counter_id: i32,
}

struct CounterLink {
    registration_id: i64,
    client_id: i64,
    counter_id: i32,
}

enum Resolver {
    Std(StdNameResolver),
    Driver(DriverNameResolver),
}

impl Resolver {
    fn resolve(&mut self, name: &str) -> DriverResult<SocketAddr> {
        match self {
            Resolver::Std(resolver) => resolver.resolve(name),
            Resolver::Driver(resolver) => resolver.resolve(name),
        }
    }
}

impl NameResolver for Resolver {
    fn resolve(&mut self, name: &str) -> DriverResult<SocketAddr> {
        Resolver::resolve(self, name)
    }
}

/// The conductor agent: every admission, lifecycle and liveness decision
/// in the driver runs through here, single-threaded.
pub struct Conductor {
    ctx: DriverContext,
    clock: CachedNanoClock,
    to_driver: OneToOneRingBuffer,
    to_clients: BroadcastTransmitter,
    counters_manager: CountersManager,
    system_counters: Arc<SystemCounters>,
    error_log: DistinctErrorLog,
    sender_proxy: CommandProducer<SenderCommand>,
    receiver_proxy: CommandProducer<ReceiverCommand>,
    from_receiver: CommandQueue<ConductorCommand>,
    from_sender: CommandQueue<ConductorCommand>,
    resolver: Resolver,
    terminate: Arc<AtomicBool>,

    clients: Vec<ClientSession>,
    publication_links: Vec<PublicationLink>,
    subscription_links: Vec<SubscriptionLink>,
    counter_links: Vec<CounterLink>,
    network_publications: Vec<NetworkPublicationEntry>,
    ipc_publications: Vec<IpcPublicationEntry>,
    images: Vec<ImageEntry>,
    send_endpoints: Vec<SendEndpointEntry>,
    receive_endpoints: Vec<ReceiveEndpointEntry>,

    next_endpoint_id: usize,
    next_session_id: i32,
    timer_deadline_ns: i64,
    log: logging::Logger,
}

impl Conductor {
    pub fn new(
        ctx: DriverContext,
        to_driver: OneToOneRingBuffer,
        to_clients: BroadcastTransmitter,
        counters_manager: CountersManager,
        system_counters: Arc<SystemCounters>,
        error_log: DistinctErrorLog,
        sender_proxy: CommandProducer<SenderCommand>,
        receiver_proxy: CommandProducer<ReceiverCommand>,
        from_receiver: CommandQueue<ConductorCommand>,
        from_sender: CommandQueue<ConductorCommand>,
        terminate: Arc<AtomicBool>,
        log: &logging::Logger,
    ) -> DriverResult<Conductor> {
        let resolver = match &ctx.resolver_name {
            Some(name) => {
                let bind = ctx
                    .resolver_interface
                    .as_deref()
                    .unwrap_or("0.0.0.0:8050")
                    .parse::<SocketAddr>()
                    .map_err(|_| {
                        DriverError::Fatal(ErrorKind::InvalidConfig(
                            "resolver interface must be host:port".to_string(),
                        ))
                    })?;
                let bootstrap = match &ctx.resolver_bootstrap_neighbor {
                    Some(neighbor) => Some(StdNameResolver::new().resolve(neighbor)?),
                    None => None,
                };
                Resolver::Driver(DriverNameResolver::new(
                    name,
                    bind,
                    bootstrap,
                    ctx.mtu_length,
                    log,
                )?)
            }
            None => Resolver::Std(StdNameResolver::new()),
        };

        Ok(Conductor {
            clock: CachedNanoClock::new(),
            to_driver,
            to_clients,
            counters_manager,
            system_counters,
            error_log,
            sender_proxy,
            receiver_proxy,
            from_receiver,
            from_sender,
            resolver,
            terminate,
            clients: Vec::new(),
            publication_links: Vec::new(),
            subscription_links: Vec::new(),
            counter_links: Vec::new(),
            network_publications: Vec::new(),
            ipc_publications: Vec::new(),
            images: Vec::new(),
            send_endpoints: Vec::new(),
            receive_endpoints: Vec::new(),
            next_endpoint_id: 0,
            next_session_id: ctx.reserved_session_id_high.wrapping_add(1),
            timer_deadline_ns: 0,
            log: log.new(logging::o!()),
            ctx,
        })
    }

    // --- Event emission ----------------------------------------------------

    fn transmit(&mut self, event_type_id: i32, payload: &[u8]) {
        if self.to_clients.transmit(event_type_id, payload).is_err() {
            self.system_counters.errors.increment();
        }
    }

    fn on_error(&mut self, correlation_id: i64, kind: &ErrorKind, now_ms: i64) {
        let message = kind.message();
        logging::warn!(self.log, "client command failed";
                       "context" => "on_error",
                       "correlation_id" => correlation_id,
                       "error" => %message);
        self.error_log.record(&message, now_ms);
        self.system_counters.errors.increment();

        let event = ErrorEvent {
            offending_correlation_id: correlation_id,
            error_code: kind.code(),
            message,
        };
        self.transmit(event_type::ON_ERROR, &event.encode());
    }

    fn operation_succeeded(&mut self, correlation_id: i64) {
        let event = OperationSucceededEvent { correlation_id };
        self.transmit(event_type::ON_OPERATION_SUCCESS, &event.encode());
    }

    // --- Client session management -----------------------------------------

    fn ensure_client(&mut self, client_id: i64, now_ns: i64) -> DriverResult<()> {
        let deadline = now_ns + self.ctx.client_liveness_timeout_ns;
        let now_ms = epoch_ms();

        match self.clients.iter_mut().find(|c| c.client_id == client_id) {
            Some(client) => {
                client.deadline_ns = deadline;
                client.heartbeat.set_ordered(now_ms);
                Ok(())
            }
            None => {
                let counter_id = self.counters_manager.allocate(
                    counters::CLIENT_HEARTBEAT_TIMESTAMP_TYPE_ID,
                    &client_id.to_le_bytes(),
                    &format!("client-heartbeat: {}", client_id),
                    now_ms,
                )?;
                let heartbeat = self.counters_manager.position(counter_id);
                heartbeat.set_ordered(now_ms);

                logging::debug!(self.log, "client session started";
                                "context" => "ensure_client",
                                "client_id" => client_id);

                self.clients.push(ClientSession {
                    client_id,
                    deadline_ns: deadline,
                    heartbeat_counter_id: counter_id,
                    heartbeat,
                });
                Ok(())
            }
        }
    }

    // --- Command ring ------------------------------------------------------

    fn process_client_commands(&mut self, now_ns: i64) -> usize {
        let mut batch: Vec<(i32, Vec<u8>)> = Vec::new();
        self.to_driver.read(
            |msg_type, payload| batch.push((msg_type, payload.to_vec())),
            10,
        );

        let count = batch.len();
        for (msg_type, payload) in batch {
            self.dispatch_client_command(msg_type, &payload, now_ns);
        }
        count
    }

    fn dispatch_client_command(&mut self, msg_type: i32, payload: &[u8], now_ns: i64) {
        let result = match msg_type {
            command_type::ADD_PUBLICATION => self.on_add_publication(payload, now_ns),
            command_type::REMOVE_PUBLICATION => self.on_remove_publication(payload, now_ns),
            command_type::ADD_SUBSCRIPTION => self.on_add_subscription(payload, now_ns),
            command_type::REMOVE_SUBSCRIPTION => self.on_remove_subscription(payload, now_ns),
            command_type::ADD_DESTINATION => self.on_add_destination(payload, now_ns),
            command_type::REMOVE_DESTINATION => self.on_remove_destination(payload, now_ns),
            command_type::CLIENT_KEEPALIVE => self.on_client_keepalive(payload, now_ns),
            command_type::ADD_COUNTER => self.on_add_counter(payload, now_ns),
            command_type::REMOVE_COUNTER => self.on_remove_counter(payload, now_ns),
            command_type::CLIENT_CLOSE => self.on_client_close(payload, now_ns),
            command_type::TERMINATE_DRIVER => self.on_terminate_driver(payload),
            _ => Err((
                crate::NULL_VALUE,
                ErrorKind::Protocol(format!("unknown command type {}", msg_type)),
            )),
        };

        if let Err((correlation_id, kind)) = result {
            self.on_error(correlation_id, &kind, epoch_ms());
        }
    }

    // Handlers return Err((offending_correlation_id, kind)).

    fn on_add_publication(
        &mut self,
        payload: &[u8],
        now_ns: i64,
    ) -> Result<(), (i64, ErrorKind)> {
        let msg = PublicationMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let uri = ChannelUri::parse(&msg.channel).map_err(fatal_kind(correlation_id))?;

        match uri.media() {
            Media::Ipc => self
                .add_ipc_publication(&msg, &uri, now_ns)
                .map_err(fatal_kind(correlation_id)),
            Media::Udp => self
                .add_network_publication(&msg, &uri, now_ns)
                .map_err(fatal_kind(correlation_id)),
        }
    }

    fn find_or_create_send_endpoint(&mut self, channel: &UdpChannel) -> DriverResult<usize> {
        if let Some(entry) = self
            .send_endpoints
            .iter_mut()
            .find(|e| e.endpoint.udp_channel.canonical == channel.canonical)
        {
            entry.ref_count += 1;
            return Ok(entry.endpoint.id);
        }

        let id = self.next_endpoint_id;
        self.next_endpoint_id += 1;
        let status_counter_id = self.counters_manager.allocate(
            counters::SEND_CHANNEL_STATUS_TYPE_ID,
            &[],
            &format!("snd-channel: {}", channel.canonical),
            epoch_ms(),
        )?;
        let status = self.counters_manager.position(status_counter_id);
        let endpoint = Arc::new(SendChannelEndpoint::new(id, channel.clone(), status)?);

        logging::info!(self.log, "send channel endpoint created";
                       "context" => "find_or_create_send_endpoint",
                       "endpoint_id" => id,
                       "canonical" => %channel.canonical);

        self.send_endpoints.push(SendEndpointEntry {
            endpoint,
            ref_count: 1,
            status_counter_id,
        });

        Ok(id)
    }

    fn add_network_publication(
        &mut self,
        msg: &PublicationMessage,
        uri: &ChannelUri,
        now_ns: i64,
    ) -> DriverResult<()> {
        let correlation_id = msg.correlated.correlation_id;
        let udp_channel = UdpChannel::resolve(uri.clone(), &mut self.resolver)?;

        let mtu = uri.mtu()?.unwrap_or(self.ctx.mtu_length);
        let term_length = uri.term_length()?.unwrap_or(self.ctx.term_length);
        let session_param = uri.session_id()?;
        let canonical = udp_channel.canonical.clone();

        // Shared (non-exclusive) publications coalesce on (channel, stream).
        if !msg.is_exclusive {
            let found = self.network_publications.iter_mut().find(|e| {
                e.canonical == canonical
                    && e.publication.stream_id == msg.stream_id
                    && !e.is_exclusive
                    && session_param.map_or(true, |s| s == e.publication.session_id)
            });
            if let Some(entry) = found {
                if entry.publication.mtu != mtu || entry.publication.term_length != term_length {
                    return Err(DriverError::Fatal(ErrorKind::ClashingState(format!(
                        "existing publication on stream {} has different geometry",
                        msg.stream_id
                    ))));
                }
                entry.ref_count += 1;
                let publication = entry.publication.clone();
                self.publication_links.push(PublicationLink {
                    registration_id: correlation_id,
                    client_id: msg.correlated.client_id,
                    publication_id: publication.registration_id,
                    is_ipc: false,
                });
                let event = PublicationReadyEvent {
                    correlation_id,
                    registration_id: publication.registration_id,
                    session_id: publication.session_id,
                    stream_id: publication.stream_id,
                    publisher_limit_counter_id: publication.publisher_limit.id(),
                    channel_status_counter_id: self.send_endpoint_status_id(&canonical),
                    log_file: publication.log_file(),
                };
                self.transmit(event_type::ON_PUBLICATION_READY, &event.encode());
                return Ok(());
            }
        }

        // A session id clash on the same (channel, stream) is admissible
        // only through the sharing path above.
        let session_id = match session_param {
            Some(requested) => {
                let clash = self.network_publications.iter().any(|e| {
                    e.canonical == canonical
                        && e.publication.stream_id == msg.stream_id
                        && e.publication.session_id == requested
                });
                if clash {
                    return Err(DriverError::Fatal(ErrorKind::ClashingState(format!(
                        "session-id {} already active on stream {}",
                        requested, msg.stream_id
                    ))));
                }
                requested
            }
            None => self.allocate_session_id(&canonical, msg.stream_id),
        };

        let endpoint_id = self.find_or_create_send_endpoint(&udp_channel)?;
        let endpoint = self.send_endpoint(endpoint_id);

        let initial_position = uri.initial_position()?;
        let initial_term_id = initial_position.map_or(0, |p| p.initial_term_id);

        let log_path = self
            .ctx
            .driver_dir
            .join("publications")
            .join(format!("{}.logbuffer", correlation_id));
        let log = Arc::new(LogBuffers::create(
            &log_path,
            term_length,
            initial_term_id,
            mtu,
            correlation_id,
        )?);

        let mut start_position = 0i64;
        if let Some(initial) = initial_position {
            let bits = descriptor::position_bits_to_shift(term_length);
            start_position = descriptor::compute_position(
                initial.term_id,
                initial.term_offset,
                bits,
                initial.initial_term_id,
            );
            let term_count = initial.term_id.wrapping_sub(initial.initial_term_id);
            let index = descriptor::index_by_term_count(term_count as i64);
            let metadata = log.metadata();
            metadata.put_i64(
                descriptor::tail_counter_offset(index),
                descriptor::pack_tail(initial.term_id, initial.term_offset),
            );
            metadata.put_i32(descriptor::LOG_ACTIVE_TERM_COUNT_OFFSET, term_count);
        }

        let now_ms = epoch_ms();
        let label_suffix = format!(
            "{} {} {} {}",
            correlation_id, session_id, msg.stream_id, msg.channel
        );
        let pub_lmt_id = self.counters_manager.allocate(
            counters::PUBLISHER_LIMIT_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("pub-lmt: {}", label_suffix),
            now_ms,
        )?;
        let pub_pos_id = self.counters_manager.allocate(
            counters::PUBLISHER_POSITION_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("pub-pos: {}", label_suffix),
            now_ms,
        )?;
        let snd_pos_id = self.counters_manager.allocate(
            counters::SENDER_POSITION_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("snd-pos: {}", label_suffix),
            now_ms,
        )?;
        let snd_lmt_id = self.counters_manager.allocate(
            counters::SENDER_LIMIT_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("snd-lmt: {}", label_suffix),
            now_ms,
        )?;

        let publication = Arc::new(NetworkPublication::new(
            correlation_id,
            session_id,
            msg.stream_id,
            initial_term_id,
            self.ctx.term_window_length(term_length),
            udp_channel.ttl.unwrap_or(0),
            log,
            self.counters_manager.position(pub_lmt_id),
            self.counters_manager.position(pub_pos_id),
            self.counters_manager.position(snd_pos_id),
            self.counters_manager.position(snd_lmt_id),
            self.system_counters.clone(),
            now_ns,
        ));
        publication.sender_position.set_ordered(start_position);
        publication.publisher_position.set_ordered(start_position);
        publication.sender_limit.set_ordered(start_position);

        let flow_control = self.flow_control_for(uri, &udp_channel)?;
        let destinations = match (udp_channel.control_mode, endpoint.default_destination()) {
            (ControlMode::Manual, _) => DestinationTracker::manual(),
            (ControlMode::Dynamic, _) => {
                DestinationTracker::dynamic(self.ctx.destination_timeout_ns)
            }
            (ControlMode::None, Some(address)) => DestinationTracker::single(address),
            (ControlMode::None, None) => {
                return Err(DriverError::Fatal(ErrorKind::InvalidChannel(format!(
                    "publication channel needs an endpoint: {}",
                    msg.channel
                ))))
            }
        };

        if self
            .sender_proxy
            .offer(SenderCommand::AddPublication {
                publication: publication.clone(),
                endpoint,
                flow_control,
                destinations,
            })
            .is_err()
        {
            self.system_counters.back_pressure_events.increment();
            return Err(DriverError::Fatal(ErrorKind::Resource(
                "sender command queue full".to_string(),
            )));
        }

        self.publication_links.push(PublicationLink {
            registration_id: correlation_id,
            client_id: msg.correlated.client_id,
            publication_id: correlation_id,
            is_ipc: false,
        });
        let event = PublicationReadyEvent {
            correlation_id,
            registration_id: correlation_id,
            session_id,
            stream_id: msg.stream_id,
            publisher_limit_counter_id: pub_lmt_id,
            channel_status_counter_id: self.send_endpoint_status_id(&canonical),
            log_file: publication.log_file(),
        };
        let event_type_id = if msg.is_exclusive {
            event_type::ON_EXCLUSIVE_PUBLICATION_READY
        } else {
            event_type::ON_PUBLICATION_READY
        };

        logging::info!(self.log, "network publication created";
                       "context" => "add_network_publication",
                       "registration_id" => correlation_id,
                       "session_id" => session_id,
                       "stream_id" => msg.stream_id,
                       "channel" => %msg.channel);

        self.network_publications.push(NetworkPublicationEntry {
            publication,
            canonical,
            endpoint_id,
            is_exclusive: msg.is_exclusive,
            ref_count: 1,
            counter_ids: [pub_lmt_id, pub_pos_id, snd_pos_id, snd_lmt_id],
            last_consumer_position: start_position,
            time_of_last_consumer_change_ns: now_ns,
        });
        self.transmit(event_type_id, &event.encode());

        Ok(())
    }

    fn flow_control_for(
        &self,
        uri: &ChannelUri,
        channel: &UdpChannel,
    ) -> DriverResult<Box<dyn FlowControl>> {
        let timeout = self.ctx.flow_control_receiver_timeout_ns;
        let is_group = channel.is_multicast || uri.group()? || channel.is_multi_destination();

        if !is_group {
            return Ok(Box::new(UnicastFlowControl::new(timeout)));
        }

        match uri.group_tag()? {
            Some(tag) => Ok(Box::new(TaggedMulticastFlowControl::new(tag, 1, timeout))),
            None => Ok(Box::new(MinMulticastFlowControl::new(timeout))),
        }
    }

    fn send_endpoint(&self, endpoint_id: usize) -> Arc<SendChannelEndpoint> {
        self.send_endpoints
            .iter()
            .find(|e| e.endpoint.id == endpoint_id)
            .map(|e| e.endpoint.clone())
            .expect("send endpoint must exist for live publication")
    }

    fn send_endpoint_status_id(&self, canonical: &str) -> i32 {
        self.send_endpoints
            .iter()
            .find(|e| e.endpoint.udp_channel.canonical == canonical)
            .map(|e| e.status_counter_id)
            .unwrap_or(-1)
    }

    /// Dynamic session ids avoid the reserved range and any session live
    /// on the same (channel, stream).
    fn allocate_session_id(&mut self, canonical: &str, stream_id: i32) -> i32 {
        loop {
            let candidate = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);

            if candidate >= self.ctx.reserved_session_id_low
                && candidate <= self.ctx.reserved_session_id_high
            {
                self.next_session_id = self.ctx.reserved_session_id_high.wrapping_add(1);
                continue;
            }

            let clash = self.network_publications.iter().any(|e| {
                e.canonical == canonical
                    && e.publication.stream_id == stream_id
                    && e.publication.session_id == candidate
            });
            if !clash {
                return candidate;
            }
        }
    }

    fn add_ipc_publication(
        &mut self,
        msg: &PublicationMessage,
        uri: &ChannelUri,
        now_ns: i64,
    ) -> DriverResult<()> {
        let correlation_id = msg.correlated.correlation_id;
        let term_length = uri.term_length()?.unwrap_or(self.ctx.ipc_term_length);
        let session_param = uri.session_id()?;

        if !msg.is_exclusive {
            let found = self.ipc_publications.iter_mut().find(|e| {
                e.publication.stream_id == msg.stream_id
                    && !e.is_exclusive
                    && session_param.map_or(true, |s| s == e.publication.session_id)
            });
            if let Some(entry) = found {
                if entry.publication.term_length != term_length {
                    return Err(DriverError::Fatal(ErrorKind::ClashingState(format!(
                        "existing ipc publication on stream {} has different geometry",
                        msg.stream_id
                    ))));
                }
                entry.ref_count += 1;
                let registration_id = entry.publication.registration_id;
                let session_id = entry.publication.session_id;
                let limit_id = entry.publication.publisher_limit.id();
                let log_file = entry.publication.log_file();
                self.publication_links.push(PublicationLink {
                    registration_id: correlation_id,
                    client_id: msg.correlated.client_id,
                    publication_id: registration_id,
                    is_ipc: true,
                });
                let event = PublicationReadyEvent {
                    correlation_id,
                    registration_id,
                    session_id,
                    stream_id: msg.stream_id,
                    publisher_limit_counter_id: limit_id,
                    channel_status_counter_id: -1,
                    log_file,
                };
                self.transmit(event_type::ON_PUBLICATION_READY, &event.encode());
                return Ok(());
            }
        }

        let session_id = session_param.unwrap_or_else(|| {
            let id = self.next_session_id;
            self.next_session_id = self.next_session_id.wrapping_add(1);
            id
        });

        let log_path = self
            .ctx
            .driver_dir
            .join("ipc")
            .join(format!("{}.logbuffer", correlation_id));
        let log = Arc::new(LogBuffers::create(&log_path, term_length, 0, self.ctx.mtu_length, correlation_id)?);

        let now_ms = epoch_ms();
        let pub_lmt_id = self.counters_manager.allocate(
            counters::PUBLISHER_LIMIT_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("pub-lmt: {} {} {} ipc", correlation_id, session_id, msg.stream_id),
            now_ms,
        )?;
        let pub_pos_id = self.counters_manager.allocate(
            counters::PUBLISHER_POSITION_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("pub-pos: {} {} {} ipc", correlation_id, session_id, msg.stream_id),
            now_ms,
        )?;

        let publication = IpcPublication::new(
            correlation_id,
            session_id,
            msg.stream_id,
            0,
            self.ctx.term_window_length(term_length),
            log,
            self.counters_manager.position(pub_lmt_id),
            self.counters_manager.position(pub_pos_id),
            self.system_counters.clone(),
            now_ns,
        );
        publication
            .publisher_limit
            .set_ordered(self.ctx.term_window_length(term_length) as i64);

        let log_file = publication.log_file();
        let mut entry = IpcPublicationEntry {
            publication,
            is_exclusive: msg.is_exclusive,
            ref_count: 1,
            counter_ids: [pub_lmt_id, pub_pos_id],
            subscriber_positions: Vec::new(),
        };

        // Wire up every live ipc subscription on the stream.
        let now_ms = epoch_ms();
        let mut events = Vec::new();
        for link_index in 0..self.subscription_links.len() {
            let link = &self.subscription_links[link_index];
            if !link.is_ipc || link.stream_id != msg.stream_id {
                continue;
            }
            let link_registration_id = link.registration_id;
            let tether = link.tether;
            let counter_id = self.counters_manager.allocate(
                counters::SUBSCRIPTION_POSITION_TYPE_ID,
                &link_registration_id.to_le_bytes(),
                &format!("sub-pos: {} {} {} ipc", link_registration_id, session_id, msg.stream_id),
                now_ms,
            )?;
            let position = self.counters_manager.position(counter_id);
            position.set_ordered(0);
            entry.subscriber_positions.push(SubscriberPosition {
                link_registration_id,
                counter_id,
                position,
                tether,
                state: TetherState::Active,
            });
            events.push(AvailableImageEvent {
                correlation_id,
                subscription_registration_id: link_registration_id,
                session_id,
                stream_id: msg.stream_id,
                subscriber_position_counter_id: counter_id,
                log_file: log_file.clone(),
                source_identity: "aqueduct:ipc".to_string(),
            });
        }

        self.ipc_publications.push(entry);
        self.publication_links.push(PublicationLink {
            registration_id: correlation_id,
            client_id: msg.correlated.client_id,
            publication_id: correlation_id,
            is_ipc: true,
        });

        let event = PublicationReadyEvent {
            correlation_id,
            registration_id: correlation_id,
            session_id,
            stream_id: msg.stream_id,
            publisher_limit_counter_id: pub_lmt_id,
            channel_status_counter_id: -1,
            log_file,
        };
        let event_type_id = if msg.is_exclusive {
            event_type::ON_EXCLUSIVE_PUBLICATION_READY
        } else {
            event_type::ON_PUBLICATION_READY
        };
        self.transmit(event_type_id, &event.encode());
        for available in events {
            self.transmit(event_type::ON_AVAILABLE_IMAGE, &available.encode());
        }

        Ok(())
    }

    fn on_remove_publication(
        &mut self,
        payload: &[u8],
        now_ns: i64,
    ) -> Result<(), (i64, ErrorKind)> {
        let msg = RemoveMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let index = self
            .publication_links
            .iter()
            .position(|l| {
                l.registration_id == msg.registration_id
                    && l.client_id == msg.correlated.client_id
            })
            .ok_or((
                correlation_id,
                ErrorKind::UnknownRegistration(format!(
                    "unknown publication registration {}",
                    msg.registration_id
                )),
            ))?;

        let link = self.publication_links.swap_remove(index);
        self.release_publication(&link, now_ns);
        self.operation_succeeded(correlation_id);
        Ok(())
    }

    fn release_publication(&mut self, link: &PublicationLink, now_ns: i64) {
        if link.is_ipc {
            if let Some(entry) = self
                .ipc_publications
                .iter_mut()
                .find(|e| e.publication.registration_id == link.publication_id)
            {
                entry.ref_count -= 1;
                if entry.ref_count == 0 {
                    entry.publication.set_state(IpcPublicationState::Inactive, now_ns);
                }
            }
        } else if let Some(entry) = self
            .network_publications
            .iter_mut()
            .find(|e| e.publication.registration_id == link.publication_id)
        {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                entry.publication.signal_end_of_stream();
                entry.publication.set_state(PublicationState::Draining, now_ns);
            }
        }
    }

    fn find_or_create_receive_endpoint(&mut self, channel: &UdpChannel) -> DriverResult<usize> {
        if let Some(entry) = self
            .receive_endpoints
            .iter_mut()
            .find(|e| e.endpoint.udp_channel.canonical == channel.canonical)
        {
            entry.ref_count += 1;
            return Ok(entry.endpoint.id);
        }

        let id = self.next_endpoint_id;
        self.next_endpoint_id += 1;
        let status_counter_id = self.counters_manager.allocate(
            counters::RECEIVE_CHANNEL_STATUS_TYPE_ID,
            &[],
            &format!("rcv-channel: {}", channel.canonical),
            epoch_ms(),
        )?;
        let status = self.counters_manager.position(status_counter_id);
        let endpoint = Arc::new(ReceiveChannelEndpoint::new(id, channel.clone(), status)?);

        if self
            .receiver_proxy
            .offer(ReceiverCommand::RegisterEndpoint {
                endpoint: endpoint.clone(),
            })
            .is_err()
        {
            self.system_counters.back_pressure_events.increment();
            return Err(DriverError::Fatal(ErrorKind::Resource(
                "receiver command queue full".to_string(),
            )));
        }

        logging::info!(self.log, "receive channel endpoint created";
                       "context" => "find_or_create_receive_endpoint",
                       "endpoint_id" => id,
                       "canonical" => %channel.canonical);

        self.receive_endpoints.push(ReceiveEndpointEntry {
            endpoint,
            ref_count: 1,
            status_counter_id,
        });

        Ok(id)
    }

    fn on_add_subscription(
        &mut self,
        payload: &[u8],
        now_ns: i64,
    ) -> Result<(), (i64, ErrorKind)> {
        let msg = SubscriptionMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let uri = ChannelUri::parse(&msg.channel).map_err(fatal_kind(correlation_id))?;
        let reliable = uri.reliable().map_err(fatal_kind(correlation_id))?;
        let tether = uri.tether().map_err(fatal_kind(correlation_id))?;
        let session_id = uri.session_id().map_err(fatal_kind(correlation_id))?;
        let cc = uri
            .congestion_control()
            .map_err(fatal_kind(correlation_id))?
            .unwrap_or(CongestionControlKind::Static);

        match uri.media() {
            Media::Ipc => {
                self.subscription_links.push(SubscriptionLink {
                    registration_id: correlation_id,
                    client_id: msg.correlated.client_id,
                    stream_id: msg.stream_id,
                    is_ipc: true,
                    endpoint_id: None,
                    session_id,
                    reliable,
                    tether,
                    cc,
                });

                let event = SubscriptionReadyEvent {
                    correlation_id,
                    channel_status_counter_id: -1,
                };
                self.transmit(event_type::ON_SUBSCRIPTION_READY, &event.encode());

                // Existing ipc publications on the stream become images.
                let now_ms = epoch_ms();
                let mut events = Vec::new();
                for index in 0..self.ipc_publications.len() {
                    if self.ipc_publications[index].publication.stream_id != msg.stream_id {
                        continue;
                    }
                    let publication_session =
                        self.ipc_publications[index].publication.session_id;
                    if let Some(wanted) = session_id {
                        if wanted != publication_session {
                            continue;
                        }
                    }
                    let position_value =
                        self.ipc_publications[index].publication.producer_position();
                    let counter_id = self
                        .counters_manager
                        .allocate(
                            counters::SUBSCRIPTION_POSITION_TYPE_ID,
                            &correlation_id.to_le_bytes(),
                            &format!(
                                "sub-pos: {} {} {} ipc",
                                correlation_id, publication_session, msg.stream_id
                            ),
                            now_ms,
                        )
                        .map_err(fatal_kind(correlation_id))?;
                    let position = self.counters_manager.position(counter_id);
                    position.set_ordered(position_value);

                    let entry = &mut self.ipc_publications[index];
                    entry.subscriber_positions.push(SubscriberPosition {
                        link_registration_id: correlation_id,
                        counter_id,
                        position,
                        tether,
                        state: TetherState::Active,
                    });
                    events.push(AvailableImageEvent {
                        correlation_id: entry.publication.registration_id,
                        subscription_registration_id: correlation_id,
                        session_id: publication_session,
                        stream_id: msg.stream_id,
                        subscriber_position_counter_id: counter_id,
                        log_file: entry.publication.log_file(),
                        source_identity: "aqueduct:ipc".to_string(),
                    });
                }
                for available in events {
                    self.transmit(event_type::ON_AVAILABLE_IMAGE, &available.encode());
                }
                Ok(())
            }
            Media::Udp => {
                let udp_channel = UdpChannel::resolve(uri.clone(), &mut self.resolver)
                    .map_err(fatal_kind(correlation_id))?;
                let endpoint_id = self
                    .find_or_create_receive_endpoint(&udp_channel)
                    .map_err(fatal_kind(correlation_id))?;

                let command = match session_id {
                    Some(session) => ReceiverCommand::AddSubscriptionSession {
                        endpoint_id,
                        stream_id: msg.stream_id,
                        session_id: session,
                    },
                    None => ReceiverCommand::AddSubscription {
                        endpoint_id,
                        stream_id: msg.stream_id,
                    },
                };
                if self.receiver_proxy.offer(command).is_err() {
                    self.system_counters.back_pressure_events.increment();
                    return Err((
                        correlation_id,
                        ErrorKind::Resource("receiver command queue full".to_string()),
                    ));
                }

                self.subscription_links.push(SubscriptionLink {
                    registration_id: correlation_id,
                    client_id: msg.correlated.client_id,
                    stream_id: msg.stream_id,
                    is_ipc: false,
                    endpoint_id: Some(endpoint_id),
                    session_id,
                    reliable,
                    tether,
                    cc,
                });

                let status_id = self
                    .receive_endpoints
                    .iter()
                    .find(|e| e.endpoint.id == endpoint_id)
                    .map(|e| e.status_counter_id)
                    .unwrap_or(-1);
                let event = SubscriptionReadyEvent {
                    correlation_id,
                    channel_status_counter_id: status_id,
                };
                self.transmit(event_type::ON_SUBSCRIPTION_READY, &event.encode());
                Ok(())
            }
        }
    }

    fn on_remove_subscription(
        &mut self,
        payload: &[u8],
        now_ns: i64,
    ) -> Result<(), (i64, ErrorKind)> {
        let msg = RemoveMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let index = self
            .subscription_links
            .iter()
            .position(|l| {
                l.registration_id == msg.registration_id
                    && l.client_id == msg.correlated.client_id
            })
            .ok_or((
                correlation_id,
                ErrorKind::UnknownRegistration(format!(
                    "unknown subscription registration {}",
                    msg.registration_id
                )),
            ))?;

        let link = self.subscription_links.swap_remove(index);
        self.release_subscription(&link, now_ns);
        self.operation_succeeded(correlation_id);
        Ok(())
    }

    fn release_subscription(&mut self, link: &SubscriptionLink, now_ns: i64) {
        let now_ms = epoch_ms();

        if link.is_ipc {
            let counters_manager = &mut self.counters_manager;
            for entry in self.ipc_publications.iter_mut() {
                entry.subscriber_positions.retain(|sub| {
                    if sub.link_registration_id == link.registration_id {
                        counters_manager.free(sub.counter_id, now_ms);
                        false
                    } else {
                        true
                    }
                });
            }
            return;
        }

        if let Some(endpoint_id) = link.endpoint_id {
            let command = match link.session_id {
                Some(session) => ReceiverCommand::RemoveSubscriptionSession {
                    endpoint_id,
                    stream_id: link.stream_id,
                    session_id: session,
                },
                None => ReceiverCommand::RemoveSubscription {
                    endpoint_id,
                    stream_id: link.stream_id,
                },
            };
            if self.receiver_proxy.offer(command).is_err() {
                self.system_counters.back_pressure_events.increment();
            }

            let counters_manager = &mut self.counters_manager;
            for entry in self.images.iter_mut() {
                entry.subscriber_positions.retain(|sub| {
                    if sub.link_registration_id == link.registration_id {
                        counters_manager.free(sub.counter_id, now_ms);
                        false
                    } else {
                        true
                    }
                });
            }

            if let Some(index) = self
                .receive_endpoints
                .iter()
                .position(|e| e.endpoint.id == endpoint_id)
            {
                self.receive_endpoints[index].ref_count -= 1;
                if self.receive_endpoints[index].ref_count == 0 {
                    let entry = self.receive_endpoints.swap_remove(index);
                    if self
                        .receiver_proxy
                        .offer(ReceiverCommand::CloseEndpoint { endpoint_id })
                        .is_err()
                    {
                        self.system_counters.back_pressure_events.increment();
                    }
                    entry
                        .endpoint
                        .status
                        .set_ordered(crate::driver::endpoint::STATUS_CLOSING);
                    self.counters_manager.free(entry.status_counter_id, now_ms);
                }
            }
        }
        let _ = now_ns;
    }

    fn on_add_destination(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, ErrorKind)> {
        let msg = DestinationMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let link = self
            .publication_links
            .iter()
            .find(|l| l.registration_id == msg.registration_id && !l.is_ipc)
            .ok_or((
                correlation_id,
                ErrorKind::UnknownRegistration(format!(
                    "unknown publication registration {}",
                    msg.registration_id
                )),
            ))?;
        let publication_id = link.publication_id;

        let uri = ChannelUri::parse(&msg.channel).map_err(fatal_kind(correlation_id))?;
        let endpoint_name = uri.endpoint().ok_or((
            correlation_id,
            ErrorKind::InvalidChannel("destination needs an endpoint".to_string()),
        ))?;
        let address = self
            .resolver
            .resolve(endpoint_name)
            .map_err(fatal_kind(correlation_id))?;

        if self
            .sender_proxy
            .offer(SenderCommand::AddDestination {
                registration_id: publication_id,
                destination_registration_id: correlation_id,
                address,
            })
            .is_err()
        {
            self.system_counters.back_pressure_events.increment();
            return Err((
                correlation_id,
                ErrorKind::Resource("sender command queue full".to_string()),
            ));
        }

        self.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_remove_destination(
        &mut self,
        payload: &[u8],
        now_ns: i64,
    ) -> Result<(), (i64, ErrorKind)> {
        let msg = DestinationMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let link = self
            .publication_links
            .iter()
            .find(|l| l.registration_id == msg.registration_id && !l.is_ipc)
            .ok_or((
                correlation_id,
                ErrorKind::UnknownRegistration(format!(
                    "unknown publication registration {}",
                    msg.registration_id
                )),
            ))?;
        let publication_id = link.publication_id;

        let uri = ChannelUri::parse(&msg.channel).map_err(fatal_kind(correlation_id))?;
        let endpoint_name = uri.endpoint().ok_or((
            correlation_id,
            ErrorKind::InvalidChannel("destination needs an endpoint".to_string()),
        ))?;
        let address = self
            .resolver
            .resolve(endpoint_name)
            .map_err(fatal_kind(correlation_id))?;

        if self
            .sender_proxy
            .offer(SenderCommand::RemoveDestination {
                registration_id: publication_id,
                address,
            })
            .is_err()
        {
            self.system_counters.back_pressure_events.increment();
        }

        self.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_client_keepalive(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, ErrorKind)> {
        let msg = ClientMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        self.ensure_client(msg.client_id, now_ns)
            .map_err(fatal_kind(crate::NULL_VALUE))?;
        Ok(())
    }

    fn on_add_counter(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, ErrorKind)> {
        let msg = CounterMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let counter_id = self
            .counters_manager
            .allocate(msg.type_id, &msg.key, &msg.label, epoch_ms())
            .map_err(fatal_kind(correlation_id))?;

        self.counter_links.push(CounterLink {
            registration_id: correlation_id,
            client_id: msg.correlated.client_id,
            counter_id,
        });

        let event = CounterReadyEvent {
            correlation_id,
            counter_id,
        };
        self.transmit(event_type::ON_COUNTER_READY, &event.encode());
        Ok(())
    }

    fn on_remove_counter(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, ErrorKind)> {
        let msg = RemoveMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        let correlation_id = msg.correlated.correlation_id;
        self.ensure_client(msg.correlated.client_id, now_ns)
            .map_err(fatal_kind(correlation_id))?;

        let index = self
            .counter_links
            .iter()
            .position(|l| {
                l.registration_id == msg.registration_id
                    && l.client_id == msg.correlated.client_id
            })
            .ok_or((
                correlation_id,
                ErrorKind::UnknownRegistration(format!(
                    "unknown counter registration {}",
                    msg.registration_id
                )),
            ))?;

        let link = self.counter_links.swap_remove(index);
        self.counters_manager.free(link.counter_id, epoch_ms());
        self.operation_succeeded(correlation_id);
        Ok(())
    }

    fn on_client_close(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, ErrorKind)> {
        let msg = ClientMessage::decode(payload).map_err(fatal_kind(crate::NULL_VALUE))?;
        if let Some(index) = self.clients.iter().position(|c| c.client_id == msg.client_id) {
            let client = self.clients.swap_remove(index);
            self.reap_client(&client, now_ns, false);
        }
        Ok(())
    }

    fn on_terminate_driver(&mut self, _payload: &[u8]) -> Result<(), (i64, ErrorKind)> {
        if self.ctx.enable_driver_termination {
            logging::info!(self.log, "driver termination requested"; "context" => "terminate");
            self.terminate.store(true, Ordering::Release);
            Ok(())
        } else {
            Err((
                crate::NULL_VALUE,
                ErrorKind::Generic("driver termination disabled".to_string()),
            ))
        }
    }

    /// Remove everything a dead or closing client registered.
    fn reap_client(&mut self, client: &ClientSession, now_ns: i64, notify: bool) {
        let client_id = client.client_id;
        logging::info!(self.log, "reaping client";
                       "context" => "reap_client",
                       "client_id" => client_id,
                       "timed_out" => notify);

        let publication_links: Vec<PublicationLink> = {
            let mut taken = Vec::new();
            let mut index = 0;
            while index < self.publication_links.len() {
                if self.publication_links[index].client_id == client_id {
                    taken.push(self.publication_links.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            taken
        };
        for link in publication_links {
            self.release_publication(&link, now_ns);
        }

        let subscription_links: Vec<SubscriptionLink> = {
            let mut taken = Vec::new();
            let mut index = 0;
            while index < self.subscription_links.len() {
                if self.subscription_links[index].client_id == client_id {
                    taken.push(self.subscription_links.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            taken
        };
        for link in subscription_links {
            self.release_subscription(&link, now_ns);
        }

        let now_ms = epoch_ms();
        let mut index = 0;
        while index < self.counter_links.len() {
            if self.counter_links[index].client_id == client_id {
                let link = self.counter_links.swap_remove(index);
                self.counters_manager.free(link.counter_id, now_ms);
            } else {
                index += 1;
            }
        }

        self.counters_manager.free(client.heartbeat_counter_id, now_ms);

        if notify {
            self.system_counters.client_timeouts.increment();
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&client_id.to_le_bytes());
            self.transmit(event_type::ON_CLIENT_TIMEOUT, &payload);
        }
    }

    // --- Agent-to-agent commands -------------------------------------------

    fn process_agent_commands(&mut self, now_ns: i64) -> usize {
        let mut pending = Vec::new();
        let mut count = self.from_receiver.drain(|cmd| pending.push(cmd), 16);
        count += self.from_sender.drain(|cmd| pending.push(cmd), 16);

        for cmd in pending {
            match cmd {
                ConductorCommand::CreatePublicationImage {
                    endpoint_id,
                    session_id,
                    stream_id,
                    initial_term_id,
                    active_term_id,
                    term_offset,
                    term_length,
                    mtu,
                    source,
                } => {
                    if let Err(err) = self.create_publication_image(
                        endpoint_id,
                        session_id,
                        stream_id,
                        initial_term_id,
                        active_term_id,
                        term_offset,
                        term_length,
                        mtu,
                        source,
                        now_ns,
                    ) {
                        if let DriverError::Fatal(kind) = err {
                            let message = kind.message();
                            self.error_log.record(&message, epoch_ms());
                            self.system_counters.errors.increment();
                        }
                    }
                }
                ConductorCommand::ReResolveEndpoint {
                    registration_id,
                    endpoint_name,
                } => {
                    if let Ok(address) = self.resolver.resolve(&endpoint_name) {
                        if self
                            .sender_proxy
                            .offer(SenderCommand::UpdateDestinationAddress {
                                registration_id,
                                address,
                            })
                            .is_err()
                        {
                            self.system_counters.back_pressure_events.increment();
                        }
                    }
                }
            }
        }

        count
    }

    fn create_publication_image(
        &mut self,
        endpoint_id: usize,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        term_offset: i32,
        term_length: i32,
        mtu: i32,
        source: SocketAddr,
        now_ns: i64,
    ) -> DriverResult<()> {
        descriptor::check_term_length(term_length as usize)?;
        if mtu < 64 || mtu % 32 != 0 {
            return Err(DriverError::Fatal(ErrorKind::Protocol(format!(
                "setup carried a malformed mtu {}",
                mtu
            ))));
        }

        // Snapshot matching links before any allocation.
        let links: Vec<(i64, bool, bool, CongestionControlKind)> = self
            .subscription_links
            .iter()
            .filter(|l| {
                !l.is_ipc
                    && l.endpoint_id == Some(endpoint_id)
                    && l.stream_id == stream_id
                    && l.session_id.map_or(true, |s| s == session_id)
            })
            .map(|l| (l.registration_id, l.reliable, l.tether, l.cc))
            .collect();

        if links.is_empty() {
            return Ok(());
        }

        let correlation_id = self.to_driver.next_correlation_id();
        let log_path = self
            .ctx
            .driver_dir
            .join("images")
            .join(format!("{}.logbuffer", correlation_id));
        let log = Arc::new(LogBuffers::create(
            &log_path,
            term_length as usize,
            initial_term_id,
            mtu as usize,
            correlation_id,
        )?);

        let now_ms = epoch_ms();
        let hwm_id = self.counters_manager.allocate(
            counters::RECEIVER_HWM_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("rcv-hwm: {} {} {}", correlation_id, session_id, stream_id),
            now_ms,
        )?;
        let rebuild_id = self.counters_manager.allocate(
            counters::RECEIVER_POSITION_TYPE_ID,
            &correlation_id.to_le_bytes(),
            &format!("rcv-pos: {} {} {}", correlation_id, session_id, stream_id),
            now_ms,
        )?;

        let (_, reliable, _, cc_kind) = links[0];
        let congestion: Box<dyn CongestionControl> = match cc_kind {
            CongestionControlKind::Static => Box::new(StaticWindowCongestionControl::new(
                self.ctx.initial_window_length,
                term_length as usize,
            )),
            CongestionControlKind::Cubic => Box::new(CubicCongestionControl::new(
                mtu as usize,
                self.ctx.initial_window_length,
                term_length as usize,
            )),
        };
        let initial_window = congestion.initial_window_length();

        let image = Arc::new(PublicationImage::new(
            correlation_id,
            session_id,
            stream_id,
            initial_term_id,
            active_term_id,
            term_offset,
            initial_window,
            reliable,
            source.to_string(),
            log,
            self.counters_manager.position(hwm_id),
            self.counters_manager.position(rebuild_id),
            self.system_counters.clone(),
            now_ns,
        ));

        let join_position = image.rebuild_position();
        let mut subscriber_positions = Vec::new();
        let mut events = Vec::new();
        for (link_registration_id, _, tether, _) in links.iter() {
            let counter_id = self.counters_manager.allocate(
                counters::SUBSCRIPTION_POSITION_TYPE_ID,
                &link_registration_id.to_le_bytes(),
                &format!(
                    "sub-pos: {} {} {}",
                    link_registration_id, session_id, stream_id
                ),
                now_ms,
            )?;
            let position = self.counters_manager.position(counter_id);
            position.set_ordered(join_position);
            subscriber_positions.push(SubscriberPosition {
                link_registration_id: *link_registration_id,
                counter_id,
                position,
                tether: *tether,
                state: TetherState::Active,
            });
            events.push(AvailableImageEvent {
                correlation_id,
                subscription_registration_id: *link_registration_id,
                session_id,
                stream_id,
                subscriber_position_counter_id: counter_id,
                log_file: image.log_file(),
                source_identity: image.source_identity.clone(),
            });
        }

        // First SM goes out as soon as the receiver picks the image up.
        image.schedule_status_message(now_ns, join_position, initial_window);

        if self
            .receiver_proxy
            .offer(ReceiverCommand::NewPublicationImage {
                endpoint_id,
                image: image.clone(),
                control_address: source,
            })
            .is_err()
        {
            self.system_counters.back_pressure_events.increment();
            return Err(DriverError::Fatal(ErrorKind::Resource(
                "receiver command queue full".to_string(),
            )));
        }

        logging::info!(self.log, "publication image created";
                       "context" => "create_publication_image",
                       "correlation_id" => correlation_id,
                       "session_id" => session_id,
                       "stream_id" => stream_id,
                       "source" => %source);

        self.images.push(ImageEntry {
            image,
            endpoint_id,
            congestion,
            loss_detector: LossDetector::new(Box::new(StaticDelayGenerator::new(
                self.ctx.nak_unicast_delay_ns,
                false,
            ))),
            counter_ids: [hwm_id, rebuild_id],
            subscriber_positions,
        });
        for available in events {
            self.transmit(event_type::ON_AVAILABLE_IMAGE, &available.encode());
        }

        Ok(())
    }

    // --- Duty-cycle housekeeping -------------------------------------------

    fn track_streams(&mut self, now_ns: i64) -> usize {
        let mut work_count = 0;

        for entry in self.network_publications.iter_mut() {
            if entry.publication.update_publisher_limit() {
                work_count += 1;
            }
            let snd_pos = entry.publication.sender_position.get_volatile();
            entry.publication.clean_buffer(snd_pos);

            if snd_pos != entry.last_consumer_position {
                entry.last_consumer_position = snd_pos;
                entry.time_of_last_consumer_change_ns = now_ns;
            }
        }

        for entry in self.ipc_publications.iter_mut() {
            let min_position = entry
                .subscriber_positions
                .iter()
                .filter(|sub| sub.state == TetherState::Active)
                .map(|sub| sub.position.get_volatile())
                .min()
                .unwrap_or_else(|| entry.publication.producer_position());

            if entry.publication.update_publisher_limit(min_position) {
                work_count += 1;
            }
            entry.publication.clean_buffer(min_position);
            entry.publication.on_consumer_position(min_position, now_ns);
        }

        for entry in self.images.iter_mut() {
            let rebuild = entry.image.rebuild_position();
            let active: Vec<i64> = entry
                .subscriber_positions
                .iter()
                .filter(|sub| !matches!(sub.state, TetherState::Resting { .. }))
                .map(|sub| sub.position.get_volatile())
                .collect();
            let min_position = active.iter().min().copied().unwrap_or(rebuild);
            let max_position = active.iter().max().copied().unwrap_or(rebuild);

            entry.image.track_rebuild(
                now_ns,
                self.ctx.status_message_timeout_ns,
                min_position,
                max_position,
                entry.congestion.as_mut(),
                &mut entry.loss_detector,
            );
            entry.image.clean_buffer(min_position);
        }

        work_count
    }

    fn on_timer(&mut self, now_ns: i64) {
        self.check_clients(now_ns);
        self.check_network_publications(now_ns);
        self.check_ipc_publications(now_ns);
        self.check_images(now_ns);

        if let Resolver::Driver(resolver) = &mut self.resolver {
            let _ = resolver.do_work(epoch_ms());
        }

        self.to_driver.update_consumer_heartbeat(epoch_ms());
    }

    fn check_clients(&mut self, now_ns: i64) {
        let expired: Vec<usize> = self
            .clients
            .iter()
            .enumerate()
            .filter(|(_, c)| now_ns > c.deadline_ns)
            .map(|(i, _)| i)
            .collect();

        for index in expired.into_iter().rev() {
            let client = self.clients.swap_remove(index);
            self.reap_client(&client, now_ns, true);
        }
    }

    fn check_network_publications(&mut self, now_ns: i64) {
        let mut done: Vec<usize> = Vec::new();

        for index in 0..self.network_publications.len() {
            let state = self.network_publications[index].publication.state();
            match state {
                PublicationState::Active => {
                    let entry = &self.network_publications[index];
                    let producer = entry.publication.producer_position();
                    let stalled = producer > entry.last_consumer_position
                        && now_ns - entry.time_of_last_consumer_change_ns
                            >= self.ctx.publication_unblock_timeout_ns;
                    if stalled {
                        let entry = &mut self.network_publications[index];
                        if entry.publication.unblock_at_consumer_position() {
                            entry.time_of_last_consumer_change_ns = now_ns;
                        }
                    }
                }
                PublicationState::Draining => {
                    let entry = &self.network_publications[index];
                    let drained = entry.publication.sender_position.get_volatile()
                        >= entry.publication.producer_position();
                    let timed_out = now_ns - entry.publication.time_of_last_state_change_ns()
                        >= self.ctx.publication_linger_timeout_ns;
                    if drained || timed_out {
                        entry.publication.set_state(PublicationState::Linger, now_ns);
                        if self
                            .sender_proxy
                            .offer(SenderCommand::RemovePublication {
                                registration_id: entry.publication.registration_id,
                            })
                            .is_err()
                        {
                            self.system_counters.back_pressure_events.increment();
                        }
                    }
                }
                PublicationState::Linger => {
                    let entry = &self.network_publications[index];
                    if entry.publication.has_sender_released()
                        && now_ns - entry.publication.time_of_last_state_change_ns()
                            >= self.ctx.publication_linger_timeout_ns
                    {
                        entry.publication.set_state(PublicationState::Done, now_ns);
                        done.push(index);
                    }
                }
                PublicationState::Done => done.push(index),
            }
        }

        let now_ms = epoch_ms();
        done.sort_unstable();
        done.dedup();
        for index in done.into_iter().rev() {
            let entry = self.network_publications.swap_remove(index);
            for counter_id in entry.counter_ids.iter() {
                self.counters_manager.free(*counter_id, now_ms);
            }
            entry.publication.log().delete_file();
            self.release_send_endpoint(entry.endpoint_id, now_ms);

            logging::info!(self.log, "network publication closed";
                           "context" => "check_network_publications",
                           "registration_id" => entry.publication.registration_id);
        }
    }

    fn release_send_endpoint(&mut self, endpoint_id: usize, now_ms: i64) {
        if let Some(index) = self
            .send_endpoints
            .iter()
            .position(|e| e.endpoint.id == endpoint_id)
        {
            self.send_endpoints[index].ref_count -= 1;
            if self.send_endpoints[index].ref_count == 0 {
                let entry = self.send_endpoints.swap_remove(index);
                entry
                    .endpoint
                    .status
                    .set_ordered(crate::driver::endpoint::STATUS_CLOSING);
                self.counters_manager.free(entry.status_counter_id, now_ms);
            }
        }
    }

    fn check_ipc_publications(&mut self, now_ns: i64) {
        let mut done: Vec<usize> = Vec::new();

        for index in 0..self.ipc_publications.len() {
            let state = self.ipc_publications[index].publication.state();
            match state {
                IpcPublicationState::Active => {
                    let entry = &mut self.ipc_publications[index];
                    if entry
                        .publication
                        .is_possibly_blocked(now_ns, self.ctx.publication_unblock_timeout_ns)
                    {
                        entry.publication.unblock();
                    }
                }
                IpcPublicationState::Inactive => {
                    let entry = &mut self.ipc_publications[index];
                    let producer = entry.publication.producer_position();
                    let drained = entry
                        .subscriber_positions
                        .iter()
                        .all(|sub| sub.position.get_volatile() >= producer);
                    let stalled = now_ns - entry.publication.time_of_last_state_change_ns()
                        >= self.ctx.publication_unblock_timeout_ns;
                    if stalled && !drained {
                        entry.publication.unblock();
                    }
                    if drained || stalled {
                        entry.publication.set_state(IpcPublicationState::Linger, now_ns);
                    }
                }
                IpcPublicationState::Linger => {
                    let entry = &mut self.ipc_publications[index];
                    if now_ns - entry.publication.time_of_last_state_change_ns()
                        >= self.ctx.publication_linger_timeout_ns
                    {
                        entry.publication.set_state(IpcPublicationState::Done, now_ns);
                        done.push(index);
                    }
                }
                IpcPublicationState::Done => done.push(index),
            }
        }

        let now_ms = epoch_ms();
        done.sort_unstable();
        done.dedup();
        for index in done.into_iter().rev() {
            let entry = self.ipc_publications.swap_remove(index);
            let mut events = Vec::new();
            for sub in entry.subscriber_positions.iter() {
                self.counters_manager.free(sub.counter_id, now_ms);
                events.push(UnavailableImageEvent {
                    correlation_id: entry.publication.registration_id,
                    subscription_registration_id: sub.link_registration_id,
                    stream_id: entry.publication.stream_id,
                });
            }
            for counter_id in entry.counter_ids.iter() {
                self.counters_manager.free(*counter_id, now_ms);
            }
            entry.publication.log().delete_file();
            for event in events {
                self.transmit(event_type::ON_UNAVAILABLE_IMAGE, &event.encode());
            }
        }
    }

    fn check_images(&mut self, now_ns: i64) {
        let mut done: Vec<usize> = Vec::new();

        for index in 0..self.images.len() {
            self.manage_untethered_subscriptions(index, now_ns);

            let state = self.images[index].image.state();
            match state {
                ImageState::Init | ImageState::Active => (),
                ImageState::Inactive => {
                    let entry = &self.images[index];
                    let positions: Vec<Position> = entry
                        .subscriber_positions
                        .iter()
                        .map(|sub| sub.position)
                        .collect();
                    if entry.image.is_drained(&positions) || entry.subscriber_positions.is_empty()
                    {
                        entry.image.set_state(ImageState::Linger, now_ns);
                        self.system_counters.images_lingered.increment();

                        let mut events = Vec::new();
                        for sub in entry.subscriber_positions.iter() {
                            events.push(UnavailableImageEvent {
                                correlation_id: entry.image.correlation_id,
                                subscription_registration_id: sub.link_registration_id,
                                stream_id: entry.image.stream_id,
                            });
                        }
                        for event in events {
                            self.transmit(event_type::ON_UNAVAILABLE_IMAGE, &event.encode());
                        }
                    }
                }
                ImageState::Linger => {
                    let entry = &self.images[index];
                    if now_ns - entry.image.time_of_last_state_change_ns()
                        >= self.ctx.image_liveness_timeout_ns
                    {
                        entry.image.set_state(ImageState::Done, now_ns);
                        done.push(index);
                    }
                }
                ImageState::Done => done.push(index),
            }
        }

        let now_ms = epoch_ms();
        done.sort_unstable();
        done.dedup();
        for index in done.into_iter().rev() {
            let entry = self.images.swap_remove(index);
            for counter_id in entry.counter_ids.iter() {
                self.counters_manager.free(*counter_id, now_ms);
            }
            for sub in entry.subscriber_positions.iter() {
                self.counters_manager.free(sub.counter_id, now_ms);
            }
            entry.image.delete_log();

            logging::debug!(self.log, "image reached end of life";
                            "context" => "check_images",
                            "correlation_id" => entry.image.correlation_id);
        }
    }

    /// Untethered subscriptions rotate ACTIVE → LINGER → RESTING → ACTIVE
    /// instead of pacing flow control forever.
    fn manage_untethered_subscriptions(&mut self, image_index: usize, now_ns: i64) {
        let window_timeout = self.ctx.untethered_window_limit_timeout_ns;
        let resting_timeout = self.ctx.untethered_resting_timeout_ns;

        let entry = &mut self.images[image_index];
        let rebuild = entry.image.rebuild_position();
        let window = entry.congestion.max_window_length() as i64;

        for sub in entry.subscriber_positions.iter_mut() {
            if sub.tether {
                continue;
            }

            match sub.state {
                TetherState::Active => {
                    if rebuild - sub.position.get_volatile() > window {
                        sub.state = TetherState::Linger {
                            deadline_ns: now_ns + window_timeout,
                        };
                    }
                }
                TetherState::Linger { deadline_ns } => {
                    if sub.position.get_volatile() >= rebuild - window {
                        sub.state = TetherState::Active;
                    } else if now_ns >= deadline_ns {
                        sub.state = TetherState::Resting {
                            deadline_ns: now_ns + resting_timeout,
                        };
                    }
                }
                TetherState::Resting { deadline_ns } => {
                    if now_ns >= deadline_ns {
                        // Rejoin at the live edge.
                        sub.position.set_ordered(rebuild);
                        sub.state = TetherState::Active;
                    }
                }
            }
        }
    }
}

fn fatal_kind(correlation_id: i64) -> impl Fn(DriverError) -> (i64, ErrorKind) {
    move |err| match err {
        DriverError::Fatal(kind) => (correlation_id, kind),
        DriverError::Wait => (
            correlation_id,
            ErrorKind::Resource("resource temporarily exhausted".to_string()),
        ),
    }
}

impl Agent for Conductor {
    fn name(&self) -> &'static str {
        "conductor"
    }

    fn do_work(&mut self) -> DriverResult<usize> {
        let now_ns = self.clock.update();

        let mut work_count = self.process_client_commands(now_ns);
        work_count += self.process_agent_commands(now_ns);
        work_count += self.track_streams(now_ns);

        if now_ns >= self.timer_deadline_ns {
            self.timer_deadline_ns = now_ns + self.ctx.timer_interval_ns;
            self.on_timer(now_ns);
            work_count += 1;
        }

        Ok(work_count)
    }
}

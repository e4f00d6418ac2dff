use crate::cnc::{CncFile, CncLayout};
use crate::concurrent::broadcast::BroadcastTransmitter;
use crate::concurrent::counters::CountersManager;
use crate::concurrent::errorlog::DistinctErrorLog;
use crate::concurrent::ring_buffer::OneToOneRingBuffer;
use crate::concurrent::spsc::CommandQueue;
use crate::driver::agent::{Agent, AgentRunner, CompositeAgent, IdleStrategy};
use crate::driver::conductor::Conductor;
use crate::driver::context::{DriverContext, ThreadingMode};
use crate::driver::receiver::Receiver;
use crate::driver::sender::Sender;
use crate::driver::system_counters::SystemCounters;
use crate::error::DriverResult;
use bedrock::logging;
use bedrock::time::epoch_ms;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The assembled driver: CnC file, counters, the three agents and their
/// wiring. Construction allocates everything; `launch` starts the threads
/// for the configured mode.
pub struct MediaDriver {
    cnc: CncFile,
    runners: Vec<AgentRunner>,
    invoker: Option<CompositeAgent>,
    terminate: Arc<AtomicBool>,
    log: logging::Logger,
}

impl MediaDriver {
    pub fn launch(ctx: DriverContext, log: &logging::Logger) -> DriverResult<MediaDriver> {
        ctx.validate()?;

        let layout = CncLayout {
            to_driver_length: ctx.to_driver_buffer_length,
            to_clients_length: ctx.to_clients_buffer_length,
            counters_metadata_length: ctx.counters_values_buffer_length * 2,
            counters_values_length: ctx.counters_values_buffer_length,
            error_log_length: ctx.error_log_buffer_length,
        };
        let cnc = CncFile::create(
            &ctx.driver_dir,
            layout,
            ctx.client_liveness_timeout_ns,
            epoch_ms(),
            std::process::id() as i64,
        )?;

        let mut counters_manager = CountersManager::new(
            cnc.counters_metadata_buffer(),
            cnc.counters_values_buffer(),
            ctx.counter_free_to_reuse_timeout_ms,
        );
        let system_counters = Arc::new(SystemCounters::allocate(&mut counters_manager, epoch_ms())?);
        let error_log = DistinctErrorLog::new(cnc.error_log_buffer());
        let to_driver = OneToOneRingBuffer::new(cnc.to_driver_buffer())?;
        let to_clients = BroadcastTransmitter::new(cnc.to_clients_buffer())?;

        let sender_queue = CommandQueue::new(ctx.command_queue_capacity);
        let receiver_queue = CommandQueue::new(ctx.command_queue_capacity);
        let from_receiver = CommandQueue::new(ctx.command_queue_capacity);
        let from_sender = CommandQueue::new(ctx.command_queue_capacity);
        let sender_proxy = sender_queue.producer();
        let receiver_proxy = receiver_queue.producer();
        let terminate = Arc::new(AtomicBool::new(false));

        let sender = Sender::new(
            &ctx,
            sender_queue,
            from_sender.producer(),
            system_counters.clone(),
            log,
        );
        let receiver = Receiver::new(
            &ctx,
            receiver_queue,
            from_receiver.producer(),
            system_counters.clone(),
            log,
        );
        let threading_mode = ctx.threading_mode;
        let conductor = Conductor::new(
            ctx,
            to_driver,
            to_clients,
            counters_manager,
            system_counters,
            error_log,
            sender_proxy,
            receiver_proxy,
            from_receiver,
            from_sender,
            terminate.clone(),
            log,
        )?;

        let driver_log = log.new(logging::o!());
        logging::info!(driver_log, "media driver starting";
                       "context" => "launch",
                       "cnc" => %cnc.path().display(),
                       "mode" => ?threading_mode);

        let mut runners = Vec::new();
        let mut invoker = None;

        match threading_mode {
            ThreadingMode::Dedicated => {
                runners.push(AgentRunner::start(conductor, IdleStrategy::backoff(), log));
                runners.push(AgentRunner::start(sender, IdleStrategy::backoff(), log));
                runners.push(AgentRunner::start(receiver, IdleStrategy::backoff(), log));
            }
            ThreadingMode::Shared => {
                let composite = CompositeAgent::new(vec![
                    Box::new(conductor),
                    Box::new(sender),
                    Box::new(receiver),
                ]);
                runners.push(AgentRunner::start(composite, IdleStrategy::backoff(), log));
            }
            ThreadingMode::Invoker => {
                invoker = Some(CompositeAgent::new(vec![
                    Box::new(conductor),
                    Box::new(sender),
                    Box::new(receiver),
                ]));
            }
        }

        Ok(MediaDriver {
            cnc,
            runners,
            invoker,
            terminate,
            log: driver_log,
        })
    }

    #[inline]
    pub fn cnc(&self) -> &CncFile {
        &self.cnc
    }

    /// True once a client issued TERMINATE_DRIVER.
    #[inline]
    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Invoker mode: run one duty cycle of all agents.
    pub fn do_work(&mut self) -> DriverResult<usize> {
        match self.invoker.as_mut() {
            Some(agent) => agent.do_work(),
            None => Ok(0),
        }
    }

    /// Stop the agent threads and release the driver directory.
    pub fn close(&mut self) {
        logging::info!(self.log, "media driver closing"; "context" => "close");
        for runner in self.runners.iter_mut() {
            runner.stop();
        }
        self.runners.clear();
        if let Some(mut agent) = self.invoker.take() {
            agent.on_close();
        }
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::broadcast::BroadcastReceiver;
    use crate::concurrent::counters::{self, CountersReader};
    use crate::driver::commands::*;
    use crate::logbuffer::appender::TermAppender;
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;
    use crate::logbuffer::frame;
    use crate::logbuffer::log::LogBuffers;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn test_context(dir: &Path) -> DriverContext {
        let mut ctx = DriverContext::default();
        ctx.driver_dir = dir.to_path_buf();
        ctx.term_length = TERM_MIN_LENGTH;
        ctx.ipc_term_length = TERM_MIN_LENGTH;
        ctx.to_driver_buffer_length = 64 * 1024;
        ctx.to_clients_buffer_length = 64 * 1024;
        ctx.counters_values_buffer_length = 128 * 1024;
        ctx.error_log_buffer_length = 64 * 1024;
        ctx
    }

    fn free_loopback_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    struct Client {
        ring: OneToOneRingBuffer,
        events: BroadcastReceiver,
        client_id: i64,
    }

    impl Client {
        fn new(cnc: &CncFile) -> Client {
            Client {
                ring: OneToOneRingBuffer::new(cnc.to_driver_buffer()).unwrap(),
                events: BroadcastReceiver::new(cnc.to_clients_buffer()).unwrap(),
                client_id: 4242,
            }
        }

        fn add_subscription(&mut self, channel: &str, stream_id: i32) -> i64 {
            let correlation_id = self.ring.next_correlation_id();
            let msg = SubscriptionMessage {
                correlated: Correlated {
                    client_id: self.client_id,
                    correlation_id,
                },
                stream_id,
                channel: channel.to_string(),
            };
            self.ring
                .write(command_type::ADD_SUBSCRIPTION, &msg.encode())
                .unwrap();
            correlation_id
        }

        fn add_publication(&mut self, channel: &str, stream_id: i32) -> i64 {
            let correlation_id = self.ring.next_correlation_id();
            let msg = PublicationMessage {
                correlated: Correlated {
                    client_id: self.client_id,
                    correlation_id,
                },
                stream_id,
                is_exclusive: false,
                channel: channel.to_string(),
            };
            self.ring
                .write(command_type::ADD_PUBLICATION, &msg.encode())
                .unwrap();
            correlation_id
        }

        fn keepalive(&mut self) {
            let msg = ClientMessage {
                client_id: self.client_id,
            };
            let _ = self.ring.write(command_type::CLIENT_KEEPALIVE, &msg.encode());
        }

        fn await_event(&mut self, wanted_type: i32, deadline: Instant) -> Vec<u8> {
            loop {
                if let Some((event_type_id, payload)) = self.events.receive_next() {
                    if event_type_id == wanted_type {
                        return payload;
                    }
                    continue;
                }
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for event type {}",
                    wanted_type
                );
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_launch_creates_cnc_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = MediaDriver::launch(
            test_context(dir.path()),
            &bedrock::logging::null_logger(),
        )
        .unwrap();

        assert!(driver.cnc().path().exists());
        assert!(!driver.should_terminate());
        driver.close();
    }

    #[test]
    fn test_invoker_mode_runs_duty_cycles_inline() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.threading_mode = ThreadingMode::Invoker;

        let mut driver =
            MediaDriver::launch(ctx, &bedrock::logging::null_logger()).unwrap();

        let mut client = Client::new(driver.cnc());
        client.add_subscription("aqueduct:ipc", 77);

        for _ in 0..10 {
            driver.do_work().unwrap();
        }

        let payload = client.await_event(
            event_type::ON_SUBSCRIPTION_READY,
            Instant::now() + Duration::from_secs(1),
        );
        assert!(SubscriptionReadyEvent::decode(&payload).is_ok());
    }

    /// Single-node unicast publish/subscribe over loopback: ten messages
    /// of 1008 payload bytes arrive contiguously, with no invalid packets.
    #[test]
    fn test_loopback_publish_subscribe_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = MediaDriver::launch(
            test_context(dir.path()),
            &bedrock::logging::null_logger(),
        )
        .unwrap();

        let port = free_loopback_port();
        let channel = format!("aqueduct:udp?endpoint=127.0.0.1:{}", port);
        let deadline = Instant::now() + Duration::from_secs(10);

        let mut client = Client::new(driver.cnc());
        client.add_subscription(&channel, 1001);
        client.await_event(event_type::ON_SUBSCRIPTION_READY, deadline);

        client.add_publication(&channel, 1001);
        let payload = client.await_event(event_type::ON_PUBLICATION_READY, deadline);
        let ready = PublicationReadyEvent::decode(&payload).unwrap();

        // The client side of the publication: map the log and append.
        let publication_log = LogBuffers::map_existing(Path::new(&ready.log_file)).unwrap();
        let appender = TermAppender::new(
            publication_log.term_buffer(0),
            publication_log.metadata(),
            0,
        );
        let message = [7u8; 1008];
        for _ in 0..10 {
            appender
                .append_unfragmented(ready.session_id, 1001, &message, 1408 - frame::HEADER_LENGTH)
                .unwrap();
        }

        // The handshake runs: SETUP -> image -> SM -> data.
        let payload = client.await_event(event_type::ON_AVAILABLE_IMAGE, deadline);
        let available = AvailableImageEvent::decode(&payload).unwrap();
        assert_eq!(available.stream_id, 1001);
        assert_eq!(available.session_id, ready.session_id);

        // Watch the image's rebuild position reach all ten messages.
        let frame_length = frame::HEADER_LENGTH + 1008;
        let expected = 10 * bedrock::bits::align(frame_length, frame::FRAME_ALIGNMENT) as i64;
        let reader = CountersReader::new(
            driver.cnc().counters_metadata_buffer(),
            driver.cnc().counters_values_buffer(),
        );

        let mut rebuilt = 0;
        while rebuilt < expected {
            assert!(Instant::now() < deadline, "rebuild stalled at {}", rebuilt);
            client.keepalive();

            let mut position = 0;
            reader.for_each(|_, type_id, value, _| {
                if type_id == counters::RECEIVER_POSITION_TYPE_ID {
                    position = value;
                }
            });
            rebuilt = position;
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut hwm = 0;
        let mut invalid = 0;
        reader.for_each(|_, type_id, value, label| {
            if type_id == counters::RECEIVER_HWM_TYPE_ID {
                hwm = value;
            }
            if type_id == counters::SYSTEM_COUNTER_TYPE_ID && label == "Invalid packets" {
                invalid = value;
            }
        });
        assert!(hwm >= expected, "hwm {} below rebuild {}", hwm, expected);
        assert_eq!(invalid, 0);

        // The rebuilt log carries the payload bytes verbatim.
        let image_log = LogBuffers::map_existing(Path::new(&available.log_file)).unwrap();
        let term = image_log.term_buffer(0);
        assert_eq!(frame::frame_length_volatile(&term, 0), frame_length as i32);
        assert_eq!(
            term.as_slice(frame::HEADER_LENGTH, 1008),
            &message[..]
        );

        driver.close();
    }
}

use crate::error::{DriverError, DriverResult};
use bedrock::logging;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A cooperatively scheduled duty cycle. `do_work` returns how much work
/// was done so the idle strategy can back off when the driver goes quiet.
pub trait Agent: Send {
    fn name(&self) -> &'static str;

    fn do_work(&mut self) -> DriverResult<usize>;

    fn on_close(&mut self) {}
}

/// Spin, then yield, then park with doubling pauses. All suspension in the
/// driver happens here and nowhere else.
pub struct IdleStrategy {
    max_spins: u32,
    max_yields: u32,
    min_park_ns: u64,
    max_park_ns: u64,
    spins: u32,
    yields: u32,
    park_ns: u64,
}

impl IdleStrategy {
    pub fn backoff() -> IdleStrategy {
        IdleStrategy {
            max_spins: 10,
            max_yields: 20,
            min_park_ns: 1_000,
            max_park_ns: 1_000_000,
            spins: 0,
            yields: 0,
            park_ns: 1_000,
        }
    }

    /// For invoker mode and tests: never suspends.
    pub fn no_op() -> IdleStrategy {
        IdleStrategy {
            max_spins: u32::MAX,
            max_yields: 0,
            min_park_ns: 0,
            max_park_ns: 0,
            spins: 0,
            yields: 0,
            park_ns: 0,
        }
    }

    #[inline]
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < self.max_yields {
            self.yields += 1;
            thread::yield_now();
        } else if self.max_park_ns > 0 {
            thread::park_timeout(Duration::from_nanos(self.park_ns));
            self.park_ns = (self.park_ns * 2).min(self.max_park_ns);
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park_ns = self.min_park_ns.max(1);
    }
}

/// Runs one agent on a dedicated named thread until stopped. A fatal error
/// from `do_work` terminates the loop; `Wait` results do not.
pub struct AgentRunner {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    name: &'static str,
}

impl AgentRunner {
    pub fn start<A: Agent + 'static>(
        mut agent: A,
        mut idle: IdleStrategy,
        log: &logging::Logger,
    ) -> AgentRunner {
        let running = Arc::new(AtomicBool::new(true));
        let thread_flag = running.clone();
        let name = agent.name();
        let thread_log = log.new(logging::o!());

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                logging::info!(thread_log, "agent started"; "context" => "run", "agent" => name);

                while thread_flag.load(Ordering::Acquire) {
                    match agent.do_work() {
                        Ok(work_count) => idle.idle(work_count),
                        Err(DriverError::Wait) => idle.idle(0),
                        Err(err) => {
                            logging::error!(thread_log, "agent failed";
                                            "context" => "run",
                                            "agent" => name,
                                            "error" => ?err);
                            break;
                        }
                    }
                }

                agent.on_close();
                logging::info!(thread_log, "agent stopped"; "context" => "run", "agent" => name);
            })
            .expect("agent thread spawn failed");

        AgentRunner {
            running,
            handle: Some(handle),
            name,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs several agents round-robin on one thread (shared mode).
pub struct CompositeAgent {
    agents: Vec<Box<dyn Agent>>,
}

impl CompositeAgent {
    pub fn new(agents: Vec<Box<dyn Agent>>) -> CompositeAgent {
        CompositeAgent { agents }
    }
}

impl Agent for CompositeAgent {
    fn name(&self) -> &'static str {
        "driver-shared"
    }

    fn do_work(&mut self) -> DriverResult<usize> {
        let mut work_count = 0;
        for agent in self.agents.iter_mut() {
            work_count += agent.do_work()?;
        }
        Ok(work_count)
    }

    fn on_close(&mut self) {
        for agent in self.agents.iter_mut() {
            agent.on_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use std::sync::atomic::AtomicUsize;

    struct CountingAgent {
        count: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    impl Agent for CountingAgent {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn do_work(&mut self) -> DriverResult<usize> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_at {
                return Err(DriverError::Fatal(crate::error::ErrorKind::Generic(
                    "boom".to_string(),
                )));
            }
            Ok(1)
        }
    }

    #[test]
    fn test_runner_runs_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let agent = CountingAgent {
            count: count.clone(),
            fail_at: None,
        };

        let mut runner =
            AgentRunner::start(agent, IdleStrategy::backoff(), &bedrock::logging::null_logger());

        while count.load(Ordering::SeqCst) < 100 {
            thread::yield_now();
        }
        runner.stop();

        let stopped_at = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }

    #[test]
    fn test_fatal_error_terminates_agent() {
        let count = Arc::new(AtomicUsize::new(0));
        let agent = CountingAgent {
            count: count.clone(),
            fail_at: Some(5),
        };

        let mut runner =
            AgentRunner::start(agent, IdleStrategy::no_op(), &bedrock::logging::null_logger());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 6);
        runner.stop();
    }

    #[test]
    fn test_composite_sums_work() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut composite = CompositeAgent::new(vec![
            Box::new(CountingAgent {
                count: count.clone(),
                fail_at: None,
            }),
            Box::new(CountingAgent {
                count: count.clone(),
                fail_at: None,
            }),
        ]);

        assert_eq!(composite.do_work().unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_idle_strategy_resets_on_work() {
        let mut idle = IdleStrategy::backoff();
        for _ in 0..100 {
            idle.idle(0);
        }
        idle.idle(1);
        assert_eq!(idle.spins, 0);
        assert_eq!(idle.yields, 0);
    }
}

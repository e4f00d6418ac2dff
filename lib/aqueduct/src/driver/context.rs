use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::logbuffer::descriptor;
use bedrock::bits::is_power_of_two;
use serde_derive::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MTU_LENGTH: usize = 1408;
pub const DEFAULT_TERM_LENGTH: usize = 4 * 1024 * 1024;
pub const DEFAULT_IPC_TERM_LENGTH: usize = 4 * 1024 * 1024;
pub const DEFAULT_INITIAL_WINDOW_LENGTH: usize = 128 * 1024;

/// How the three agents are scheduled onto threads.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadingMode {
    /// One OS thread per agent.
    Dedicated,
    /// All agents round-robin on one thread.
    Shared,
    /// The application drives the duty cycle itself.
    Invoker,
}

/// Every tunable of the driver, with production defaults. The runner
/// deserialises a subset from TOML and folds it over `Default`.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub driver_dir: PathBuf,
    pub threading_mode: ThreadingMode,

    // Stream geometry.
    pub term_length: usize,
    pub ipc_term_length: usize,
    pub mtu_length: usize,
    pub initial_window_length: usize,
    /// Publisher window as a fraction of term length (term_length / 2).
    pub term_window_divisor: usize,

    // Liveness and lifecycle timeouts.
    pub client_liveness_timeout_ns: i64,
    pub image_liveness_timeout_ns: i64,
    pub publication_linger_timeout_ns: i64,
    pub publication_unblock_timeout_ns: i64,
    pub publication_connection_timeout_ns: i64,
    pub untethered_window_limit_timeout_ns: i64,
    pub untethered_resting_timeout_ns: i64,

    // Cadences.
    pub status_message_timeout_ns: i64,
    pub status_message_read_timeout_ns: i64,
    pub nak_unicast_delay_ns: i64,
    pub pending_setups_timeout_ns: i64,
    pub setup_interval_ns: i64,
    pub heartbeat_interval_ns: i64,
    pub flow_control_receiver_timeout_ns: i64,
    pub destination_timeout_ns: i64,
    pub re_resolution_check_interval_ns: i64,
    pub timer_interval_ns: i64,
    pub dispatcher_no_interest_timeout_ns: i64,
    pub counter_free_to_reuse_timeout_ms: i64,

    // Session-id allocation keeps clear of this inclusive range.
    pub reserved_session_id_low: i32,
    pub reserved_session_id_high: i32,

    // CnC region sizing.
    pub to_driver_buffer_length: usize,
    pub to_clients_buffer_length: usize,
    pub counters_values_buffer_length: usize,
    pub error_log_buffer_length: usize,

    pub command_queue_capacity: usize,
    pub duty_cycle_ratio: u32,
    pub enable_driver_termination: bool,

    // Name resolution.
    pub resolver_name: Option<String>,
    pub resolver_interface: Option<String>,
    pub resolver_bootstrap_neighbor: Option<String>,
}

impl Default for DriverContext {
    fn default() -> DriverContext {
        DriverContext {
            driver_dir: std::env::temp_dir().join("aqueduct"),
            threading_mode: ThreadingMode::Dedicated,
            term_length: DEFAULT_TERM_LENGTH,
            ipc_term_length: DEFAULT_IPC_TERM_LENGTH,
            mtu_length: DEFAULT_MTU_LENGTH,
            initial_window_length: DEFAULT_INITIAL_WINDOW_LENGTH,
            term_window_divisor: 2,
            client_liveness_timeout_ns: 10_000_000_000,
            image_liveness_timeout_ns: 10_000_000_000,
            publication_linger_timeout_ns: 5_000_000_000,
            publication_unblock_timeout_ns: 15_000_000_000,
            publication_connection_timeout_ns: 5_000_000_000,
            untethered_window_limit_timeout_ns: 5_000_000_000,
            untethered_resting_timeout_ns: 10_000_000_000,
            status_message_timeout_ns: 200_000_000,
            status_message_read_timeout_ns: 200_000_000,
            nak_unicast_delay_ns: 60_000_000,
            pending_setups_timeout_ns: 1_000_000_000,
            setup_interval_ns: 100_000_000,
            heartbeat_interval_ns: 100_000_000,
            flow_control_receiver_timeout_ns: 2_000_000_000,
            destination_timeout_ns: 5_000_000_000,
            re_resolution_check_interval_ns: 1_000_000_000,
            timer_interval_ns: 1_000_000,
            dispatcher_no_interest_timeout_ns: 60_000_000_000,
            counter_free_to_reuse_timeout_ms: 1_000,
            reserved_session_id_low: -1,
            reserved_session_id_high: 1000,
            to_driver_buffer_length: 1024 * 1024,
            to_clients_buffer_length: 1024 * 1024,
            counters_values_buffer_length: 1024 * 1024,
            error_log_buffer_length: 1024 * 1024,
            command_queue_capacity: 1024,
            duty_cycle_ratio: 16,
            enable_driver_termination: true,
            resolver_name: None,
            resolver_interface: None,
            resolver_bootstrap_neighbor: None,
        }
    }
}

impl DriverContext {
    /// Publisher flow-control window for a given term length.
    #[inline]
    pub fn term_window_length(&self, term_length: usize) -> usize {
        term_length / self.term_window_divisor
    }

    pub fn validate(&self) -> DriverResult<()> {
        descriptor::check_term_length(self.term_length)?;
        descriptor::check_term_length(self.ipc_term_length)?;

        if self.mtu_length < 64 || self.mtu_length > 65504 {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "mtu length {} outside [64, 65504]",
                self.mtu_length
            ))));
        }

        if self.mtu_length % 32 != 0 {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "mtu length {} not frame aligned",
                self.mtu_length
            ))));
        }

        if !is_power_of_two(self.command_queue_capacity) {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "command queue capacity {} not a power of two",
                self.command_queue_capacity
            ))));
        }

        if !is_power_of_two(self.to_driver_buffer_length)
            || !is_power_of_two(self.to_clients_buffer_length)
        {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(
                "CnC ring lengths must be powers of two".to_string(),
            )));
        }

        if self.initial_window_length < self.mtu_length {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "initial window {} smaller than mtu {}",
                self.initial_window_length, self.mtu_length
            ))));
        }

        if self.reserved_session_id_low > self.reserved_session_id_high {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(
                "reserved session-id range is inverted".to_string(),
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DriverContext::default().validate().is_ok());
    }

    #[test]
    fn test_bad_mtu_rejected() {
        let mut ctx = DriverContext::default();
        ctx.mtu_length = 100;
        assert!(ctx.validate().is_err());

        ctx.mtu_length = 70000;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_bad_term_length_rejected() {
        let mut ctx = DriverContext::default();
        ctx.term_length = 100_000;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_window_smaller_than_mtu_rejected() {
        let mut ctx = DriverContext::default();
        ctx.initial_window_length = 1024;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_term_window_length() {
        let ctx = DriverContext::default();
        assert_eq!(ctx.term_window_length(65536), 32768);
    }
}

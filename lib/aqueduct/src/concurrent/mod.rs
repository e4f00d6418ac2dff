//! Lock-free primitives shared between the driver agents and, through the
//! CnC file and log buffers, with client processes.

pub mod broadcast;
pub mod buffer;
pub mod counters;
pub mod errorlog;
pub mod position;
pub mod ring_buffer;
pub mod spsc;

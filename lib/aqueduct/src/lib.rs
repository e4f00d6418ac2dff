//! Aqueduct is a low-latency reliable messaging transport. This crate is
//! the media driver: the data plane that multiplexes publication streams
//! over UDP (unicast, multicast, multi-destination cast) and shared-memory
//! IPC, and the conductor that manages the lifecycles around it.
//!
//! Streams live in memory-mapped tri-term log buffers shared with client
//! processes. Three cooperating agents run the driver: the sender frames
//! and transmits, the receiver dispatches inbound datagrams and rebuilds
//! per-source images, and the conductor owns every lifecycle and liveness
//! decision.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod cnc;
pub mod concurrent;
pub mod driver;
pub mod error;
pub mod logbuffer;
pub mod protocol;

/// Sentinel for unset 64-bit identifiers and positions.
pub const NULL_VALUE: i64 = -1;

/// Sentinel for unset stream positions.
pub const NULL_POSITION: i64 = -1;

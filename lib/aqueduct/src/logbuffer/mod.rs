//! The shared-memory log-buffer protocol: three rotating term buffers plus
//! a metadata page, appended by publishers via a CAS on the active tail and
//! rebuilt by subscribers as single-writer inserts.

pub mod appender;
pub mod descriptor;
pub mod frame;
pub mod gap_scanner;
pub mod log;
pub mod rebuilder;
pub mod scanner;
pub mod unblocker;

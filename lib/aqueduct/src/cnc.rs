//! The Command-and-Control file: the single mapped region a client needs
//! to talk to the driver. Header, to-driver command ring, to-clients
//! broadcast, counters metadata/values and the distinct error log, in
//! that order.

use crate::concurrent::buffer::AtomicBuffer;
use crate::concurrent::{broadcast, ring_buffer};
use crate::error::{DriverError, DriverResult, ErrorKind};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const CNC_VERSION: i32 = 1;
pub const CNC_FILE_NAME: &str = "cnc.dat";

pub const VERSION_OFFSET: usize = 0;
pub const TO_DRIVER_LENGTH_OFFSET: usize = 4;
pub const TO_CLIENTS_LENGTH_OFFSET: usize = 8;
pub const COUNTERS_METADATA_LENGTH_OFFSET: usize = 12;
pub const COUNTERS_VALUES_LENGTH_OFFSET: usize = 16;
pub const ERROR_LOG_LENGTH_OFFSET: usize = 20;
pub const CLIENT_LIVENESS_TIMEOUT_OFFSET: usize = 24;
pub const START_TIMESTAMP_OFFSET: usize = 32;
pub const PID_OFFSET: usize = 40;
pub const HEADER_LENGTH: usize = 128;

/// Region lengths chosen at driver start.
#[derive(Debug, Clone, Copy)]
pub struct CncLayout {
    pub to_driver_length: usize,
    pub to_clients_length: usize,
    pub counters_metadata_length: usize,
    pub counters_values_length: usize,
    pub error_log_length: usize,
}

impl CncLayout {
    #[inline]
    pub fn total_length(&self) -> usize {
        HEADER_LENGTH
            + self.to_driver_length
            + ring_buffer::TRAILER_LENGTH
            + self.to_clients_length
            + broadcast::TRAILER_LENGTH
            + self.counters_metadata_length
            + self.counters_values_length
            + self.error_log_length
    }
}

pub struct CncFile {
    path: PathBuf,
    _mmap: MmapMut,
    ptr: *mut u8,
    layout: CncLayout,
}

unsafe impl Send for CncFile {}
unsafe impl Sync for CncFile {}

impl CncFile {
    /// Create and stamp a fresh CnC file in `dir`.
    pub fn create(
        dir: &Path,
        layout: CncLayout,
        client_liveness_timeout_ns: i64,
        start_timestamp_ms: i64,
        pid: i64,
    ) -> DriverResult<CncFile> {
        std::fs::create_dir_all(dir).map_err(|err| {
            DriverError::Fatal(ErrorKind::Resource(format!(
                "creating driver directory {:?}: {}",
                dir, err
            )))
        })?;

        let path = dir.join(CNC_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| {
                DriverError::Fatal(ErrorKind::Resource(format!(
                    "creating CnC file {:?}: {}",
                    path, err
                )))
            })?;

        file.set_len(layout.total_length() as u64).map_err(|err| {
            DriverError::Fatal(ErrorKind::Resource(format!(
                "sizing CnC file {:?}: {}",
                path, err
            )))
        })?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|err| {
            DriverError::Fatal(ErrorKind::Resource(format!(
                "mapping CnC file {:?}: {}",
                path, err
            )))
        })?;

        let ptr = mmap.as_mut_ptr();
        let cnc = CncFile {
            path,
            _mmap: mmap,
            ptr,
            layout,
        };

        let header = cnc.header();
        header.put_i32(TO_DRIVER_LENGTH_OFFSET, layout.to_driver_length as i32);
        header.put_i32(TO_CLIENTS_LENGTH_OFFSET, layout.to_clients_length as i32);
        header.put_i32(
            COUNTERS_METADATA_LENGTH_OFFSET,
            layout.counters_metadata_length as i32,
        );
        header.put_i32(
            COUNTERS_VALUES_LENGTH_OFFSET,
            layout.counters_values_length as i32,
        );
        header.put_i32(ERROR_LOG_LENGTH_OFFSET, layout.error_log_length as i32);
        header.put_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET, client_liveness_timeout_ns);
        header.put_i64(START_TIMESTAMP_OFFSET, start_timestamp_ms);
        header.put_i64(PID_OFFSET, pid);
        // Version is published last: clients spin on it before trusting
        // the rest of the header.
        header.put_i32_ordered(VERSION_OFFSET, CNC_VERSION);

        Ok(cnc)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn layout(&self) -> CncLayout {
        self.layout
    }

    #[inline]
    fn region(&self, offset: usize, len: usize) -> AtomicBuffer {
        AtomicBuffer::new(unsafe { self.ptr.add(offset) }, len)
    }

    #[inline]
    pub fn header(&self) -> AtomicBuffer {
        self.region(0, HEADER_LENGTH)
    }

    #[inline]
    pub fn to_driver_buffer(&self) -> AtomicBuffer {
        self.region(
            HEADER_LENGTH,
            self.layout.to_driver_length + ring_buffer::TRAILER_LENGTH,
        )
    }

    #[inline]
    pub fn to_clients_buffer(&self) -> AtomicBuffer {
        let offset = HEADER_LENGTH + self.layout.to_driver_length + ring_buffer::TRAILER_LENGTH;
        self.region(
            offset,
            self.layout.to_clients_length + broadcast::TRAILER_LENGTH,
        )
    }

    #[inline]
    pub fn counters_metadata_buffer(&self) -> AtomicBuffer {
        let offset = HEADER_LENGTH
            + self.layout.to_driver_length
            + ring_buffer::TRAILER_LENGTH
            + self.layout.to_clients_length
            + broadcast::TRAILER_LENGTH;
        self.region(offset, self.layout.counters_metadata_length)
    }

    #[inline]
    pub fn counters_values_buffer(&self) -> AtomicBuffer {
        let offset = HEADER_LENGTH
            + self.layout.to_driver_length
            + ring_buffer::TRAILER_LENGTH
            + self.layout.to_clients_length
            + broadcast::TRAILER_LENGTH
            + self.layout.counters_metadata_length;
        self.region(offset, self.layout.counters_values_length)
    }

    #[inline]
    pub fn error_log_buffer(&self) -> AtomicBuffer {
        let offset = HEADER_LENGTH
            + self.layout.to_driver_length
            + ring_buffer::TRAILER_LENGTH
            + self.layout.to_clients_length
            + broadcast::TRAILER_LENGTH
            + self.layout.counters_metadata_length
            + self.layout.counters_values_length;
        self.region(offset, self.layout.error_log_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> CncLayout {
        CncLayout {
            to_driver_length: 64 * 1024,
            to_clients_length: 64 * 1024,
            counters_metadata_length: 64 * 1024,
            counters_values_length: 32 * 1024,
            error_log_length: 16 * 1024,
        }
    }

    #[test]
    fn test_create_stamps_header() {
        let dir = tempfile::tempdir().unwrap();
        let cnc = CncFile::create(dir.path(), layout(), 5_000_000_000, 1234, 42).unwrap();

        let header = cnc.header();
        assert_eq!(header.get_i32_volatile(VERSION_OFFSET), CNC_VERSION);
        assert_eq!(header.get_i32(TO_DRIVER_LENGTH_OFFSET), 64 * 1024);
        assert_eq!(header.get_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET), 5_000_000_000);
        assert_eq!(header.get_i64(START_TIMESTAMP_OFFSET), 1234);
        assert_eq!(header.get_i64(PID_OFFSET), 42);
        assert!(cnc.path().ends_with(CNC_FILE_NAME));
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let cnc = CncFile::create(dir.path(), layout(), 0, 0, 0).unwrap();

        cnc.to_driver_buffer().put_i64(0, 1);
        cnc.to_clients_buffer().put_i64(0, 2);
        cnc.counters_metadata_buffer().put_i64(0, 3);
        cnc.counters_values_buffer().put_i64(0, 4);
        cnc.error_log_buffer().put_i64(0, 5);

        assert_eq!(cnc.to_driver_buffer().get_i64(0), 1);
        assert_eq!(cnc.to_clients_buffer().get_i64(0), 2);
        assert_eq!(cnc.counters_metadata_buffer().get_i64(0), 3);
        assert_eq!(cnc.counters_values_buffer().get_i64(0), 4);
        assert_eq!(cnc.error_log_buffer().get_i64(0), 5);
    }

    #[test]
    fn test_rings_construct_over_regions() {
        let dir = tempfile::tempdir().unwrap();
        let cnc = CncFile::create(dir.path(), layout(), 0, 0, 0).unwrap();

        assert!(ring_buffer::OneToOneRingBuffer::new(cnc.to_driver_buffer()).is_ok());
        assert!(broadcast::BroadcastTransmitter::new(cnc.to_clients_buffer()).is_ok());
    }
}

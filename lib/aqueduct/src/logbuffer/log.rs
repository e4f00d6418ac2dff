use crate::concurrent::buffer::AtomicBuffer;
use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::logbuffer::descriptor;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// The mapped file behind one stream's log: three terms followed by the
/// metadata page. The driver creates and owns the mapping; clients map the
/// same file read-write for append (publications) or read-only (images).
pub struct LogBuffers {
    path: PathBuf,
    _mmap: MmapMut,
    ptr: *mut u8,
    term_length: usize,
}

unsafe impl Send for LogBuffers {}
unsafe impl Sync for LogBuffers {}

impl LogBuffers {
    /// Create the file, size it and stamp the metadata page.
    pub fn create(
        path: &Path,
        term_length: usize,
        initial_term_id: i32,
        mtu: usize,
        correlation_id: i64,
    ) -> DriverResult<LogBuffers> {
        descriptor::check_term_length(term_length)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| DriverError::Fatal(ErrorKind::Resource(format!(
                    "creating log directory {:?}: {}",
                    parent, err
                ))))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| {
                DriverError::Fatal(ErrorKind::Resource(format!(
                    "creating log file {:?}: {}",
                    path, err
                )))
            })?;

        let log_length = descriptor::compute_log_length(term_length);
        file.set_len(log_length as u64).map_err(|err| {
            DriverError::Fatal(ErrorKind::Resource(format!(
                "sizing log file {:?}: {}",
                path, err
            )))
        })?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|err| {
            DriverError::Fatal(ErrorKind::Resource(format!(
                "mapping log file {:?}: {}",
                path, err
            )))
        })?;

        let ptr = mmap.as_mut_ptr();
        let buffers = LogBuffers {
            path: path.to_path_buf(),
            _mmap: mmap,
            ptr,
            term_length,
        };

        descriptor::initialize(
            &buffers.metadata(),
            initial_term_id,
            term_length,
            mtu,
            correlation_id,
        );

        Ok(buffers)
    }

    /// Map a log created by another party (the driver, from a client's
    /// point of view); geometry is read back from the metadata page.
    pub fn map_existing(path: &Path) -> DriverResult<LogBuffers> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                DriverError::Fatal(ErrorKind::Resource(format!(
                    "opening log file {:?}: {}",
                    path, err
                )))
            })?;

        let file_length = file
            .metadata()
            .map_err(|err| {
                DriverError::Fatal(ErrorKind::Resource(format!(
                    "sizing log file {:?}: {}",
                    path, err
                )))
            })?
            .len() as usize;

        if file_length <= descriptor::LOG_META_DATA_LENGTH
            || (file_length - descriptor::LOG_META_DATA_LENGTH) % descriptor::PARTITION_COUNT != 0
        {
            return Err(DriverError::Fatal(ErrorKind::Resource(format!(
                "log file {:?} has a malformed length {}",
                path, file_length
            ))));
        }
        let term_length = (file_length - descriptor::LOG_META_DATA_LENGTH) / descriptor::PARTITION_COUNT;
        descriptor::check_term_length(term_length)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|err| {
            DriverError::Fatal(ErrorKind::Resource(format!(
                "mapping log file {:?}: {}",
                path, err
            )))
        })?;

        let ptr = mmap.as_mut_ptr();
        Ok(LogBuffers {
            path: path.to_path_buf(),
            _mmap: mmap,
            ptr,
            term_length,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    #[inline]
    pub fn log_length(&self) -> usize {
        descriptor::compute_log_length(self.term_length)
    }

    #[inline]
    pub fn term_buffer(&self, index: usize) -> AtomicBuffer {
        debug_assert!(index < descriptor::PARTITION_COUNT);
        AtomicBuffer::new(
            unsafe { self.ptr.add(index * self.term_length) },
            self.term_length,
        )
    }

    #[inline]
    pub fn metadata(&self) -> AtomicBuffer {
        AtomicBuffer::new(
            unsafe { self.ptr.add(descriptor::PARTITION_COUNT * self.term_length) },
            descriptor::LOG_META_DATA_LENGTH,
        )
    }

    /// Remove the backing file; called once the owning entity reaches its
    /// end of life.
    pub fn delete_file(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbuffer::descriptor::TERM_MIN_LENGTH;

    #[test]
    fn test_create_and_reflect_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pub-777.logbuffer");

        let log = LogBuffers::create(&path, TERM_MIN_LENGTH, 42, 1408, 777).unwrap();

        assert_eq!(log.term_length(), TERM_MIN_LENGTH);
        assert_eq!(
            log.log_length(),
            3 * TERM_MIN_LENGTH + descriptor::LOG_META_DATA_LENGTH
        );
        assert_eq!(descriptor::initial_term_id(&log.metadata()), 42);
        assert_eq!(descriptor::mtu_length(&log.metadata()), 1408);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            log.log_length() as u64
        );
    }

    #[test]
    fn test_terms_are_distinct_regions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pub-1.logbuffer");
        let log = LogBuffers::create(&path, TERM_MIN_LENGTH, 0, 1408, 1).unwrap();

        log.term_buffer(0).put_i64(0, 11);
        log.term_buffer(1).put_i64(0, 22);
        log.term_buffer(2).put_i64(0, 33);

        assert_eq!(log.term_buffer(0).get_i64(0), 11);
        assert_eq!(log.term_buffer(1).get_i64(0), 22);
        assert_eq!(log.term_buffer(2).get_i64(0), 33);
    }

    #[test]
    fn test_rejects_bad_term_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.logbuffer");
        assert!(LogBuffers::create(&path, 1000, 0, 1408, 1).is_err());
    }

    #[test]
    fn test_map_existing_reads_geometry_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.logbuffer");
        let log = LogBuffers::create(&path, TERM_MIN_LENGTH, 7, 1408, 3).unwrap();
        log.term_buffer(1).put_i64(64, 4242);

        let mapped = LogBuffers::map_existing(&path).unwrap();
        assert_eq!(mapped.term_length(), TERM_MIN_LENGTH);
        assert_eq!(descriptor::initial_term_id(&mapped.metadata()), 7);
        assert_eq!(mapped.term_buffer(1).get_i64(64), 4242);

        // Writes through one mapping are visible through the other.
        mapped.term_buffer(2).put_i64_ordered(0, 99);
        assert_eq!(log.term_buffer(2).get_i64_volatile(0), 99);
    }

    #[test]
    fn test_delete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.logbuffer");
        let log = LogBuffers::create(&path, TERM_MIN_LENGTH, 0, 1408, 1).unwrap();

        assert!(path.exists());
        log.delete_file();
        assert!(!path.exists());
    }
}

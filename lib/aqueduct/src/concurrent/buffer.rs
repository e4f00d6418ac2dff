use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Unowned view over a region of shared memory with volatile, ordered and
/// atomic accessors. The region outlives the view: it is either a mapped
/// file held open by the driver, or an [`OwnedBuffer`] kept alive alongside
/// every view handed out.
///
/// Multi-byte atomic accessors require naturally aligned offsets; this is
/// asserted in debug builds and guaranteed by the layouts in
/// `logbuffer::descriptor` and the CnC file.
#[derive(Clone, Copy)]
pub struct AtomicBuffer {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for AtomicBuffer {}
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// The caller guarantees `ptr` points at `len` readable and writable
    /// bytes that stay valid for the lifetime of every copy of the view.
    #[inline]
    pub fn new(ptr: *mut u8, len: usize) -> AtomicBuffer {
        AtomicBuffer { ptr, len }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Narrowed view over `[offset, offset + len)`.
    #[inline]
    pub fn view(&self, offset: usize, len: usize) -> AtomicBuffer {
        self.bounds_check(offset, len);
        AtomicBuffer {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }

    #[inline]
    fn bounds_check(&self, offset: usize, len: usize) {
        debug_assert!(
            offset + len <= self.len,
            "access [{}, {}) out of bounds of {}",
            offset,
            offset + len,
            self.len
        );
    }

    #[inline]
    fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        self.bounds_check(offset, 8);
        debug_assert!(offset % 8 == 0, "unaligned i64 access at {}", offset);
        unsafe { &*(self.ptr.add(offset) as *const AtomicI64) }
    }

    #[inline]
    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        self.bounds_check(offset, 4);
        debug_assert!(offset % 4 == 0, "unaligned i32 access at {}", offset);
        unsafe { &*(self.ptr.add(offset) as *const AtomicI32) }
    }

    #[inline]
    pub fn get_i32(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_i32(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Release);
    }

    #[inline]
    pub fn get_i64(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_i64(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get_i64_volatile(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i64_ordered(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Release);
    }

    #[inline]
    pub fn compare_and_set_i64(&self, offset: usize, expected: i64, updated: i64) -> bool {
        self.atomic_i64(offset)
            .compare_exchange(expected, updated, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn compare_and_set_i32(&self, offset: usize, expected: i32, updated: i32) -> bool {
        self.atomic_i32(offset)
            .compare_exchange(expected, updated, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn get_and_add_i64(&self, offset: usize, delta: i64) -> i64 {
        self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel)
    }

    /// Raise the value at `offset` to `proposed` if it is greater. Returns
    /// true if the stored value changed.
    #[inline]
    pub fn propose_max_i64_ordered(&self, offset: usize, proposed: i64) -> bool {
        let cell = self.atomic_i64(offset);
        let mut current = cell.load(Ordering::Relaxed);
        while proposed > current {
            match cell.compare_exchange(current, proposed, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    #[inline]
    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.bounds_check(offset, dst.len());
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len()) };
    }

    #[inline]
    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        self.bounds_check(offset, src.len());
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len()) };
    }

    #[inline]
    pub fn set_memory(&self, offset: usize, len: usize, value: u8) {
        self.bounds_check(offset, len);
        unsafe { ptr::write_bytes(self.ptr.add(offset), value, len) };
    }

    /// Borrow a sub-range as a plain slice. Safe against the buffer bounds;
    /// the single-writer discipline of the callers keeps it race-free.
    #[inline]
    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        self.bounds_check(offset, len);
        unsafe { slice::from_raw_parts(self.ptr.add(offset), len) }
    }

    #[inline]
    pub fn as_mut_slice(&self, offset: usize, len: usize) -> &mut [u8] {
        self.bounds_check(offset, len);
        unsafe { slice::from_raw_parts_mut(self.ptr.add(offset), len) }
    }

    /// Length-prefixed string write, used for counter labels and channel
    /// URIs embedded in metadata records.
    #[inline]
    pub fn put_string(&self, offset: usize, value: &str) {
        self.put_i32(offset, value.len() as i32);
        self.put_bytes(offset + 4, value.as_bytes());
    }

    #[inline]
    pub fn get_string(&self, offset: usize) -> String {
        let len = self.get_i32(offset) as usize;
        String::from_utf8_lossy(self.as_slice(offset + 4, len)).into_owned()
    }
}

/// Heap-backed storage for an [`AtomicBuffer`], 8-byte aligned. Used for
/// agent-internal buffers and tests; shared regions come from mapped files.
pub struct OwnedBuffer {
    // Kept alive for the lifetime of the views; never reallocated.
    _mem: Vec<i64>,
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for OwnedBuffer {}
unsafe impl Sync for OwnedBuffer {}

impl OwnedBuffer {
    #[inline]
    pub fn new(len: usize) -> OwnedBuffer {
        assert!(len % 8 == 0, "buffer length must be a multiple of 8, got {}", len);

        let mut mem = vec![0i64; len / 8];
        let ptr = mem.as_mut_ptr() as *mut u8;

        OwnedBuffer { _mem: mem, ptr, len }
    }

    #[inline]
    pub fn buffer(&self) -> AtomicBuffer {
        AtomicBuffer::new(self.ptr, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_accessors() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();

        buf.put_i32(0, 42);
        buf.put_i64(8, -9);

        assert_eq!(buf.get_i32(0), 42);
        assert_eq!(buf.get_i64(8), -9);
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_ordered_roundtrip() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();

        buf.put_i64_ordered(16, 77);
        assert_eq!(buf.get_i64_volatile(16), 77);

        buf.put_i32_ordered(24, 13);
        assert_eq!(buf.get_i32_volatile(24), 13);
    }

    #[test]
    fn test_cas_and_add() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();

        assert!(buf.compare_and_set_i64(0, 0, 5));
        assert!(!buf.compare_and_set_i64(0, 0, 6));
        assert_eq!(buf.get_and_add_i64(0, 3), 5);
        assert_eq!(buf.get_i64(0), 8);
    }

    #[test]
    fn test_propose_max() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();

        buf.put_i64(0, 10);
        assert!(buf.propose_max_i64_ordered(0, 20));
        assert!(!buf.propose_max_i64_ordered(0, 15));
        assert_eq!(buf.get_i64(0), 20);
    }

    #[test]
    fn test_bytes_and_memset() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();

        buf.put_bytes(8, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        buf.get_bytes(8, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);

        buf.set_memory(8, 4, 0);
        assert_eq!(buf.as_slice(8, 4), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();

        buf.put_string(0, "aqueduct:udp?endpoint=x");
        assert_eq!(buf.get_string(0), "aqueduct:udp?endpoint=x");
    }

    #[test]
    fn test_view_is_offset() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();
        let view = buf.view(32, 32);

        view.put_i64(0, 123);
        assert_eq!(buf.get_i64(32), 123);
        assert_eq!(view.capacity(), 32);
    }
}

use crate::concurrent::buffer::AtomicBuffer;
use crate::error::{DriverError, DriverResult, ErrorKind};
use bedrock::bits::{align, is_power_of_two};

/// Record header: [length i32][type i32] followed by the payload, the
/// whole record aligned to 8 bytes. The length is written last with a
/// release store so a consumer never reads a partially written record.
pub const RECORD_HEADER_LENGTH: usize = 8;
pub const RECORD_ALIGNMENT: usize = 8;

/// Message type reserved for padding records inserted at the wrap point.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Trailer appended after the data capacity. Counters sit on their own
/// cache lines.
pub const TAIL_POSITION_OFFSET: usize = 0;
pub const HEAD_CACHE_POSITION_OFFSET: usize = 64;
pub const HEAD_POSITION_OFFSET: usize = 128;
pub const CORRELATION_COUNTER_OFFSET: usize = 160;
pub const CONSUMER_HEARTBEAT_OFFSET: usize = 168;
pub const TRAILER_LENGTH: usize = 192;

const LENGTH_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 4;

/// One-to-one ring buffer carrying client commands to the driver through
/// the CnC file. The client library is the producer; the conductor is the
/// consumer. Layout and maths also back the in-process tests.
pub struct OneToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: usize,
    max_msg_length: usize,
    trailer: usize,
}

impl OneToOneRingBuffer {
    /// `buffer` must be `capacity + TRAILER_LENGTH` long with a
    /// power-of-two capacity.
    pub fn new(buffer: AtomicBuffer) -> DriverResult<OneToOneRingBuffer> {
        let capacity = buffer.capacity() - TRAILER_LENGTH;

        if !is_power_of_two(capacity) {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "ring capacity must be a power of two, got {}",
                capacity
            ))));
        }

        Ok(OneToOneRingBuffer {
            buffer,
            capacity,
            mask: capacity - 1,
            max_msg_length: capacity / 8,
            trailer: capacity,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Monotonic id source shared with clients for command correlation.
    #[inline]
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer
            .get_and_add_i64(self.trailer + CORRELATION_COUNTER_OFFSET, 1)
    }

    #[inline]
    pub fn consumer_heartbeat_time_ms(&self) -> i64 {
        self.buffer
            .get_i64_volatile(self.trailer + CONSUMER_HEARTBEAT_OFFSET)
    }

    #[inline]
    pub fn update_consumer_heartbeat(&self, now_ms: i64) {
        self.buffer
            .put_i64_ordered(self.trailer + CONSUMER_HEARTBEAT_OFFSET, now_ms);
    }

    /// Producer side: append one message. `Err(Wait)` when the ring lacks
    /// space, so callers retry later.
    pub fn write(&self, msg_type: i32, payload: &[u8]) -> DriverResult<()> {
        if payload.len() > self.max_msg_length {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "message of {} exceeds max length {}",
                payload.len(),
                self.max_msg_length
            ))));
        }

        let record_length = RECORD_HEADER_LENGTH + payload.len();
        let aligned = align(record_length, RECORD_ALIGNMENT);
        let tail = self.buffer.get_i64(self.trailer + TAIL_POSITION_OFFSET);
        let tail_index = (tail as usize) & self.mask;
        let to_end = self.capacity - tail_index;

        let mut required = aligned;
        let mut padding = 0usize;
        if aligned > to_end {
            // Wrap: a padding record fills the tail of the buffer.
            padding = to_end;
            required = aligned + padding;
        }

        let head_cache_offset = self.trailer + HEAD_CACHE_POSITION_OFFSET;
        let mut head = self.buffer.get_i64(head_cache_offset);
        if (tail - head) as usize + required > self.capacity {
            head = self
                .buffer
                .get_i64_volatile(self.trailer + HEAD_POSITION_OFFSET);
            if (tail - head) as usize + required > self.capacity {
                return Err(DriverError::Wait);
            }
            self.buffer.put_i64(head_cache_offset, head);
        }

        let mut record_index = tail_index;
        if padding > 0 {
            self.buffer
                .put_i32(tail_index + TYPE_OFFSET, PADDING_MSG_TYPE_ID);
            self.buffer
                .put_i32_ordered(tail_index + LENGTH_OFFSET, padding as i32);
            record_index = 0;
        }

        self.buffer.put_i32(record_index + TYPE_OFFSET, msg_type);
        self.buffer
            .put_bytes(record_index + RECORD_HEADER_LENGTH, payload);
        self.buffer
            .put_i32_ordered(record_index + LENGTH_OFFSET, record_length as i32);

        self.buffer.put_i64_ordered(
            self.trailer + TAIL_POSITION_OFFSET,
            tail + required as i64,
        );

        Ok(())
    }

    /// Consumer side: read up to `limit` messages into the handler as
    /// `(msg_type, payload)`.
    pub fn read<F: FnMut(i32, &[u8])>(&self, mut handler: F, limit: usize) -> usize {
        let head_offset = self.trailer + HEAD_POSITION_OFFSET;
        let mut head = self.buffer.get_i64(head_offset);
        let mut messages = 0;

        while messages < limit {
            let index = (head as usize) & self.mask;
            let record_length = self.buffer.get_i32_volatile(index + LENGTH_OFFSET);
            if record_length <= 0 {
                break;
            }

            let msg_type = self.buffer.get_i32(index + TYPE_OFFSET);
            let aligned = align(record_length as usize, RECORD_ALIGNMENT);

            if msg_type != PADDING_MSG_TYPE_ID {
                let payload = self
                    .buffer
                    .as_slice(index + RECORD_HEADER_LENGTH, record_length as usize - RECORD_HEADER_LENGTH);
                handler(msg_type, payload);
                messages += 1;
            }

            // Zero the consumed record so the producer's length check sees
            // free space, then publish the new head.
            self.buffer.set_memory(index, aligned, 0);
            head += aligned as i64;
            self.buffer.put_i64_ordered(head_offset, head);
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::error::ErrorUtils;

    fn make_ring(capacity: usize) -> (OwnedBuffer, OneToOneRingBuffer) {
        let mem = OwnedBuffer::new(capacity + TRAILER_LENGTH);
        let ring = OneToOneRingBuffer::new(mem.buffer()).unwrap();
        (mem, ring)
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let mem = OwnedBuffer::new(1000 + TRAILER_LENGTH);
        assert!(OneToOneRingBuffer::new(mem.buffer()).is_err());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_mem, ring) = make_ring(1024);

        ring.write(7, b"hello").unwrap();
        ring.write(9, b"world!!").unwrap();

        let mut seen = Vec::new();
        let count = ring.read(|t, p| seen.push((t, p.to_vec())), 10);

        assert_eq!(count, 2);
        assert_eq!(seen[0], (7, b"hello".to_vec()));
        assert_eq!(seen[1], (9, b"world!!".to_vec()));
    }

    #[test]
    fn test_wraps_with_padding_record() {
        let (_mem, ring) = make_ring(256);

        // Fill and drain repeatedly so the tail index wraps mid-buffer.
        for round in 0..64 {
            let payload = [round as u8; 23];
            ring.write(1, &payload).unwrap();
            let mut got = 0;
            ring.read(
                |t, p| {
                    assert_eq!(t, 1);
                    assert_eq!(p, &payload[..]);
                    got += 1;
                },
                1,
            );
            assert_eq!(got, 1);
        }
    }

    #[test]
    fn test_full_ring_returns_wait() {
        let (_mem, ring) = make_ring(256);

        let payload = [0u8; 24];
        let mut writes = 0;
        loop {
            match ring.write(1, &payload) {
                Ok(()) => writes += 1,
                Err(DriverError::Wait) => break,
                Err(err) => panic!("unexpected error {:?}", err),
            }
            assert!(writes < 100, "ring never filled");
        }

        // Draining frees capacity again.
        ring.read(|_, _| (), 1);
        ring.write(1, &payload).unwrap();
    }

    #[test]
    fn test_oversized_message_is_fatal() {
        let (_mem, ring) = make_ring(256);
        let payload = [0u8; 64];
        assert!(ring.write(1, &payload).has_failed());
    }

    #[test]
    fn test_correlation_ids_are_monotonic() {
        let (_mem, ring) = make_ring(256);
        let a = ring.next_correlation_id();
        let b = ring.next_correlation_id();
        assert_eq!(b, a + 1);
    }
}

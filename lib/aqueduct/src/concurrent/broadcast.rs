use crate::concurrent::buffer::AtomicBuffer;
use crate::error::{DriverError, DriverResult, ErrorKind};
use bedrock::bits::{align, is_power_of_two};

/// One-to-many broadcast buffer carrying driver events to every connected
/// client. The transmitter (conductor) never blocks on slow receivers; a
/// receiver that falls more than a buffer-length behind is lapped and must
/// resynchronise, losing the overwritten records.
///
/// Records: [sequence i64][length i32][type i32][payload], aligned to 16.
/// The sequence is written before the payload and the tail published after,
/// the same two-stage release used by the image SM/loss counters.
pub const RECORD_HEADER_LENGTH: usize = 16;
pub const RECORD_ALIGNMENT: usize = 16;
pub const PADDING_MSG_TYPE_ID: i32 = -1;

pub const TAIL_INTENT_OFFSET: usize = 0;
pub const TAIL_COUNTER_OFFSET: usize = 64;
pub const LATEST_SEQUENCE_OFFSET: usize = 128;
pub const TRAILER_LENGTH: usize = 192;

const SEQUENCE_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 8;
const TYPE_OFFSET: usize = 12;

pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: usize,
    max_msg_length: usize,
    trailer: usize,
}

impl BroadcastTransmitter {
    pub fn new(buffer: AtomicBuffer) -> DriverResult<BroadcastTransmitter> {
        let capacity = buffer.capacity() - TRAILER_LENGTH;

        if !is_power_of_two(capacity) {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "broadcast capacity must be a power of two, got {}",
                capacity
            ))));
        }

        Ok(BroadcastTransmitter {
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

    pub fn transmit(&self, msg_type: i32, payload: &[u8]) -> DriverResult<()> {
        if payload.len() > self.max_msg_length {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "broadcast of {} exceeds max length {}",
                payload.len(),
                self.max_msg_length
            ))));
        }

        let record_length = RECORD_HEADER_LENGTH + payload.len();
        let aligned = align(record_length, RECORD_ALIGNMENT);
        let tail = self.buffer.get_i64(self.trailer + TAIL_COUNTER_OFFSET);
        let mut index = (tail as usize) & self.mask;
        let to_end = self.capacity - index;

        let mut new_tail = tail + aligned as i64;
        if aligned > to_end {
            // Claim through the wrap point; a padding record covers the
            // remainder of the buffer.
            new_tail += to_end as i64;
            self.buffer.put_i64_ordered(
                self.trailer + TAIL_INTENT_OFFSET,
                new_tail,
            );
            self.buffer.put_i64(index + SEQUENCE_OFFSET, tail);
            self.buffer.put_i32(index + LENGTH_OFFSET, to_end as i32);
            self.buffer.put_i32(index + TYPE_OFFSET, PADDING_MSG_TYPE_ID);
            index = 0;
        } else {
            self.buffer.put_i64_ordered(
                self.trailer + TAIL_INTENT_OFFSET,
                new_tail,
            );
        }

        let record_sequence = new_tail - aligned as i64;
        self.buffer.put_i64(index + SEQUENCE_OFFSET, record_sequence);
        self.buffer.put_i32(index + LENGTH_OFFSET, record_length as i32);
        self.buffer.put_i32(index + TYPE_OFFSET, msg_type);
        self.buffer.put_bytes(index + RECORD_HEADER_LENGTH, payload);

        self.buffer
            .put_i64_ordered(self.trailer + TAIL_COUNTER_OFFSET, new_tail);
        self.buffer
            .put_i64_ordered(self.trailer + LATEST_SEQUENCE_OFFSET, record_sequence);

        Ok(())
    }
}

/// Client-side view; the driver keeps one in-process for tests and for the
/// invoker mode loopback.
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: usize,
    trailer: usize,
    cursor: i64,
    lapped_count: u64,
}

impl BroadcastReceiver {
    pub fn new(buffer: AtomicBuffer) -> DriverResult<BroadcastReceiver> {
        let capacity = buffer.capacity() - TRAILER_LENGTH;

        if !is_power_of_two(capacity) {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "broadcast capacity must be a power of two, got {}",
                capacity
            ))));
        }

        let trailer = capacity;
        let cursor = buffer.get_i64_volatile(trailer + TAIL_COUNTER_OFFSET);

        Ok(BroadcastReceiver {
            buffer,
            capacity,
            mask: capacity - 1,
            trailer,
            cursor,
            lapped_count: 0,
        })
    }

    /// Times this receiver was overrun and forced to resynchronise.
    #[inline]
    pub fn lapped_count(&self) -> u64 {
        self.lapped_count
    }

    /// Receive the next record, if any. Returns `(msg_type, payload)`.
    /// A lapped receiver skips to the most recent record.
    pub fn receive_next(&mut self) -> Option<(i32, Vec<u8>)> {
        loop {
            let tail = self
                .buffer
                .get_i64_volatile(self.trailer + TAIL_COUNTER_OFFSET);
            if self.cursor >= tail {
                return None;
            }

            let tail_intent = self
                .buffer
                .get_i64_volatile(self.trailer + TAIL_INTENT_OFFSET);
            if tail_intent - self.cursor > self.capacity as i64 {
                // Lapped while idle; jump to the latest published record.
                self.cursor = self
                    .buffer
                    .get_i64_volatile(self.trailer + LATEST_SEQUENCE_OFFSET);
                self.lapped_count += 1;
            }

            let index = (self.cursor as usize) & self.mask;
            let sequence = self.buffer.get_i64(index + SEQUENCE_OFFSET);
            let length = self.buffer.get_i32(index + LENGTH_OFFSET);
            let msg_type = self.buffer.get_i32(index + TYPE_OFFSET);

            if sequence != self.cursor || length <= 0 {
                // Transmitter raced us mid-record; retry from the latest.
                self.cursor = self
                    .buffer
                    .get_i64_volatile(self.trailer + LATEST_SEQUENCE_OFFSET);
                self.lapped_count += 1;
                continue;
            }

            let aligned = align(length as usize, RECORD_ALIGNMENT) as i64;

            if msg_type == PADDING_MSG_TYPE_ID {
                self.cursor += length as i64;
                continue;
            }

            let payload = self
                .buffer
                .as_slice(index + RECORD_HEADER_LENGTH, length as usize - RECORD_HEADER_LENGTH)
                .to_vec();

            // Validate nothing overwrote the record while we copied it.
            let intent_after = self
                .buffer
                .get_i64_volatile(self.trailer + TAIL_INTENT_OFFSET);
            if intent_after - self.cursor > self.capacity as i64 {
                self.cursor = self
                    .buffer
                    .get_i64_volatile(self.trailer + LATEST_SEQUENCE_OFFSET);
                self.lapped_count += 1;
                continue;
            }

            self.cursor += aligned;
            return Some((msg_type, payload));
        }
    }
}

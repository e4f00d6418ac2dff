use crate::concurrent::buffer::AtomicBuffer;
use crate::concurrent::position::Position;
use crate::error::{DriverError, DriverResult, ErrorKind};

/// Counter type ids shared with clients. These are wire-stable; new types
/// are appended, never renumbered.
pub const SYSTEM_COUNTER_TYPE_ID: i32 = 0;
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;
pub const SENDER_POSITION_TYPE_ID: i32 = 2;
pub const RECEIVER_HWM_TYPE_ID: i32 = 3;
pub const SUBSCRIPTION_POSITION_TYPE_ID: i32 = 4;
pub const RECEIVER_POSITION_TYPE_ID: i32 = 5;
pub const SEND_CHANNEL_STATUS_TYPE_ID: i32 = 6;
pub const RECEIVE_CHANNEL_STATUS_TYPE_ID: i32 = 7;
pub const SENDER_LIMIT_TYPE_ID: i32 = 9;
pub const PER_IMAGE_TYPE_ID: i32 = 10;
pub const CLIENT_HEARTBEAT_TIMESTAMP_TYPE_ID: i32 = 11;
pub const PUBLISHER_POSITION_TYPE_ID: i32 = 12;
pub const SENDER_BPE_TYPE_ID: i32 = 13;
pub const LOCAL_SOCKADDR_TYPE_ID: i32 = 14;

/// Values region: one slot per counter, two cache lines apart so hot
/// counters never false-share.
pub const COUNTER_LENGTH: usize = 128;

/// Metadata region record layout.
pub const METADATA_LENGTH: usize = 256;
const STATE_OFFSET: usize = 0;
const TYPE_ID_OFFSET: usize = 4;
const FREE_FOR_REUSE_DEADLINE_OFFSET: usize = 8;
const KEY_OFFSET: usize = 16;
const LABEL_OFFSET: usize = 64;

pub const MAX_KEY_LENGTH: usize = LABEL_OFFSET - KEY_OFFSET;
pub const MAX_LABEL_LENGTH: usize = METADATA_LENGTH - LABEL_OFFSET - 4;

const RECORD_UNUSED: i32 = 0;
const RECORD_ALLOCATED: i32 = 1;
const RECORD_RECLAIMED: i32 = -1;

/// Allocates and frees counters in the shared metadata/values regions of
/// the CnC file. Owned by the conductor; clients read through
/// [`CountersReader`].
pub struct CountersManager {
    metadata: AtomicBuffer,
    values: AtomicBuffer,
    max_counters: usize,
    /// Freed slots are quarantined briefly so clients holding a stale id
    /// read a dead counter rather than an unrelated live one.
    reuse_timeout_ms: i64,
}

impl CountersManager {
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer, reuse_timeout_ms: i64) -> CountersManager {
        let by_values = values.capacity() / COUNTER_LENGTH;
        let by_metadata = metadata.capacity() / METADATA_LENGTH;

        CountersManager {
            metadata,
            values,
            max_counters: by_values.min(by_metadata),
            reuse_timeout_ms,
        }
    }

    #[inline]
    pub fn max_counters(&self) -> usize {
        self.max_counters
    }

    /// Allocate a counter, writing `key` bytes and `label` into its
    /// metadata record. Returns the counter id.
    pub fn allocate(&mut self, type_id: i32, key: &[u8], label: &str, now_ms: i64) -> DriverResult<i32> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "counter key of {} exceeds {}",
                key.len(),
                MAX_KEY_LENGTH
            ))));
        }

        let id = self.next_free_id(now_ms)?;
        let offset = id as usize * METADATA_LENGTH;

        self.metadata.set_memory(offset, METADATA_LENGTH, 0);
        self.metadata.put_i32(offset + TYPE_ID_OFFSET, type_id);
        self.metadata.put_bytes(offset + KEY_OFFSET, key);

        let label = if label.len() > MAX_LABEL_LENGTH {
            &label[..MAX_LABEL_LENGTH]
        } else {
            label
        };
        self.metadata.put_string(offset + LABEL_OFFSET, label);

        self.values
            .set_memory(id as usize * COUNTER_LENGTH, COUNTER_LENGTH, 0);
        self.metadata
            .put_i32_ordered(offset + STATE_OFFSET, RECORD_ALLOCATED);

        Ok(id)
    }

    /// Release a counter for eventual reuse.
    pub fn free(&mut self, id: i32, now_ms: i64) {
        let offset = id as usize * METADATA_LENGTH;
        self.metadata.put_i64(
            offset + FREE_FOR_REUSE_DEADLINE_OFFSET,
            now_ms + self.reuse_timeout_ms,
        );
        self.metadata
            .put_i32_ordered(offset + STATE_OFFSET, RECORD_RECLAIMED);
    }

    /// Position handle over a counter's value slot.
    #[inline]
    pub fn position(&self, id: i32) -> Position {
        Position::new(self.values, id as usize * COUNTER_LENGTH, id)
    }

    pub fn set_counter_value(&mut self, id: i32, value: i64) {
        self.values
            .put_i64_ordered(id as usize * COUNTER_LENGTH, value);
    }

    fn next_free_id(&self, now_ms: i64) -> DriverResult<i32> {
        for id in 0..self.max_counters {
            let offset = id * METADATA_LENGTH;
            match self.metadata.get_i32_volatile(offset + STATE_OFFSET) {
                RECORD_UNUSED => return Ok(id as i32),
                RECORD_RECLAIMED => {
                    let deadline = self.metadata.get_i64(offset + FREE_FOR_REUSE_DEADLINE_OFFSET);
                    if now_ms >= deadline {
                        return Ok(id as i32);
                    }
                }
                _ => (),
            }
        }

        Err(DriverError::Fatal(ErrorKind::Resource(
            "counters region exhausted".to_string(),
        )))
    }
}

/// Read-only view used by clients and by the driver's own introspection.
pub struct CountersReader {
    metadata: AtomicBuffer,
    values: AtomicBuffer,
    max_counters: usize,
}

impl CountersReader {
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer) -> CountersReader {
        let by_values = values.capacity() / COUNTER_LENGTH;
        let by_metadata = metadata.capacity() / METADATA_LENGTH;

        CountersReader {
            metadata,
            values,
            max_counters: by_values.min(by_metadata),
        }
    }

    #[inline]
    pub fn counter_value(&self, id: i32) -> i64 {
        self.values.get_i64_volatile(id as usize * COUNTER_LENGTH)
    }

    pub fn label(&self, id: i32) -> Option<String> {
        let offset = id as usize * METADATA_LENGTH;
        if self.metadata.get_i32_volatile(offset + STATE_OFFSET) != RECORD_ALLOCATED {
            return None;
        }
        Some(self.metadata.get_string(offset + LABEL_OFFSET))
    }

    pub fn type_id(&self, id: i32) -> Option<i32> {
        let offset = id as usize * METADATA_LENGTH;
        if self.metadata.get_i32_volatile(offset + STATE_OFFSET) != RECORD_ALLOCATED {
            return None;
        }
        Some(self.metadata.get_i32(offset + TYPE_ID_OFFSET))
    }

    /// Iterate live counters as `(id, type_id, value, label)`.
    pub fn for_each<F: FnMut(i32, i32, i64, &str)>(&self, mut handler: F) {
        for id in 0..self.max_counters as i32 {
            let offset = id as usize * METADATA_LENGTH;
            if self.metadata.get_i32_volatile(offset + STATE_OFFSET) == RECORD_ALLOCATED {
                let type_id = self.metadata.get_i32(offset + TYPE_ID_OFFSET);
                let label = self.metadata.get_string(offset + LABEL_OFFSET);
                handler(id, type_id, self.counter_value(id), &label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;

    fn make_manager(slots: usize) -> (OwnedBuffer, OwnedBuffer, CountersManager) {
        let metadata = OwnedBuffer::new(slots * METADATA_LENGTH);
        let values = OwnedBuffer::new(slots * COUNTER_LENGTH);
        let manager = CountersManager::new(metadata.buffer(), values.buffer(), 1000);
        (metadata, values, manager)
    }

    #[test]
    fn test_allocate_and_read_back() {
        let (metadata, values, mut manager) = make_manager(8);

        let id = manager
            .allocate(SENDER_POSITION_TYPE_ID, &[1, 2, 3], "snd-pos: 42", 0)
            .unwrap();
        assert_eq!(id, 0);

        let position = manager.position(id);
        position.set_ordered(1024);

        let reader = CountersReader::new(metadata.buffer(), values.buffer());
        assert_eq!(reader.counter_value(id), 1024);
        assert_eq!(reader.type_id(id), Some(SENDER_POSITION_TYPE_ID));
        assert_eq!(reader.label(id), Some("snd-pos: 42".to_string()));
    }

    #[test]
    fn test_ids_are_sequential() {
        let (_m, _v, mut manager) = make_manager(8);

        assert_eq!(manager.allocate(1, &[], "a", 0).unwrap(), 0);
        assert_eq!(manager.allocate(1, &[], "b", 0).unwrap(), 1);
        assert_eq!(manager.allocate(1, &[], "c", 0).unwrap(), 2);
    }

    #[test]
    fn test_freed_slot_respects_cool_down() {
        let (_m, _v, mut manager) = make_manager(2);

        let a = manager.allocate(1, &[], "a", 0).unwrap();
        let _b = manager.allocate(1, &[], "b", 0).unwrap();

        manager.free(a, 0);

        // Before the reuse deadline the region is exhausted.
        assert!(manager.allocate(1, &[], "c", 500).is_err());

        // After the deadline the slot is reusable.
        let c = manager.allocate(1, &[], "c", 1000).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_freed_counter_is_invisible_to_reader() {
        let (metadata, values, mut manager) = make_manager(4);
        let id = manager.allocate(1, &[], "gone", 0).unwrap();
        manager.free(id, 0);

        let reader = CountersReader::new(metadata.buffer(), values.buffer());
        assert_eq!(reader.label(id), None);
        assert_eq!(reader.type_id(id), None);

        let mut seen = 0;
        reader.for_each(|_, _, _, _| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let (_m, _v, mut manager) = make_manager(4);
        let key = [0u8; MAX_KEY_LENGTH + 1];
        assert!(manager.allocate(1, &key, "label", 0).is_err());
    }
}

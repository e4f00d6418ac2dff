use crate::concurrent::buffer::AtomicBuffer;
use crate::error::{DriverError, DriverResult, ErrorKind};
use bedrock::bits::{is_power_of_two, number_of_trailing_zeros};

/// A log is always three terms: one active, one dirty (just retired), one
/// clean (zeroed ahead of the tail) so rotation never waits.
pub const PARTITION_COUNT: usize = 3;

pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

pub const PAGE_MIN_LENGTH: usize = 4 * 1024;

/// Metadata page layout. Tail counters first, hot fields spread over the
/// first cache lines, the default frame header template at a fixed offset.
pub const TERM_TAIL_COUNTERS_OFFSET: usize = 0;
pub const LOG_ACTIVE_TERM_COUNT_OFFSET: usize = 24;
pub const LOG_END_OF_STREAM_POSITION_OFFSET: usize = 32;
pub const LOG_IS_CONNECTED_OFFSET: usize = 40;
pub const LOG_ACTIVE_TRANSPORT_COUNT_OFFSET: usize = 44;
pub const LOG_CORRELATION_ID_OFFSET: usize = 48;
pub const LOG_INITIAL_TERM_ID_OFFSET: usize = 56;
pub const LOG_MTU_LENGTH_OFFSET: usize = 60;
pub const LOG_TERM_LENGTH_OFFSET: usize = 64;
pub const LOG_DEFAULT_FRAME_HEADER_OFFSET: usize = 128;
pub const LOG_META_DATA_LENGTH: usize = 4096;

pub fn check_term_length(term_length: usize) -> DriverResult<()> {
    if term_length < TERM_MIN_LENGTH || term_length > TERM_MAX_LENGTH || !is_power_of_two(term_length)
    {
        return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
            "term length must be a power of two in [{}, {}], got {}",
            TERM_MIN_LENGTH, TERM_MAX_LENGTH, term_length
        ))));
    }

    Ok(())
}

#[inline]
pub fn compute_log_length(term_length: usize) -> usize {
    (term_length * PARTITION_COUNT) + LOG_META_DATA_LENGTH
}

#[inline]
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    number_of_trailing_zeros(term_length)
}

/// Map a (termId, termOffset) pair onto the 64-bit stream position.
#[inline]
pub fn compute_position(term_id: i32, term_offset: i32, bits: u32, initial_term_id: i32) -> i64 {
    let term_count = (term_id.wrapping_sub(initial_term_id)) as i64;
    (term_count << bits) + term_offset as i64
}

#[inline]
pub fn compute_term_begin_position(term_id: i32, bits: u32, initial_term_id: i32) -> i64 {
    compute_position(term_id, 0, bits, initial_term_id)
}

#[inline]
pub fn compute_term_id_from_position(position: i64, bits: u32, initial_term_id: i32) -> i32 {
    ((position >> bits) as i32).wrapping_add(initial_term_id)
}

#[inline]
pub fn compute_term_offset_from_position(position: i64, bits: u32) -> i32 {
    let mask = (1i64 << bits) - 1;
    (position & mask) as i32
}

#[inline]
pub fn index_by_term(initial_term_id: i32, term_id: i32) -> usize {
    (term_id.wrapping_sub(initial_term_id)).rem_euclid(PARTITION_COUNT as i32) as usize
}

#[inline]
pub fn index_by_term_count(term_count: i64) -> usize {
    term_count.rem_euclid(PARTITION_COUNT as i64) as usize
}

#[inline]
pub fn index_by_position(position: i64, bits: u32) -> usize {
    ((position >> bits) % PARTITION_COUNT as i64) as usize
}

/// Tail counters pack (termId << 32 | termOffset) so both move in one
/// atomic operation.
#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as i64 & 0xFFFF_FFFF)
}

#[inline]
pub fn term_id_from_raw_tail(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// The raw offset may overshoot the term when a losing CAS racer runs past
/// the end; observers clamp to the term length.
#[inline]
pub fn term_offset_from_raw_tail(raw_tail: i64, term_length: usize) -> i32 {
    let offset = raw_tail & 0xFFFF_FFFF;
    offset.min(term_length as i64) as i32
}

#[inline]
pub fn tail_counter_offset(index: usize) -> usize {
    TERM_TAIL_COUNTERS_OFFSET + (index * 8)
}

#[inline]
pub fn raw_tail_volatile(metadata: &AtomicBuffer, index: usize) -> i64 {
    metadata.get_i64_volatile(tail_counter_offset(index))
}

#[inline]
pub fn active_term_count(metadata: &AtomicBuffer) -> i32 {
    metadata.get_i32_volatile(LOG_ACTIVE_TERM_COUNT_OFFSET)
}

#[inline]
pub fn initial_term_id(metadata: &AtomicBuffer) -> i32 {
    metadata.get_i32(LOG_INITIAL_TERM_ID_OFFSET)
}

#[inline]
pub fn mtu_length(metadata: &AtomicBuffer) -> usize {
    metadata.get_i32(LOG_MTU_LENGTH_OFFSET) as usize
}

#[inline]
pub fn term_length(metadata: &AtomicBuffer) -> usize {
    metadata.get_i32(LOG_TERM_LENGTH_OFFSET) as usize
}

#[inline]
pub fn is_connected(metadata: &AtomicBuffer) -> bool {
    metadata.get_i32_volatile(LOG_IS_CONNECTED_OFFSET) == 1
}

#[inline]
pub fn set_is_connected(metadata: &AtomicBuffer, connected: bool) {
    metadata.put_i32_ordered(LOG_IS_CONNECTED_OFFSET, if connected { 1 } else { 0 });
}

#[inline]
pub fn end_of_stream_position(metadata: &AtomicBuffer) -> i64 {
    metadata.get_i64_volatile(LOG_END_OF_STREAM_POSITION_OFFSET)
}

#[inline]
pub fn set_end_of_stream_position(metadata: &AtomicBuffer, position: i64) {
    metadata.put_i64_ordered(LOG_END_OF_STREAM_POSITION_OFFSET, position);
}

/// Stamp a fresh metadata page. Tail 0 starts at the initial term id, the
/// other tails are pre-set one and two terms ahead so their first rotation
/// needs no special case.
pub fn initialize(
    metadata: &AtomicBuffer,
    initial_term_id_value: i32,
    term_length_value: usize,
    mtu: usize,
    correlation_id: i64,
) {
    metadata.set_memory(0, LOG_META_DATA_LENGTH, 0);
    metadata.put_i64(
        tail_counter_offset(0),
        pack_tail(initial_term_id_value, 0),
    );
    metadata.put_i64(
        tail_counter_offset(1),
        pack_tail(initial_term_id_value.wrapping_add(1), 0),
    );
    metadata.put_i64(
        tail_counter_offset(2),
        pack_tail(initial_term_id_value.wrapping_add(2), 0),
    );
    metadata.put_i32(LOG_INITIAL_TERM_ID_OFFSET, initial_term_id_value);
    metadata.put_i32(LOG_TERM_LENGTH_OFFSET, term_length_value as i32);
    metadata.put_i32(LOG_MTU_LENGTH_OFFSET, mtu as i32);
    metadata.put_i64(LOG_CORRELATION_ID_OFFSET, correlation_id);
    metadata.put_i64(LOG_END_OF_STREAM_POSITION_OFFSET, i64::MAX);
}

/// Rotate to the next term: pre-stage the tail of the term after next and
/// publish the new active term count. Idempotent under racing appenders.
pub fn rotate_log(metadata: &AtomicBuffer, current_term_count: i32, current_term_id: i32) -> bool {
    let next_term_id = current_term_id.wrapping_add(1);
    let next_term_count = current_term_count.wrapping_add(1);
    let next_index = index_by_term_count(next_term_count as i64);
    let expected_term_id = next_term_id.wrapping_sub(PARTITION_COUNT as i32);

    let offset = tail_counter_offset(next_index);
    let new_raw_tail = pack_tail(next_term_id, 0);
    loop {
        let raw_tail = metadata.get_i64_volatile(offset);
        if expected_term_id != term_id_from_raw_tail(raw_tail) {
            break;
        }
        if metadata.compare_and_set_i64(offset, raw_tail, new_raw_tail) {
            break;
        }
    }

    metadata.compare_and_set_i32(
        LOG_ACTIVE_TERM_COUNT_OFFSET,
        current_term_count,
        next_term_count,
    )
}

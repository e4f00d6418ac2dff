use crate::concurrent::buffer::AtomicBuffer;
use crate::protocol;
use bedrock::bits::align_i32;

/// Frames are stored in the log exactly as they travel on the wire, so
/// these offsets match the common header in `protocol`.
pub const VERSION_OFFSET: usize = 0;
pub const FLAGS_OFFSET: usize = 1;
pub const TYPE_OFFSET: usize = 2;
pub const LENGTH_OFFSET: usize = 4;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_OFFSET: usize = 24;

pub const HEADER_LENGTH: usize = 32;

/// Frames and the gaps between them are always 32-byte aligned.
pub const FRAME_ALIGNMENT: usize = 32;

#[inline]
pub fn compute_max_payload_length(mtu: usize) -> usize {
    mtu - HEADER_LENGTH
}

/// The length field is the concurrency control for a frame: the rebuilder
/// and appender publish it last with a release store, and every scanner
/// reads it first with an acquire load.
#[inline]
pub fn frame_length_volatile(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32_volatile(frame_offset + LENGTH_OFFSET)
}

#[inline]
pub fn set_frame_length_ordered(buffer: &AtomicBuffer, frame_offset: usize, length: i32) {
    buffer.put_i32_ordered(frame_offset + LENGTH_OFFSET, length);
}

#[inline]
pub fn frame_type(buffer: &AtomicBuffer, frame_offset: usize) -> u16 {
    let raw = buffer.as_slice(frame_offset + TYPE_OFFSET, 2);
    u16::from_le_bytes([raw[0], raw[1]])
}

#[inline]
pub fn is_padding_frame(buffer: &AtomicBuffer, frame_offset: usize) -> bool {
    frame_type(buffer, frame_offset) == protocol::HDR_TYPE_PAD
}

#[inline]
pub fn frame_term_offset(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + TERM_OFFSET_OFFSET)
}

#[inline]
pub fn frame_session_id(buffer: &AtomicBuffer, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + SESSION_ID_OFFSET)
}

#[inline]
pub fn frame_flags(buffer: &AtomicBuffer, frame_offset: usize) -> u8 {
    buffer.as_slice(frame_offset + FLAGS_OFFSET, 1)[0]
}

#[inline]
pub fn aligned_frame_length(length: i32) -> i32 {
    align_i32(length, FRAME_ALIGNMENT as i32)
}

/// Write a complete header at `frame_offset` with a zero length field;
/// the length is published separately once the body is in place.
pub fn write_header(
    buffer: &AtomicBuffer,
    frame_offset: usize,
    frame_type_value: u16,
    flags: u8,
    term_offset: i32,
    session_id: i32,
    stream_id: i32,
    term_id: i32,
) {
    let header = buffer.as_mut_slice(frame_offset, HEADER_LENGTH);
    header[VERSION_OFFSET] = protocol::PROTOCOL_VERSION;
    header[FLAGS_OFFSET] = flags;
    header[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&frame_type_value.to_le_bytes());
    header[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&0i32.to_le_bytes());
    header[TERM_OFFSET_OFFSET..TERM_OFFSET_OFFSET + 4].copy_from_slice(&term_offset.to_le_bytes());
    header[SESSION_ID_OFFSET..SESSION_ID_OFFSET + 4].copy_from_slice(&session_id.to_le_bytes());
    header[STREAM_ID_OFFSET..STREAM_ID_OFFSET + 4].copy_from_slice(&stream_id.to_le_bytes());
    header[TERM_ID_OFFSET..TERM_ID_OFFSET + 4].copy_from_slice(&term_id.to_le_bytes());
    header[RESERVED_OFFSET..RESERVED_OFFSET + 8].copy_from_slice(&0i64.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;

    #[test]
    fn test_header_roundtrip() {
        let mem = OwnedBuffer::new(128);
        let buf = mem.buffer();

        write_header(&buf, 32, protocol::HDR_TYPE_DATA, protocol::BEGIN_AND_END_FLAGS, 32, 7, 1001, 3);
        set_frame_length_ordered(&buf, 32, 100);

        assert_eq!(frame_length_volatile(&buf, 32), 100);
        assert_eq!(frame_type(&buf, 32), protocol::HDR_TYPE_DATA);
        assert_eq!(frame_term_offset(&buf, 32), 32);
        assert_eq!(frame_session_id(&buf, 32), 7);
        assert_eq!(frame_flags(&buf, 32), protocol::BEGIN_AND_END_FLAGS);
        assert!(!is_padding_frame(&buf, 32));
    }

    #[test]
    fn test_padding_detection() {
        let mem = OwnedBuffer::new(64);
        let buf = mem.buffer();

        write_header(&buf, 0, protocol::HDR_TYPE_PAD, protocol::BEGIN_AND_END_FLAGS, 0, 1, 1, 1);
        assert!(is_padding_frame(&buf, 0));
    }

    #[test]
    fn test_aligned_length() {
        assert_eq!(aligned_frame_length(32), 32);
        assert_eq!(aligned_frame_length(33), 64);
        assert_eq!(aligned_frame_length(1040), 1056);
    }
}

use crate::concurrent::buffer::AtomicBuffer;
use crate::logbuffer::frame;

/// Subscriber-side insert of a received frame at its declared term offset.
/// Single writer per image. The first eight header bytes (version, flags,
/// type, length) are published last as one ordered store, so a concurrent
/// scanner that observes a non-zero length sees a complete frame.
pub fn insert(term: &AtomicBuffer, term_offset: usize, packet: &[u8]) {
    if frame::frame_length_volatile(term, term_offset) != 0 {
        // Duplicate or retransmit of an already rebuilt frame.
        return;
    }

    term.put_bytes(term_offset + 8, &packet[8..]);

    let mut first_word = [0u8; 8];
    first_word.copy_from_slice(&packet[..8]);
    term.put_i64_ordered(term_offset, i64::from_le_bytes(first_word));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::protocol;

    const TERM_LENGTH: usize = 64 * 1024;

    fn make_packet(term_offset: i32, payload: &[u8]) -> Vec<u8> {
        let frame_length = protocol::header::LENGTH + payload.len();
        let mut packet = vec![0u8; frame_length];
        protocol::header::encode(
            &mut packet,
            protocol::HDR_TYPE_DATA,
            protocol::BEGIN_AND_END_FLAGS,
            frame_length as i32,
            term_offset,
            7,
            1001,
            3,
        );
        packet[protocol::header::LENGTH..].copy_from_slice(payload);
        packet
    }

    #[test]
    fn test_insert_places_frame_at_offset() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();

        let packet = make_packet(1024, &[5u8; 64]);
        insert(&term, 1024, &packet);

        assert_eq!(frame::frame_length_volatile(&term, 1024), packet.len() as i32);
        assert_eq!(
            term.as_slice(1024 + frame::HEADER_LENGTH, 64),
            &[5u8; 64][..]
        );
        // Offsets before and after stay untouched.
        assert_eq!(frame::frame_length_volatile(&term, 0), 0);
        assert_eq!(frame::frame_length_volatile(&term, 2048), 0);
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();

        let packet = make_packet(0, &[5u8; 64]);
        insert(&term, 0, &packet);

        let mut duplicate = make_packet(0, &[9u8; 64]);
        duplicate[0] = 99;
        insert(&term, 0, &duplicate);

        // The second copy landed on the same bytes and changed nothing.
        assert_eq!(term.as_slice(frame::HEADER_LENGTH, 64), &[5u8; 64][..]);
        assert_eq!(protocol::header::version(term.as_slice(0, 32)), protocol::PROTOCOL_VERSION);
    }
}

use crate::concurrent::buffer::AtomicBuffer;
use crate::logbuffer::frame;
use crate::protocol;

/// Write a PAD over a claim that was reserved but never committed, so
/// consumers blocked behind it can advance. The pad covers the stalled
/// region up to the next committed frame or the given tail offset.
///
/// Returns the padded length, or `None` when the offset holds a committed
/// frame (nothing to unblock).
pub fn unblock(
    term: &AtomicBuffer,
    blocked_offset: usize,
    tail_offset: usize,
    term_id: i32,
    session_id: i32,
    stream_id: i32,
) -> Option<usize> {
    if blocked_offset >= tail_offset {
        return None;
    }

    if frame::frame_length_volatile(term, blocked_offset) != 0 {
        return None;
    }

    // The stalled claim's length is unknowable; pad to the next committed
    // frame header.
    let mut pad_end = blocked_offset + frame::FRAME_ALIGNMENT;
    while pad_end < tail_offset && frame::frame_length_volatile(term, pad_end) == 0 {
        pad_end += frame::FRAME_ALIGNMENT;
    }
    let pad_length = pad_end.min(tail_offset) - blocked_offset;

    frame::write_header(
        term,
        blocked_offset,
        protocol::HDR_TYPE_PAD,
        protocol::BEGIN_AND_END_FLAGS,
        blocked_offset as i32,
        session_id,
        stream_id,
        term_id,
    );
    frame::set_frame_length_ordered(term, blocked_offset, pad_length as i32);

    Some(pad_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;

    const TERM_LENGTH: usize = 64 * 1024;

    fn write_frame(term: &AtomicBuffer, offset: usize, frame_length: usize) {
        frame::write_header(
            term,
            offset,
            protocol::HDR_TYPE_DATA,
            protocol::BEGIN_AND_END_FLAGS,
            offset as i32,
            7,
            1001,
            3,
        );
        frame::set_frame_length_ordered(term, offset, frame_length as i32);
    }

    #[test]
    fn test_pads_stalled_claim_up_to_next_frame() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();

        // Claim at 0 never committed; a later append at 256 did commit.
        write_frame(&term, 256, 128);

        let padded = unblock(&term, 0, 512, 3, 7, 1001).unwrap();
        assert_eq!(padded, 256);
        assert!(frame::is_padding_frame(&term, 0));
        assert_eq!(frame::frame_length_volatile(&term, 0), 256);
    }

    #[test]
    fn test_pads_to_tail_when_no_later_frame() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();

        let padded = unblock(&term, 128, 512, 3, 7, 1001).unwrap();
        assert_eq!(padded, 384);
        assert!(frame::is_padding_frame(&term, 128));
    }

    #[test]
    fn test_committed_frame_is_not_disturbed() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();
        write_frame(&term, 0, 128);

        assert_eq!(unblock(&term, 0, 512, 3, 7, 1001), None);
        assert!(!frame::is_padding_frame(&term, 0));
    }

    #[test]
    fn test_nothing_to_unblock_at_tail() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();

        assert_eq!(unblock(&term, 512, 512, 3, 7, 1001), None);
    }
}

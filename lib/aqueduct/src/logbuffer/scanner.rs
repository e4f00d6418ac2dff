use crate::concurrent::buffer::AtomicBuffer;
use crate::logbuffer::frame;

/// Result of a sender-side scan: `available` bytes ready to transmit from
/// the scan offset, and `padding` bytes to skip after them (a PAD frame's
/// body, which never travels on the wire).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ScanOutcome {
    pub available: usize,
    pub padding: usize,
}

/// Scan forward from `offset` collecting whole frames up to `max_length`.
/// A frame is never split: if the next frame would overrun the limit the
/// scan stops before it.
pub fn scan_for_availability(term: &AtomicBuffer, offset: usize, max_length: usize) -> ScanOutcome {
    let max_length = max_length.min(term.capacity() - offset);
    let mut available = 0usize;
    let mut padding = 0usize;

    loop {
        let frame_offset = offset + available + padding;
        if frame_offset >= term.capacity() {
            break;
        }

        let frame_length = frame::frame_length_volatile(term, frame_offset);
        if frame_length <= 0 {
            break;
        }

        let mut frame_bytes = frame::aligned_frame_length(frame_length) as usize;
        if frame::is_padding_frame(term, frame_offset) {
            // Only the PAD header travels; the body is skipped.
            padding = frame_bytes - frame::HEADER_LENGTH;
            frame_bytes = frame::HEADER_LENGTH;
        }

        available += frame_bytes;
        if available > max_length {
            available -= frame_bytes;
            padding = 0;
            break;
        }

        if padding != 0 {
            break;
        }
    }

    ScanOutcome { available, padding }
}

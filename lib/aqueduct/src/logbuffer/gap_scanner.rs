use crate::concurrent::buffer::AtomicBuffer;
use crate::logbuffer::frame;

/// A hole in a partially rebuilt term.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Gap {
    pub term_id: i32,
    pub term_offset: usize,
    pub length: usize,
}

/// Scan `[rebuild_offset, hwm_offset)` for the first gap. Frames and the
/// gaps between them are 32-byte aligned, so the scan steps a frame at a
/// time over rebuilt regions and an alignment unit at a time inside holes.
pub fn scan_for_gap(
    term: &AtomicBuffer,
    term_id: i32,
    rebuild_offset: usize,
    hwm_offset: usize,
) -> Option<Gap> {
    let mut offset = rebuild_offset;

    while offset < hwm_offset {
        let frame_length = frame::frame_length_volatile(term, offset);
        if frame_length > 0 {
            offset += frame::aligned_frame_length(frame_length) as usize;
            continue;
        }

        let gap_begin = offset;
        let mut gap_end = offset + frame::FRAME_ALIGNMENT;
        while gap_end < hwm_offset && frame::frame_length_volatile(term, gap_end) <= 0 {
            gap_end += frame::FRAME_ALIGNMENT;
        }

        return Some(Gap {
            term_id,
            term_offset: gap_begin,
            length: gap_end.min(hwm_offset) - gap_begin,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::protocol;

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
    fn test_contiguous_prefix_has_no_gap() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();
        write_frame(&term, 0, 128);
        write_frame(&term, 128, 128);

        assert_eq!(scan_for_gap(&term, 3, 0, 256), None);
    }

    #[test]
    fn test_finds_first_gap_only() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();

        // Frames at 0 and 256; holes at [128, 256) and [384, 512).
        write_frame(&term, 0, 128);
        write_frame(&term, 256, 128);
        write_frame(&term, 512, 128);

        let gap = scan_for_gap(&term, 3, 0, 640).unwrap();
        assert_eq!(
            gap,
            Gap {
                term_id: 3,
                term_offset: 128,
                length: 128,
            }
        );
    }

    #[test]
    fn test_gap_runs_to_hwm_when_unterminated() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();
        write_frame(&term, 0, 128);

        let gap = scan_for_gap(&term, 3, 0, 1024).unwrap();
        assert_eq!(gap.term_offset, 128);
        assert_eq!(gap.length, 1024 - 128);
    }

    #[test]
    fn test_scan_starts_at_rebuild_offset() {
        let mem = OwnedBuffer::new(TERM_LENGTH);
        let term = mem.buffer();
        write_frame(&term, 1024, 128);

        // Hole before 1024 is outside the scan window.
        let gap = scan_for_gap(&term, 3, 1024, 2048).unwrap();
        assert_eq!(gap.term_offset, 1024 + 128);
    }
}

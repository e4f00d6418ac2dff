use crate::concurrent::buffer::AtomicBuffer;
use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::logbuffer::descriptor;
use crate::logbuffer::frame;
use crate::protocol;

/// Outcome of one append attempt against the active term.
#[derive(Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    /// The frame is in; the new tail offset within the term.
    Appended { term_id: i32, term_offset: i32 },
    /// The term had no room: a PAD was written (when space allowed) and
    /// the caller must rotate the log before retrying.
    EndOfTerm { term_id: i32 },
}

/// Publisher-side appender for one term partition. Reservation is a
/// get-and-add on the packed tail counter, so exclusive and concurrent
/// publications share the same code path.
pub struct TermAppender {
    term: AtomicBuffer,
    metadata: AtomicBuffer,
    tail_counter_offset: usize,
}

impl TermAppender {
    #[inline]
    pub fn new(term: AtomicBuffer, metadata: AtomicBuffer, partition_index: usize) -> TermAppender {
        TermAppender {
            term,
            metadata,
            tail_counter_offset: descriptor::tail_counter_offset(partition_index),
        }
    }

    #[inline]
    pub fn raw_tail_volatile(&self) -> i64 {
        self.metadata.get_i64_volatile(self.tail_counter_offset)
    }

    /// Append a message that fits in a single frame.
    pub fn append_unfragmented(
        &self,
        session_id: i32,
        stream_id: i32,
        payload: &[u8],
        max_payload_length: usize,
    ) -> DriverResult<AppendOutcome> {
        if payload.len() > max_payload_length {
            return Err(DriverError::Fatal(ErrorKind::InvalidConfig(format!(
                "payload of {} exceeds max payload length {}",
                payload.len(),
                max_payload_length
            ))));
        }

        let frame_length = frame::HEADER_LENGTH + payload.len();
        let aligned_length = bedrock::bits::align(frame_length, frame::FRAME_ALIGNMENT);

        let raw_tail = self
            .metadata
            .get_and_add_i64(self.tail_counter_offset, aligned_length as i64);
        let term_id = descriptor::term_id_from_raw_tail(raw_tail);
        let term_offset = (raw_tail & 0xFFFF_FFFF) as i64;
        let term_length = self.term.capacity();

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > term_length as i64 {
            self.handle_end_of_term(term_offset, term_id, session_id, stream_id);
            return Ok(AppendOutcome::EndOfTerm { term_id });
        }

        let offset = term_offset as usize;
        frame::write_header(
            &self.term,
            offset,
            protocol::HDR_TYPE_DATA,
            protocol::BEGIN_AND_END_FLAGS,
            offset as i32,
            session_id,
            stream_id,
            term_id,
        );
        self.term
            .put_bytes(offset + frame::HEADER_LENGTH, payload);
        frame::set_frame_length_ordered(&self.term, offset, frame_length as i32);

        Ok(AppendOutcome::Appended {
            term_id,
            term_offset: resulting_offset as i32,
        })
    }

    /// Append a message as a chain of MTU-sized fragments carrying
    /// BEGIN/END flags on the first and last frame.
    pub fn append_fragmented(
        &self,
        session_id: i32,
        stream_id: i32,
        payload: &[u8],
        max_payload_length: usize,
    ) -> DriverResult<AppendOutcome> {
        let num_fragments = (payload.len() + max_payload_length - 1) / max_payload_length;
        let last_fragment_length = payload.len() - (num_fragments - 1) * max_payload_length;
        let required = (num_fragments - 1)
            * bedrock::bits::align(
                frame::HEADER_LENGTH + max_payload_length,
                frame::FRAME_ALIGNMENT,
            )
            + bedrock::bits::align(
                frame::HEADER_LENGTH + last_fragment_length,
                frame::FRAME_ALIGNMENT,
            );

        let raw_tail = self
            .metadata
            .get_and_add_i64(self.tail_counter_offset, required as i64);
        let term_id = descriptor::term_id_from_raw_tail(raw_tail);
        let term_offset = (raw_tail & 0xFFFF_FFFF) as i64;
        let term_length = self.term.capacity();

        let resulting_offset = term_offset + required as i64;
        if resulting_offset > term_length as i64 {
            self.handle_end_of_term(term_offset, term_id, session_id, stream_id);
            return Ok(AppendOutcome::EndOfTerm { term_id });
        }

        let mut offset = term_offset as usize;
        let mut remaining = payload;
        let mut flags = protocol::BEGIN_FLAG;

        while !remaining.is_empty() {
            let chunk = remaining.len().min(max_payload_length);
            if chunk == remaining.len() {
                flags |= protocol::END_FLAG;
            }

            let frame_length = frame::HEADER_LENGTH + chunk;
            frame::write_header(
                &self.term,
                offset,
                protocol::HDR_TYPE_DATA,
                flags,
                offset as i32,
                session_id,
                stream_id,
                term_id,
            );
            self.term
                .put_bytes(offset + frame::HEADER_LENGTH, &remaining[..chunk]);
            frame::set_frame_length_ordered(&self.term, offset, frame_length as i32);

            offset += bedrock::bits::align(frame_length, frame::FRAME_ALIGNMENT);
            remaining = &remaining[chunk..];
            flags = 0;
        }

        Ok(AppendOutcome::Appended {
            term_id,
            term_offset: resulting_offset as i32,
        })
    }

    /// A losing racer that runs past the end pads only if it is the first
    /// to land on the live region of the term.
    fn handle_end_of_term(&self, term_offset: i64, term_id: i32, session_id: i32, stream_id: i32) {
        let term_length = self.term.capacity() as i64;

        if term_offset < term_length {
            let offset = term_offset as usize;
            let pad_length = (term_length - term_offset) as i32;
            frame::write_header(
                &self.term,
                offset,
                protocol::HDR_TYPE_PAD,
                protocol::BEGIN_AND_END_FLAGS,
                offset as i32,
                session_id,
                stream_id,
                term_id,
            );
            frame::set_frame_length_ordered(&self.term, offset, pad_length);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::logbuffer::descriptor::LOG_META_DATA_LENGTH;

    const TERM_LENGTH: usize = 64 * 1024;
    const MAX_PAYLOAD: usize = 1024 - frame::HEADER_LENGTH;

    fn make_appender() -> (OwnedBuffer, OwnedBuffer, TermAppender) {
        let term = OwnedBuffer::new(TERM_LENGTH);
        let meta = OwnedBuffer::new(LOG_META_DATA_LENGTH);
        descriptor::initialize(&meta.buffer(), 5, TERM_LENGTH, 1024, 0);
        let appender = TermAppender::new(term.buffer(), meta.buffer(), 0);
        (term, meta, appender)
    }

    #[test]
    fn test_append_single_frame() {
        let (term, _meta, appender) = make_appender();

        let outcome = appender
            .append_unfragmented(7, 1001, &[9u8; 100], MAX_PAYLOAD)
            .unwrap();

        let aligned = bedrock::bits::align(132, frame::FRAME_ALIGNMENT) as i32;
        assert_eq!(outcome, AppendOutcome::Appended { term_id: 5, term_offset: aligned });

        let buf = term.buffer();
        assert_eq!(frame::frame_length_volatile(&buf, 0), 132);
        assert_eq!(frame::frame_type(&buf, 0), protocol::HDR_TYPE_DATA);
        assert_eq!(frame::frame_session_id(&buf, 0), 7);
        assert_eq!(buf.as_slice(frame::HEADER_LENGTH, 100), &[9u8; 100][..]);
    }

    #[test]
    fn test_appends_are_sequential() {
        let (term, _meta, appender) = make_appender();

        appender.append_unfragmented(7, 1001, &[1u8; 96], MAX_PAYLOAD).unwrap();
        appender.append_unfragmented(7, 1001, &[2u8; 96], MAX_PAYLOAD).unwrap();

        let buf = term.buffer();
        assert_eq!(frame::frame_length_volatile(&buf, 0), 128);
        assert_eq!(frame::frame_length_volatile(&buf, 128), 128);
        assert_eq!(frame::frame_term_offset(&buf, 128), 128);
    }

    #[test]
    fn test_term_overflow_writes_pad_and_reports_rotation() {
        let (term, meta, appender) = make_appender();

        // Park the tail 64 bytes shy of the end of the term.
        meta.buffer().put_i64(
            descriptor::tail_counter_offset(0),
            descriptor::pack_tail(5, (TERM_LENGTH - 64) as i32),
        );

        let outcome = appender
            .append_unfragmented(7, 1001, &[3u8; 100], MAX_PAYLOAD)
            .unwrap();
        assert_eq!(outcome, AppendOutcome::EndOfTerm { term_id: 5 });

        let buf = term.buffer();
        let pad_offset = TERM_LENGTH - 64;
        assert!(frame::is_padding_frame(&buf, pad_offset));
        assert_eq!(frame::frame_length_volatile(&buf, pad_offset), 64);
    }

    #[test]
    fn test_fragmented_append_sets_begin_end_flags() {
        let (term, _meta, appender) = make_appender();

        let payload = vec![8u8; MAX_PAYLOAD * 2 + 10];
        appender
            .append_fragmented(7, 1001, &payload, MAX_PAYLOAD)
            .unwrap();

        let buf = term.buffer();
        let frame_one = frame::frame_flags(&buf, 0);
        assert_eq!(frame_one & protocol::BEGIN_FLAG, protocol::BEGIN_FLAG);
        assert_eq!(frame_one & protocol::END_FLAG, 0);

        let aligned_full = bedrock::bits::align(1024, frame::FRAME_ALIGNMENT);
        let frame_two = frame::frame_flags(&buf, aligned_full);
        assert_eq!(frame_two, 0);

        let frame_three = frame::frame_flags(&buf, aligned_full * 2);
        assert_eq!(frame_three & protocol::END_FLAG, protocol::END_FLAG);
        assert_eq!(
            frame::frame_length_volatile(&buf, aligned_full * 2),
            (frame::HEADER_LENGTH + 10) as i32
        );
    }

    #[test]
    fn test_oversized_unfragmented_payload_rejected() {
        let (_term, _meta, appender) = make_appender();
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(appender
            .append_unfragmented(7, 1001, &payload, MAX_PAYLOAD)
            .is_err());
    }
}

//! UDP wire protocol. Every frame leads with the same 32-byte header;
//! type-specific fields trail it. Accessors are free functions over byte
//! slices so parsing never materialises an owned struct.

use byteorder::{ByteOrder, LittleEndian};

pub const PROTOCOL_VERSION: u8 = 1;

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;
pub const HDR_TYPE_NAK: u16 = 0x02;
pub const HDR_TYPE_SM: u16 = 0x03;
pub const HDR_TYPE_ERR: u16 = 0x04;
pub const HDR_TYPE_SETUP: u16 = 0x05;
pub const HDR_TYPE_RTTM: u16 = 0x06;
pub const HDR_TYPE_RES: u16 = 0x07;

/// Fragmentation flags on DATA frames.
pub const BEGIN_FLAG: u8 = 0x80;
pub const END_FLAG: u8 = 0x40;
pub const BEGIN_AND_END_FLAGS: u8 = BEGIN_FLAG | END_FLAG;
/// End-of-stream, set on a zero-body DATA heartbeat.
pub const EOS_FLAG: u8 = 0x20;
/// On an SM: the receiver wants a SETUP frame (new image handshake).
pub const SEND_SETUP_FLAG: u8 = 0x80;
/// On an RTTM: this frame is the echo reply, not the probe.
pub const REPLY_FLAG: u8 = 0x80;

pub mod header {
    use super::*;

    pub const VERSION_OFFSET: usize = 0;
    pub const FLAGS_OFFSET: usize = 1;
    pub const TYPE_OFFSET: usize = 2;
    pub const LENGTH_OFFSET: usize = 4;
    pub const TERM_OFFSET_OFFSET: usize = 8;
    pub const SESSION_ID_OFFSET: usize = 12;
    pub const STREAM_ID_OFFSET: usize = 16;
    pub const TERM_ID_OFFSET: usize = 20;
    pub const RESERVED_OFFSET: usize = 24;
    pub const LENGTH: usize = 32;

    #[inline]
    pub fn version(buf: &[u8]) -> u8 {
        buf[VERSION_OFFSET]
    }

    #[inline]
    pub fn flags(buf: &[u8]) -> u8 {
        buf[FLAGS_OFFSET]
    }

    #[inline]
    pub fn frame_type(buf: &[u8]) -> u16 {
        LittleEndian::read_u16(&buf[TYPE_OFFSET..])
    }

    #[inline]
    pub fn frame_length(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[LENGTH_OFFSET..])
    }

    #[inline]
    pub fn term_offset(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[TERM_OFFSET_OFFSET..])
    }

    #[inline]
    pub fn session_id(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[SESSION_ID_OFFSET..])
    }

    #[inline]
    pub fn stream_id(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[STREAM_ID_OFFSET..])
    }

    #[inline]
    pub fn term_id(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[TERM_ID_OFFSET..])
    }

    #[inline]
    pub fn reserved_value(buf: &[u8]) -> i64 {
        LittleEndian::read_i64(&buf[RESERVED_OFFSET..])
    }

    pub fn encode(
        buf: &mut [u8],
        frame_type_value: u16,
        flags_value: u8,
        frame_length_value: i32,
        term_offset_value: i32,
        session_id_value: i32,
        stream_id_value: i32,
        term_id_value: i32,
    ) {
        buf[VERSION_OFFSET] = PROTOCOL_VERSION;
        buf[FLAGS_OFFSET] = flags_value;
        LittleEndian::write_u16(&mut buf[TYPE_OFFSET..], frame_type_value);
        LittleEndian::write_i32(&mut buf[LENGTH_OFFSET..], frame_length_value);
        LittleEndian::write_i32(&mut buf[TERM_OFFSET_OFFSET..], term_offset_value);
        LittleEndian::write_i32(&mut buf[SESSION_ID_OFFSET..], session_id_value);
        LittleEndian::write_i32(&mut buf[STREAM_ID_OFFSET..], stream_id_value);
        LittleEndian::write_i32(&mut buf[TERM_ID_OFFSET..], term_id_value);
        LittleEndian::write_i64(&mut buf[RESERVED_OFFSET..], 0);
    }
}

pub mod status_message {
    use super::*;

    pub const RECEIVER_WINDOW_OFFSET: usize = 32;
    pub const RECEIVER_ID_OFFSET: usize = 36;
    pub const GROUP_TAG_OFFSET: usize = 44;
    pub const LENGTH: usize = 44;
    pub const LENGTH_WITH_GROUP_TAG: usize = 52;

    #[inline]
    pub fn receiver_window_length(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[RECEIVER_WINDOW_OFFSET..])
    }

    #[inline]
    pub fn receiver_id(buf: &[u8]) -> i64 {
        LittleEndian::read_i64(&buf[RECEIVER_ID_OFFSET..])
    }

    #[inline]
    pub fn has_group_tag(buf: &[u8]) -> bool {
        header::frame_length(buf) as usize >= LENGTH_WITH_GROUP_TAG
    }

    #[inline]
    pub fn group_tag(buf: &[u8]) -> Option<i64> {
        if has_group_tag(buf) {
            Some(LittleEndian::read_i64(&buf[GROUP_TAG_OFFSET..]))
        } else {
            None
        }
    }

    pub fn encode(
        buf: &mut [u8],
        flags: u8,
        session_id: i32,
        stream_id: i32,
        term_id: i32,
        term_offset: i32,
        receiver_window: i32,
        receiver_id: i64,
        group_tag: Option<i64>,
    ) -> usize {
        let length = if group_tag.is_some() {
            LENGTH_WITH_GROUP_TAG
        } else {
            LENGTH
        };

        header::encode(
            buf,
            HDR_TYPE_SM,
            flags,
            length as i32,
            term_offset,
            session_id,
            stream_id,
            term_id,
        );
        LittleEndian::write_i32(&mut buf[RECEIVER_WINDOW_OFFSET..], receiver_window);
        LittleEndian::write_i64(&mut buf[RECEIVER_ID_OFFSET..], receiver_id);
        if let Some(tag) = group_tag {
            LittleEndian::write_i64(&mut buf[GROUP_TAG_OFFSET..], tag);
        }

        length
    }
}

pub mod nak {
    use super::*;

    pub const GAP_LENGTH_OFFSET: usize = 32;
    pub const LENGTH: usize = 36;

    #[inline]
    pub fn gap_length(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[GAP_LENGTH_OFFSET..])
    }

    pub fn encode(
        buf: &mut [u8],
        session_id: i32,
        stream_id: i32,
        term_id: i32,
        term_offset: i32,
        gap_length_value: i32,
    ) -> usize {
        header::encode(
            buf,
            HDR_TYPE_NAK,
            0,
            LENGTH as i32,
            term_offset,
            session_id,
            stream_id,
            term_id,
        );
        LittleEndian::write_i32(&mut buf[GAP_LENGTH_OFFSET..], gap_length_value);

        LENGTH
    }
}

pub mod setup {
    use super::*;

    pub const INITIAL_TERM_ID_OFFSET: usize = 32;
    pub const TERM_LENGTH_OFFSET: usize = 36;
    pub const MTU_OFFSET: usize = 40;
    pub const TTL_OFFSET: usize = 44;
    pub const LENGTH: usize = 48;

    #[inline]
    pub fn initial_term_id(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[INITIAL_TERM_ID_OFFSET..])
    }

    #[inline]
    pub fn term_length(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[TERM_LENGTH_OFFSET..])
    }

    #[inline]
    pub fn mtu(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[MTU_OFFSET..])
    }

    #[inline]
    pub fn ttl(buf: &[u8]) -> i32 {
        LittleEndian::read_i32(&buf[TTL_OFFSET..])
    }

    pub fn encode(
        buf: &mut [u8],
        session_id: i32,
        stream_id: i32,
        active_term_id: i32,
        term_offset: i32,
        initial_term_id_value: i32,
        term_length_value: i32,
        mtu_value: i32,
        ttl_value: i32,
    ) -> usize {
        header::encode(
            buf,
            HDR_TYPE_SETUP,
            0,
            LENGTH as i32,
            term_offset,
            session_id,
            stream_id,
            active_term_id,
        );
        LittleEndian::write_i32(&mut buf[INITIAL_TERM_ID_OFFSET..], initial_term_id_value);
        LittleEndian::write_i32(&mut buf[TERM_LENGTH_OFFSET..], term_length_value);
        LittleEndian::write_i32(&mut buf[MTU_OFFSET..], mtu_value);
        LittleEndian::write_i32(&mut buf[TTL_OFFSET..], ttl_value);

        LENGTH
    }
}

pub mod rttm {
    use super::*;

    pub const ECHO_TIMESTAMP_OFFSET: usize = 32;
    pub const RECEPTION_DELTA_OFFSET: usize = 40;
    pub const RECEIVER_ID_OFFSET: usize = 48;
    pub const LENGTH: usize = 56;

    #[inline]
    pub fn echo_timestamp_ns(buf: &[u8]) -> i64 {
        LittleEndian::read_i64(&buf[ECHO_TIMESTAMP_OFFSET..])
    }

    #[inline]
    pub fn reception_delta_ns(buf: &[u8]) -> i64 {
        LittleEndian::read_i64(&buf[RECEPTION_DELTA_OFFSET..])
    }

    #[inline]
    pub fn receiver_id(buf: &[u8]) -> i64 {
        LittleEndian::read_i64(&buf[RECEIVER_ID_OFFSET..])
    }

    #[inline]
    pub fn is_reply(buf: &[u8]) -> bool {
        header::flags(buf) & REPLY_FLAG != 0
    }

    pub fn encode(
        buf: &mut [u8],
        flags: u8,
        session_id: i32,
        stream_id: i32,
        echo_timestamp: i64,
        reception_delta: i64,
        receiver_id_value: i64,
    ) -> usize {
        header::encode(buf, HDR_TYPE_RTTM, flags, LENGTH as i32, 0, session_id, stream_id, 0);
        LittleEndian::write_i64(&mut buf[ECHO_TIMESTAMP_OFFSET..], echo_timestamp);
        LittleEndian::write_i64(&mut buf[RECEPTION_DELTA_OFFSET..], reception_delta);
        LittleEndian::write_i64(&mut buf[RECEIVER_ID_OFFSET..], receiver_id_value);

        LENGTH
    }
}

pub mod resolution {
    use super::*;
    use std::net::IpAddr;

    pub const RES_TYPE_IP4: u8 = 1;
    pub const RES_TYPE_IP6: u8 = 2;

    /// Set when the record describes the advertising driver itself.
    pub const SELF_FLAG: u8 = 0x80;

    pub const RECORDS_OFFSET: usize = header::LENGTH;

    const RES_TYPE_OFFSET: usize = 0;
    const RES_FLAGS_OFFSET: usize = 1;
    const PORT_OFFSET: usize = 2;
    const AGE_MS_OFFSET: usize = 4;
    const ADDRESS_OFFSET: usize = 8;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ResolutionRecord {
        pub is_self: bool,
        pub address: IpAddr,
        pub port: u16,
        pub age_ms: i32,
        pub name: String,
    }

    #[inline]
    fn record_length(address: &IpAddr, name_len: usize) -> usize {
        let addr_len = match address {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        };
        ADDRESS_OFFSET + addr_len + 2 + name_len
    }

    /// Append a record at `offset`; `None` when it does not fit.
    pub fn encode_record(buf: &mut [u8], offset: usize, record: &ResolutionRecord) -> Option<usize> {
        let length = record_length(&record.address, record.name.len());
        if offset + length > buf.len() {
            return None;
        }

        let rec = &mut buf[offset..];
        let (res_type, addr_bytes): (u8, Vec<u8>) = match record.address {
            IpAddr::V4(v4) => (RES_TYPE_IP4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (RES_TYPE_IP6, v6.octets().to_vec()),
        };

        rec[RES_TYPE_OFFSET] = res_type;
        rec[RES_FLAGS_OFFSET] = if record.is_self { SELF_FLAG } else { 0 };
        LittleEndian::write_u16(&mut rec[PORT_OFFSET..], record.port);
        LittleEndian::write_i32(&mut rec[AGE_MS_OFFSET..], record.age_ms);
        rec[ADDRESS_OFFSET..ADDRESS_OFFSET + addr_bytes.len()].copy_from_slice(&addr_bytes);

        let name_offset = ADDRESS_OFFSET + addr_bytes.len();
        LittleEndian::write_u16(&mut rec[name_offset..], record.name.len() as u16);
        rec[name_offset + 2..name_offset + 2 + record.name.len()]
            .copy_from_slice(record.name.as_bytes());

        Some(length)
    }

    /// Decode one record at `offset`, returning it and the next offset.
    pub fn decode_record(buf: &[u8], offset: usize) -> Option<(ResolutionRecord, usize)> {
        if offset + ADDRESS_OFFSET > buf.len() {
            return None;
        }

        let rec = &buf[offset..];
        let (address, addr_len): (IpAddr, usize) = match rec[RES_TYPE_OFFSET] {
            RES_TYPE_IP4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&rec[ADDRESS_OFFSET..ADDRESS_OFFSET + 4]);
                (IpAddr::from(octets), 4)
            }
            RES_TYPE_IP6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rec[ADDRESS_OFFSET..ADDRESS_OFFSET + 16]);
                (IpAddr::from(octets), 16)
            }
            _ => return None,
        };

        let name_offset = ADDRESS_OFFSET + addr_len;
        let name_len = LittleEndian::read_u16(&rec[name_offset..]) as usize;
        let name_end = name_offset + 2 + name_len;
        if offset + name_end > buf.len() {
            return None;
        }

        let record = ResolutionRecord {
            is_self: rec[RES_FLAGS_OFFSET] & SELF_FLAG != 0,
            address,
            port: LittleEndian::read_u16(&rec[PORT_OFFSET..]),
            age_ms: LittleEndian::read_i32(&rec[AGE_MS_OFFSET..]),
            name: String::from_utf8_lossy(&rec[name_offset + 2..name_end]).into_owned(),
        };

        Some((record, offset + name_end))
    }
}

/// A heartbeat is a DATA frame with a header-only body.
#[inline]
pub fn is_heartbeat(buf: &[u8], length: usize) -> bool {
    length == header::LENGTH && header::frame_type(buf) == HDR_TYPE_DATA
}

#[inline]
pub fn is_end_of_stream(buf: &[u8]) -> bool {
    header::flags(buf) & EOS_FLAG != 0
}

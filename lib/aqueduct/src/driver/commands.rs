//! Client↔driver control-plane messages carried over the CnC rings.
//! Commands flow client→driver through the to-driver ring; events flow
//! driver→clients through the broadcast buffer. Encodings are flat
//! little-endian records, length-prefixed strings last.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{DriverError, DriverResult, ErrorKind};

pub mod command_type {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const REMOVE_PUBLICATION: i32 = 0x02;
    pub const ADD_SUBSCRIPTION: i32 = 0x03;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x04;
    pub const ADD_DESTINATION: i32 = 0x05;
    pub const REMOVE_DESTINATION: i32 = 0x06;
    pub const CLIENT_KEEPALIVE: i32 = 0x07;
    pub const ADD_COUNTER: i32 = 0x08;
    pub const REMOVE_COUNTER: i32 = 0x09;
    pub const CLIENT_CLOSE: i32 = 0x0A;
    pub const TERMINATE_DRIVER: i32 = 0x0B;
}

pub mod event_type {
    pub const ON_PUBLICATION_READY: i32 = 0x01;
    pub const ON_EXCLUSIVE_PUBLICATION_READY: i32 = 0x02;
    pub const ON_SUBSCRIPTION_READY: i32 = 0x03;
    pub const ON_AVAILABLE_IMAGE: i32 = 0x04;
    pub const ON_UNAVAILABLE_IMAGE: i32 = 0x05;
    pub const ON_OPERATION_SUCCESS: i32 = 0x06;
    pub const ON_ERROR: i32 = 0x07;
    pub const ON_CLIENT_TIMEOUT: i32 = 0x08;
    pub const ON_COUNTER_READY: i32 = 0x09;
}

#[inline]
fn truncated() -> DriverError {
    DriverError::Fatal(ErrorKind::Protocol("truncated command".to_string()))
}

#[inline]
fn read_string(buf: &[u8], offset: usize) -> DriverResult<(String, usize)> {
    if offset + 4 > buf.len() {
        return Err(truncated());
    }
    let len = LittleEndian::read_i32(&buf[offset..]) as usize;
    let end = offset + 4 + len;
    if end > buf.len() {
        return Err(truncated());
    }
    let value = String::from_utf8_lossy(&buf[offset + 4..end]).into_owned();
    Ok((value, end))
}

#[inline]
fn write_string(out: &mut Vec<u8>, value: &str) {
    let mut len = [0u8; 4];
    LittleEndian::write_i32(&mut len, value.len() as i32);
    out.extend_from_slice(&len);
    out.extend_from_slice(value.as_bytes());
}

#[inline]
fn write_i32(out: &mut Vec<u8>, value: i32) {
    let mut raw = [0u8; 4];
    LittleEndian::write_i32(&mut raw, value);
    out.extend_from_slice(&raw);
}

#[inline]
fn write_i64(out: &mut Vec<u8>, value: i64) {
    let mut raw = [0u8; 8];
    LittleEndian::write_i64(&mut raw, value);
    out.extend_from_slice(&raw);
}

/// `[client_id i64][correlation_id i64]` leads every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlated {
    pub client_id: i64,
    pub correlation_id: i64,
}

impl Correlated {
    pub const LENGTH: usize = 16;

    #[inline]
    pub fn decode(buf: &[u8]) -> DriverResult<Correlated> {
        if buf.len() < Self::LENGTH {
            return Err(truncated());
        }
        Ok(Correlated {
            client_id: LittleEndian::read_i64(&buf[0..]),
            correlation_id: LittleEndian::read_i64(&buf[8..]),
        })
    }

    #[inline]
    pub fn encode(&self, out: &mut Vec<u8>) {
        write_i64(out, self.client_id);
        write_i64(out, self.correlation_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationMessage {
    pub correlated: Correlated,
    pub stream_id: i32,
    pub is_exclusive: bool,
    pub channel: String,
}

impl PublicationMessage {
    pub fn decode(buf: &[u8]) -> DriverResult<PublicationMessage> {
        let correlated = Correlated::decode(buf)?;
        if buf.len() < Correlated::LENGTH + 8 {
            return Err(truncated());
        }
        let stream_id = LittleEndian::read_i32(&buf[16..]);
        let is_exclusive = LittleEndian::read_i32(&buf[20..]) != 0;
        let (channel, _) = read_string(buf, 24)?;

        Ok(PublicationMessage {
            correlated,
            stream_id,
            is_exclusive,
            channel,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.channel.len());
        self.correlated.encode(&mut out);
        write_i32(&mut out, self.stream_id);
        write_i32(&mut out, if self.is_exclusive { 1 } else { 0 });
        write_string(&mut out, &self.channel);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionMessage {
    pub correlated: Correlated,
    pub stream_id: i32,
    pub channel: String,
}

impl SubscriptionMessage {
    pub fn decode(buf: &[u8]) -> DriverResult<SubscriptionMessage> {
        let correlated = Correlated::decode(buf)?;
        if buf.len() < Correlated::LENGTH + 4 {
            return Err(truncated());
        }
        let stream_id = LittleEndian::read_i32(&buf[16..]);
        let (channel, _) = read_string(buf, 20)?;

        Ok(SubscriptionMessage {
            correlated,
            stream_id,
            channel,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28 + self.channel.len());
        self.correlated.encode(&mut out);
        write_i32(&mut out, self.stream_id);
        write_string(&mut out, &self.channel);
        out
    }
}

/// REMOVE_PUBLICATION / REMOVE_SUBSCRIPTION / REMOVE_COUNTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveMessage {
    pub correlated: Correlated,
    pub registration_id: i64,
}

impl RemoveMessage {
    pub fn decode(buf: &[u8]) -> DriverResult<RemoveMessage> {
        let correlated = Correlated::decode(buf)?;
        if buf.len() < Correlated::LENGTH + 8 {
            return Err(truncated());
        }
        Ok(RemoveMessage {
            correlated,
            registration_id: LittleEndian::read_i64(&buf[16..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        self.correlated.encode(&mut out);
        write_i64(&mut out, self.registration_id);
        out
    }
}

/// ADD_DESTINATION / REMOVE_DESTINATION against a publication or
/// subscription registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationMessage {
    pub correlated: Correlated,
    pub registration_id: i64,
    pub channel: String,
}

impl DestinationMessage {
    pub fn decode(buf: &[u8]) -> DriverResult<DestinationMessage> {
        let correlated = Correlated::decode(buf)?;
        if buf.len() < Correlated::LENGTH + 8 {
            return Err(truncated());
        }
        let registration_id = LittleEndian::read_i64(&buf[16..]);
        let (channel, _) = read_string(buf, 24)?;

        Ok(DestinationMessage {
            correlated,
            registration_id,
            channel,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.channel.len());
        self.correlated.encode(&mut out);
        write_i64(&mut out, self.registration_id);
        write_string(&mut out, &self.channel);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterMessage {
    pub correlated: Correlated,
    pub type_id: i32,
    pub key: Vec<u8>,
    pub label: String,
}

impl CounterMessage {
    pub fn decode(buf: &[u8]) -> DriverResult<CounterMessage> {
        let correlated = Correlated::decode(buf)?;
        if buf.len() < Correlated::LENGTH + 8 {
            return Err(truncated());
        }
        let type_id = LittleEndian::read_i32(&buf[16..]);
        let key_len = LittleEndian::read_i32(&buf[20..]) as usize;
        if 24 + key_len > buf.len() {
            return Err(truncated());
        }
        let key = buf[24..24 + key_len].to_vec();
        let (label, _) = read_string(buf, 24 + key_len)?;

        Ok(CounterMessage {
            correlated,
            type_id,
            key,
            label,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.key.len() + self.label.len());
        self.correlated.encode(&mut out);
        write_i32(&mut out, self.type_id);
        write_i32(&mut out, self.key.len() as i32);
        out.extend_from_slice(&self.key);
        write_string(&mut out, &self.label);
        out
    }
}

/// CLIENT_KEEPALIVE and CLIENT_CLOSE carry only the client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMessage {
    pub client_id: i64,
}

impl ClientMessage {
    pub fn decode(buf: &[u8]) -> DriverResult<ClientMessage> {
        if buf.len() < 8 {
            return Err(truncated());
        }
        Ok(ClientMessage {
            client_id: LittleEndian::read_i64(&buf[0..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        write_i64(&mut out, self.client_id);
        out
    }
}

// --- Events ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReadyEvent {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub publisher_limit_counter_id: i32,
    pub channel_status_counter_id: i32,
    pub log_file: String,
}

impl PublicationReadyEvent {
    pub fn decode(buf: &[u8]) -> DriverResult<PublicationReadyEvent> {
        if buf.len() < 32 {
            return Err(truncated());
        }
        let (log_file, _) = read_string(buf, 32)?;
        Ok(PublicationReadyEvent {
            correlation_id: LittleEndian::read_i64(&buf[0..]),
            registration_id: LittleEndian::read_i64(&buf[8..]),
            session_id: LittleEndian::read_i32(&buf[16..]),
            stream_id: LittleEndian::read_i32(&buf[20..]),
            publisher_limit_counter_id: LittleEndian::read_i32(&buf[24..]),
            channel_status_counter_id: LittleEndian::read_i32(&buf[28..]),
            log_file,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40 + self.log_file.len());
        write_i64(&mut out, self.correlation_id);
        write_i64(&mut out, self.registration_id);
        write_i32(&mut out, self.session_id);
        write_i32(&mut out, self.stream_id);
        write_i32(&mut out, self.publisher_limit_counter_id);
        write_i32(&mut out, self.channel_status_counter_id);
        write_string(&mut out, &self.log_file);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionReadyEvent {
    pub correlation_id: i64,
    pub channel_status_counter_id: i32,
}

impl SubscriptionReadyEvent {
    pub fn decode(buf: &[u8]) -> DriverResult<SubscriptionReadyEvent> {
        if buf.len() < 12 {
            return Err(truncated());
        }
        Ok(SubscriptionReadyEvent {
            correlation_id: LittleEndian::read_i64(&buf[0..]),
            channel_status_counter_id: LittleEndian::read_i32(&buf[8..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        write_i64(&mut out, self.correlation_id);
        write_i32(&mut out, self.channel_status_counter_id);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableImageEvent {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub subscriber_position_counter_id: i32,
    pub log_file: String,
    pub source_identity: String,
}

impl AvailableImageEvent {
    pub fn decode(buf: &[u8]) -> DriverResult<AvailableImageEvent> {
        if buf.len() < 28 {
            return Err(truncated());
        }
        let (log_file, next) = read_string(buf, 28)?;
        let (source_identity, _) = read_string(buf, next)?;
        Ok(AvailableImageEvent {
            correlation_id: LittleEndian::read_i64(&buf[0..]),
            subscription_registration_id: LittleEndian::read_i64(&buf[8..]),
            session_id: LittleEndian::read_i32(&buf[16..]),
            stream_id: LittleEndian::read_i32(&buf[20..]),
            subscriber_position_counter_id: LittleEndian::read_i32(&buf[24..]),
            log_file,
            source_identity,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(40 + self.log_file.len() + self.source_identity.len());
        write_i64(&mut out, self.correlation_id);
        write_i64(&mut out, self.subscription_registration_id);
        write_i32(&mut out, self.session_id);
        write_i32(&mut out, self.stream_id);
        write_i32(&mut out, self.subscriber_position_counter_id);
        write_string(&mut out, &self.log_file);
        write_string(&mut out, &self.source_identity);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnavailableImageEvent {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub stream_id: i32,
}

impl UnavailableImageEvent {
    pub fn decode(buf: &[u8]) -> DriverResult<UnavailableImageEvent> {
        if buf.len() < 20 {
            return Err(truncated());
        }
        Ok(UnavailableImageEvent {
            correlation_id: LittleEndian::read_i64(&buf[0..]),
            subscription_registration_id: LittleEndian::read_i64(&buf[8..]),
            stream_id: LittleEndian::read_i32(&buf[16..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        write_i64(&mut out, self.correlation_id);
        write_i64(&mut out, self.subscription_registration_id);
        write_i32(&mut out, self.stream_id);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub offending_correlation_id: i64,
    pub error_code: i32,
    pub message: String,
}

impl ErrorEvent {
    pub fn decode(buf: &[u8]) -> DriverResult<ErrorEvent> {
        if buf.len() < 12 {
            return Err(truncated());
        }
        let (message, _) = read_string(buf, 12)?;
        Ok(ErrorEvent {
            offending_correlation_id: LittleEndian::read_i64(&buf[0..]),
            error_code: LittleEndian::read_i32(&buf[8..]),
            message,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.message.len());
        write_i64(&mut out, self.offending_correlation_id);
        write_i32(&mut out, self.error_code);
        write_string(&mut out, &self.message);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSucceededEvent {
    pub correlation_id: i64,
}

impl OperationSucceededEvent {
    pub fn decode(buf: &[u8]) -> DriverResult<OperationSucceededEvent> {
        if buf.len() < 8 {
            return Err(truncated());
        }
        Ok(OperationSucceededEvent {
            correlation_id: LittleEndian::read_i64(&buf[0..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        write_i64(&mut out, self.correlation_id);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReadyEvent {
    pub correlation_id: i64,
    pub counter_id: i32,
}

impl CounterReadyEvent {
    pub fn decode(buf: &[u8]) -> DriverResult<CounterReadyEvent> {
        if buf.len() < 12 {
            return Err(truncated());
        }
        Ok(CounterReadyEvent {
            correlation_id: LittleEndian::read_i64(&buf[0..]),
            counter_id: LittleEndian::read_i32(&buf[8..]),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        write_i64(&mut out, self.correlation_id);
        write_i32(&mut out, self.counter_id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_message_roundtrip() {
        let msg = PublicationMessage {
            correlated: Correlated {
                client_id: 11,
                correlation_id: 22,
            },
            stream_id: 1001,
            is_exclusive: true,
            channel: "aqueduct:udp?endpoint=127.0.0.1:24325".to_string(),
        };

        assert_eq!(PublicationMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_subscription_message_roundtrip() {
        let msg = SubscriptionMessage {
            correlated: Correlated {
                client_id: 11,
                correlation_id: 23,
            },
            stream_id: 1001,
            channel: "aqueduct:udp?endpoint=127.0.0.1:24325|reliable=false".to_string(),
        };

        assert_eq!(SubscriptionMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_counter_message_roundtrip() {
        let msg = CounterMessage {
            correlated: Correlated {
                client_id: 1,
                correlation_id: 2,
            },
            type_id: 1001,
            key: vec![1, 2, 3, 4],
            label: "app counter".to_string(),
        };

        assert_eq!(CounterMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_error_event_roundtrip() {
        let event = ErrorEvent {
            offending_correlation_id: 99,
            error_code: 3,
            message: "session-id 7 clashes with active publication".to_string(),
        };

        assert_eq!(ErrorEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn test_available_image_event_roundtrip() {
        let event = AvailableImageEvent {
            correlation_id: 5,
            subscription_registration_id: 6,
            session_id: 42,
            stream_id: 1001,
            subscriber_position_counter_id: 12,
            log_file: "/dev/shm/aqueduct/images/5.logbuffer".to_string(),
            source_identity: "127.0.0.1:54321".to_string(),
        };

        assert_eq!(AvailableImageEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn test_truncated_command_rejected() {
        let msg = PublicationMessage {
            correlated: Correlated {
                client_id: 11,
                correlation_id: 22,
            },
            stream_id: 1001,
            is_exclusive: false,
            channel: "aqueduct:ipc".to_string(),
        };

        let encoded = msg.encode();
        assert!(PublicationMessage::decode(&encoded[..encoded.len() - 4]).is_err());
        assert!(PublicationMessage::decode(&encoded[..10]).is_err());
    }
}

/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! FIX tag=value protocol.
//!
//! A small concrete [`Protocol`] for demos and tests: messages are ordered
//! field lists, encoding stamps the standard header (CompIDs, sequence number,
//! sending time) and computes BodyLength and CheckSum. Heartbeats are `35=0`.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use ironsim_core::{ProtocolError, SessionError};
use ironsim_session::{Dictionary, Protocol, Session};
use ironsim_transport::codec::{SOH, calculate_checksum};
use ironsim_transport::{FixFramer, Framer};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Standard tag numbers used by the header and trailer.
pub mod tags {
    /// BeginString.
    pub const BEGIN_STRING: u32 = 8;
    /// BodyLength.
    pub const BODY_LENGTH: u32 = 9;
    /// CheckSum.
    pub const CHECKSUM: u32 = 10;
    /// MsgSeqNum.
    pub const MSG_SEQ_NUM: u32 = 34;
    /// MsgType.
    pub const MSG_TYPE: u32 = 35;
    /// SenderCompID.
    pub const SENDER_COMP_ID: u32 = 49;
    /// SendingTime.
    pub const SENDING_TIME: u32 = 52;
    /// TargetCompID.
    pub const TARGET_COMP_ID: u32 = 56;
    /// Text.
    pub const TEXT: u32 = 58;
}

/// MsgType of a heartbeat.
pub const HEARTBEAT: &str = "0";

const DEFAULT_BEGIN_STRING: &str = "FIX.4.4";
const SENDING_TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S%.3f";

/// A FIX message as an ordered list of body fields.
///
/// BeginString, BodyLength and CheckSum are not stored; they are produced
/// by [`FixMessage::encode`] and dropped by [`FixMessage::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixMessage {
    fields: Vec<(u32, String)>,
}

impl FixMessage {
    /// Creates a message of the given MsgType.
    #[must_use]
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            fields: vec![(tags::MSG_TYPE, msg_type.into())],
        }
    }

    /// Appends a field.
    #[must_use]
    pub fn with_field(mut self, tag: u32, value: impl Into<String>) -> Self {
        self.fields.push((tag, value.into()));
        self
    }

    /// Returns the first value of `tag`.
    #[must_use]
    pub fn field(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the MsgType.
    #[must_use]
    pub fn msg_type(&self) -> Option<&str> {
        self.field(tags::MSG_TYPE)
    }

    /// Returns the body fields in order.
    #[must_use]
    pub fn fields(&self) -> &[(u32, String)] {
        &self.fields
    }

    /// Encodes the message with the given BeginString.
    #[must_use]
    pub fn encode(&self, begin_string: &str) -> BytesMut {
        let mut body = BytesMut::with_capacity(128);
        for (tag, value) in &self.fields {
            body.put_slice(tag.to_string().as_bytes());
            body.put_u8(b'=');
            body.put_slice(value.as_bytes());
            body.put_u8(SOH);
        }

        let mut message = BytesMut::with_capacity(body.len() + 32);
        message.put_slice(format!("8={begin_string}\x019={}\x01", body.len()).as_bytes());
        message.put_slice(&body);
        let checksum = calculate_checksum(&message);
        message.put_slice(format!("10={checksum:03}\x01").as_bytes());
        message
    }

    /// Parses an encoded message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] on a malformed field or a missing
    /// MsgType.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut fields = Vec::new();
        for raw in data.split(|byte| *byte == SOH).filter(|raw| !raw.is_empty()) {
            let text = std::str::from_utf8(raw)
                .map_err(|err| ProtocolError::Decode(format!("field is not UTF-8: {err}")))?;
            let (tag, value) = text
                .split_once('=')
                .ok_or_else(|| ProtocolError::Decode(format!("field without '=': {text}")))?;
            let tag: u32 = tag
                .parse()
                .map_err(|_| ProtocolError::Decode(format!("invalid tag: {tag}")))?;
            if matches!(tag, tags::BEGIN_STRING | tags::BODY_LENGTH | tags::CHECKSUM) {
                continue;
            }
            fields.push((tag, value.to_string()));
        }
        if fields.first().map(|(tag, _)| *tag) != Some(tags::MSG_TYPE) {
            return Err(ProtocolError::Decode("MsgType must lead the body".to_string()));
        }
        Ok(Self { fields })
    }
}

/// FIX tag=value protocol with header stamping.
pub struct FixProtocol {
    sender_comp_id: String,
    target_comp_id: String,
    begin_string: RwLock<String>,
    next_seq_num: AtomicU64,
    validate_checksum: bool,
}

impl FixProtocol {
    /// Creates a protocol stamping the given CompIDs.
    #[must_use]
    pub fn new(sender_comp_id: impl Into<String>, target_comp_id: impl Into<String>) -> Self {
        Self {
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
            begin_string: RwLock::new(DEFAULT_BEGIN_STRING.to_string()),
            next_seq_num: AtomicU64::new(1),
            validate_checksum: true,
        }
    }

    /// Enables or disables inbound checksum validation.
    #[must_use]
    pub fn with_checksum_validation(mut self, validate: bool) -> Self {
        self.validate_checksum = validate;
        self
    }

    /// Returns the BeginString in use.
    #[must_use]
    pub fn begin_string(&self) -> String {
        self.begin_string.read().clone()
    }

    /// Returns the sequence number the next outbound message gets.
    #[must_use]
    pub fn next_seq_num(&self) -> u64 {
        self.next_seq_num.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FixProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixProtocol")
            .field("sender_comp_id", &self.sender_comp_id)
            .field("target_comp_id", &self.target_comp_id)
            .field("begin_string", &*self.begin_string.read())
            .field("next_seq_num", &self.next_seq_num())
            .finish()
    }
}

impl Protocol for FixProtocol {
    type Message = FixMessage;

    fn name(&self) -> &str {
        "FIX"
    }

    fn initialize(&self, dictionary: Option<&Dictionary>) -> Result<(), ProtocolError> {
        if let Some(dictionary) = dictionary {
            *self.begin_string.write() = dictionary.begin_string.clone();
        }
        Ok(())
    }

    fn framer(&self) -> Option<Box<dyn Framer>> {
        Some(Box::new(
            FixFramer::new().with_checksum_validation(self.validate_checksum),
        ))
    }

    fn encode(&self, message: &FixMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = message
            .msg_type()
            .ok_or_else(|| ProtocolError::Encode("message has no MsgType".to_string()))?;
        let seq_num = self.next_seq_num.fetch_add(1, Ordering::AcqRel);
        let mut stamped = FixMessage::new(msg_type)
            .with_field(tags::SENDER_COMP_ID, self.sender_comp_id.as_str())
            .with_field(tags::TARGET_COMP_ID, self.target_comp_id.as_str())
            .with_field(tags::MSG_SEQ_NUM, seq_num.to_string())
            .with_field(
                tags::SENDING_TIME,
                Utc::now().format(SENDING_TIME_FORMAT).to_string(),
            );
        stamped.fields.extend(
            message
                .fields
                .iter()
                .filter(|(tag, _)| {
                    !matches!(
                        *tag,
                        tags::MSG_TYPE
                            | tags::SENDER_COMP_ID
                            | tags::TARGET_COMP_ID
                            | tags::MSG_SEQ_NUM
                            | tags::SENDING_TIME
                    )
                })
                .cloned(),
        );
        Ok(stamped.encode(&self.begin_string()).freeze())
    }

    fn decode(&self, frame: &[u8]) -> Result<FixMessage, ProtocolError> {
        FixMessage::parse(frame)
    }

    fn send_heartbeat(
        &self,
        session: &Session<Self>,
        timeout_millis: u64,
    ) -> Result<(), SessionError> {
        session
            .send(FixMessage::new(HEARTBEAT), timeout_millis)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironsim_transport::codec::parse_checksum;

    #[test]
    fn test_encode_computes_length_and_checksum() {
        let encoded = FixMessage::new(HEARTBEAT).encode("FIX.4.4");
        assert_eq!(&encoded[..], b"8=FIX.4.4\x019=5\x0135=0\x0110=163\x01");

        let checksum_at = encoded.len() - 7;
        assert_eq!(
            parse_checksum(&encoded[checksum_at + 3..checksum_at + 6]),
            Some(calculate_checksum(&encoded[..checksum_at]))
        );
    }

    #[test]
    fn test_parse_skips_envelope() {
        let message =
            FixMessage::parse(b"8=FIX.4.2\x019=12\x0135=A\x0158=hi\x0110=000\x01").unwrap();
        assert_eq!(message.msg_type(), Some("A"));
        assert_eq!(message.field(tags::TEXT), Some("hi"));
        assert_eq!(message.fields().len(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(FixMessage::parse(b"hello").is_err());
        assert!(FixMessage::parse(b"58=x\x0135=0\x01").is_err());
        assert!(FixMessage::parse(b"abc=1\x01").is_err());
    }

    #[test]
    fn test_protocol_stamps_header() {
        let protocol = FixProtocol::new("CLIENT", "SERVER");
        let first = protocol
            .encode(&FixMessage::new("D").with_field(11, "order-1"))
            .unwrap();
        let second = protocol.encode(&FixMessage::new(HEARTBEAT)).unwrap();

        let first = protocol.decode(&first).unwrap();
        assert_eq!(first.msg_type(), Some("D"));
        assert_eq!(first.field(tags::SENDER_COMP_ID), Some("CLIENT"));
        assert_eq!(first.field(tags::TARGET_COMP_ID), Some("SERVER"));
        assert_eq!(first.field(tags::MSG_SEQ_NUM), Some("1"));
        assert_eq!(first.field(11), Some("order-1"));
        assert!(first.field(tags::SENDING_TIME).is_some());

        let second = protocol.decode(&second).unwrap();
        assert_eq!(second.field(tags::MSG_SEQ_NUM), Some("2"));
        assert_eq!(protocol.next_seq_num(), 3);
    }

    #[test]
    fn test_initialize_takes_dictionary_begin_string() {
        let protocol = FixProtocol::new("A", "B");
        protocol.initialize(None).unwrap();
        assert_eq!(protocol.begin_string(), "FIX.4.4");

        protocol
            .initialize(Some(&Dictionary::new("FIX42", "FIX.4.2")))
            .unwrap();
        let encoded = protocol.encode(&FixMessage::new(HEARTBEAT)).unwrap();
        assert!(encoded.starts_with(b"8=FIX.4.2\x01"));
    }

    #[test]
    fn test_framer_accepts_own_output() {
        let protocol = FixProtocol::new("A", "B");
        let mut framer = protocol.framer().unwrap();
        let mut buffer = BytesMut::from(&protocol.encode(&FixMessage::new(HEARTBEAT)).unwrap()[..]);
        let frame = framer.next_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(protocol.decode(&frame).unwrap().msg_type(), Some(HEARTBEAT));
        assert!(buffer.is_empty());
    }
}

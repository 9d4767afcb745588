//! Wire codec: a 4-byte big-endian length prefix followed by a JSON-encoded
//! [`Message`]. Absent fields are never serialized, matching the protocol's
//! "only non-empty fields are transmitted" rule. `type` itself is always
//! present, sent as its integer discriminant rather than a name.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use kv_error::{Error, Kind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Upper bound on a single frame's body, guarding against a corrupt or
/// hostile length prefix driving an unbounded allocation.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Message type discriminants, in the order the protocol assigns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    GetReq = 0,
    PutReq = 1,
    DelReq = 2,
    GetResp = 3,
    Resp = 4,
    Ack = 5,
    Abort = 6,
    Commit = 7,
    VoteCommit = 8,
    VoteAbort = 9,
    Register = 10,
    Info = 11,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MessageType::GetReq,
            1 => MessageType::PutReq,
            2 => MessageType::DelReq,
            3 => MessageType::GetResp,
            4 => MessageType::Resp,
            5 => MessageType::Ack,
            6 => MessageType::Abort,
            7 => MessageType::Commit,
            8 => MessageType::VoteCommit,
            9 => MessageType::VoteAbort,
            10 => MessageType::Register,
            11 => MessageType::Info,
            _ => return None,
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        MessageType::from_u8(v).ok_or_else(|| serde::de::Error::custom(format!("unknown message type {v}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Message {
            kind,
            key: None,
            value: None,
            message: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Builds a `RESP`-typed reply carrying only a `message` field, the
    /// shape used for every non-GET success/failure response.
    pub fn response(message: impl Into<String>) -> Self {
        Message::new(MessageType::Resp).with_message(message)
    }

    /// Builds a `RESP` reply from an [`kv_error::Error`], echoing the wire
    /// message the error maps to.
    pub fn error_response(err: &Error) -> Self {
        Message::response(err.wire_message())
    }

    pub fn success() -> Self {
        Message::response(kv_error::SUCCESS)
    }

    pub fn is_success(&self) -> bool {
        self.message.as_deref() == Some(kv_error::SUCCESS)
    }
}

/// Writes one framed [`Message`] to `w` and flushes it. Matches the
/// "flushed before returning" durability contract callers rely on.
pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> Result<(), Error> {
    let body = serde_json::to_vec(msg).map_err(|_| Kind::InvalidRequest)?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(Kind::InvalidRequest.into());
    }
    w.write_u32::<BigEndian>(body.len() as u32)
        .map_err(|_| Kind::InvalidRequest)?;
    w.write_all(&body).map_err(|_| Kind::InvalidRequest)?;
    w.flush().map_err(|_| Kind::InvalidRequest)?;
    Ok(())
}

/// Reads one framed [`Message`] from `r`. Fails with
/// [`Kind::InvalidRequest`] on short read, truncated body, an
/// implausibly large length prefix, or unparseable JSON.
pub fn read_message<R: Read>(r: &mut R) -> Result<Message, Error> {
    let len = r.read_u32::<BigEndian>().map_err(|_| Kind::InvalidRequest)?;
    if len > MAX_FRAME_LEN {
        return Err(Kind::InvalidRequest.into());
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).map_err(|_| Kind::InvalidRequest)?;
    serde_json::from_slice(&body).map_err(|_| Kind::InvalidRequest.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn round_trips_a_put_request() {
        let msg = Message::new(MessageType::PutReq)
            .with_key("k")
            .with_value("v");

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = read_message(&mut cursor).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let msg = Message::new(MessageType::Info);
        let body = serde_json::to_string(&msg).unwrap();
        assert_eq!(body, r#"{"type":11}"#);
    }

    #[test]
    fn message_type_round_trips_through_its_discriminant() {
        for kind in [
            MessageType::GetReq,
            MessageType::PutReq,
            MessageType::DelReq,
            MessageType::GetResp,
            MessageType::Resp,
            MessageType::Ack,
            MessageType::Abort,
            MessageType::Commit,
            MessageType::VoteCommit,
            MessageType::VoteAbort,
            MessageType::Register,
            MessageType::Info,
        ] {
            let encoded = serde_json::to_string(&kind).unwrap();
            let decoded: MessageType = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, kind);
        }
    }

    #[test]
    fn unknown_discriminant_fails_to_deserialize() {
        let result: Result<MessageType, _> = serde_json::from_str("99");
        assert!(result.is_err());
    }

    #[test]
    fn short_read_is_invalid_request() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0]);
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), Kind::InvalidRequest);
    }

    #[test]
    fn truncated_body_is_invalid_request() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(10).unwrap();
        buf.extend_from_slice(b"short");
        let mut cursor = Cursor::new(buf);
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), Kind::InvalidRequest);
    }

    #[test]
    fn unparseable_body_is_invalid_request() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(3).unwrap();
        buf.extend_from_slice(b"xyz");
        let mut cursor = Cursor::new(buf);
        let err = read_message(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), Kind::InvalidRequest);
    }
}

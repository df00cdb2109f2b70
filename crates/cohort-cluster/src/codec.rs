//! Wire format for cluster frames
//!
//! ```text
//! +--------------+---------+-----+------------------+
//! | length (u32) | version | tag | payload (JSON)   |
//! +--------------+---------+-----+------------------+
//! ```
//!
//! The length prefix is handled by [`LengthDelimitedCodec`] on stream
//! transports and omitted on datagrams, where the datagram itself bounds the
//! frame. Everything after it is produced by [`encode_frame`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use cohort_core::types::{ServerId, TransactionEvent};
use cohort_core::WIRE_VERSION;

use crate::error::{ClusterError, ClusterResult};

pub const TAG_EVENT: u8 = 1;
pub const TAG_HELLO: u8 = 2;
pub const TAG_LEAVE: u8 = 3;
pub const TAG_ACK: u8 = 4;
pub const TAG_NACK: u8 = 5;

/// version + tag
const HEADER_LEN: usize = 2;

/// Announcement a member sends when it joins or leaves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberNotice {
    pub server_id: ServerId,
    /// Address peers should use to reach the announcing member
    pub address: String,
}

/// A unit of cluster communication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Committed transaction to invalidate
    Event(TransactionEvent),
    /// Member came online
    Hello(MemberNotice),
    /// Member is leaving
    Leave(MemberNotice),
    /// Previous frame accepted
    Ack,
    /// Previous frame rejected
    Nack(String),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Event(_) => TAG_EVENT,
            Frame::Hello(_) => TAG_HELLO,
            Frame::Leave(_) => TAG_LEAVE,
            Frame::Ack => TAG_ACK,
            Frame::Nack(_) => TAG_NACK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Event(_) => "event",
            Frame::Hello(_) => "hello",
            Frame::Leave(_) => "leave",
            Frame::Ack => "ack",
            Frame::Nack(_) => "nack",
        }
    }
}

/// Serialize a frame body (version, tag, payload)
pub fn encode_frame(frame: &Frame) -> ClusterResult<Bytes> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(frame.tag());

    let mut writer = buf.writer();
    match frame {
        Frame::Event(event) => serde_json::to_writer(&mut writer, event)?,
        Frame::Hello(notice) | Frame::Leave(notice) => serde_json::to_writer(&mut writer, notice)?,
        Frame::Ack => {}
        Frame::Nack(reason) => serde_json::to_writer(&mut writer, reason)?,
    }

    Ok(writer.into_inner().freeze())
}

/// Parse a frame body produced by [`encode_frame`]
pub fn decode_frame(data: &[u8]) -> ClusterResult<Frame> {
    if data.len() < HEADER_LEN {
        return Err(ClusterError::MalformedFrame(format!(
            "frame of {} bytes is shorter than its header",
            data.len()
        )));
    }

    let version = data[0];
    if version != WIRE_VERSION {
        return Err(ClusterError::UnsupportedVersion(version));
    }

    let payload = &data[HEADER_LEN..];
    let frame = match data[1] {
        TAG_EVENT => Frame::Event(parse_payload(payload)?),
        TAG_HELLO => Frame::Hello(parse_payload(payload)?),
        TAG_LEAVE => Frame::Leave(parse_payload(payload)?),
        TAG_ACK => Frame::Ack,
        TAG_NACK => Frame::Nack(parse_payload(payload)?),
        other => {
            return Err(ClusterError::MalformedFrame(format!(
                "unknown frame tag {}",
                other
            )))
        }
    };

    Ok(frame)
}

fn parse_payload<T: DeserializeOwned>(payload: &[u8]) -> ClusterResult<T> {
    serde_json::from_slice(payload).map_err(|e| ClusterError::MalformedFrame(e.to_string()))
}

/// Length-prefixed framing for stream transports
pub fn stream_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

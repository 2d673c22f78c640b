//! # Length-prefixed frame codec.
//!
//! Every request and response travels as one frame:
//!
//! ```text
//! +----+----+----+----+----+========…====+
//! | T  | L0   L1   L2   L3 |   body …    |
//! +----+----+----+----+----+========…====+
//! ```
//!
//! - `T`: one byte, the frame [`Tag`].
//! - `L`: body length, 32-bit little-endian.
//! - body: JSON when the body type is non-void, empty otherwise.
//!
//! [`send_frame`] and [`recv_frame`] are symmetric and tolerate short
//! reads/writes. Decoding checks the received tag against the tag the handler
//! expects.

pub mod types;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame tag. Byte values are assigned in declaration order starting at 0
/// and must never be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    // Client -> daemon.
    Handshake = 0,
    Schedule = 1,
    List = 2,
    Log = 3,
    QueryTaskActive = 4,
    Refresh = 5,
    Reschedule = 6,
    Stop = 7,

    // Daemon -> client.
    ScheduleResponse = 8,
    ListResponse = 9,
    LogResponse = 10,
    QueryTaskActiveResponse = 11,
    RefreshResponse = 12,
    RescheduleResponse = 13,
    StopResponse = 14,
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Tag::Handshake,
            1 => Tag::Schedule,
            2 => Tag::List,
            3 => Tag::Log,
            4 => Tag::QueryTaskActive,
            5 => Tag::Refresh,
            6 => Tag::Reschedule,
            7 => Tag::Stop,
            8 => Tag::ScheduleResponse,
            9 => Tag::ListResponse,
            10 => Tag::LogResponse,
            11 => Tag::QueryTaskActiveResponse,
            12 => Tag::RefreshResponse,
            13 => Tag::RescheduleResponse,
            14 => Tag::StopResponse,
            other => return Err(ProtocolError::InvalidTag(other)),
        })
    }
}

/// Frame codec failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame tag {0}")]
    InvalidTag(u8),

    #[error("expected {expected:?} frame, got {got:?}")]
    UnexpectedTag { expected: Tag, got: Tag },

    #[error("unexpected non-empty body for bodyless frame")]
    NonEmptyVoidBody,

    #[error("body encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded frame: tag plus raw body bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub body: Vec<u8>,
}

impl Frame {
    /// Encodes a JSON body under the given tag.
    pub fn encode<T: Serialize>(tag: Tag, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            tag,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Encodes a bodyless frame.
    pub fn encode_void(tag: Tag) -> Self {
        Self {
            tag,
            body: Vec::new(),
        }
    }

    /// Decodes the body, first checking the tag matches what the caller
    /// expects.
    pub fn decode<T: DeserializeOwned>(&self, expected: Tag) -> Result<T, ProtocolError> {
        self.check_tag(expected)?;
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Checks the tag and that the body is empty.
    pub fn decode_void(&self, expected: Tag) -> Result<(), ProtocolError> {
        self.check_tag(expected)?;
        if !self.body.is_empty() {
            return Err(ProtocolError::NonEmptyVoidBody);
        }
        Ok(())
    }

    fn check_tag(&self, expected: Tag) -> Result<(), ProtocolError> {
        if self.tag != expected {
            return Err(ProtocolError::UnexpectedTag {
                expected,
                got: self.tag,
            });
        }
        Ok(())
    }
}

/// Writes one frame. `write_all` loops until every byte is out.
pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 5];
    header[0] = frame.tag as u8;
    header[1..5].copy_from_slice(&(frame.body.len() as u32).to_le_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `read_exact` loops until the declared length arrives;
/// a stream that ends early is rejected with an IO error.
pub async fn recv_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let tag = Tag::try_from(header[0])?;
    let length = u32::from_le_bytes(header[1..5].try_into().expect("4 header bytes"));

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;

    Ok(Frame { tag, body })
}

//! Length-prefixed framing for tree store connections
//!
//! Both ends of a store connection exchange [`Frame`]s as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf Frame ]
//! ```
//! The agent's client and the server's session share the async helpers
//! here, so reads and writes are framed the same way on both sides.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::Frame;

/// Maximum frame size (10 MiB); a store value never comes close
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Bytes reserved for each socket read
const READ_CHUNK: usize = 4096;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Invalid message length prefix: {0}")]
    InvalidLength(u32),

    #[error("Protobuf decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    EncodeError(#[from] prost::EncodeError),

    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the connection itself failed, as opposed to one bad frame
    pub fn is_io(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

/// Encode a frame into a length-prefixed byte buffer
pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
    let msg_len = frame.encoded_len();

    if msg_len > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::MessageTooLarge(msg_len));
    }

    let mut buf = BytesMut::with_capacity(4 + msg_len);
    buf.put_u32(msg_len as u32);
    frame.encode(&mut buf)?;

    Ok(buf.freeze())
}

/// Try to decode a length-prefixed frame from a buffer
///
/// Returns:
/// - `Ok(Some(frame))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

    if msg_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(msg_len));
    }

    let total_len = 4 + msg_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    let msg_bytes = buf.split_to(msg_len as usize);
    let frame = Frame::decode(msg_bytes)?;

    Ok(Some(frame))
}

/// Encode `frame` and write it out in one piece
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode(frame)?;
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Buffers bytes read from a connection and splits them into frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read whatever the peer has sent into the buffer.
    ///
    /// Returns the number of bytes read; `0` means the peer closed the
    /// connection. Cancel safe, so it can sit in a `select!` branch.
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> Result<usize, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        self.buffer.reserve(READ_CHUNK);
        Ok(reader.read_buf(&mut self.buffer).await?)
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Frame>, CodecError> {
        decode(&mut self.buffer)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

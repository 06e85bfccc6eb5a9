use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, AppResult, ProtocolError};

use super::frame::Frame;

pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads one newline-terminated frame, reassembling partial reads.
///
/// # Errors
///
/// Returns an error when the peer closed the connection, the frame is too
/// large or not UTF-8, or it does not decode.
pub async fn read_frame<R>(reader: &mut R) -> AppResult<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(MAX_FRAME_BYTES).map_or(u64::MAX, |max| max.saturating_add(1));
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let mut bounded = (&mut *reader).take(limit);
    let bytes = bounded.read_until(b'\n', &mut buffer).await.map_err(|err| {
        AppError::protocol(ProtocolError::Io {
            context: "read wire frame",
            source: err,
        })
    })?;
    if bytes == 0 {
        return Err(AppError::protocol(ProtocolError::ConnectionClosed));
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    if buffer.len() > MAX_FRAME_BYTES {
        return Err(AppError::protocol(ProtocolError::FrameTooLarge {
            max_bytes: MAX_FRAME_BYTES,
        }));
    }
    let line = std::str::from_utf8(&buffer).map_err(|err| {
        AppError::protocol(ProtocolError::FrameInvalidUtf8 { source: err })
    })?;
    decode_frame(line)
}

/// Decodes a single frame line (without the trailing newline).
///
/// # Errors
///
/// Returns an error when the line is not a valid frame.
pub fn decode_frame(line: &str) -> AppResult<Frame> {
    serde_json::from_str::<Frame>(line).map_err(|err| {
        AppError::protocol(ProtocolError::Deserialize {
            context: "wire frame",
            source: err,
        })
    })
}

/// Writes one frame followed by a newline.
///
/// # Errors
///
/// Returns an error when encoding or the write fails.
pub async fn send_frame<W>(writer: &mut W, frame: &Frame) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_string(frame).map_err(|err| {
        AppError::protocol(ProtocolError::Serialize {
            context: "wire frame",
            source: err,
        })
    })?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await.map_err(|err| {
        AppError::protocol(ProtocolError::Io {
            context: "send wire frame",
            source: err,
        })
    })?;
    writer.flush().await.map_err(|err| {
        AppError::protocol(ProtocolError::Io {
            context: "flush wire frame",
            source: err,
        })
    })
}

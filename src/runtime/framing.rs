//! Newline-delimited text framing.
//!
//! Each protocol message is one UTF-8 line terminated by `\n`. A `\r`
//! immediately before the terminator is dropped so CRLF peers work too.

use bytes::{Buf, BytesMut};

/// Longest line accepted from a peer, excluding the terminator
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Framing errors. Either one ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    TooLong,
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Split the next complete line off the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer holds only a partial line.
pub fn next_line(buffer: &mut BytesMut) -> Result<Option<String>, FrameError> {
    let Some(end) = buffer.iter().position(|&b| b == b'\n') else {
        if buffer.len() > MAX_LINE_LENGTH {
            return Err(FrameError::TooLong);
        }
        return Ok(None);
    };

    let mut line = buffer.split_to(end);
    buffer.advance(1);

    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    if line.len() > MAX_LINE_LENGTH {
        return Err(FrameError::TooLong);
    }

    String::from_utf8(line.to_vec())
        .map(Some)
        .map_err(|_| FrameError::InvalidUtf8)
}

/// Append `text` as one framed line to `out`.
pub fn encode(text: &str, out: &mut BytesMut) {
    out.reserve(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"\n");
}

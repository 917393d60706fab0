use std::io;

use bytes::{Buf, BytesMut};
use log::trace;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Marker the tool prints on its own line once a response is complete.
/// Some versions append a number, e.g. `{ready12345}`.
pub const READY_TOKEN: &[u8] = b"{ready";

/// Errors produced while splitting the output stream into frames
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Failed to read from process: {0}")]
    Read(#[from] io::Error),

    #[error("no terminating token before stream end ({0} bytes left over)")]
    Unterminated(usize),
}

/// Splits merged tool output into one frame per response
///
/// A frame is everything before a line starting with [`READY_TOKEN`]. The
/// token line itself, suffix and newline included, is consumed and dropped.
#[derive(Debug, Default)]
pub struct ReadyTokenCodec {
    /// Offset up to which the buffer holds no token-line start
    scanned: usize,
}

impl ReadyTokenCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the next line beginning with the token, starting at `from`
    fn find_token(buf: &[u8], from: usize) -> Option<usize> {
        let mut pos = from;
        while pos + READY_TOKEN.len() <= buf.len() {
            let found = buf[pos..]
                .windows(READY_TOKEN.len())
                .position(|window| window == READY_TOKEN)?;
            let at = pos + found;
            if at == 0 || buf[at - 1] == b'\n' {
                return Some(at);
            }
            pos = at + 1;
        }
        None
    }

    /// Where the next scan may safely resume without missing a token
    /// that straddles the end of the current buffer
    fn resume_offset(buf_len: usize) -> usize {
        buf_len.saturating_sub(READY_TOKEN.len())
    }

    fn split_frame(&mut self, buf: &mut BytesMut, token_at: usize, consumed: usize) -> BytesMut {
        self.scanned = 0;
        let frame = buf.split_to(token_at);
        buf.advance(consumed - token_at);
        trace!("Framed {} byte response", frame.len());
        frame
    }
}

impl Decoder for ReadyTokenCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        let Some(token_at) = Self::find_token(buf, self.scanned) else {
            self.scanned = Self::resume_offset(buf.len());
            return Ok(None);
        };

        // The whole token line must be buffered before the frame is released
        let rest = &buf[token_at + READY_TOKEN.len()..];
        match rest.iter().position(|b| *b == b'\n') {
            Some(newline) => {
                let consumed = token_at + READY_TOKEN.len() + newline + 1;
                Ok(Some(self.split_frame(buf, token_at, consumed)))
            }
            None => {
                self.scanned = token_at;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        // A token line cut short by the end of the stream still ends the frame
        if let Some(token_at) = Self::find_token(buf, 0) {
            let len = buf.len();
            return Ok(Some(self.split_frame(buf, token_at, len)));
        }

        if buf.is_empty() {
            Ok(None)
        } else {
            Err(FrameError::Unterminated(buf.len()))
        }
    }
}

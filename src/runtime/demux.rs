//! Demultiplexer for the runtime's framed log stream.
//!
//! The stream is a sequence of frames: an 8-byte header
//! `[stream_type, 0, 0, 0, size_be4]` where stream type 1 is stdout and 2
//! is stderr, followed by `size` payload bytes. Frames may be split or
//! merged arbitrarily across chunks; the decoder is incremental. A
//! malformed header is fatal for the whole call.

use crate::error::{CommandError, ErrorKind};

const HEADER_LEN: usize = 8;

const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

/// Incremental decoder routing frame payloads into stdout and stderr
/// buffers.
#[derive(Debug, Default)]
pub struct LogDemux {
    header: Vec<u8>,
    remaining: usize,
    target: u8,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LogDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk of the raw stream.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), CommandError> {
        let mut rest = chunk;

        while !rest.is_empty() {
            if self.remaining > 0 {
                let take = self.remaining.min(rest.len());
                let sink = if self.target == STREAM_STDOUT {
                    &mut self.stdout
                } else {
                    &mut self.stderr
                };
                sink.extend_from_slice(&rest[..take]);
                self.remaining -= take;
                rest = &rest[take..];
                continue;
            }

            let need = HEADER_LEN - self.header.len();
            let take = need.min(rest.len());
            self.header.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.header.len() == HEADER_LEN {
                let stream_type = self.header[0];
                if !matches!(stream_type, STREAM_STDOUT | STREAM_STDERR)
                    || self.header[1..4] != [0, 0, 0]
                {
                    return Err(CommandError::new(
                        ErrorKind::LogDecode,
                        format!("malformed log frame header {:?}", self.header),
                    ));
                }

                let size = u32::from_be_bytes(
                    self.header[4..8].try_into().expect("4-byte header slice"),
                );
                self.target = stream_type;
                self.remaining = size as usize;
                self.header.clear();
            }
        }

        Ok(())
    }

    /// Finish decoding at end of stream, yielding `(stdout, stderr)`. A
    /// partial header or payload at EOF is a decode error.
    pub fn finish(self) -> Result<(String, String), CommandError> {
        if !self.header.is_empty() || self.remaining > 0 {
            return Err(CommandError::new(
                ErrorKind::LogDecode,
                "log stream truncated mid-frame",
            ));
        }

        Ok((
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        ))
    }
}

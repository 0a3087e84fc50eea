//! Message framing over a raw byte stream
//!
//! The simulator writes one request per socket write and never delimits
//! it, so the legacy mode treats every read as one message. Line mode
//! reads newline-delimited messages through a `BufReader`, which survives
//! reads that split or coalesce messages.

use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

use crate::error::{ProtocolError, Result};

/// Largest message accepted in line mode
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One read = one message
    #[default]
    Chunk,
    /// Newline-delimited messages
    Line,
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chunk" => Ok(Self::Chunk),
            "line" => Ok(Self::Line),
            other => Err(format!("unknown framing '{other}' (expected chunk or line)")),
        }
    }
}

/// Yields complete request messages from the read half of a connection
pub struct FrameReader<R> {
    framing: Framing,
    reader: BufReader<R>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            framing,
            reader: BufReader::new(reader),
            chunk: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Next non-blank message, or `None` once the peer closed the stream
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.framing {
            Framing::Chunk => self.next_chunk().await,
            Framing::Line => self.next_line().await,
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.chunk.is_empty() {
            self.chunk = vec![0u8; CHUNK_BYTES];
        }
        loop {
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            if !is_blank(&self.chunk[..n]) {
                return Ok(Some(self.chunk[..n].to_vec()));
            }
        }
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let mut line = Vec::new();
            let limit = MAX_FRAME_BYTES as u64 + 1;
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 {
                return Ok(None);
            }

            if line.last() == Some(&b'\n') {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
            } else if line.len() > MAX_FRAME_BYTES {
                return Err(ProtocolError::FrameTooLarge {
                    size: line.len(),
                    limit: MAX_FRAME_BYTES,
                }
                .into());
            } else {
                debug!(bytes = line.len(), "dropping unterminated message");
                return Ok(None);
            }

            if !is_blank(&line) {
                return Ok(Some(line));
            }
        }
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_whitespace())
}

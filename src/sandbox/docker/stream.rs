//! Demultiplexing of `docker exec` output
//!
//! Without a TTY, Docker interleaves stdout and stderr in one stream of
//! framed chunks:
//!
//! ```text
//! ┌──────────┬───────────┬─────────────────────┬───────────────┐
//! │ type (1) │ 0 0 0 (3) │ size, u32 BE (4)    │ payload (size)│
//! └──────────┴───────────┴─────────────────────┴───────────────┘
//!   1 = stdout, 2 = stderr
//! ```
//!
//! Frames can be split across body chunks, so the demuxer buffers partial
//! headers and payloads.

use crate::sandbox::output::OutputBuffer;

const HEADER_LEN: usize = 8;
const STDERR: u8 = 2;

/// Splits a multiplexed exec stream into capped stdout and stderr buffers
#[derive(Debug)]
pub struct ExecStreamDemuxer {
    pending: Vec<u8>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
}

impl ExecStreamDemuxer {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            stdout: OutputBuffer::new(limit),
            stderr: OutputBuffer::new(limit),
        }
    }

    /// Feed one body chunk
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut offset = 0;
        while self.pending.len() - offset >= HEADER_LEN {
            let header = &self.pending[offset..offset + HEADER_LEN];
            let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let end = offset + HEADER_LEN + size;
            if self.pending.len() < end {
                break;
            }
            let payload = &self.pending[offset + HEADER_LEN..end];
            if header[0] == STDERR {
                self.stderr.push(payload);
            } else {
                self.stdout.push(payload);
            }
            offset = end;
        }
        self.pending.drain(..offset);
    }

    /// Bytes left over from an incomplete frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn finish(self) -> (OutputBuffer, OutputBuffer) {
        (self.stdout, self.stderr)
    }
}

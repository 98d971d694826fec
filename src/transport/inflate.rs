//! zlib-stream payload decompression
//!
//! With transport compression enabled the gateway sends one shared zlib
//! stream split across binary messages. A logical frame is complete when the
//! accumulated bytes end with the sync-flush marker `00 00 FF FF`.

use super::TransportError;
use flate2::{Decompress, FlushDecompress, Status};

const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];
const CHUNK: usize = 32 * 1024;

pub struct Inflater {
    decompress: Decompress,
    buffer: Vec<u8>,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    /// Feed one binary message.
    ///
    /// Returns the decoded text once a complete frame has accumulated,
    /// `None` while the frame is still partial.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<String>, TransportError> {
        self.buffer.extend_from_slice(chunk);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let result = self.inflate();
        self.buffer.clear();
        result.map(Some)
    }

    fn inflate(&mut self) -> Result<String, TransportError> {
        let mut output = Vec::with_capacity(self.buffer.len() * 4);
        let mut offset = 0usize;

        loop {
            if output.capacity() - output.len() < CHUNK {
                output.reserve(CHUNK);
            }

            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();

            let status = self
                .decompress
                .decompress_vec(&self.buffer[offset..], &mut output, FlushDecompress::Sync)
                .map_err(|e| TransportError::Decompress(e.to_string()))?;

            let consumed = (self.decompress.total_in() - in_before) as usize;
            let produced = self.decompress.total_out() - out_before;
            offset += consumed;

            let input_drained = offset >= self.buffer.len();
            if status == Status::StreamEnd && !input_drained {
                return Err(TransportError::Decompress(format!(
                    "{} trailing byte(s) after end of zlib stream",
                    self.buffer.len() - offset
                )));
            }
            if input_drained && (output.len() < output.capacity() || produced == 0) {
                break;
            }
            if consumed == 0 && produced == 0 {
                return Err(TransportError::Decompress(
                    "zlib stream stalled with input left".to_string(),
                ));
            }
        }

        String::from_utf8(output).map_err(|e| TransportError::Decompress(e.to_string()))
    }

    /// Drop stream state; a new socket starts a new zlib stream.
    pub fn reset(&mut self) {
        self.decompress.reset(true);
        self.buffer.clear();
    }
}

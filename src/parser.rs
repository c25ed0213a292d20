//! Reassembles newline-delimited JSON from arbitrary body deliveries.
//!
//! Deliveries may split a line anywhere, including inside a multi-byte
//! character, so the carry-over is kept as raw bytes and a line is only
//! decoded once its terminating `\n` has arrived.

use crate::api::ChatResponseChunk;
use crate::error::ChatError;

/// Splits a byte stream into complete lines, carrying the unterminated tail across calls.
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `fragment` and returns every line it completed, in order.
    /// Blank lines are skipped.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<Vec<u8>> {
        self.carry.extend_from_slice(fragment);

        let Some(last_newline) = self.carry.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        complete
            .split(|&b| b == b'\n')
            .map(<[u8]>::trim_ascii)
            .filter(|line| !line.is_empty())
            .map(<[u8]>::to_vec)
            .collect()
    }

    /// Takes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.carry);
        let line = rest.trim_ascii();
        (!line.is_empty()).then(|| line.to_vec())
    }

    pub fn carry_over(&self) -> &[u8] {
        &self.carry
    }
}

/// Decodes one complete line into a chunk.
pub fn decode_line(line: &[u8]) -> Result<ChatResponseChunk, ChatError> {
    let text = std::str::from_utf8(line).map_err(|_| ChatError::InvalidUtf8)?;
    serde_json::from_str(text).map_err(|source| ChatError::Decode {
        line: text.to_string(),
        source,
    })
}

/// Line reassembly plus decoding. Each result is independent: a line that
/// fails to decode does not affect the ones around it.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    lines: LineBuffer,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &[u8]) -> Vec<Result<ChatResponseChunk, ChatError>> {
        self.lines
            .push(fragment)
            .iter()
            .map(|line| decode_line(line))
            .collect()
    }

    pub fn finish(&mut self) -> Option<Result<ChatResponseChunk, ChatError>> {
        self.lines.finish().map(|line| decode_line(&line))
    }
}

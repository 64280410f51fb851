//! Incremental line splitting for newline-delimited response bodies.
//!
//! Chunks arrive at arbitrary byte boundaries; [`LineBuffer`] holds only the
//! unterminated tail between pushes.

/// Splits a byte stream into `\n`-terminated lines. `\r\n` is tolerated.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        for (i, byte) in chunk.iter().enumerate() {
            if *byte == b'\n' {
                self.pending.extend_from_slice(&chunk[start..i]);
                lines.push(decode_line(&self.pending));
                self.pending.clear();
                start = i + 1;
            }
        }
        self.pending.extend_from_slice(&chunk[start..]);

        lines
    }

    /// Flush the final unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }

    /// Bytes held waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

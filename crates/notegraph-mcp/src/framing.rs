//! Newline framing for byte chunks read from a child process.

/// Accumulates raw output chunks and yields complete lines.
///
/// Partial lines are held until their terminating `\n` arrives. A trailing
/// `\r` is stripped and blank lines are skipped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = decode(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Take whatever unterminated text is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        decode(&rest)
    }
}

fn decode(bytes: &[u8]) -> Option<String> {
    let decoded = String::from_utf8_lossy(bytes);
    let text = decoded.strip_suffix('\r').unwrap_or(decoded.as_ref());
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

//! Line assembly for the incoming byte stream

/// Longest line kept before it is cut and delivered as is
const MAX_LINE_LENGTH: usize = 1024;

/// Accumulates raw bytes and yields complete, trimmed text lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line completed by them.
    ///
    /// Lines are split on `\n`, surrounding whitespace (including `\r`) is
    /// trimmed and invalid UTF-8 is replaced. Empty lines are kept.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                lines.push(self.take_line());
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE_LENGTH {
                    tracing::warn!("Line exceeded {} bytes, cutting it", MAX_LINE_LENGTH);
                    lines.push(self.take_line());
                }
            }
        }
        lines
    }

    /// Bytes received since the last complete line
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop a partial line
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        line
    }
}

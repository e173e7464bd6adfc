//! Line-oriented output log for command sessions
//!
//! Raw bytes drained from the controller descriptor arrive in arbitrary
//! chunks. The buffer decodes them tolerantly, splits on newlines, and keeps
//! the last line "open" when the chunk ended mid-line so the next drain
//! continues it. No line is ever split or duplicated across drains.

/// Append-only line log with partial-line buffering.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    lines: Vec<String>,
    /// True when the last element of `lines` is an unterminated partial line.
    open: bool,
}

impl OutputBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw output.
    ///
    /// Invalid UTF-8 sequences are substituted, never rejected. The first
    /// fragment of the chunk continues the previous unterminated line, if any.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(data);
        let ends_with_newline = text.ends_with('\n');

        let mut segments: Vec<&str> = text.split('\n').collect();
        if ends_with_newline {
            // split produces a trailing empty segment after the final newline
            segments.pop();
        }

        let mut segments = segments.into_iter();
        if self.open {
            if let (Some(first), Some(last)) = (segments.next(), self.lines.last_mut()) {
                last.push_str(first);
            }
        }
        for segment in segments {
            self.lines.push(segment.to_string());
        }
        self.open = !ends_with_newline;
    }

    /// The most recent `max_lines` lines (all of them if fewer).
    pub fn recent_lines(&self, max_lines: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(max_lines);
        self.lines[start..].to_vec()
    }

    /// Number of buffered lines, counting an open partial line
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Check if nothing has been appended yet
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

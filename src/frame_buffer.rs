//! Bounded, line-wrapped scrollback buffer for the simulated terminal.
//!
//! When the buffer is full, appending new lines silently evicts the oldest
//! lines from the front. Memory usage is bounded at `max_lines` rendered
//! lines regardless of how much text is appended, and no stored line ever
//! exceeds `width` characters.
//!
//! # Usage in the engine
//!
//! The engine owns a single `FrameBuffer`. Banner text goes in through
//! [`FrameBuffer::append`]; the typing path emits one character at a time
//! via [`FrameBuffer::append_char`]. After every mutation the engine calls
//! [`FrameBuffer::snapshot`] and pushes the owned copy to viewers; the
//! buffer is never shared by reference.

use std::collections::VecDeque;

/// Default scrollback depth in rendered lines.
pub const DEFAULT_MAX_LINES: usize = 100;

/// Fixed-capacity line buffer with character-based wrapping.
///
/// Appending past `max_lines` silently drops the oldest lines. The buffer
/// never panics or grows beyond its configured limits.
#[derive(Debug)]
pub struct FrameBuffer {
    lines: VecDeque<String>,
    width: usize,
    max_lines: usize,
}

impl FrameBuffer {
    /// Create a new buffer wrapping at `width` characters, keeping at most
    /// `max_lines` lines.
    ///
    /// # Panics
    ///
    /// Panics if `width == 0` or `max_lines == 0`.
    #[must_use]
    pub fn new(width: usize, max_lines: usize) -> Self {
        assert!(width > 0, "FrameBuffer width must be > 0");
        assert!(max_lines > 0, "FrameBuffer max_lines must be > 0");
        Self {
            lines: VecDeque::with_capacity(max_lines.min(256)),
            width,
            max_lines,
        }
    }

    /// Append `text`, splitting on `\n` and wrapping each logical line into
    /// chunks of at most `width` characters.
    ///
    /// An empty `text` is a no-op. An empty logical line (consecutive
    /// newlines) produces an empty rendered line.
    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        for logical in text.split('\n') {
            if logical.is_empty() {
                self.push_line(String::new());
                continue;
            }
            let chars: Vec<char> = logical.chars().collect();
            for chunk in chars.chunks(self.width) {
                self.push_line(chunk.iter().collect());
            }
        }
    }

    /// Append a single character in typing mode.
    ///
    /// The character extends the current last line unless that line has
    /// reached `width` (or the buffer is empty), in which case a new line
    /// is started. A `\n` starts a new empty line instead of being stored.
    pub fn append_char(&mut self, ch: char) {
        if ch == '\n' {
            self.push_line(String::new());
            return;
        }
        let needs_new_line = match self.lines.back() {
            Some(last) => last.chars().count() >= self.width,
            None => true,
        };
        if needs_new_line {
            self.push_line(ch.to_string());
        } else if let Some(last) = self.lines.back_mut() {
            last.push(ch);
        }
    }

    /// Return an owned copy of the current lines, oldest first.
    ///
    /// The snapshot does not track later mutations; callers receive a
    /// point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Discard all lines without changing the configured limits.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Replace the wrap width and scrollback depth, re-wrapping existing
    /// content so the line-length invariant holds under the new width.
    ///
    /// # Panics
    ///
    /// Panics if `width == 0` or `max_lines == 0`.
    pub fn set_limits(&mut self, width: usize, max_lines: usize) {
        assert!(width > 0, "FrameBuffer width must be > 0");
        assert!(max_lines > 0, "FrameBuffer max_lines must be > 0");
        if width == self.width && max_lines == self.max_lines {
            return;
        }
        let existing: Vec<String> = self.lines.drain(..).collect();
        self.width = width;
        self.max_lines = max_lines;
        for line in existing {
            self.append(&line);
        }
    }

    /// Current number of rendered lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True if no lines are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Configured wrap width in characters.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Configured maximum number of lines.
    #[must_use]
    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Construction ──────────────────────────────────────────────────────

    #[test]
    fn test_new_buffer_is_empty() {
        let fb = FrameBuffer::new(70, 100);
        assert!(fb.is_empty());
        assert_eq!(fb.len(), 0);
        assert_eq!(fb.width(), 70);
        assert_eq!(fb.max_lines(), 100);
        assert!(fb.snapshot().is_empty());
    }

    #[test]
    #[should_panic(expected = "width must be > 0")]
    fn test_zero_width_panics() {
        let _ = FrameBuffer::new(0, 100);
    }

    #[test]
    #[should_panic(expected = "max_lines must be > 0")]
    fn test_zero_max_lines_panics() {
        let _ = FrameBuffer::new(70, 0);
    }

    // ── Append / wrapping ─────────────────────────────────────────────────

    #[test]
    fn test_append_empty_is_noop() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append("");
        assert!(fb.is_empty());
    }

    #[test]
    fn test_append_splits_on_newlines() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append("one\ntwo\nthree");
        assert_eq!(fb.snapshot(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_append_preserves_blank_lines() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append("above\n\nbelow");
        assert_eq!(fb.snapshot(), vec!["above", "", "below"]);
    }

    #[test]
    fn test_append_wraps_long_lines_at_width() {
        let mut fb = FrameBuffer::new(4, 100);
        fb.append("abcdefghij");
        assert_eq!(fb.snapshot(), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_no_line_exceeds_width() {
        let mut fb = FrameBuffer::new(7, 100);
        fb.append("the quick brown fox\njumps over the lazy dog");
        for line in fb.snapshot() {
            assert!(line.chars().count() <= 7, "line too long: {line:?}");
        }
    }

    #[test]
    fn test_wrap_counts_chars_not_bytes() {
        // 6 multibyte characters into a 3-char buffer: exactly two lines.
        let mut fb = FrameBuffer::new(3, 100);
        fb.append("éééééé");
        assert_eq!(fb.snapshot(), vec!["ééé", "ééé"]);
    }

    // ── Eviction ──────────────────────────────────────────────────────────

    #[test]
    fn test_eviction_drops_oldest_lines() {
        let mut fb = FrameBuffer::new(70, 3);
        fb.append("1\n2\n3\n4\n5");
        assert_eq!(fb.snapshot(), vec!["3", "4", "5"]);
        assert_eq!(fb.len(), 3);
    }

    #[test]
    fn test_len_never_exceeds_max_lines() {
        let mut fb = FrameBuffer::new(5, 10);
        for i in 0..50 {
            fb.append(&format!("line number {i} with enough text to wrap"));
            assert!(fb.len() <= 10);
        }
    }

    // ── Typing path ───────────────────────────────────────────────────────

    #[test]
    fn test_append_char_extends_last_line() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append("h");
        fb.append_char('i');
        assert_eq!(fb.snapshot(), vec!["hi"]);
    }

    #[test]
    fn test_append_char_into_empty_buffer_starts_line() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append_char('x');
        assert_eq!(fb.snapshot(), vec!["x"]);
    }

    #[test]
    fn test_append_char_wraps_at_width() {
        let mut fb = FrameBuffer::new(3, 100);
        for ch in "abcde".chars() {
            fb.append_char(ch);
        }
        assert_eq!(fb.snapshot(), vec!["abc", "de"]);
    }

    #[test]
    fn test_append_char_newline_starts_empty_line() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append_char('a');
        fb.append_char('\n');
        fb.append_char('b');
        assert_eq!(fb.snapshot(), vec!["a", "b"]);
    }

    #[test]
    fn test_append_char_evicts_at_capacity() {
        let mut fb = FrameBuffer::new(1, 2);
        for ch in "abc".chars() {
            fb.append_char(ch);
        }
        assert_eq!(fb.snapshot(), vec!["b", "c"]);
    }

    // ── Snapshot semantics ────────────────────────────────────────────────

    #[test]
    fn test_snapshot_is_point_in_time() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append("before");
        let snap = fb.snapshot();
        fb.append("after");
        assert_eq!(snap, vec!["before"]);
        assert_eq!(fb.snapshot(), vec!["before", "after"]);
    }

    // ── Clear ─────────────────────────────────────────────────────────────

    #[test]
    fn test_clear_empties_buffer() {
        let mut fb = FrameBuffer::new(70, 100);
        fb.append("some\ncontent");
        fb.clear();
        assert!(fb.is_empty());
        fb.append("fresh");
        assert_eq!(fb.snapshot(), vec!["fresh"]);
    }

    // ── Reconfiguration ───────────────────────────────────────────────────

    #[test]
    fn test_set_limits_rewraps_existing_content() {
        let mut fb = FrameBuffer::new(10, 100);
        fb.append("abcdefghij");
        fb.set_limits(4, 100);
        assert_eq!(fb.snapshot(), vec!["abcd", "efgh", "ij"]);
        for line in fb.snapshot() {
            assert!(line.chars().count() <= 4);
        }
    }

    #[test]
    fn test_set_limits_shrinking_depth_evicts_oldest() {
        let mut fb = FrameBuffer::new(70, 10);
        fb.append("1\n2\n3\n4\n5");
        fb.set_limits(70, 2);
        assert_eq!(fb.snapshot(), vec!["4", "5"]);
    }

    #[test]
    fn test_set_limits_same_values_is_noop() {
        let mut fb = FrameBuffer::new(5, 10);
        fb.append("hello world");
        let before = fb.snapshot();
        fb.set_limits(5, 10);
        assert_eq!(fb.snapshot(), before);
    }
}

//! Coalesces streamed deltas before they reach the UI.
//!
//! Two independent rules apply. Pending text is promoted into the message's
//! fixed (append-only) buffers in batches, and pending text is pushed to the
//! observable fields at most once per throttle window.

use crate::splitter::Split;
use std::time::{Duration, Instant};

/// Pending text at or above this many characters is promoted to the fixed buffer.
pub const FLUSH_THRESHOLD_CHARS: usize = 300;

/// Minimum spacing between UI pushes.
pub const UI_THROTTLE: Duration = Duration::from_millis(80);

/// Text promoted out of the pending accumulators by one flush.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Flushed {
    pub content: Option<String>,
    pub thinking: Option<String>,
}

impl Flushed {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.thinking.is_none()
    }
}

#[derive(Debug)]
pub struct DisplayBuffer {
    pending_content: String,
    pending_thinking: String,
    last_push: Option<Instant>,
    threshold: usize,
    throttle: Duration,
}

impl Default for DisplayBuffer {
    fn default() -> Self {
        Self::new(FLUSH_THRESHOLD_CHARS, UI_THROTTLE)
    }
}

impl DisplayBuffer {
    pub fn new(threshold: usize, throttle: Duration) -> Self {
        Self {
            pending_content: String::new(),
            pending_thinking: String::new(),
            last_push: None,
            threshold,
            throttle,
        }
    }

    pub fn append(&mut self, split: &Split) {
        self.pending_content.push_str(&split.content);
        self.pending_thinking.push_str(&split.thinking);
    }

    pub fn pending_content(&self) -> &str {
        &self.pending_content
    }

    pub fn pending_thinking(&self) -> &str {
        &self.pending_thinking
    }

    /// Moves each accumulator out whole when `force` is set, it has reached
    /// the threshold, or it contains a newline. Empty accumulators never flush.
    pub fn flush_to_fixed(&mut self, force: bool) -> Flushed {
        Flushed {
            content: take_if_ready(&mut self.pending_content, force, self.threshold),
            thinking: take_if_ready(&mut self.pending_thinking, force, self.threshold),
        }
    }

    /// Returns true, and restarts the window, when a UI push is due.
    pub fn should_push(&mut self, now: Instant, done: bool) -> bool {
        let due = done
            || self
                .last_push
                .map_or(true, |last| now.saturating_duration_since(last) >= self.throttle);
        if due {
            self.last_push = Some(now);
        }
        due
    }
}

fn take_if_ready(pending: &mut String, force: bool, threshold: usize) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    if force || pending.contains('\n') || pending.chars().count() >= threshold {
        Some(std::mem::take(pending))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> Split {
        Split {
            content: text.to_string(),
            ..Split::default()
        }
    }

    #[test]
    fn flushing_nothing_is_a_no_op() {
        let mut buffer = DisplayBuffer::default();
        assert!(buffer.flush_to_fixed(false).is_empty());
        assert!(buffer.flush_to_fixed(true).is_empty());
    }

    #[test]
    fn short_text_waits() {
        let mut buffer = DisplayBuffer::default();
        buffer.append(&content("Hello"));
        assert!(buffer.flush_to_fixed(false).is_empty());
        assert_eq!(buffer.pending_content(), "Hello");
    }

    #[test]
    fn newline_flushes_everything_pending() {
        let mut buffer = DisplayBuffer::default();
        buffer.append(&content("line one\nline t"));
        let flushed = buffer.flush_to_fixed(false);
        assert_eq!(flushed.content.as_deref(), Some("line one\nline t"));
        assert_eq!(buffer.pending_content(), "");
    }

    #[test]
    fn threshold_counts_characters_not_bytes() {
        let mut buffer = DisplayBuffer::new(4, UI_THROTTLE);
        buffer.append(&content("ééé"));
        assert!(buffer.flush_to_fixed(false).is_empty());
        buffer.append(&content("é"));
        assert_eq!(buffer.flush_to_fixed(false).content.as_deref(), Some("éééé"));
    }

    #[test]
    fn thinking_flushes_independently() {
        let mut buffer = DisplayBuffer::default();
        buffer.append(&Split {
            content: "short".into(),
            thinking: "a thought\n".into(),
            thinking_completed: false,
        });
        let flushed = buffer.flush_to_fixed(false);
        assert_eq!(flushed.content, None);
        assert_eq!(flushed.thinking.as_deref(), Some("a thought\n"));
        assert_eq!(buffer.pending_content(), "short");
    }

    #[test]
    fn force_flushes_short_text() {
        let mut buffer = DisplayBuffer::default();
        buffer.append(&content("tail"));
        assert_eq!(buffer.flush_to_fixed(true).content.as_deref(), Some("tail"));
    }

    #[test]
    fn throttle_limits_push_rate() {
        let mut buffer = DisplayBuffer::default();
        let start = Instant::now();
        assert!(buffer.should_push(start, false));
        assert!(!buffer.should_push(start + Duration::from_millis(40), false));
        assert!(buffer.should_push(start + Duration::from_millis(40), true));
        assert!(!buffer.should_push(start + Duration::from_millis(100), false));
        assert!(buffer.should_push(start + Duration::from_millis(121), false));
    }
}

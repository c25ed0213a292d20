//! Applies decoded chunks of one stream onto its target message.
//!
//! Everything here is synchronous and clock-injected so the orchestrator can
//! hold the conversation lock only for the duration of a single chunk.

use crate::api::ChatResponseChunk;
use crate::buffer::{DisplayBuffer, Flushed};
use crate::models::ChatMessage;
use crate::splitter::{SplitMode, ThinkingSplitter};
use std::time::Instant;

#[derive(Debug)]
pub struct StreamProcessor {
    splitter: ThinkingSplitter,
    buffer: DisplayBuffer,
    received_first: bool,
}

impl StreamProcessor {
    pub fn new(mode: SplitMode) -> Self {
        Self::with_buffer(mode, DisplayBuffer::default())
    }

    pub fn with_buffer(mode: SplitMode, buffer: DisplayBuffer) -> Self {
        Self {
            splitter: ThinkingSplitter::new(mode),
            buffer,
            received_first: false,
        }
    }

    /// Routes one chunk into `message`. Returns true when observers should be notified.
    /// A terminal chunk finalizes the message.
    pub fn apply(&mut self, message: &mut ChatMessage, chunk: &ChatResponseChunk, now: Instant) -> bool {
        if let Some(fragment) = &chunk.message {
            if !self.received_first {
                self.received_first = true;
                if let Some(created_at) = &chunk.created_at {
                    message.created_at = Some(created_at.clone());
                }
            }

            let split = self.splitter.split(&fragment.content, fragment.thinking.as_deref());
            if split.thinking_completed {
                message.is_thinking_completed = true;
            }
            self.buffer.append(&split);

            if let Some(calls) = &fragment.tool_calls {
                message
                    .tool_calls
                    .get_or_insert_with(Vec::new)
                    .extend(calls.iter().cloned());
            }
        }

        if chunk.done {
            self.finalize(message, Some(chunk));
            return true;
        }

        let flushed = self.buffer.flush_to_fixed(false);
        let fixed_changed = apply_flushed(message, flushed);
        if self.buffer.should_push(now, false) {
            self.publish_pending(message);
            return true;
        }
        if fixed_changed {
            // Keep fixed + pending free of duplicated text until the next push.
            message.pending_content = self.buffer.pending_content().to_string();
            message.pending_thinking = self.buffer.pending_thinking().to_string();
        }
        false
    }

    /// Completes the message. `chunk` carries the metrics of a terminal chunk, if any.
    pub fn finalize(&mut self, message: &mut ChatMessage, chunk: Option<&ChatResponseChunk>) {
        self.drain(message);
        message.is_streaming = false;
        message.is_stopped = false;

        if let Some(chunk) = chunk {
            message.total_duration = chunk.total_duration;
            message.eval_count = chunk.eval_count;
            message.eval_duration = chunk.eval_duration;
        }
        if message.thinking.is_some() {
            message.is_thinking_completed = true;
        }
        snapshot_final(message);
    }

    /// Ends the stream early, keeping whatever text already arrived.
    pub fn interrupt(&mut self, message: &mut ChatMessage, stopped: bool) {
        self.drain(message);
        message.is_streaming = false;
        message.is_stopped = stopped;
        snapshot_final(message);
    }

    fn drain(&mut self, message: &mut ChatMessage) {
        let tail = self.splitter.finish();
        self.buffer.append(&tail);
        apply_flushed(message, self.buffer.flush_to_fixed(true));

        message.content = message.fixed_content.clone();
        message.thinking = (!message.fixed_thinking.is_empty()).then(|| message.fixed_thinking.clone());
        message.pending_content.clear();
        message.pending_thinking.clear();
    }

    fn publish_pending(&self, message: &mut ChatMessage) {
        message.pending_content = self.buffer.pending_content().to_string();
        message.pending_thinking = self.buffer.pending_thinking().to_string();
        message.latest_content = format!("{}{}", message.fixed_content, message.pending_content);
    }
}

fn apply_flushed(message: &mut ChatMessage, flushed: Flushed) -> bool {
    let changed = !flushed.is_empty();
    if let Some(content) = flushed.content {
        message.fixed_content.push_str(&content);
    }
    if let Some(thinking) = flushed.thinking {
        message.fixed_thinking.push_str(&thinking);
    }
    changed
}

// Records the just-finished state as the latest version of the message.
fn snapshot_final(message: &mut ChatMessage) {
    message.latest_content = message.content.clone();
    if message.revisions.is_empty() && message.original_content.is_empty() {
        message.original_content = message.content.clone();
    }
    message.final_thinking = message.thinking.clone();
    message.final_is_thinking_completed = message.is_thinking_completed;
    message.final_created_at = message.created_at.clone();
    message.final_total_duration = message.total_duration;
    message.final_eval_count = message.eval_count;
    message.final_eval_duration = message.eval_duration;
    message.final_is_stopped = message.is_stopped;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ResponseMessage;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn chunk(content: &str, done: bool) -> ChatResponseChunk {
        ChatResponseChunk {
            model: "demo:1b".into(),
            created_at: Some("2025-05-01T10:00:00Z".into()),
            message: Some(ResponseMessage {
                content: content.into(),
                ..ResponseMessage::default()
            }),
            done,
            ..ChatResponseChunk::default()
        }
    }

    fn thinking_chunk(thinking: &str) -> ChatResponseChunk {
        let mut c = chunk("", false);
        if let Some(m) = c.message.as_mut() {
            m.thinking = Some(thinking.into());
        }
        c
    }

    #[test]
    fn first_chunk_sets_created_at() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::InlineTags);
        let now = Instant::now();
        processor.apply(&mut message, &chunk("Hi", false), now);
        let mut later = chunk(" there", false);
        later.created_at = Some("2025-05-01T10:00:01Z".into());
        processor.apply(&mut message, &later, now);
        assert_eq!(message.created_at.as_deref(), Some("2025-05-01T10:00:00Z"));
    }

    #[test]
    fn throttled_pushes_update_pending_and_latest() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::InlineTags);
        let start = Instant::now();

        assert!(processor.apply(&mut message, &chunk("Hel", false), start));
        assert_eq!(message.pending_content, "Hel");
        assert_eq!(message.latest_content, "Hel");

        assert!(!processor.apply(&mut message, &chunk("lo", false), start + Duration::from_millis(10)));
        assert_eq!(message.pending_content, "Hel");

        assert!(processor.apply(&mut message, &chunk("!", false), start + Duration::from_millis(90)));
        assert_eq!(message.pending_content, "Hello!");
        assert_eq!(message.fixed_content, "");
    }

    #[test]
    fn newline_promotes_to_fixed_without_duplication() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::InlineTags);
        let start = Instant::now();

        processor.apply(&mut message, &chunk("first", false), start);
        processor.apply(&mut message, &chunk(" line\n", false), start + Duration::from_millis(5));
        assert_eq!(message.fixed_content, "first line\n");
        assert_eq!(message.pending_content, "");
        assert_eq!(message.display_content(), "first line\n");
    }

    #[test]
    fn terminal_chunk_finalizes_metrics() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::InlineTags);
        let now = Instant::now();
        processor.apply(&mut message, &chunk("Answer", false), now);

        let mut last = chunk("", true);
        last.total_duration = Some(500_000_000);
        last.eval_count = Some(42);
        last.eval_duration = Some(200_000_000);
        assert!(processor.apply(&mut message, &last, now));

        assert!(!message.is_streaming);
        assert!(!message.is_stopped);
        assert_eq!(message.content, "Answer");
        assert_eq!(message.pending_content, "");
        assert_eq!(message.eval_count, Some(42));
        assert_eq!(message.total_duration, Some(500_000_000));
        assert!((message.tokens_per_second().unwrap() - 210.0).abs() < 1e-9);
        assert_eq!(message.latest_content, "Answer");
        assert_eq!(message.original_content, "Answer");
        assert_eq!(message.final_eval_count, Some(42));
        assert_eq!(message.thinking, None);
    }

    #[test]
    fn inline_thinking_is_separated() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::InlineTags);
        let now = Instant::now();
        for piece in ["<think>", "hmm", "</think>", "Yes"] {
            processor.apply(&mut message, &chunk(piece, false), now);
        }
        assert!(message.is_thinking_completed);
        processor.finalize(&mut message, None);
        assert_eq!(message.content, "Yes");
        assert_eq!(message.thinking.as_deref(), Some("hmm"));
        assert_eq!(message.final_thinking.as_deref(), Some("hmm"));
    }

    #[test]
    fn structured_thinking_completes_at_finalization() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::Structured);
        let now = Instant::now();
        processor.apply(&mut message, &thinking_chunk("only reasoning"), now);
        assert!(!message.is_thinking_completed);
        processor.apply(&mut message, &chunk("", true), now);
        assert!(message.is_thinking_completed);
        assert_eq!(message.thinking.as_deref(), Some("only reasoning"));
        assert_eq!(message.content, "");
    }

    #[test]
    fn interrupt_keeps_partial_output() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::InlineTags);
        let now = Instant::now();
        processor.apply(&mut message, &chunk("par", false), now);
        processor.apply(&mut message, &chunk("tial", false), now);
        processor.interrupt(&mut message, true);

        assert!(!message.is_streaming);
        assert!(message.is_stopped);
        assert!(message.final_is_stopped);
        assert_eq!(message.content, "partial");
    }

    #[test]
    fn failure_before_any_output_leaves_empty_content() {
        let mut message = ChatMessage::assistant_placeholder();
        let mut processor = StreamProcessor::new(SplitMode::InlineTags);
        processor.interrupt(&mut message, false);
        assert!(!message.is_streaming);
        assert!(!message.is_stopped);
        assert_eq!(message.content, "");
    }
}

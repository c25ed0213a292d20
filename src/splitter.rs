//! Routes streamed text into reasoning ("thinking") and main content.

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// The server returns reasoning in its own `thinking` field.
    Structured,
    /// Reasoning is embedded in the content between `<think>` tags.
    InlineTags,
}

/// The routed result of one fragment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Split {
    pub content: String,
    pub thinking: String,
    /// Set when this fragment ended the reasoning block.
    pub thinking_completed: bool,
}

impl Split {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.thinking.is_empty() && !self.thinking_completed
    }
}

#[derive(Debug)]
pub struct ThinkingSplitter {
    mode: SplitMode,
    in_thinking: bool,
    seen_thinking: bool,
    completed: bool,
    // Tail that may be the start of a tag; rescanned with the next fragment.
    held: String,
}

impl ThinkingSplitter {
    pub fn new(mode: SplitMode) -> Self {
        Self {
            mode,
            in_thinking: false,
            seen_thinking: false,
            completed: false,
            held: String::new(),
        }
    }

    pub fn mode(&self) -> SplitMode {
        self.mode
    }

    pub fn is_in_thinking(&self) -> bool {
        self.in_thinking
    }

    pub fn split(&mut self, content: &str, thinking: Option<&str>) -> Split {
        match self.mode {
            SplitMode::Structured => self.split_structured(content, thinking),
            SplitMode::InlineTags => self.split_inline(content, thinking),
        }
    }

    /// Releases any held-back text once the stream is over.
    pub fn finish(&mut self) -> Split {
        let mut split = Split::default();
        let held = std::mem::take(&mut self.held);
        if held.is_empty() {
            return split;
        }
        if self.in_thinking {
            split.thinking = held;
        } else {
            split.content = held;
        }
        split
    }

    fn split_structured(&mut self, content: &str, thinking: Option<&str>) -> Split {
        let mut split = Split::default();
        if let Some(thinking) = thinking.filter(|t| !t.is_empty()) {
            self.seen_thinking = true;
            split.thinking.push_str(thinking);
        }
        if !content.is_empty() {
            split.content.push_str(content);
            if self.seen_thinking && !self.completed {
                self.completed = true;
                split.thinking_completed = true;
            }
        }
        split
    }

    fn split_inline(&mut self, fragment: &str, thinking: Option<&str>) -> Split {
        let mut split = Split::default();
        // Some models fill `thinking` even when it was not requested.
        if let Some(thinking) = thinking.filter(|t| !t.is_empty()) {
            self.seen_thinking = true;
            split.thinking.push_str(thinking);
        }
        let mut text = std::mem::take(&mut self.held);
        text.push_str(fragment);
        let mut rest = text.as_str();

        loop {
            if self.in_thinking {
                if let Some(idx) = rest.find(THINK_CLOSE) {
                    split.thinking.push_str(&rest[..idx]);
                    self.in_thinking = false;
                    self.completed = true;
                    split.thinking_completed = true;
                    rest = &rest[idx + THINK_CLOSE.len()..];
                    continue;
                }
                let keep = partial_tag_len(rest, THINK_CLOSE);
                split.thinking.push_str(&rest[..rest.len() - keep]);
                self.held = rest[rest.len() - keep..].to_string();
            } else {
                if let Some(idx) = rest.find(THINK_OPEN) {
                    split.content.push_str(&rest[..idx]);
                    self.in_thinking = true;
                    self.seen_thinking = true;
                    rest = &rest[idx + THINK_OPEN.len()..];
                    continue;
                }
                let keep = partial_tag_len(rest, THINK_OPEN);
                split.content.push_str(&rest[..rest.len() - keep]);
                self.held = rest[rest.len() - keep..].to_string();
            }
            break;
        }

        if !split.content.is_empty() && !self.in_thinking && self.seen_thinking && !self.completed {
            self.completed = true;
            split.thinking_completed = true;
        }
        split
    }
}

// Length of the longest proper prefix of `tag` that `text` ends with.
fn partial_tag_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| text.ends_with(&tag[..n]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(splitter: &mut ThinkingSplitter, fragments: &[&str]) -> (String, String, bool) {
        let mut content = String::new();
        let mut thinking = String::new();
        let mut completed = false;
        for fragment in fragments {
            let split = splitter.split(fragment, None);
            content.push_str(&split.content);
            thinking.push_str(&split.thinking);
            completed |= split.thinking_completed;
        }
        let tail = splitter.finish();
        content.push_str(&tail.content);
        thinking.push_str(&tail.thinking);
        (content, thinking, completed)
    }

    #[test]
    fn inline_single_fragment() {
        let mut splitter = ThinkingSplitter::new(SplitMode::InlineTags);
        let split = splitter.split("A<think>B</think>C", None);
        assert_eq!(split.content, "AC");
        assert_eq!(split.thinking, "B");
        assert!(split.thinking_completed);
        assert!(!splitter.is_in_thinking());
    }

    #[test]
    fn inline_tag_split_across_fragments() {
        let mut splitter = ThinkingSplitter::new(SplitMode::InlineTags);
        let result = run(&mut splitter, &["A<thi", "nk>B</think>C"]);
        assert_eq!(result, ("AC".to_string(), "B".to_string(), true));
    }

    #[test]
    fn every_split_point_gives_the_same_result() {
        let text = "Sure.<think>let me see</think>The answer is 4.";
        for i in 1..text.len() {
            let mut splitter = ThinkingSplitter::new(SplitMode::InlineTags);
            let (a, b) = text.split_at(i);
            let result = run(&mut splitter, &[a, b]);
            assert_eq!(
                result,
                (
                    "Sure.The answer is 4.".to_string(),
                    "let me see".to_string(),
                    true
                ),
                "split at {i}"
            );
        }
    }

    #[test]
    fn reasoning_continues_into_later_fragments() {
        let mut splitter = ThinkingSplitter::new(SplitMode::InlineTags);
        let first = splitter.split("<think>step one, ", None);
        assert_eq!(first.thinking, "step one, ");
        assert!(splitter.is_in_thinking());
        let second = splitter.split("step two", None);
        assert_eq!(second.thinking, "step two");
        assert!(!second.thinking_completed);
        let third = splitter.split("</think>done", None);
        assert_eq!(third.content, "done");
        assert!(third.thinking_completed);
    }

    #[test]
    fn lookalike_text_is_released_at_finish() {
        let mut splitter = ThinkingSplitter::new(SplitMode::InlineTags);
        let result = run(&mut splitter, &["x < y and a <th"]);
        assert_eq!(result, ("x < y and a <th".to_string(), String::new(), false));
    }

    #[test]
    fn held_text_is_flushed_when_not_a_tag() {
        let mut splitter = ThinkingSplitter::new(SplitMode::InlineTags);
        let first = splitter.split("a <t", None);
        assert_eq!(first.content, "a ");
        let second = splitter.split("able>", None);
        assert_eq!(second.content, "<table>");
    }

    #[test]
    fn inline_mode_keeps_a_thinking_field() {
        let mut splitter = ThinkingSplitter::new(SplitMode::InlineTags);
        let first = splitter.split("", Some("reasoning text"));
        assert_eq!(first.thinking, "reasoning text");
        assert_eq!(first.content, "");
        assert!(!first.thinking_completed);

        let second = splitter.split("Answer", None);
        assert_eq!(second.content, "Answer");
        assert!(second.thinking_completed);

        let third = splitter.split(" continues", None);
        assert!(!third.thinking_completed);
    }

    #[test]
    fn structured_mode_never_scans_tags() {
        let mut splitter = ThinkingSplitter::new(SplitMode::Structured);
        let first = splitter.split("", Some("pondering"));
        assert_eq!(first.thinking, "pondering");
        assert!(!first.thinking_completed);

        let second = splitter.split("<think>literal</think>", None);
        assert_eq!(second.content, "<think>literal</think>");
        assert!(second.thinking_completed);

        let third = splitter.split("more", None);
        assert!(!third.thinking_completed);
    }

    #[test]
    fn structured_content_without_reasoning_does_not_complete() {
        let mut splitter = ThinkingSplitter::new(SplitMode::Structured);
        let split = splitter.split("plain answer", None);
        assert_eq!(split.content, "plain answer");
        assert!(!split.thinking_completed);
    }
}

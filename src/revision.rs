//! Archiving a message before a retry, and browsing the archived versions.

use crate::error::ChatError;
use crate::models::ChatMessage;
use chrono::Utc;
use uuid::Uuid;

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

impl ChatMessage {
    /// Content to archive: the finalized snapshot, then the displayed
    /// content, then the raw stream buffers.
    fn latest_candidate_content(&self) -> String {
        non_empty(&self.latest_content)
            .or_else(|| non_empty(&self.content))
            .unwrap_or_else(|| format!("{}{}", self.fixed_content, self.pending_content))
    }

    fn latest_candidate_thinking(&self) -> Option<String> {
        self.final_thinking
            .as_deref()
            .and_then(non_empty)
            .or_else(|| self.thinking.as_deref().and_then(non_empty))
            .or_else(|| non_empty(&format!("{}{}", self.fixed_thinking, self.pending_thinking)))
    }

    /// Builds the archived copy of the latest version of this message.
    pub fn latest_snapshot(&self) -> ChatMessage {
        let content = self.latest_candidate_content();
        let thinking = self.latest_candidate_thinking();

        // An older revision may be on display; its metrics are not the latest ones.
        let (is_thinking_completed, created_at, total_duration, eval_count, eval_duration, is_stopped) =
            if self.is_viewing_latest() {
                (
                    self.is_thinking_completed,
                    self.created_at.clone(),
                    self.total_duration,
                    self.eval_count,
                    self.eval_duration,
                    self.is_stopped,
                )
            } else {
                (
                    self.final_is_thinking_completed,
                    self.final_created_at.clone(),
                    self.final_total_duration,
                    self.final_eval_count,
                    self.final_eval_duration,
                    self.final_is_stopped,
                )
            };

        let mut archive = ChatMessage::new(self.role, content.clone());
        archive.id = Uuid::new_v4();
        archive.fixed_content = content.clone();
        archive.thinking = thinking.clone();
        archive.fixed_thinking = thinking.clone().unwrap_or_default();
        archive.is_thinking_completed = is_thinking_completed;
        archive.created_at = created_at.clone();
        archive.total_duration = total_duration;
        archive.eval_count = eval_count;
        archive.eval_duration = eval_duration;
        archive.is_stopped = is_stopped;
        archive.revisions = self.revisions.clone();
        archive.current_revision_index = self.current_revision_index;
        archive.original_content = self.original_content.clone();
        archive.latest_content = content;
        archive.final_thinking = thinking;
        archive.final_is_thinking_completed = is_thinking_completed;
        archive.final_created_at = created_at;
        archive.final_total_duration = total_duration;
        archive.final_eval_count = eval_count;
        archive.final_eval_duration = eval_duration;
        archive.final_is_stopped = is_stopped;
        archive.timestamp = self.timestamp;
        archive
    }

    /// Archives the latest version and resets this message for a new stream.
    pub fn archive_for_retry(&mut self) {
        let archive = self.latest_snapshot();
        self.revisions.push(archive);
        self.current_revision_index = self.revisions.len();

        self.content.clear();
        self.fixed_content.clear();
        self.pending_content.clear();
        self.latest_content.clear();
        self.thinking = None;
        self.fixed_thinking.clear();
        self.pending_thinking.clear();
        self.is_thinking_completed = false;
        self.is_streaming = true;
        self.is_stopped = false;
        self.created_at = Some(Utc::now().to_rfc3339());
        self.total_duration = None;
        self.eval_count = None;
        self.eval_duration = None;
        self.tool_calls = None;
    }

    pub fn can_show_previous(&self) -> bool {
        !self.is_streaming && self.current_revision_index > 0
    }

    pub fn can_show_next(&self) -> bool {
        !self.is_streaming && self.current_revision_index < self.revisions.len()
    }

    pub fn show_previous_revision(&mut self) -> Result<(), ChatError> {
        if !self.can_show_previous() {
            return Err(ChatError::NavigationUnavailable);
        }
        self.current_revision_index -= 1;
        self.show_revision(self.current_revision_index);
        Ok(())
    }

    pub fn show_next_revision(&mut self) -> Result<(), ChatError> {
        if !self.can_show_next() {
            return Err(ChatError::NavigationUnavailable);
        }
        self.current_revision_index += 1;
        if self.current_revision_index < self.revisions.len() {
            self.show_revision(self.current_revision_index);
        } else {
            self.show_latest();
        }
        Ok(())
    }

    fn show_revision(&mut self, index: usize) {
        let Some(revision) = self.revisions.get(index).cloned() else {
            return;
        };
        self.content = revision.content.clone();
        self.fixed_content = revision.content;
        self.pending_content.clear();
        self.fixed_thinking = revision.thinking.clone().unwrap_or_default();
        self.thinking = revision.thinking;
        self.pending_thinking.clear();
        self.is_thinking_completed = revision.is_thinking_completed;
        self.created_at = revision.created_at;
        self.total_duration = revision.total_duration;
        self.eval_count = revision.eval_count;
        self.eval_duration = revision.eval_duration;
        self.is_stopped = revision.is_stopped;
    }

    fn show_latest(&mut self) {
        self.content = self.latest_content.clone();
        self.fixed_content = self.latest_content.clone();
        self.pending_content.clear();
        self.thinking = self.final_thinking.clone();
        self.fixed_thinking = self.final_thinking.clone().unwrap_or_default();
        self.pending_thinking.clear();
        self.is_thinking_completed = self.final_is_thinking_completed;
        self.created_at = self.final_created_at.clone();
        self.total_duration = self.final_total_duration;
        self.eval_count = self.final_eval_count;
        self.eval_duration = self.final_eval_duration;
        self.is_stopped = self.final_is_stopped;
    }
}

//! The chat engine's exported interface and the per-turn stream task.

use crate::api::{ByteStream, ChatProvider, ChatRequest, ChatResponseChunk, ModelDetails, OllamaProvider, RequestMessage};
use crate::config::{AppConfig, ChatSettings};
use crate::error::ChatError;
use crate::models::{ChatMessage, Role};
use crate::parser::ChunkDecoder;
use crate::splitter::SplitMode;
use crate::state::{ChatEvent, SessionState, StreamOutcome};
use crate::stream::StreamProcessor;
use chrono::Utc;
use futures::future::Fuse;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A running stream for one assistant message.
pub struct StreamHandle {
    pub message_id: Uuid,
    task: JoinHandle<()>,
}

impl StreamHandle {
    /// Resolves once the message has reached its terminal state.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            log::error!("Stream task for message {} panicked: {:?}", self.message_id, e);
        }
    }
}

/// One conversation against one server. Clones share the same conversation.
#[derive(Clone)]
pub struct ChatSession {
    state: SessionState,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn ChatProvider>, settings: ChatSettings) -> Self {
        Self::with_idle_timeout(provider, settings, None)
    }

    pub fn with_idle_timeout(
        provider: Arc<dyn ChatProvider>,
        settings: ChatSettings,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: SessionState::new(provider, settings, idle_timeout),
        }
    }

    /// Connects to the configured Ollama server.
    pub fn with_config(config: &AppConfig) -> Result<Self, ChatError> {
        let timeout = config.server.api_timeout.as_duration();
        let provider = OllamaProvider::new(&config.server.base_url(), timeout)?;
        log::info!("Using Ollama server {} at {}", config.server.name, provider.base_url());
        Ok(Self::with_idle_timeout(Arc::new(provider), config.chat.clone(), timeout))
    }

    pub fn provider(&self) -> Arc<dyn ChatProvider> {
        self.state.api_provider.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.state.events.subscribe()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.conversation.lock().await.messages.clone()
    }

    pub async fn settings(&self) -> ChatSettings {
        self.state.settings.read().await.clone()
    }

    pub async fn update_settings(&self, f: impl FnOnce(&mut ChatSettings)) {
        let mut settings = self.state.settings.write().await;
        let previous_model = settings.model.clone();
        f(&mut *settings);
        if settings.model != previous_model {
            // Cached details belong to the old model
            self.state.model_details.write().await.take();
        }
    }

    /// Fetches `/api/show` for the current model and keeps it for gating options.
    pub async fn refresh_model_details(&self) -> Result<ModelDetails, ChatError> {
        let model = self.state.settings.read().await.model.clone();
        let details = self.state.api_provider.show_model(&model).await?;
        log::debug!(
            "Model {} capabilities: {:?}, context length: {:?}",
            model,
            details.capabilities,
            details.context_length()
        );
        *self.state.model_details.write().await = Some(details.clone());
        Ok(details)
    }

    /// Appends a user message and a placeholder reply, then starts streaming into the reply.
    pub async fn send_message(&self, text: &str) -> Result<StreamHandle, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let user_message = ChatMessage::user(text);
        let assistant_message = ChatMessage::assistant_placeholder();
        let assistant_id = assistant_message.id;

        let history = {
            let mut conversation = self.state.conversation.lock().await;
            conversation.messages.push(user_message.clone());
            let history = conversation.messages.clone();
            conversation.messages.push(assistant_message.clone());
            history
        };
        log::info!("User message {} added, reply will be {}", user_message.id, assistant_id);
        self.state.emit(ChatEvent::MessageAdded(user_message));
        self.state.emit(ChatEvent::MessageAdded(assistant_message));

        Ok(self.start_stream(assistant_id, history).await)
    }

    /// Regenerates an assistant reply, or resends a user message.
    pub async fn retry(&self, message_id: Uuid) -> Result<StreamHandle, ChatError> {
        let role = {
            let conversation = self.state.conversation.lock().await;
            conversation
                .get(message_id)
                .map(|m| m.role)
                .ok_or(ChatError::MessageNotFound(message_id))?
        };
        match role {
            Role::Assistant => self.retry_assistant(message_id).await,
            Role::User => self.retry_user(message_id, None).await,
            other => Err(ChatError::NotRetryable(format!(
                "{} messages cannot be retried",
                other.as_str()
            ))),
        }
    }

    /// Resends the most recent user message with new text.
    pub async fn retry_with_edit(&self, message_id: Uuid, text: &str) -> Result<StreamHandle, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.retry_user(message_id, Some(text)).await
    }

    /// Stops the most recently started stream. Returns the affected message, if any.
    pub async fn cancel(&self) -> Option<Uuid> {
        let cancelled = self.state.cancel_current().await;
        if cancelled.is_none() {
            log::debug!("Cancel requested with no stream in flight");
        }
        cancelled
    }

    /// Stops every stream and discards all messages.
    pub async fn clear_conversation(&self) {
        self.state.cancel_all().await;
        {
            let mut conversation = self.state.conversation.lock().await;
            *conversation = Default::default();
        }
        log::info!("Conversation cleared");
        self.state.emit(ChatEvent::ConversationCleared);
    }

    pub async fn previous_revision(&self, message_id: Uuid) -> Result<(), ChatError> {
        self.state
            .try_update_message(message_id, ChatMessage::show_previous_revision)
            .await
    }

    pub async fn next_revision(&self, message_id: Uuid) -> Result<(), ChatError> {
        self.state
            .try_update_message(message_id, ChatMessage::show_next_revision)
            .await
    }

    async fn retry_assistant(&self, message_id: Uuid) -> Result<StreamHandle, ChatError> {
        let (snapshot, history) = {
            let mut conversation = self.state.conversation.lock().await;
            let index = conversation
                .position(message_id)
                .ok_or(ChatError::MessageNotFound(message_id))?;
            if index + 1 != conversation.messages.len() {
                return Err(ChatError::NotRetryable("only the last message can be regenerated".into()));
            }
            if conversation.messages[index].is_streaming {
                return Err(ChatError::NotRetryable("the message is still streaming".into()));
            }

            // History runs up to and including the user message this replied to.
            let history_end = conversation.messages[..index]
                .iter()
                .rposition(|m| m.role == Role::User)
                .map_or(index, |i| i + 1);
            let history = conversation.messages[..history_end].to_vec();

            let message = &mut conversation.messages[index];
            message.archive_for_retry();
            log::info!(
                "Regenerating message {} (version {})",
                message_id,
                message.version_count()
            );
            (message.clone(), history)
        };
        self.state.emit(ChatEvent::MessageUpdated(snapshot));

        Ok(self.start_stream(message_id, history).await)
    }

    async fn retry_user(&self, message_id: Uuid, new_text: Option<&str>) -> Result<StreamHandle, ChatError> {
        let assistant_message = ChatMessage::assistant_placeholder();
        let assistant_id = assistant_message.id;

        let (removed, user_message, history) = {
            let mut conversation = self.state.conversation.lock().await;
            let index = conversation
                .position(message_id)
                .ok_or(ChatError::MessageNotFound(message_id))?;
            if conversation.last_user_index() != Some(index) {
                return Err(ChatError::NotRetryable(
                    "only the most recent user message can be resent".into(),
                ));
            }
            if conversation.is_streaming() {
                return Err(ChatError::NotRetryable("a reply is still streaming".into()));
            }

            let mut user_message = conversation.messages.remove(index);
            let sent_at = user_message.timestamp;
            let mut removed = vec![user_message.id];
            conversation.messages.retain(|m| {
                let stale = m.role == Role::Assistant && m.timestamp >= sent_at;
                if stale {
                    removed.push(m.id);
                }
                !stale
            });

            if let Some(text) = new_text {
                user_message.content = text.to_string();
                user_message.latest_content = text.to_string();
            }
            user_message.timestamp = Utc::now();
            user_message.created_at = Some(user_message.timestamp.to_rfc3339());

            conversation.messages.push(user_message.clone());
            let history = conversation.messages.clone();
            conversation.messages.push(assistant_message.clone());
            (removed, user_message, history)
        };
        log::info!(
            "Resending user message {} ({} messages removed)",
            message_id,
            removed.len() - 1
        );
        self.state.emit(ChatEvent::MessagesRemoved(removed));
        self.state.emit(ChatEvent::MessageAdded(user_message));
        self.state.emit(ChatEvent::MessageAdded(assistant_message));

        Ok(self.start_stream(assistant_id, history).await)
    }

    async fn start_stream(&self, message_id: Uuid, history: Vec<ChatMessage>) -> StreamHandle {
        let settings = self.state.settings.read().await.clone();
        let details = self.state.model_details.read().await.clone();
        let request = build_request(&settings, details.as_ref(), &history);
        let mode = if request.think == Some(true) {
            SplitMode::Structured
        } else {
            SplitMode::InlineTags
        };

        let cancel_rx = self.state.register_stream(message_id).await;
        let state = self.state.clone();
        let task = tokio::spawn(run_stream(state, message_id, request, mode, cancel_rx));
        StreamHandle { message_id, task }
    }
}

/// Builds the `/api/chat` body: optional system prompt, then the finished history.
pub fn build_request(
    settings: &ChatSettings,
    details: Option<&ModelDetails>,
    history: &[ChatMessage],
) -> ChatRequest {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(prompt) = settings
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        messages.push(RequestMessage::from(&ChatMessage::system(prompt)));
    }
    // Replies still streaming for another turn have nothing to contribute yet.
    messages.extend(history.iter().filter(|m| !m.is_streaming).map(RequestMessage::from));

    ChatRequest {
        model: settings.model.clone(),
        messages,
        stream: settings.stream,
        think: settings.think_flag(details),
        options: settings.request_options(details),
        tools: (!settings.tools.is_empty()).then(|| settings.tools.clone()),
    }
}

async fn run_stream(
    state: SessionState,
    message_id: Uuid,
    request: ChatRequest,
    mode: SplitMode,
    cancel_rx: oneshot::Receiver<()>,
) {
    log::info!("Stream [{}]: starting request for model {}", message_id, request.model);
    let mut processor = StreamProcessor::new(mode);
    // Fused so a dropped sender stays pending instead of being polled after completion
    let mut cancel = cancel_rx.fuse();

    let outcome = match drive_stream(&state, message_id, &request, &mut processor, &mut cancel).await {
        Ok(()) => {
            log::info!("Stream [{}]: completed", message_id);
            StreamOutcome::Completed
        }
        Err(e) if e.is_cancellation() => {
            log::warn!("Stream [{}]: stopped by user", message_id);
            state
                .update_message(message_id, |m| processor.interrupt(m, true))
                .await;
            StreamOutcome::Stopped
        }
        Err(e) => {
            log::error!("Stream [{}]: failed: {}", message_id, e);
            state
                .update_message(message_id, |m| processor.interrupt(m, false))
                .await;
            state.emit(ChatEvent::Error {
                message_id: Some(message_id),
                message: e.to_string(),
            });
            StreamOutcome::Failed
        }
    };

    drop(cancel);
    state.finish_stream(message_id).await;
    state.emit(ChatEvent::StreamFinished { message_id, outcome });
}

async fn drive_stream(
    state: &SessionState,
    message_id: Uuid,
    request: &ChatRequest,
    processor: &mut StreamProcessor,
    cancel: &mut Fuse<oneshot::Receiver<()>>,
) -> Result<(), ChatError> {
    // Cancel is polled before data so a stop never waits behind a ready body.
    let mut body = tokio::select! {
        biased;
        Ok(()) = &mut *cancel => return Err(ChatError::Cancelled),
        opened = state.api_provider.open_chat_stream(request) => opened?,
    };

    let mut decoder = ChunkDecoder::new();
    loop {
        let delivery = tokio::select! {
            biased;
            Ok(()) = &mut *cancel => return Err(ChatError::Cancelled),
            next = next_delivery(&mut body, state.idle_timeout) => next?,
        };
        let Some(bytes) = delivery else {
            break;
        };
        for decoded in decoder.push(&bytes) {
            // One delivery can carry many lines
            if cancel_requested(cancel) {
                return Err(ChatError::Cancelled);
            }
            if handle_chunk(state, message_id, processor, decoded).await? {
                return Ok(());
            }
        }
    }

    if let Some(decoded) = decoder.finish() {
        if handle_chunk(state, message_id, processor, decoded).await? {
            return Ok(());
        }
    }

    log::warn!("Stream [{}]: body ended without a terminal chunk", message_id);
    state
        .update_message(message_id, |m| processor.finalize(m, None))
        .await;
    Ok(())
}

fn cancel_requested(cancel: &mut Fuse<oneshot::Receiver<()>>) -> bool {
    matches!(cancel.now_or_never(), Some(Ok(())))
}

async fn next_delivery(body: &mut ByteStream, idle_timeout: Option<Duration>) -> Result<Option<Vec<u8>>, ChatError> {
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, body.next())
            .await
            .map_err(|_| ChatError::Timeout(limit))?,
        None => body.next().await,
    };
    next.transpose()
}

// Applies one decoded line. Returns true once the terminal chunk has been handled.
async fn handle_chunk(
    state: &SessionState,
    message_id: Uuid,
    processor: &mut StreamProcessor,
    decoded: Result<ChatResponseChunk, ChatError>,
) -> Result<bool, ChatError> {
    let chunk = match decoded {
        Ok(chunk) => chunk,
        Err(e) if e.is_recoverable() => {
            log::warn!("Stream [{}]: skipping undecodable line: {}", message_id, e);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    if let Some(error) = &chunk.error {
        return Err(ChatError::Server(error.clone()));
    }

    let now = Instant::now();
    let snapshot = {
        let mut conversation = state.conversation.lock().await;
        let Some(message) = conversation.get_mut(message_id) else {
            // Conversation was cleared under us
            return Err(ChatError::Cancelled);
        };
        let notify = processor.apply(message, &chunk, now);
        notify.then(|| message.clone())
    };
    if let Some(snapshot) = snapshot {
        state.emit(ChatEvent::MessageUpdated(snapshot));
    }
    if chunk.done {
        log::info!(
            "Stream [{}]: done (eval_count: {:?}, total_duration: {:?})",
            message_id,
            chunk.eval_count,
            chunk.total_duration
        );
    }
    Ok(chunk.done)
}

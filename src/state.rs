use crate::api::{ChatProvider, ModelDetails};
use crate::config::ChatSettings;
use crate::error::ChatError;
use crate::models::{ChatMessage, Conversation};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    Completed,
    Stopped,
    Failed,
}

/// Change notifications for observers of a session. Message payloads are
/// snapshots taken right after the change.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageAdded(ChatMessage),
    MessageUpdated(ChatMessage),
    MessagesRemoved(Vec<Uuid>),
    StreamFinished { message_id: Uuid, outcome: StreamOutcome },
    Error { message_id: Option<Uuid>, message: String },
    ConversationCleared,
}

// Shared state behind a chat session, cloned into each stream task
#[derive(Clone)]
pub struct SessionState {
    // Every mutation of the message list goes through this lock.
    pub conversation: Arc<Mutex<Conversation>>,
    pub settings: Arc<RwLock<ChatSettings>>,
    pub model_details: Arc<RwLock<Option<ModelDetails>>>,
    pub api_provider: Arc<dyn ChatProvider>,
    pub events: broadcast::Sender<ChatEvent>,
    pub cancel_signals: Arc<DashMap<Uuid, oneshot::Sender<()>>>,
    // Most recently started stream; the only one `cancel` reaches.
    pub current_stream: Arc<Mutex<Option<Uuid>>>,
    pub idle_timeout: Option<Duration>,
}

impl SessionState {
    pub fn new(api_provider: Arc<dyn ChatProvider>, settings: ChatSettings, idle_timeout: Option<Duration>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conversation: Arc::new(Mutex::new(Conversation::default())),
            settings: Arc::new(RwLock::new(settings)),
            model_details: Arc::new(RwLock::new(None)),
            api_provider,
            events,
            cancel_signals: Arc::new(DashMap::new()),
            current_stream: Arc::new(Mutex::new(None)),
            idle_timeout,
        }
    }

    pub fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Applies `f` to a message and publishes the result.
    pub async fn update_message<R>(&self, id: Uuid, f: impl FnOnce(&mut ChatMessage) -> R) -> Option<R> {
        let (result, snapshot) = {
            let mut conversation = self.conversation.lock().await;
            let message = conversation.get_mut(id)?;
            let result = f(message);
            (result, message.clone())
        };
        self.emit(ChatEvent::MessageUpdated(snapshot));
        Some(result)
    }

    /// Like `update_message`, but only publishes when `f` succeeds.
    pub async fn try_update_message(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut ChatMessage) -> Result<(), ChatError>,
    ) -> Result<(), ChatError> {
        let snapshot = {
            let mut conversation = self.conversation.lock().await;
            let message = conversation.get_mut(id).ok_or(ChatError::MessageNotFound(id))?;
            f(message)?;
            message.clone()
        };
        self.emit(ChatEvent::MessageUpdated(snapshot));
        Ok(())
    }

    pub async fn register_stream(&self, message_id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.cancel_signals.insert(message_id, tx);
        *self.current_stream.lock().await = Some(message_id);
        rx
    }

    /// Must be called after the stream's receiver is dropped. A retry may already
    /// have registered a new stream for the same message; its signal is kept.
    pub async fn finish_stream(&self, message_id: Uuid) {
        self.cancel_signals.remove_if(&message_id, |_, signal| signal.is_closed());
        if self.cancel_signals.contains_key(&message_id) {
            return;
        }
        let mut current = self.current_stream.lock().await;
        if *current == Some(message_id) {
            *current = None;
        }
    }

    /// Signals the most recent stream and forgets it, so a second call does nothing.
    pub async fn cancel_current(&self) -> Option<Uuid> {
        let message_id = self.current_stream.lock().await.take()?;
        let (_, signal) = self.cancel_signals.remove(&message_id)?;
        log::info!("Cancellation signal sent for message ID: {}", message_id);
        let _ = signal.send(());
        Some(message_id)
    }

    pub async fn cancel_all(&self) {
        self.current_stream.lock().await.take();
        let ids: Vec<Uuid> = self.cancel_signals.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, signal)) = self.cancel_signals.remove(&id) {
                let _ = signal.send(());
            }
        }
    }
}

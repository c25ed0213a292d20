#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use mocolamma_lib::api::{ByteStream, ChatProvider, ChatRequest, ModelDetails, ModelSummary};
use mocolamma_lib::{ChatError, ChatEvent, StreamOutcome};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type Delivery = Result<Vec<u8>, ChatError>;

/// Answers each chat request with the next scripted body and records the request.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<ByteStream, ChatError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    pub details: ModelDetails,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a body delivered as the given pieces, one delivery each.
    pub fn push_deliveries(&self, pieces: Vec<Vec<u8>>) {
        let stream = futures::stream::iter(pieces.into_iter().map(Ok::<Vec<u8>, ChatError>));
        self.push_stream(Box::pin(stream));
    }

    /// Queues a body with one delivery per JSON line.
    pub fn push_lines(&self, lines: &[&str]) {
        self.push_deliveries(lines.iter().map(|l| line(l)).collect());
    }

    /// Queues a body the test feeds by hand.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<Delivery> {
        let (tx, rx) = mpsc::unbounded();
        self.push_stream(Box::pin(rx));
        tx
    }

    pub fn push_stream(&self, stream: ByteStream) {
        self.responses.lock().unwrap().push_back(Ok(stream));
    }

    pub fn push_error(&self, error: ChatError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn open_chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ChatError::Connection("no scripted response".into())))
    }

    async fn list_models(&self) -> Result<Vec<ModelSummary>, ChatError> {
        Ok(Vec::new())
    }

    async fn show_model(&self, _model: &str) -> Result<ModelDetails, ChatError> {
        Ok(self.details.clone())
    }

    async fn version(&self) -> Result<String, ChatError> {
        Ok("0.0.0-test".into())
    }
}

pub fn line(json: &str) -> Vec<u8> {
    format!("{json}\n").into_bytes()
}

pub fn content_chunk(content: &str) -> String {
    serde_json::json!({
        "model": "demo:1b",
        "created_at": "2025-05-01T10:00:00Z",
        "message": {"role": "assistant", "content": content},
        "done": false
    })
    .to_string()
}

pub fn done_chunk(eval_count: u64) -> String {
    serde_json::json!({
        "model": "demo:1b",
        "created_at": "2025-05-01T10:00:02Z",
        "message": {"role": "assistant", "content": ""},
        "done": true,
        "done_reason": "stop",
        "total_duration": 500_000_000u64,
        "eval_count": eval_count,
        "eval_duration": 200_000_000u64
    })
    .to_string()
}

/// Waits until an update of `message_id` displays exactly `expected`.
pub async fn wait_for_display(events: &mut broadcast::Receiver<ChatEvent>, message_id: Uuid, expected: &str) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(ChatEvent::MessageUpdated(message))
                    if message.id == message_id && message.display_content() == expected =>
                {
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("message never displayed {expected:?}"))
}

/// Waits for the `StreamFinished` event of `message_id`.
pub async fn wait_finished(events: &mut broadcast::Receiver<ChatEvent>, message_id: Uuid) -> StreamOutcome {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(ChatEvent::StreamFinished { message_id: id, outcome }) if id == message_id => {
                    return outcome;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("stream did not finish")
}

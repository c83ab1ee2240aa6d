//! Run progress events and the bus that fans them out to observers.
//!
//! Producers (run workers, stage handlers) push [`PipelineEvent`]s into one
//! unbounded queue. A single broadcaster task drains the queue and forwards
//! each event to every attached [`EventSink`]. Sinks never block the
//! broadcaster: a sink that cannot take an event right now misses it, and a
//! closed sink is detached. One queue and one drain loop keep events from the
//! same run in emission order.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use gantry_types::RunStatus;

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Start,
    StageStart,
    StageComplete,
    ArtifactProduced,
    TokenChunk,
    Paused,
    Completed,
    Error,
}

/// One progress notification. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub kind: EventKind,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl PipelineEvent {
    pub fn new(kind: EventKind, run_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn start(run_id: &str, pipeline: &str, title: &str) -> Self {
        Self::new(
            EventKind::Start,
            run_id,
            json!({"pipeline": pipeline, "title": title}),
        )
    }

    pub fn stage_start(run_id: &str, stage: &str) -> Self {
        Self::new(EventKind::StageStart, run_id, json!({"stage": stage}))
    }

    pub fn stage_complete(run_id: &str, stage: &str, success: bool, message: &str) -> Self {
        Self::new(
            EventKind::StageComplete,
            run_id,
            json!({"stage": stage, "success": success, "message": message}),
        )
    }

    pub fn artifact_produced(
        run_id: &str,
        stage: &str,
        name: &str,
        category: &str,
        location: &str,
    ) -> Self {
        Self::new(
            EventKind::ArtifactProduced,
            run_id,
            json!({"stage": stage, "name": name, "category": category, "location": location}),
        )
    }

    pub fn token_chunk(run_id: &str, stage: &str, text: &str) -> Self {
        Self::new(
            EventKind::TokenChunk,
            run_id,
            json!({"stage": stage, "text": text}),
        )
    }

    pub fn paused(run_id: &str, stage: &str) -> Self {
        Self::new(EventKind::Paused, run_id, json!({"stage": stage}))
    }

    pub fn completed(run_id: &str, status: RunStatus) -> Self {
        Self::new(
            EventKind::Completed,
            run_id,
            json!({"status": status.as_str()}),
        )
    }

    pub fn error(run_id: &str, message: &str) -> Self {
        Self::new(EventKind::Error, run_id, json!({"message": message}))
    }

    /// Serialize to the wire format `{"kind","runId","timestamp","payload"}`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Result of offering one event to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The sink could not take the event now; it stays attached.
    Skipped,
    /// The sink is gone and will be detached.
    Closed,
}

/// A subscriber endpoint. `deliver` must not block.
pub trait EventSink: Send {
    fn deliver(&mut self, event: &PipelineEvent) -> Delivery;
}

impl EventSink for mpsc::Sender<PipelineEvent> {
    fn deliver(&mut self, event: &PipelineEvent) -> Delivery {
        match self.try_send(event.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Skipped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Stream of events handed to a subscriber.
pub type EventStream = ReceiverStream<PipelineEvent>;

// ---------------------------------------------------------------------------
// Token assembly
// ---------------------------------------------------------------------------

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("newline pattern is valid"));

/// Reassembles streamed generator fragments into display-ready text.
///
/// Complete escape sequences (`\n`, `\"`, `\t`) are unescaped and three or
/// more newlines collapse to two. A buffer ending in an unpaired backslash is
/// held back until the next fragment completes the sequence.
#[derive(Debug, Default)]
pub struct TokenAssembler {
    buffer: String,
}

impl TokenAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment; returns text ready to flush, if any.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);
        let cleaned = self
            .buffer
            .replace("\\n", "\n")
            .replace("\\\"", "\"")
            .replace("\\t", "\t");
        self.buffer = EXCESS_NEWLINES.replace_all(&cleaned, "\n\n").into_owned();

        if ends_with_dangling_backslash(&self.buffer) || self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    /// Take whatever is buffered, including a dangling backslash.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

fn ends_with_dangling_backslash(text: &str) -> bool {
    let trailing = text.chars().rev().take_while(|c| *c == '\\').count();
    trailing % 2 == 1
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

enum Command {
    Publish(PipelineEvent),
    Attach(Box<dyn EventSink>),
    Count(oneshot::Sender<usize>),
    Close,
}

struct Shared {
    queue: mpsc::UnboundedSender<Command>,
    capacity: usize,
    assemblers: Mutex<HashMap<String, TokenAssembler>>,
}

/// Multiplexes run events to any number of live subscribers.
///
/// Cloning is cheap; all clones feed the same broadcaster. The broadcaster
/// task exits once every clone has been dropped.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Create a bus whose channel subscribers buffer up to `capacity` events.
    ///
    /// Spawns the broadcaster, so this must be called inside a tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(broadcast_loop(rx));
        Self {
            shared: Arc::new(Shared {
                queue,
                capacity: capacity.max(1),
                assemblers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueue an event for delivery. Never blocks.
    pub fn publish(&self, event: PipelineEvent) {
        if self.shared.queue.send(Command::Publish(event)).is_err() {
            tracing::debug!("Event bus broadcaster has stopped, dropping event");
        }
    }

    /// Attach a custom sink. It receives every event published afterwards.
    pub fn attach(&self, sink: Box<dyn EventSink>) {
        if self.shared.queue.send(Command::Attach(sink)).is_err() {
            tracing::debug!("Event bus broadcaster has stopped, sink not attached");
        }
    }

    /// Attach a channel subscriber and return its stream.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        self.attach(Box::new(tx));
        ReceiverStream::new(rx)
    }

    /// Number of attached sinks, observed after every command queued so far.
    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.shared.queue.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Detach every sink once the events queued so far are delivered.
    ///
    /// Channel subscribers see their stream end after the last of those
    /// events. Sinks attached later are unaffected.
    pub fn close_subscribers(&self) {
        if self.shared.queue.send(Command::Close).is_err() {
            tracing::debug!("Event bus broadcaster has stopped, nothing to close");
        }
    }

    /// Feed a generator fragment for `run_id` through its token assembler.
    pub fn emit_token(&self, run_id: &str, stage: &str, fragment: &str) {
        let mut assemblers = self
            .shared
            .assemblers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ready = assemblers
            .entry(run_id.to_string())
            .or_default()
            .push(fragment);
        if let Some(text) = ready {
            self.publish(PipelineEvent::token_chunk(run_id, stage, &text));
        }
    }

    /// Flush and drop the token buffer of `run_id`. Called at stage boundaries.
    pub fn flush_tokens(&self, run_id: &str, stage: &str) {
        let mut assemblers = self
            .shared
            .assemblers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(mut assembler) = assemblers.remove(run_id) {
            if let Some(text) = assembler.flush() {
                self.publish(PipelineEvent::token_chunk(run_id, stage, &text));
            }
        }
    }
}

async fn broadcast_loop(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Publish(event) => {
                sinks.retain_mut(|sink| match sink.deliver(&event) {
                    Delivery::Delivered => true,
                    Delivery::Skipped => {
                        tracing::warn!(run = %event.run_id, kind = ?event.kind, "Subscriber busy, event skipped");
                        true
                    }
                    Delivery::Closed => false,
                });
            }
            Command::Attach(sink) => sinks.push(sink),
            Command::Count(reply) => {
                let _ = reply.send(sinks.len());
            }
            Command::Close => {
                tracing::debug!(sinks = sinks.len(), "Detaching event sinks");
                sinks.clear();
            }
        }
    }
    tracing::debug!("Event bus broadcaster finished");
}

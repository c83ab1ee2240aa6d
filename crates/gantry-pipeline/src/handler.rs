//! Stage handler trait and the context a handler runs with.

use async_trait::async_trait;
use serde_json::Value;

use gantry_types::{Fields, GantryError, Result, StageOutput};

use crate::cancellation::CancellationToken;
use crate::events::EventBus;

// ---------------------------------------------------------------------------
// StageHandler trait
// ---------------------------------------------------------------------------

/// The single extension point of the engine.
///
/// A handler receives the run's fields restricted to the stage's declared
/// inputs and returns a [`StageOutput`]. Returning `Err(Cancelled)` stops the
/// run; any other `Err` is recorded as a stage-level failure.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Short identifier used in logs (e.g. "generative", "executor").
    fn handler_type(&self) -> &str;

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput>;
}

// ---------------------------------------------------------------------------
// TokenEmitter
// ---------------------------------------------------------------------------

/// Forwards streamed fragments to the event bus, refusing once the run has
/// been asked to stop.
#[derive(Clone)]
pub struct TokenEmitter {
    run_id: String,
    stage_id: String,
    cancel: CancellationToken,
    bus: Option<EventBus>,
}

impl TokenEmitter {
    pub fn emit(&self, fragment: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(GantryError::Cancelled {
                run_id: self.run_id.clone(),
            });
        }
        if let Some(bus) = &self.bus {
            bus.emit_token(&self.run_id, &self.stage_id, fragment);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StageContext
// ---------------------------------------------------------------------------

pub struct StageContext {
    pub run_id: String,
    pub stage_id: String,
    /// The payload the run was started with.
    pub input: Value,
    /// Run fields restricted to the stage's declared inputs.
    pub fields: Fields,
    cancel: CancellationToken,
    emitter: TokenEmitter,
}

impl StageContext {
    pub fn new(
        run_id: impl Into<String>,
        stage_id: impl Into<String>,
        input: Value,
        fields: Fields,
        cancel: CancellationToken,
        bus: Option<EventBus>,
    ) -> Self {
        let run_id = run_id.into();
        let stage_id = stage_id.into();
        let emitter = TokenEmitter {
            run_id: run_id.clone(),
            stage_id: stage_id.clone(),
            cancel: cancel.clone(),
            bus,
        };
        Self {
            run_id,
            stage_id,
            input,
            fields,
            cancel,
            emitter,
        }
    }

    /// A field value, with JSON `null` treated as absent.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(Value::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once a stop has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GantryError::Cancelled {
                run_id: self.run_id.clone(),
            })
        } else {
            Ok(())
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn emitter(&self) -> &TokenEmitter {
        &self.emitter
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn ctx_with(bus: Option<EventBus>, cancel: CancellationToken) -> StageContext {
        let mut fields = Fields::new();
        fields.insert("srs".into(), json!("the spec"));
        fields.insert("code".into(), Value::Null);
        StageContext::new(
            "run-1",
            "Developer",
            json!({"product_idea": "todo app"}),
            fields,
            cancel,
            bus,
        )
    }

    #[test]
    fn null_fields_read_as_absent() {
        let ctx = ctx_with(None, CancellationToken::new());
        assert_eq!(ctx.field_str("srs"), Some("the spec"));
        assert!(ctx.field("code").is_none());
        assert_eq!(ctx.input_str("product_idea"), Some("todo app"));
    }

    #[test]
    fn cancellation_is_visible_to_handler() {
        let cancel = CancellationToken::new();
        let ctx = ctx_with(None, cancel.clone());
        assert!(ctx.check_cancelled().is_ok());
        cancel.cancel("user");
        assert!(matches!(
            ctx.check_cancelled(),
            Err(GantryError::Cancelled { .. })
        ));
        assert!(ctx.emitter().emit("late").is_err());
    }

    #[tokio::test]
    async fn emitter_forwards_to_bus() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();
        let ctx = ctx_with(Some(bus.clone()), CancellationToken::new());

        ctx.emitter().emit("hello").unwrap();
        let event = stream.next().await.unwrap();
        assert_eq!(event.run_id, "run-1");
        assert_eq!(event.payload["stage"], "Developer");
        assert_eq!(event.payload["text"], "hello");
    }
}

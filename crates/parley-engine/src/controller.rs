use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tracing::{debug, field, info, instrument, warn, Span};

use parley_core::errors::ProviderError;
use parley_core::ids::{CycleId, SessionId};
use parley_core::messages::{Role, Turn};
use parley_core::provider::{GenerationClient, GenerationRequest};
use parley_core::stream::StreamEvent;
use parley_store::ConversationStore;
use parley_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::format::decorate;
use crate::transport::Transport;

/// Sent after every cycle, success or failure, so the client knows to stop waiting.
pub const FINISHED: &str = "Finished";

/// Sent in place of a response when generation fails.
pub const ERROR_MESSAGE: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

pub const DEFAULT_PREAMBLE: &str = "You are a friendly cooking assistant. Answer clearly, \
use markdown headers for sections and `* ` for list items, and label sections such as \
Ingredients:, Steps:, Tip: and Note: on their own line.";

const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(60 * 60);

const CYCLES_STARTED: &str = "cycles_started";
const CYCLES_COMPLETED: &str = "cycles_completed";
const CYCLES_FAILED: &str = "cycles_failed";
const DELIVERIES_SKIPPED: &str = "deliveries_skipped";
const GENERATION_MS: &str = "generation_ms";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Instruction text sent ahead of every history. Never stored.
    pub preamble: String,
    /// How long a disconnected session's history is kept.
    pub eviction_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_string(),
            eviction_grace: DEFAULT_EVICTION_GRACE,
        }
    }
}

/// Where a request cycle currently is. Recorded on the cycle's span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    AwaitingHistory,
    Streaming,
    Formatting,
    Delivering,
    Failed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingHistory => "awaiting_history",
            Self::Streaming => "streaming",
            Self::Formatting => "formatting",
            Self::Delivering => "delivering",
            Self::Failed => "failed",
        }
    }

    fn enter(self) {
        Span::current().record("phase", self.as_str());
    }
}

/// How a request cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Response and completion marker were queued to the client.
    Delivered,
    /// Generation succeeded but the session was no longer live.
    Skipped,
    /// Generation failed; the apology was sent if the session was live.
    Failed(EngineError),
}

/// Drives one prompt through history, generation, formatting and delivery.
pub struct SessionController {
    client: Arc<dyn GenerationClient>,
    store: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsRecorder>,
    config: ControllerConfig,
}

impl SessionController {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        store: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsRecorder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            store,
            transport,
            metrics,
            config,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Run one full request cycle for `prompt`. Never fails: errors are
    /// reported to the client as the apology message and to the caller via
    /// the returned outcome.
    ///
    /// Cycles on the same session run one at a time in arrival order.
    #[instrument(
        skip_all,
        fields(session_id = %session_id, cycle_id = field::Empty, phase = field::Empty)
    )]
    pub async fn handle_prompt(&self, session_id: &SessionId, prompt: impl Into<String>) -> CycleOutcome {
        let cycle_id = CycleId::new();
        Span::current().record("cycle_id", cycle_id.as_str());
        self.metrics.counter_inc(CYCLES_STARTED, &[], 1);

        let gate = self.store.turn_gate(session_id);
        let _turn = gate.lock().await;

        Phase::AwaitingHistory.enter();
        self.store.append(session_id, Turn::user(prompt));
        let history = self.store.snapshot(session_id);
        debug!(turns = history.len(), "history ready");

        Phase::Streaming.enter();
        let started = Instant::now();
        let raw = match self.generate(history).await {
            Ok(raw) => raw,
            Err(error) => return self.fail(session_id, error),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.histogram_observe(GENERATION_MS, &[], elapsed_ms);

        Phase::Formatting.enter();
        let formatted = decorate(&raw);

        // History is settled before the client sees the completion marker.
        self.store.append(session_id, Turn::assistant(raw));
        self.metrics.counter_inc(CYCLES_COMPLETED, &[], 1);

        Phase::Delivering.enter();
        let delivered = self.deliver(session_id, formatted);
        info!(elapsed_ms = elapsed_ms as u64, delivered, "cycle complete");

        if delivered {
            CycleOutcome::Delivered
        } else {
            CycleOutcome::Skipped
        }
    }

    /// Start a new conversation on the same connection. Waits for any cycle
    /// already running on the session, so its reply lands in the old history.
    pub async fn new_chat(&self, session_id: &SessionId) {
        let gate = self.store.turn_gate(session_id);
        let _turn = gate.lock().await;
        let existed = self.store.clear(session_id);
        info!(session_id = %session_id, existed, "conversation cleared");
    }

    /// The connection is gone. Its history is kept for the grace period.
    pub fn disconnect(&self, session_id: &SessionId, reason: &str) {
        info!(session_id = %session_id, reason, "client disconnected");
        self.store
            .schedule_eviction(session_id, self.config.eviction_grace);
    }

    pub fn transport_error(&self, session_id: &SessionId, error: &dyn std::error::Error) {
        warn!(session_id = %session_id, error = %error, "transport error");
    }

    async fn generate(&self, turns: Vec<Turn>) -> Result<String, EngineError> {
        let request = GenerationRequest::new(self.config.preamble.clone(), turns);
        let mut stream = self.client.submit(&request).await?;

        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta { delta } => text.push_str(&delta),
                StreamEvent::Done => return Ok(text),
                StreamEvent::Error { error } => return Err(error.into()),
                StreamEvent::Start => {}
            }
        }

        Err(ProviderError::StreamInterrupted("stream ended without completion".into()).into())
    }

    fn fail(&self, session_id: &SessionId, error: EngineError) -> CycleOutcome {
        Phase::Failed.enter();
        let kind = error.error_kind();
        warn!(error_kind = kind, error = %error, "generation failed");
        self.metrics
            .counter_inc(CYCLES_FAILED, &[("kind", kind)], 1);

        self.store.discard_last(session_id, Role::User);
        self.deliver(session_id, ERROR_MESSAGE.to_string());
        CycleOutcome::Failed(error)
    }

    /// Queue `text` and then the completion marker, back to back. The marker
    /// is attempted even when the text could not be queued.
    fn deliver(&self, session_id: &SessionId, text: String) -> bool {
        if !self.transport.is_live(session_id) {
            debug!("session not live, delivery skipped");
            self.metrics.counter_inc(DELIVERIES_SKIPPED, &[], 1);
            return false;
        }
        let content = self.transport.emit(session_id, text);
        if !content {
            warn!("response frame dropped");
        }
        let finished = self.transport.emit(session_id, FINISHED.to_string());
        content && finished
    }
}

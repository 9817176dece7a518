use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use parley_core::errors::ProviderError;
use parley_core::stream::StreamEvent;

/// Translates Anthropic Messages API server-sent events into `StreamEvent`s.
///
/// Only text content is relayed; thinking and tool blocks are ignored.
#[derive(Default)]
pub struct SseParser {
    input_tokens: u32,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single SSE event and return zero or more StreamEvents.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStartEvent>(data) {
                    if let Some(usage) = msg.message.usage {
                        self.input_tokens = usage.input_tokens.unwrap_or(0);
                    }
                }
                events.push(StreamEvent::Start);
            }

            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_str::<ContentBlockDeltaEvent>(data) {
                    if delta.delta.get("type").and_then(|t| t.as_str()) == Some("text_delta") {
                        let text = delta
                            .delta
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or("");
                        events.push(StreamEvent::text(text));
                    }
                }
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDeltaEvent>(data) {
                    let output_tokens = delta.usage.and_then(|u| u.output_tokens).unwrap_or(0);
                    let stop_reason = delta.delta.and_then(|d| d.stop_reason);
                    debug!(
                        input_tokens = self.input_tokens,
                        output_tokens,
                        stop_reason = stop_reason.as_deref().unwrap_or("none"),
                        "generation finished"
                    );
                    if is_truncated(stop_reason.as_deref()) {
                        warn!(output_tokens, "response truncated at max_tokens");
                    }
                }
            }

            "message_stop" => events.push(StreamEvent::Done),

            "error" => {
                let error = match serde_json::from_str::<ErrorEvent>(data) {
                    Ok(err) => classify_error(&err),
                    Err(_) => ProviderError::StreamInterrupted(format!("malformed error event: {data}")),
                };
                events.push(StreamEvent::Error { error });
            }

            _ => {} // ping, content_block_start/stop
        }

        events
    }

}

fn is_truncated(stop_reason: Option<&str>) -> bool {
    stop_reason == Some("max_tokens")
}

fn classify_error(err: &ErrorEvent) -> ProviderError {
    match err.error.error_type.as_str() {
        "overloaded_error" => ProviderError::ProviderOverloaded,
        "rate_limit_error" => ProviderError::RateLimited { retry_after: None },
        "authentication_error" | "permission_error" => {
            ProviderError::AuthenticationFailed(err.error.message.clone())
        }
        "invalid_request_error" | "not_found_error" => {
            ProviderError::InvalidRequest(err.error.message.clone())
        }
        _ => ProviderError::ServerError {
            status: 500,
            body: err.error.message.clone(),
        },
    }
}

/// Parse raw SSE text into (event_type, data) pairs.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data.strip_prefix(' ').unwrap_or(data));
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((
                std::mem::take(&mut current_event),
                std::mem::take(&mut current_data),
            ));
        } else if line.is_empty() {
            current_data.clear();
        }
    }

    // Trailing event without blank line
    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

// --- Deserialization types for Anthropic SSE events ---

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    delta: Value,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

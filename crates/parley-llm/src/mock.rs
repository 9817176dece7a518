use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use parley_core::errors::ProviderError;
use parley_core::provider::{EventStream, GenerationClient, GenerationRequest};
use parley_core::stream::StreamEvent;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Return an error from the submit() call itself.
    Error(ProviderError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete stream carrying `text` as a single delta.
    pub fn stream_text(text: &str) -> Self {
        Self::stream_chunks(&[text])
    }

    /// A complete stream carrying each chunk as its own delta.
    pub fn stream_chunks(chunks: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::text(*c)));
        events.push(StreamEvent::Done);
        Self::Stream(events)
    }

    /// A stream that delivers some text and then fails.
    pub fn stream_error(partial: &str, error: ProviderError) -> Self {
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::text(partial),
            StreamEvent::Error { error },
        ])
    }

    /// A stream that stops without a terminal event.
    pub fn truncated(partial: &str) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::text(partial)])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock client that returns pre-programmed responses in sequence and records
/// every request it receives.
pub struct MockClient {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl GenerationClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<EventStream, ProviderError> {
        self.requests.lock().push(request.clone());
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        let Some(response) = self.responses.get(idx).cloned() else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockClient: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, unrolling nested delays iteratively.
async fn resolve_response(response: MockResponse) -> Result<EventStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

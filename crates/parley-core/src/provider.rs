use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::ProviderError;
use crate::messages::Turn;
use crate::stream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Everything sent to the generation service for one request cycle.
#[derive(Clone, Debug, Default)]
pub struct GenerationRequest {
    /// Fixed instruction text placed ahead of the conversation. Never stored in history.
    pub preamble: String,
    /// Full ordered history, newest user turn last.
    pub turns: Vec<Turn>,
}

impl GenerationRequest {
    pub fn new(preamble: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            preamble: preamble.into(),
            turns,
        }
    }
}

/// Boundary to a remote text-generation provider.
///
/// `submit` fails when the call cannot be established. Once it returns, the
/// stream is finite and cannot be restarted.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn submit(&self, request: &GenerationRequest) -> Result<EventStream, ProviderError>;
}

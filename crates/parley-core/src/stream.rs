use crate::errors::ProviderError;

/// Events emitted by a generation stream. Ordering contract:
///
/// Start → TextDelta* → Done
///
/// Error can appear at any point and ends the stream. A stream that runs out
/// without `Done` terminated abnormally.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta { delta: String },
    Done,
    Error { error: ProviderError },
}

impl StreamEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

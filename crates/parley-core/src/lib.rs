pub mod errors;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod stream;

pub use errors::ProviderError;
pub use ids::{CycleId, SessionId};
pub use messages::{Role, Turn};
pub use provider::{EventStream, GenerationClient, GenerationRequest};
pub use stream::StreamEvent;

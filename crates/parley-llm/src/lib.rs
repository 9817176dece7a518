pub mod anthropic;
pub mod mock;
pub mod sse;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use mock::{MockClient, MockResponse};

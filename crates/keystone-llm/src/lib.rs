pub mod anthropic;
pub mod models;
pub mod openai;
pub mod registry;
pub mod sse;

pub mod mock;

pub use anthropic::AnthropicProvider;
pub use mock::{MockProvider, MockResponse};
pub use openai::OpenAiProvider;
pub use registry::{create_provider, ProviderConfig};

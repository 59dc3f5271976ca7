//! Model providers.

pub mod openai;
pub mod reasoning;
pub mod shared;

pub use openai::{OpenAIChatClient, OpenAIChatConfig};
pub use shared::{
    ModelClient, ProviderError, ProviderErrorKind, ProviderResult, ProviderStream, StreamEvent,
    Usage,
};

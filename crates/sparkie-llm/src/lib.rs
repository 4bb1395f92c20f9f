//! Clients for the remote model services Sparkie talks to: an
//! OpenAI-compatible chat-completion endpoint and an image-generation
//! endpoint.

pub mod chat;
pub mod error;
pub mod image;
mod sse;

pub use chat::{ChatClient, ChatOptions, OpenAiCompatClient, TextStream};
pub use error::UpstreamError;
pub use image::{GeneratedImage, ImageClient, ImageSize, SUPPORTED_SIZES};

use std::time::Duration;

/// Connect and read-gap timeout for upstream calls; also the overall cap on
/// buffered ones.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

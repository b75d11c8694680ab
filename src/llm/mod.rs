pub mod antigravity;
pub mod anthropic;
pub mod client;
pub mod gemini;
pub mod models;
pub mod openai;

pub use client::{ChatResult, Client, Message, ToolCall, ToolDefinition};
pub use models::{ModelInfo, ProbeStatus};

use thiserror::Error;

/// Typed error hierarchy for pincer.
///
/// Used at module boundaries (provider routing, channel lookup, config
/// loading). Internal/leaf functions keep `anyhow::Result` — the
/// `Internal` variant converts seamlessly via `?`.
#[derive(Debug, Error)]
pub enum PincerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("channel error: {channel}: {message}")]
    Channel { channel: String, message: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PincerResult<T> = std::result::Result<T, PincerError>;

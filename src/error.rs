//! Error types for the vector-quantized transformer.

use thiserror::Error;

/// A configuration that cannot be turned into a model.
///
/// Raised synchronously while building modules; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Transformer2D over discrete input must provide sample_size")]
    MissingSampleSize,

    #[error("Transformer2D over discrete input must provide num_vector_embeds")]
    MissingNumVectorEmbeds,

    #[error("sample_size must be positive")]
    ZeroSampleSize,

    #[error("num_vector_embeds must be at least 1 (the mask token)")]
    EmptyVocabulary,

    #[error("norm_type ada_norm requires num_embeds_ada_norm")]
    MissingAdaNormEmbeds,

    #[error("unsupported {option}: {value}")]
    Unsupported {
        option: &'static str,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("missing forward input: {0}")]
    MissingInput(&'static str),

    #[error("invalid forward input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the configuration error, if this is one.
    #[must_use]
    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

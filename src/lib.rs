#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod model;
pub mod weights;

pub use error::{ConfigError, Error, Result};
pub use model::{Transformer2DConfig, VectorizedTransformer2D};

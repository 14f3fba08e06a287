pub mod attention;
pub mod config;
pub mod embedding;
pub mod layers;
pub mod transformer;

// Re-exports for convenience
pub use attention::Attention;
pub use config::{ActivationKind, AttentionType, LatentGeometry, NormType, Transformer2DConfig};
pub use embedding::ImagePositionalEmbeddings;
pub use layers::{AdaLayerNorm, BasicTransformerBlock, BlockOptions, FeedForward};
pub use transformer::{
    DiscreteLatentInput, LatentInput, OutputHead, Transformer2D, VectorizedTransformer2D,
    load_model, load_model_from_bytes,
};

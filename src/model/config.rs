use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Feed-forward activation, named as in diffusers `config.json` files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivationKind {
    /// Exact (erf) GELU
    #[serde(rename = "gelu")]
    Gelu,
    /// Tanh-approximated GELU
    #[serde(rename = "gelu-approximate")]
    GeluApproximate,
    /// Gated GELU: projects to twice the hidden width and gates one half with the other
    #[default]
    #[serde(rename = "geglu")]
    Geglu,
    /// Sigmoid-approximated GELU, `x * sigmoid(1.702 * x)`
    #[serde(rename = "geglu-approximate")]
    GegluApproximate,
}

/// Normalization applied before each attention sub-layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormType {
    #[default]
    LayerNorm,
    /// Timestep-conditioned layer norm
    AdaNorm,
    AdaNormZero,
    AdaNormSingle,
}

impl NormType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LayerNorm => "layer_norm",
            Self::AdaNorm => "ada_norm",
            Self::AdaNormZero => "ada_norm_zero",
            Self::AdaNormSingle => "ada_norm_single",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionType {
    #[default]
    Default,
    Gated,
    GatedTextImage,
}

impl AttentionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Gated => "gated",
            Self::GatedTextImage => "gated-text-image",
        }
    }
}

/// Hyperparameters of a 2D transformer over discrete latent codes.
///
/// Field names match the diffusers `Transformer2DModel` config so an exported
/// `config.json` deserializes directly. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transformer2DConfig {
    /// Number of attention heads
    pub num_attention_heads: usize,
    /// Dimension per attention head
    pub attention_head_dim: usize,
    /// Input channels (continuous inputs only; recorded for discrete models)
    pub in_channels: Option<usize>,
    /// Number of transformer blocks
    pub num_layers: usize,
    /// Dropout probability (a no-op at inference)
    pub dropout: f32,
    /// Width of the encoder hidden states used for cross-attention
    pub cross_attention_dim: Option<usize>,
    /// Whether the q/k/v projections carry a bias
    pub attention_bias: bool,
    /// Side length of the square latent grid
    pub sample_size: Option<usize>,
    /// Codebook size including the mask token
    pub num_vector_embeds: Option<usize>,
    /// Model width; defaults to `num_attention_heads * attention_head_dim`
    pub inner_dim: Option<usize>,
    pub activation_fn: ActivationKind,
    /// Number of diffusion timesteps for ada-norm conditioning
    pub num_embeds_ada_norm: Option<usize>,
    pub only_cross_attention: bool,
    pub double_self_attention: bool,
    pub upcast_attention: bool,
    pub norm_type: NormType,
    pub norm_elementwise_affine: bool,
    pub norm_eps: f64,
    pub attention_type: AttentionType,
}

impl Default for Transformer2DConfig {
    fn default() -> Self {
        Self {
            num_attention_heads: 16,
            attention_head_dim: 88,
            in_channels: None,
            num_layers: 1,
            dropout: 0.0,
            cross_attention_dim: None,
            attention_bias: false,
            sample_size: None,
            num_vector_embeds: None,
            inner_dim: None,
            activation_fn: ActivationKind::Geglu,
            num_embeds_ada_norm: None,
            only_cross_attention: false,
            double_self_attention: false,
            upcast_attention: false,
            norm_type: NormType::LayerNorm,
            norm_elementwise_affine: true,
            norm_eps: 1e-5,
            attention_type: AttentionType::Default,
        }
    }
}

/// Grid geometry derived from a discrete-input configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentGeometry {
    pub height: usize,
    pub width: usize,
    pub num_latent_pixels: usize,
    pub num_vector_embeds: usize,
}

impl LatentGeometry {
    /// Classes predicted by the output head: the mask token is never predicted.
    #[must_use]
    pub fn num_output_classes(&self) -> usize {
        self.num_vector_embeds - 1
    }
}

impl Transformer2DConfig {
    /// Model width seen by the embedding, blocks and output head.
    #[must_use]
    pub fn inner_dim(&self) -> usize {
        self.inner_dim
            .unwrap_or(self.num_attention_heads * self.attention_head_dim)
    }

    /// Resolve the discrete latent grid.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if `sample_size` or `num_vector_embeds` is absent
    /// (checked in that order) or degenerate.
    pub fn geometry(&self) -> std::result::Result<LatentGeometry, ConfigError> {
        let sample_size = self.sample_size.ok_or(ConfigError::MissingSampleSize)?;
        let num_vector_embeds = self
            .num_vector_embeds
            .ok_or(ConfigError::MissingNumVectorEmbeds)?;
        if sample_size == 0 {
            return Err(ConfigError::ZeroSampleSize);
        }
        if num_vector_embeds == 0 {
            return Err(ConfigError::EmptyVocabulary);
        }

        let height = sample_size;
        let width = sample_size;
        Ok(LatentGeometry {
            height,
            width,
            num_latent_pixels: height * width,
            num_vector_embeds,
        })
    }

    /// Norm type the blocks are built with.
    ///
    /// Older exports set `num_embeds_ada_norm` but leave `norm_type` at its
    /// default; those checkpoints were trained with ada-norm.
    ///
    /// This differs from handing the raw `norm_type` to the blocks, which would
    /// build plain layer norms and ignore `num_embeds_ada_norm`.
    #[must_use]
    pub fn effective_norm_type(&self) -> NormType {
        if self.norm_type == NormType::LayerNorm && self.num_embeds_ada_norm.is_some() {
            NormType::AdaNorm
        } else {
            self.norm_type
        }
    }

    /// Validate that the configuration can build a discrete-latent model.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.geometry()?;
        if self.effective_norm_type() == NormType::AdaNorm && self.num_embeds_ada_norm.is_none()
        {
            return Err(ConfigError::MissingAdaNormEmbeds);
        }
        match self.effective_norm_type() {
            NormType::LayerNorm | NormType::AdaNorm => {}
            other => {
                return Err(ConfigError::Unsupported {
                    option: "norm_type",
                    value: other.as_str().to_string(),
                });
            }
        }
        if self.attention_type != AttentionType::Default {
            return Err(ConfigError::Unsupported {
                option: "attention_type",
                value: self.attention_type.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Parse a diffusers-style `config.json` document.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or a field has the wrong type.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read and parse a `config.json` file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Tiny config for tests and smoke runs.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            num_attention_heads: 2,
            attention_head_dim: 8,
            num_layers: 2,
            sample_size: Some(4),
            num_vector_embeds: Some(10),
            cross_attention_dim: Some(12),
            num_embeds_ada_norm: Some(5),
            norm_type: NormType::AdaNorm,
            ..Self::default()
        }
    }

    /// Transformer of the published VQ-Diffusion ITHQ checkpoint.
    #[must_use]
    pub fn vq_diffusion_ithq() -> Self {
        Self {
            num_attention_heads: 16,
            attention_head_dim: 88,
            num_layers: 36,
            attention_bias: true,
            cross_attention_dim: Some(512),
            sample_size: Some(32),
            num_vector_embeds: Some(4097),
            activation_fn: ActivationKind::GegluApproximate,
            num_embeds_ada_norm: Some(100),
            norm_type: NormType::AdaNorm,
            ..Self::default()
        }
    }
}

//! Transformer block and its feed-forward / normalization sub-layers.

use candle_core::{D, Result, Tensor};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, Module, VarBuilder};

use super::attention::Attention;
use super::config::{ActivationKind, AttentionType, NormType, Transformer2DConfig};
use crate::error::{ConfigError, Error};

/// Layer norm that only reads `weight`/`bias` when `affine` is set.
fn layer_norm(dim: usize, eps: f64, affine: bool, vb: VarBuilder) -> Result<LayerNorm> {
    if affine {
        let config = candle_nn::LayerNormConfig {
            eps,
            ..Default::default()
        };
        candle_nn::layer_norm(dim, config, vb)
    } else {
        let weight = Tensor::ones(dim, vb.dtype(), vb.device())?;
        let bias = Tensor::zeros(dim, vb.dtype(), vb.device())?;
        Ok(LayerNorm::new(weight, bias, eps))
    }
}

/// Feed-forward network with 4x hidden expansion.
///
/// Layout follows diffusers: `net.0` is the activation (with its own input
/// projection), `net.1` dropout, `net.2` the output projection.
pub struct FeedForward {
    /// Input projection inside the activation (dim -> hidden, or 2 * hidden for GEGLU)
    proj_in: Linear,
    /// Output projection (hidden -> dim)
    proj_out: Linear,
    activation: ActivationKind,
    dropout: Dropout,
}

impl FeedForward {
    /// Create a new feed-forward layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        dim: usize,
        activation: ActivationKind,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden_dim = 4 * dim;
        let proj_width = match activation {
            ActivationKind::Geglu => 2 * hidden_dim,
            _ => hidden_dim,
        };

        let net = vb.pp("net");
        let proj_in = candle_nn::linear(dim, proj_width, net.pp("0").pp("proj"))?;
        let proj_out = candle_nn::linear(hidden_dim, dim, net.pp("2"))?;

        Ok(Self {
            proj_in,
            proj_out,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    /// Forward pass: (batch, seq_len, dim) -> (batch, seq_len, dim).
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.proj_in.forward(x)?;
        let h = match self.activation {
            ActivationKind::Gelu => h.gelu_erf()?,
            ActivationKind::GeluApproximate => h.gelu()?,
            ActivationKind::Geglu => {
                let chunks = h.chunk(2, D::Minus1)?;
                (&chunks[0] * chunks[1].gelu_erf()?)?
            }
            ActivationKind::GegluApproximate => {
                (&h * candle_nn::ops::sigmoid(&(&h * 1.702)?)?)?
            }
        };
        let h = self.dropout.forward(&h, false)?;
        self.proj_out.forward(&h)
    }
}

/// Layer norm modulated by a learned per-timestep scale and shift.
pub struct AdaLayerNorm {
    /// Timestep embeddings (num_embeddings, dim)
    emb: Embedding,
    /// Projection to scale and shift (dim -> 2 * dim)
    linear: Linear,
    norm: LayerNorm,
    dim: usize,
}

impl AdaLayerNorm {
    /// Create a new ada-norm layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(dim: usize, num_embeddings: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let emb = candle_nn::embedding(num_embeddings, dim, vb.pp("emb"))?;
        let linear = candle_nn::linear(dim, 2 * dim, vb.pp("linear"))?;
        let norm = layer_norm(dim, eps, false, vb.pp("norm"))?;
        Ok(Self {
            emb,
            linear,
            norm,
            dim,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Hidden states of shape (batch, seq_len, dim)
    /// * `timestep` - Timestep ids of shape (batch,) or (1,)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, timestep: &Tensor) -> Result<Tensor> {
        let emb = self.emb.forward(timestep)?.silu()?;
        let emb = self.linear.forward(&emb)?;

        // (B, 2 * dim) -> scale, shift of shape (B, 1, dim)
        let scale = emb.narrow(D::Minus1, 0, self.dim)?.unsqueeze(1)?;
        let shift = emb.narrow(D::Minus1, self.dim, self.dim)?.unsqueeze(1)?;

        let h = self.norm.forward(x)?;
        h.broadcast_mul(&(scale + 1.0)?)?.broadcast_add(&shift)
    }
}

/// Pre-attention normalization of a block.
pub enum BlockNorm {
    Layer(LayerNorm),
    Ada(AdaLayerNorm),
}

impl BlockNorm {
    #[allow(clippy::needless_pass_by_value)]
    fn new(dim: usize, options: &BlockOptions, vb: VarBuilder) -> crate::Result<Self> {
        match options.norm_type {
            NormType::LayerNorm => Ok(Self::Layer(layer_norm(
                dim,
                options.norm_eps,
                options.norm_elementwise_affine,
                vb,
            )?)),
            NormType::AdaNorm => {
                let num_embeddings = options
                    .num_embeds_ada_norm
                    .ok_or(ConfigError::MissingAdaNormEmbeds)?;
                Ok(Self::Ada(AdaLayerNorm::new(
                    dim,
                    num_embeddings,
                    options.norm_eps,
                    vb,
                )?))
            }
            other => Err(ConfigError::Unsupported {
                option: "norm_type",
                value: other.as_str().to_string(),
            }
            .into()),
        }
    }

    fn forward(&self, x: &Tensor, timestep: Option<&Tensor>) -> crate::Result<Tensor> {
        match self {
            Self::Layer(norm) => Ok(norm.forward(x)?),
            Self::Ada(norm) => {
                let timestep =
                    timestep.ok_or(Error::MissingInput("timestep (norm_type = ada_norm)"))?;
                Ok(norm.forward(x, timestep)?)
            }
        }
    }
}

/// Options shared by every block of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOptions {
    pub dropout: f32,
    pub cross_attention_dim: Option<usize>,
    pub activation_fn: ActivationKind,
    pub num_embeds_ada_norm: Option<usize>,
    pub attention_bias: bool,
    pub only_cross_attention: bool,
    pub double_self_attention: bool,
    pub upcast_attention: bool,
    pub norm_type: NormType,
    pub norm_elementwise_affine: bool,
    pub norm_eps: f64,
    pub attention_type: AttentionType,
}

impl BlockOptions {
    /// Block options carried by a model configuration.
    #[must_use]
    pub fn from_config(config: &Transformer2DConfig) -> Self {
        Self {
            dropout: config.dropout,
            cross_attention_dim: config.cross_attention_dim,
            activation_fn: config.activation_fn,
            num_embeds_ada_norm: config.num_embeds_ada_norm,
            attention_bias: config.attention_bias,
            only_cross_attention: config.only_cross_attention,
            double_self_attention: config.double_self_attention,
            upcast_attention: config.upcast_attention,
            norm_type: config.effective_norm_type(),
            norm_elementwise_affine: config.norm_elementwise_affine,
            norm_eps: config.norm_eps,
            attention_type: config.attention_type,
        }
    }

    /// Whether the block has a second attention sub-layer.
    #[must_use]
    pub fn has_second_attention(&self) -> bool {
        self.cross_attention_dim.is_some() || self.double_self_attention
    }

    /// Whether any attention sub-layer reads encoder hidden states.
    #[must_use]
    pub fn uses_context(&self) -> bool {
        self.cross_attention_dim.is_some()
            && (self.only_cross_attention || !self.double_self_attention)
    }
}

/// Transformer block with pre-norm architecture.
///
/// Structure: norm1 -> attn1 -> residual -> [norm2 -> attn2 -> residual] ->
/// norm3 -> feed-forward -> residual
pub struct BasicTransformerBlock {
    norm1: BlockNorm,
    /// Self-attention, or cross-attention when `only_cross_attention`
    attn1: Attention,
    norm2: Option<BlockNorm>,
    /// Cross-attention, or a second self-attention when `double_self_attention`
    attn2: Option<Attention>,
    norm3: LayerNorm,
    ff: FeedForward,
    only_cross_attention: bool,
    double_self_attention: bool,
}

impl BasicTransformerBlock {
    /// Create a new transformer block.
    ///
    /// # Arguments
    /// * `dim` - Width of the hidden states
    /// * `n_head`, `head_dim` - Attention head layout
    /// * `options` - Shared block options
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns [`Error::Config`] for unsupported options, or a candle error if
    /// weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        dim: usize,
        n_head: usize,
        head_dim: usize,
        options: &BlockOptions,
        vb: VarBuilder,
    ) -> crate::Result<Self> {
        if options.attention_type != AttentionType::Default {
            return Err(ConfigError::Unsupported {
                option: "attention_type",
                value: options.attention_type.as_str().to_string(),
            }
            .into());
        }

        let norm1 = BlockNorm::new(dim, options, vb.pp("norm1"))?;
        let attn1 = Attention::new(
            dim,
            options
                .cross_attention_dim
                .filter(|_| options.only_cross_attention),
            n_head,
            head_dim,
            options.attention_bias,
            options.dropout,
            options.upcast_attention,
            vb.pp("attn1"),
        )?;

        let (norm2, attn2) = if options.has_second_attention() {
            let norm2 = BlockNorm::new(dim, options, vb.pp("norm2"))?;
            let attn2 = Attention::new(
                dim,
                options
                    .cross_attention_dim
                    .filter(|_| !options.double_self_attention),
                n_head,
                head_dim,
                options.attention_bias,
                options.dropout,
                options.upcast_attention,
                vb.pp("attn2"),
            )?;
            (Some(norm2), Some(attn2))
        } else {
            (None, None)
        };

        let norm3 = layer_norm(
            dim,
            options.norm_eps,
            options.norm_elementwise_affine,
            vb.pp("norm3"),
        )?;
        let ff = FeedForward::new(dim, options.activation_fn, options.dropout, vb.pp("ff"))?;

        Ok(Self {
            norm1,
            attn1,
            norm2,
            attn2,
            norm3,
            ff,
            only_cross_attention: options.only_cross_attention,
            double_self_attention: options.double_self_attention,
        })
    }

    /// Forward pass through the block.
    ///
    /// # Arguments
    /// * `x` - Hidden states of shape (batch, seq_len, dim)
    /// * `context` - Encoder hidden states for cross-attention
    /// * `timestep` - Timestep ids, required by ada-norm blocks
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, dim)
    ///
    /// # Errors
    /// Returns [`Error::MissingInput`] if an ada-norm block gets no timestep, or a
    /// candle error if tensor operations fail.
    pub fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        timestep: Option<&Tensor>,
    ) -> crate::Result<Tensor> {
        let h = self.norm1.forward(x, timestep)?;
        let attn1_context = if self.only_cross_attention {
            context
        } else {
            None
        };
        let h = self.attn1.forward(&h, attn1_context)?;
        let mut x = (x + h)?;

        if let (Some(norm2), Some(attn2)) = (&self.norm2, &self.attn2) {
            let attn2_context = if self.double_self_attention {
                None
            } else {
                context
            };
            let h = norm2.forward(&x, timestep)?;
            let h = attn2.forward(&h, attn2_context)?;
            x = (x + h)?;
        }

        let h = self.norm3.forward(&x)?;
        let h = self.ff.forward(&h)?;
        Ok((x + h)?)
    }

    /// Whether this block has a second attention sub-layer.
    #[must_use]
    pub fn has_second_attention(&self) -> bool {
        self.attn2.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer_norm_options() -> BlockOptions {
        BlockOptions::from_config(&Transformer2DConfig {
            cross_attention_dim: None,
            num_embeds_ada_norm: None,
            norm_type: NormType::LayerNorm,
            ..Transformer2DConfig::tiny()
        })
    }

    #[test]
    fn test_feed_forward_activations_keep_shape() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        for activation in [
            ActivationKind::Gelu,
            ActivationKind::GeluApproximate,
            ActivationKind::Geglu,
            ActivationKind::GegluApproximate,
        ] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let ff = FeedForward::new(8, activation, 0.0, vb).unwrap();
            assert_eq!(ff.forward(&x).unwrap().dims(), &[2, 3, 8]);
        }
    }

    #[test]
    fn test_geglu_projects_to_double_width() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _ff = FeedForward::new(8, ActivationKind::Geglu, 0.0, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["net.0.proj.weight"].dims(), &[64, 8]);
        assert_eq!(data["net.2.weight"].dims(), &[8, 32]);
    }

    #[test]
    fn test_ada_layer_norm_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = AdaLayerNorm::new(8, 5, 1e-5, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        let t = Tensor::new(&[0u32, 4], &device).unwrap();
        assert_eq!(norm.forward(&x, &t).unwrap().dims(), &[2, 3, 8]);
    }

    #[test]
    fn test_ada_layer_norm_conditions_each_sample_on_its_timestep() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = AdaLayerNorm::new(8, 5, 1e-5, vb).unwrap();

        let row = Tensor::randn(0f32, 1.0, (1, 3, 8), &device).unwrap();
        let x = Tensor::cat(&[&row, &row], 0).unwrap();
        let batch_gap = |t: &[u32]| {
            let t = Tensor::new(t, &device).unwrap();
            let out = norm.forward(&x, &t).unwrap();
            let a = out.get(0).unwrap();
            let b = out.get(1).unwrap();
            (a - b)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
        };

        assert!(batch_gap(&[0, 4]) > 1e-4);
        assert!(batch_gap(&[4, 4]) < 1e-6);
    }

    #[test]
    fn test_self_attention_only_block() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = BasicTransformerBlock::new(16, 2, 8, &layer_norm_options(), vb).unwrap();
        assert!(!block.has_second_attention());

        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &device).unwrap();
        let y = block.forward(&x, None, None).unwrap();
        assert_eq!(y.dims(), &[1, 4, 16]);
    }

    #[test]
    fn test_double_self_attention_ignores_cross_dim() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let options = BlockOptions {
            cross_attention_dim: Some(12),
            double_self_attention: true,
            ..layer_norm_options()
        };
        let block = BasicTransformerBlock::new(16, 2, 8, &options, vb).unwrap();
        assert!(block.has_second_attention());
        assert!(!options.uses_context());

        {
            let data = varmap.data().lock().unwrap();
            assert_eq!(data["attn2.to_k.weight"].dims(), &[16, 16]);
        }

        // A context is accepted but never attended to
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &device).unwrap();
        let ctx = Tensor::randn(0f32, 1.0, (1, 3, 12), &device).unwrap();
        let y = block.forward(&x, Some(&ctx), None).unwrap();
        assert_eq!(y.dims(), &[1, 4, 16]);
    }

    #[test]
    fn test_ada_norm_block_requires_timestep() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let options = BlockOptions::from_config(&Transformer2DConfig::tiny());
        let block = BasicTransformerBlock::new(16, 2, 8, &options, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &device).unwrap();
        let ctx = Tensor::randn(0f32, 1.0, (1, 3, 12), &device).unwrap();
        let err = block.forward(&x, Some(&ctx), None).unwrap_err();
        assert!(matches!(err, Error::MissingInput(_)));

        let t = Tensor::new(&[2u32], &device).unwrap();
        let y = block.forward(&x, Some(&ctx), Some(&t)).unwrap();
        assert_eq!(y.dims(), &[1, 4, 16]);
    }

    #[test]
    fn test_gated_attention_is_a_config_error() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let options = BlockOptions {
            attention_type: AttentionType::GatedTextImage,
            ..layer_norm_options()
        };
        let err = BasicTransformerBlock::new(16, 2, 8, &options, vb)
            .err()
            .expect("gated attention should be rejected");
        assert!(err.as_config().is_some());
    }
}

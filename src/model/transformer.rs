//! 2D transformer over latent pixels.
//!
//! The block stack is shared by every input kind; how the input is embedded and
//! how hidden states are projected back out is chosen by a [`LatentInput`]
//! strategy. [`VectorizedTransformer2D`] is the discrete (vector-quantized) model.

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{LayerNorm, Linear, Module, VarBuilder};

use super::config::{LatentGeometry, Transformer2DConfig};
use super::embedding::ImagePositionalEmbeddings;
use super::layers::{BasicTransformerBlock, BlockOptions};
use crate::error::{Error, Result};

/// Input embedding and output projection of a [`Transformer2D`].
pub trait LatentInput: Sized {
    /// Validate the configuration for this input kind and build its parameters.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if required options are absent.
    fn build(config: &Transformer2DConfig, vb: VarBuilder) -> Result<Self>;

    /// Map a raw sample to hidden states of shape (batch, seq_len, inner_dim).
    ///
    /// # Errors
    /// Returns an error if the sample does not fit the model.
    fn embed(&self, sample: &Tensor) -> Result<Tensor>;

    /// Map final hidden states to the model output.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    fn project(&self, hidden: &Tensor) -> Result<Tensor>;
}

/// Output head of the discrete model: layer norm then a linear map to the
/// codebook without the mask token.
pub struct OutputHead {
    norm_out: LayerNorm,
    out: Linear,
    out_features: usize,
}

impl OutputHead {
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(inner_dim: usize, num_classes: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let norm_out = candle_nn::layer_norm(
            inner_dim,
            candle_nn::LayerNormConfig::default(),
            vb.pp("norm_out"),
        )?;
        let out = candle_nn::linear(inner_dim, num_classes, vb.pp("out"))?;
        Ok(Self {
            norm_out,
            out,
            out_features: num_classes,
        })
    }

    /// (batch, seq_len, inner_dim) -> logits (batch, seq_len, num_classes)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.norm_out.forward(x)?;
        self.out.forward(&h)
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.out.weight().dims().get(1).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

/// Input strategy for grids of codebook indices.
pub struct DiscreteLatentInput {
    geometry: LatentGeometry,
    latent_image_embedding: ImagePositionalEmbeddings,
    head: OutputHead,
}

impl DiscreteLatentInput {
    #[must_use]
    pub fn geometry(&self) -> LatentGeometry {
        self.geometry
    }

    #[must_use]
    pub fn latent_image_embedding(&self) -> &ImagePositionalEmbeddings {
        &self.latent_image_embedding
    }

    #[must_use]
    pub fn output_head(&self) -> &OutputHead {
        &self.head
    }
}

impl LatentInput for DiscreteLatentInput {
    #[allow(clippy::needless_pass_by_value)]
    fn build(config: &Transformer2DConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let geometry = config.geometry()?;
        let inner_dim = config.inner_dim();

        let latent_image_embedding = ImagePositionalEmbeddings::new(
            geometry.num_vector_embeds,
            inner_dim,
            geometry.height,
            geometry.width,
            vb.pp("latent_image_embedding"),
        )?;
        let head = OutputHead::new(inner_dim, geometry.num_output_classes(), vb)?;

        Ok(Self {
            geometry,
            latent_image_embedding,
            head,
        })
    }

    fn embed(&self, sample: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = sample.dims2().map_err(|_| {
            Error::InvalidInput(format!(
                "expected (batch, pixels) indices, got {:?}",
                sample.dims()
            ))
        })?;
        if seq_len > self.geometry.num_latent_pixels {
            return Err(Error::InvalidInput(format!(
                "{seq_len} latent pixels exceed the {}x{} grid",
                self.geometry.height, self.geometry.width
            )));
        }
        if sample.elem_count() > 0 {
            let codes = sample.to_dtype(DType::I64)?;
            let lo = codes.min_all()?.to_scalar::<i64>()?;
            let hi = codes.max_all()?.to_scalar::<i64>()?;
            #[allow(clippy::cast_possible_wrap)]
            let codebook = self.geometry.num_vector_embeds as i64;
            if lo < 0 || hi >= codebook {
                return Err(Error::InvalidInput(format!(
                    "latent codes must lie in [0, {codebook}), got range [{lo}, {hi}]"
                )));
            }
        }
        Ok(self.latent_image_embedding.forward(sample)?)
    }

    /// Log-probabilities of shape (batch, num_vector_embeds - 1, seq_len).
    fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        // Codebook holding only the mask token: nothing to normalize over
        if self.head.out_features() == 0 {
            let (b, t, _) = hidden.dims3()?;
            return Ok(Tensor::zeros((b, 0, t), hidden.dtype(), hidden.device())?);
        }

        let logits = self.head.forward(hidden)?;
        let dtype = logits.dtype();

        // (B, T, classes) -> (B, classes, T); softmax in f64 for stability
        let logits = logits.transpose(1, 2)?.contiguous()?.to_dtype(DType::F64)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, 1)?;
        Ok(log_probs.to_dtype(dtype)?)
    }
}

/// Transformer over latent pixels, generic over the input strategy.
pub struct Transformer2D<I: LatentInput> {
    input: I,
    /// Transformer blocks, applied in order
    blocks: Vec<BasicTransformerBlock>,
    config: Transformer2DConfig,
    device: Device,
}

/// Transformer over vector-quantized latents.
pub type VectorizedTransformer2D = Transformer2D<DiscreteLatentInput>;

impl<I: LatentInput> Transformer2D<I> {
    /// Build the model.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder for loading (or initializing) weights
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the configuration is invalid for the input
    /// kind, or a candle error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: Transformer2DConfig, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let inner_dim = config.inner_dim();

        let input = I::build(&config, vb.clone())?;

        let options = BlockOptions::from_config(&config);
        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let block = BasicTransformerBlock::new(
                inner_dim,
                config.num_attention_heads,
                config.attention_head_dim,
                &options,
                vb.pp(format!("transformer_blocks.{i}")),
            )?;
            blocks.push(block);
        }

        tracing::debug!(
            inner_dim,
            num_layers = blocks.len(),
            norm_type = options.norm_type.as_str(),
            cross_attention_dim = ?options.cross_attention_dim,
            "built Transformer2D"
        );

        Ok(Self {
            input,
            blocks,
            config,
            device,
        })
    }

    /// Forward pass through the model.
    ///
    /// # Arguments
    /// * `sample` - Model input (codebook indices of shape (batch, pixels) for
    ///   the discrete model)
    /// * `encoder_hidden_states` - Cross-attention context (batch, ctx_len, cross_attention_dim)
    /// * `timestep` - Timestep ids (batch,) or (1,), required for ada-norm blocks
    ///
    /// # Errors
    /// Returns an error if an input is missing or does not fit the model.
    pub fn forward(
        &self,
        sample: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        timestep: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut x = self.input.embed(sample)?;
        for block in &self.blocks {
            x = block.forward(&x, encoder_hidden_states, timestep)?;
        }
        self.input.project(&x)
    }

    /// Get the model configuration.
    #[must_use]
    pub fn config(&self) -> &Transformer2DConfig {
        &self.config
    }

    /// Get the device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn inner_dim(&self) -> usize {
        self.config.inner_dim()
    }

    #[must_use]
    pub fn blocks(&self) -> &[BasicTransformerBlock] {
        &self.blocks
    }

    #[must_use]
    pub fn input(&self) -> &I {
        &self.input
    }
}

impl Transformer2D<DiscreteLatentInput> {
    #[must_use]
    pub fn geometry(&self) -> LatentGeometry {
        self.input.geometry()
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.input.geometry().height
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.input.geometry().width
    }

    #[must_use]
    pub fn num_latent_pixels(&self) -> usize {
        self.input.geometry().num_latent_pixels
    }

    #[must_use]
    pub fn num_vector_embeds(&self) -> usize {
        self.input.geometry().num_vector_embeds
    }

    /// Classes predicted per latent pixel (`num_vector_embeds - 1`).
    #[must_use]
    pub fn num_output_classes(&self) -> usize {
        self.input.output_head().out_features()
    }

    #[must_use]
    pub fn in_channels(&self) -> Option<usize> {
        self.config.in_channels
    }

    #[must_use]
    pub fn latent_image_embedding(&self) -> &ImagePositionalEmbeddings {
        self.input.latent_image_embedding()
    }

    #[must_use]
    pub fn output_head(&self) -> &OutputHead {
        self.input.output_head()
    }

    /// Most likely codebook entry per latent pixel, shape (batch, pixels).
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn predict_indices(
        &self,
        sample: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        timestep: Option<&Tensor>,
    ) -> Result<Tensor> {
        let log_probs = self.forward(sample, encoder_hidden_states, timestep)?;
        Ok(log_probs.argmax(D::Minus2)?)
    }
}

/// Load a discrete-latent model from a safetensors file.
///
/// # Errors
/// Returns an error if file loading or model construction fails.
pub fn load_model(
    path: &std::path::Path,
    config: Transformer2DConfig,
    device: &Device,
) -> Result<VectorizedTransformer2D> {
    let data = std::fs::read(path)?;
    load_model_from_bytes(&data, config, device)
}

/// Load a discrete-latent model from in-memory safetensors bytes.
///
/// # Errors
/// Returns an error if the buffer cannot be parsed as safetensors or model construction fails.
pub fn load_model_from_bytes(
    data: &[u8],
    config: Transformer2DConfig,
    device: &Device,
) -> Result<VectorizedTransformer2D> {
    let vb = VarBuilder::from_buffered_safetensors(data.to_vec(), DType::F32, device)?;
    VectorizedTransformer2D::new(config, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::model::config::NormType;
    use candle_nn::VarMap;

    fn random_model(config: Transformer2DConfig) -> (VarMap, Result<VectorizedTransformer2D>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VectorizedTransformer2D::new(config, vb);
        (varmap, model)
    }

    #[test]
    fn test_missing_sample_size_fails_before_allocating() {
        let config = Transformer2DConfig {
            sample_size: None,
            ..Transformer2DConfig::vq_diffusion_ithq()
        };
        let (varmap, model) = random_model(config);
        let err = model.err().expect("construction should fail");
        assert_eq!(err.as_config(), Some(&ConfigError::MissingSampleSize));
        assert!(varmap.all_vars().is_empty());
    }

    #[test]
    fn test_missing_num_vector_embeds_fails() {
        let config = Transformer2DConfig {
            num_vector_embeds: None,
            ..Transformer2DConfig::tiny()
        };
        let (_, model) = random_model(config);
        let err = model.err().expect("construction should fail");
        assert_eq!(err.as_config(), Some(&ConfigError::MissingNumVectorEmbeds));
    }

    #[test]
    fn test_wiring_matches_configuration() {
        let config = Transformer2DConfig {
            sample_size: Some(16),
            num_vector_embeds: Some(100),
            inner_dim: Some(64),
            num_attention_heads: 4,
            attention_head_dim: 16,
            num_layers: 2,
            cross_attention_dim: None,
            num_embeds_ada_norm: None,
            norm_type: NormType::LayerNorm,
            ..Transformer2DConfig::default()
        };
        let (varmap, model) = random_model(config);
        let model = model.unwrap();

        assert_eq!(model.height(), 16);
        assert_eq!(model.width(), 16);
        assert_eq!(model.num_latent_pixels(), 256);

        let emb = model.latent_image_embedding();
        assert_eq!(emb.num_positions(), 256);
        assert_eq!(emb.num_embed(), 100);
        assert_eq!(emb.embed_dim(), 64);

        assert_eq!(model.blocks().len(), 2);
        assert_eq!(model.output_head().in_features(), 64);
        assert_eq!(model.output_head().out_features(), 99);
        assert_eq!(model.num_output_classes(), 99);

        let data = varmap.data().lock().unwrap();
        let q0 = &data["transformer_blocks.0.attn1.to_q.weight"];
        let q1 = &data["transformer_blocks.1.attn1.to_q.weight"];
        assert_eq!(q0.dims(), &[64, 64]);
        assert_ne!(q0.id(), q1.id());
        assert_eq!(data["out.weight"].dims(), &[99, 64]);
        assert_eq!(data["latent_image_embedding.emb.weight"].dims(), &[100, 64]);
    }

    #[test]
    fn test_forward_returns_log_probs_over_classes() {
        let device = Device::Cpu;
        let config = Transformer2DConfig::tiny();
        let (_, model) = random_model(config);
        let model = model.unwrap();

        let sample = Tensor::zeros((2, 16), DType::U32, &device).unwrap();
        let context = Tensor::randn(0f32, 1.0, (2, 3, 12), &device).unwrap();
        let timestep = Tensor::new(&[1u32, 3], &device).unwrap();

        let out = model
            .forward(&sample, Some(&context), Some(&timestep))
            .unwrap();
        assert_eq!(out.dims(), &[2, 9, 16]);

        let totals: Vec<Vec<f32>> = out.exp().unwrap().sum(1).unwrap().to_vec2().unwrap();
        for row in totals {
            for total in row {
                assert!((total - 1.0).abs() < 1e-4, "probabilities sum to {total}");
            }
        }

        let indices = model
            .predict_indices(&sample, Some(&context), Some(&timestep))
            .unwrap();
        assert_eq!(indices.dims(), &[2, 16]);
    }

    #[test]
    fn test_forward_rejects_codes_outside_codebook() {
        let device = Device::Cpu;
        let (_, model) = random_model(Transformer2DConfig::tiny());
        let model = model.unwrap();
        let timestep = Tensor::new(&[0u32], &device).unwrap();

        let sample = Tensor::new(&[[0u32, 1, 99]], &device).unwrap();
        let err = model.forward(&sample, None, Some(&timestep)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "unexpected error: {err:?}");

        let sample = Tensor::new(&[[0i64, -1, 2]], &device).unwrap();
        let err = model.forward(&sample, None, Some(&timestep)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "unexpected error: {err:?}");

        // The mask token (last codebook entry) is a valid input
        let sample = Tensor::new(&[[9u32, 9, 9]], &device).unwrap();
        let context = Tensor::ones((1, 2, 12), DType::F32, &device).unwrap();
        let out = model
            .forward(&sample, Some(&context), Some(&timestep))
            .unwrap();
        assert_eq!(out.dims(), &[1, 9, 3]);
    }

    #[test]
    fn test_forward_rejects_oversized_grid() {
        let device = Device::Cpu;
        let (_, model) = random_model(Transformer2DConfig::tiny());
        let model = model.unwrap();

        let sample = Tensor::zeros((1, 17), DType::U32, &device).unwrap();
        let timestep = Tensor::new(&[0u32], &device).unwrap();
        let err = model.forward(&sample, None, Some(&timestep)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}

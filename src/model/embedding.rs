//! Embedding of discrete latent codes on a 2D grid.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

/// Learned value + 2D position embedding for a grid of codebook indices.
///
/// Each latent pixel at row `r`, column `c` (flattened as `r * width + c`) is
/// embedded as `emb[index] + height_emb[r] + width_emb[c]`.
pub struct ImagePositionalEmbeddings {
    /// Codebook embeddings (num_embed, embed_dim)
    emb: Embedding,
    /// Row embeddings (height, embed_dim)
    height_emb: Embedding,
    /// Column embeddings (width, embed_dim)
    width_emb: Embedding,
    num_embed: usize,
    embed_dim: usize,
    height: usize,
    width: usize,
}

impl ImagePositionalEmbeddings {
    /// Create the embedding table.
    ///
    /// # Arguments
    /// * `num_embed` - Codebook size, including the mask token
    /// * `embed_dim` - Output width
    /// * `height`, `width` - Latent grid size
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        num_embed: usize,
        embed_dim: usize,
        height: usize,
        width: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let emb = candle_nn::embedding(num_embed, embed_dim, vb.pp("emb"))?;
        let height_emb = candle_nn::embedding(height, embed_dim, vb.pp("height_emb"))?;
        let width_emb = candle_nn::embedding(width, embed_dim, vb.pp("width_emb"))?;

        Ok(Self {
            emb,
            height_emb,
            width_emb,
            num_embed,
            embed_dim,
            height,
            width,
        })
    }

    /// Position embeddings for the full grid, shape (1, height * width, embed_dim).
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn position_embeddings(&self) -> Result<Tensor> {
        let device = self.emb.embeddings().device();

        #[allow(clippy::cast_possible_truncation)]
        let rows = Tensor::arange(0u32, self.height as u32, device)?;
        #[allow(clippy::cast_possible_truncation)]
        let cols = Tensor::arange(0u32, self.width as u32, device)?;

        // (H, D) -> (H, 1, D) and (W, D) -> (1, W, D), broadcast to (H, W, D)
        let row_emb = self.height_emb.forward(&rows)?.unsqueeze(1)?;
        let col_emb = self.width_emb.forward(&cols)?.unsqueeze(0)?;
        let pos = row_emb.broadcast_add(&col_emb)?;

        pos.reshape((1, self.height * self.width, self.embed_dim))
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `index` - Codebook indices of shape (batch, seq_len), `seq_len <= height * width`
    ///
    /// # Returns
    /// Embeddings of shape (batch, seq_len, embed_dim)
    ///
    /// # Errors
    /// Returns an error if `seq_len` exceeds the grid or a lookup fails.
    pub fn forward(&self, index: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = index.dims2()?;
        if seq_len > self.num_positions() {
            return Err(candle_core::Error::Msg(format!(
                "Sequence length {seq_len} exceeds the {}x{} latent grid",
                self.height, self.width
            )));
        }

        let index = if index.dtype() == DType::U32 {
            index.clone()
        } else {
            index.to_dtype(DType::U32)?
        };
        let emb = self.emb.forward(&index)?;
        let pos = self.position_embeddings()?.narrow(1, 0, seq_len)?;
        emb.broadcast_add(&pos.to_dtype(emb.dtype())?)
    }

    #[must_use]
    pub fn num_embed(&self) -> usize {
        self.num_embed
    }

    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of grid positions covered by the table.
    #[must_use]
    pub fn num_positions(&self) -> usize {
        self.height * self.width
    }
}

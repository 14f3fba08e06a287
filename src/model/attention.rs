//! Multi-head attention over latent pixels, optionally attending to a context.

use candle_core::{D, DType, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

/// Multi-head scaled dot-product attention.
///
/// Used both as self-attention and as cross-attention over encoder hidden
/// states. No mask is applied: every latent pixel sees the whole grid.
pub struct Attention {
    /// Query projection (query_dim -> heads * head_dim)
    to_q: Linear,
    /// Key projection (context_dim -> heads * head_dim)
    to_k: Linear,
    /// Value projection (context_dim -> heads * head_dim)
    to_v: Linear,
    /// Output projection (heads * head_dim -> query_dim)
    to_out: Linear,
    dropout: Dropout,
    n_head: usize,
    head_dim: usize,
    /// Compute scores and softmax in f32 regardless of model dtype
    upcast_attention: bool,
}

impl Attention {
    /// Create a new attention layer.
    ///
    /// # Arguments
    /// * `query_dim` - Width of the hidden states
    /// * `cross_attention_dim` - Width of the context; `None` for self-attention
    /// * `n_head`, `head_dim` - Head layout
    /// * `bias` - Whether the q/k/v projections carry a bias
    /// * `dropout` - Dropout probability after the output projection
    /// * `upcast_attention` - Compute attention scores in f32
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value, clippy::too_many_arguments)]
    pub fn new(
        query_dim: usize,
        cross_attention_dim: Option<usize>,
        n_head: usize,
        head_dim: usize,
        bias: bool,
        dropout: f32,
        upcast_attention: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = n_head * head_dim;
        let context_dim = cross_attention_dim.unwrap_or(query_dim);

        let to_q = candle_nn::linear_b(query_dim, inner_dim, bias, vb.pp("to_q"))?;
        let to_k = candle_nn::linear_b(context_dim, inner_dim, bias, vb.pp("to_k"))?;
        let to_v = candle_nn::linear_b(context_dim, inner_dim, bias, vb.pp("to_v"))?;
        // diffusers stores the output projection as to_out.0 (to_out.1 is dropout)
        let to_out = candle_nn::linear(inner_dim, query_dim, vb.pp("to_out").pp("0"))?;

        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            dropout: Dropout::new(dropout),
            n_head,
            head_dim,
            upcast_attention,
        })
    }

    /// Split (B, T, heads * head_dim) into (B, heads, T, head_dim).
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        x.reshape((b, t, self.n_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Hidden states of shape (batch, seq_len, query_dim)
    /// * `context` - Encoder hidden states (batch, ctx_len, cross_attention_dim);
    ///   `None` attends to `x` itself
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, query_dim)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward(&self, x: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let context = context.unwrap_or(x);

        let q = self.split_heads(&self.to_q.forward(x)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;

        let in_dtype = q.dtype();
        let (q, k) = if self.upcast_attention {
            (q.to_dtype(DType::F32)?, k.to_dtype(DType::F32)?)
        } else {
            (q, k)
        };

        // softmax(QK^T / sqrt(d_k)) * V
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let att = (q.matmul(&k_t)? * scale)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?.to_dtype(in_dtype)?;

        // (B, heads, T, S) @ (B, heads, S, head_dim) -> (B, T, heads * head_dim)
        let y = att.matmul(&v)?;
        let y = y
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.n_head * self.head_dim))?;

        let y = self.to_out.forward(&y)?;
        self.dropout.forward(&y, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_self_attention_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = Attention::new(16, None, 2, 8, false, 0.0, false, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 9, 16), &device).unwrap();
        let y = attn.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[2, 9, 16]);
    }

    #[test]
    fn test_cross_attention_uses_context_width() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = Attention::new(16, Some(12), 4, 4, true, 0.0, true, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 9, 16), &device).unwrap();
        let ctx = Tensor::randn(0f32, 1.0, (1, 5, 12), &device).unwrap();
        let y = attn.forward(&x, Some(&ctx)).unwrap();
        assert_eq!(y.dims(), &[1, 9, 16]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["to_k.weight"].dims(), &[16, 12]);
        assert!(data.contains_key("to_q.bias"));
        assert!(data.contains_key("to_out.0.bias"));
    }
}

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use safetensors::SafeTensors;

use crate::model::{Transformer2DConfig, VectorizedTransformer2D, load_model_from_bytes};

/// Weight file names tried, in order, when a directory is given.
const WEIGHT_CANDIDATES: [&str; 3] = [
    "diffusion_pytorch_model.safetensors",
    "diffusion_pytorch_model.fp16.safetensors",
    "model.safetensors",
];

/// Tensor every discrete-latent checkpoint carries.
const EMBEDDING_TENSOR: &str = "latent_image_embedding.emb.weight";

/// Resolve a weights path from a file, a transformer directory, or a pipeline
/// directory with a `transformer/` subfolder.
///
/// # Errors
/// Returns an error if no weights file can be found.
pub fn resolve_weights_path(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        anyhow::bail!("Model path not found: {}", path.display());
    }

    for dir in [path.to_path_buf(), path.join("transformer")] {
        for name in WEIGHT_CANDIDATES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(anyhow::anyhow!(
        "no model weights found in {} (expected one of: {})",
        path.display(),
        WEIGHT_CANDIDATES.join(", ")
    ))
}

/// Load a model from a weights file or model directory, reading `config.json`
/// from the directory holding the weights.
///
/// # Errors
/// Returns an error if the weights or config cannot be loaded, or the config is
/// not a discrete-latent configuration.
pub fn load_external_model(model_path: &Path, device: &Device) -> Result<VectorizedTransformer2D> {
    let weights_path = resolve_weights_path(model_path)?;
    let config = load_config_for_model(&weights_path)?;
    load_with_config(&weights_path, config, device)
}

/// Load a model from a weights file or model directory with an explicit config.
///
/// # Errors
/// Returns an error if the weights cannot be read or do not match the config.
pub fn load_with_config(
    model_path: &Path,
    config: Transformer2DConfig,
    device: &Device,
) -> Result<VectorizedTransformer2D> {
    let weights_path = resolve_weights_path(model_path)?;
    let data = std::fs::read(&weights_path)
        .with_context(|| format!("read weights {}", weights_path.display()))?;
    check_checkpoint(&data, &config)
        .with_context(|| format!("inspect {}", weights_path.display()))?;

    tracing::info!(
        path = %weights_path.display(),
        bytes = data.len(),
        num_layers = config.num_layers,
        "loading discrete-latent transformer"
    );
    load_model_from_bytes(&data, config, device).context("load safetensors weights")
}

/// Read and validate the `config.json` next to a weights file.
fn load_config_for_model(weights_path: &Path) -> Result<Transformer2DConfig> {
    let dir = weights_path.parent().unwrap_or_else(|| Path::new("."));
    let config_path = dir.join("config.json");
    if !config_path.exists() {
        anyhow::bail!(
            "config.json was not found at {}. A discrete-latent model needs at least \
`sample_size` and `num_vector_embeds`; pass --config or --preset.",
            config_path.display()
        );
    }

    let config = Transformer2DConfig::from_json_file(&config_path)
        .with_context(|| format!("parse {}", config_path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    Ok(config)
}

/// Sanity-check a safetensors buffer against the config before building.
fn check_checkpoint(data: &[u8], config: &Transformer2DConfig) -> Result<()> {
    let tensors = SafeTensors::deserialize(data).context("parse safetensors header")?;

    let Ok(embedding) = tensors.tensor(EMBEDDING_TENSOR) else {
        anyhow::bail!(
            "not a discrete-latent transformer checkpoint: missing tensor {EMBEDDING_TENSOR:?}"
        );
    };
    if let (Some(&rows), Some(expected)) = (embedding.shape().first(), config.num_vector_embeds) {
        if rows != expected {
            anyhow::bail!(
                "checkpoint codebook has {rows} entries but config num_vector_embeds is {expected}"
            );
        }
    }

    let names: Vec<String> = tensors
        .tensors()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let layers = count_blocks(names.iter().map(String::as_str));
    if layers < config.num_layers {
        anyhow::bail!(
            "checkpoint has {layers} transformer blocks but config num_layers is {}",
            config.num_layers
        );
    }
    if layers > config.num_layers {
        tracing::warn!(
            checkpoint_layers = layers,
            config_layers = config.num_layers,
            "checkpoint has more transformer blocks than config; extra blocks are ignored"
        );
    }
    Ok(())
}

/// Number of distinct `transformer_blocks.{i}` prefixes among tensor names.
fn count_blocks<'a>(names: impl Iterator<Item = &'a str>) -> usize {
    names
        .filter_map(|name| name.strip_prefix("transformer_blocks."))
        .filter_map(|rest| rest.split('.').next())
        .filter_map(|idx| idx.parse::<usize>().ok())
        .collect::<BTreeSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_blocks() {
        let names = [
            "transformer_blocks.0.attn1.to_q.weight",
            "transformer_blocks.0.ff.net.2.bias",
            "transformer_blocks.11.norm3.weight",
            "norm_out.weight",
            "latent_image_embedding.emb.weight",
        ];
        assert_eq!(count_blocks(names.into_iter()), 2);
    }

    #[test]
    fn test_missing_path_is_reported() {
        let err = resolve_weights_path(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

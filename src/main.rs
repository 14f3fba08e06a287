//! Discrete-latent transformer CLI
//!
//! Builds a vector-quantized 2D transformer from a config (and optionally
//! safetensors weights) and runs one denoising-step forward pass over random
//! latent codes.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use vq_transformer::model::{BlockOptions, Transformer2DConfig, VectorizedTransformer2D};
use vq_transformer::weights::loader as weights_loader;

/// Built-in model configurations.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Preset {
    /// Tiny 4x4 grid model for smoke tests
    #[default]
    Tiny,
    /// VQ-Diffusion ITHQ transformer (32x32 grid, 4097 codes, 36 layers)
    Ithq,
}

impl Preset {
    #[must_use]
    pub fn config(self) -> Transformer2DConfig {
        match self {
            Self::Tiny => Transformer2DConfig::tiny(),
            Self::Ithq => Transformer2DConfig::vq_diffusion_ithq(),
        }
    }
}

/// Output format for the forward-pass summary.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// JSON with metadata
    Json,
}

/// Discrete-latent transformer - build a VQ image transformer and run a forward pass.
#[derive(Debug, Parser)]
#[command(
    name = "vq-transformer",
    version,
    about = "Build a discrete-latent (VQ) image transformer and run a forward pass",
    long_about = "Embeds a grid of vector-quantized latent codes, runs it through a stack of \
                  transformer blocks and predicts log-probabilities over the codebook \
                  (excluding the mask token) for every latent pixel."
)]
struct Cli {
    /// Path to a diffusers-style config.json
    #[arg(short, long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in configuration to use when no config file is given
    #[arg(short, long, value_enum)]
    preset: Option<Preset>,

    /// Path to safetensors weights, or a model directory (randomly initialized when absent)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Number of latent grids in the batch
    #[arg(short, long, default_value = "1")]
    batch: usize,

    /// Diffusion timestep for ada-norm models
    #[arg(short, long, default_value = "0")]
    timestep: u32,

    /// Length of the random cross-attention context
    #[arg(long, default_value = "77")]
    context_len: usize,

    /// Random seed for latent codes and context
    #[arg(long)]
    seed: Option<u64>,

    /// Print model configuration and derived geometry, then exit
    #[arg(long)]
    info: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct JsonOutput {
    batch: usize,
    height: usize,
    width: usize,
    num_vector_embeds: usize,
    num_output_classes: usize,
    num_layers: usize,
    inner_dim: usize,
    output_shape: Vec<usize>,
    timestep: Option<u32>,
    seed: Option<u64>,
    mean_max_log_prob: f32,
    predicted_indices: Vec<Vec<u32>>,
    forward_time_ms: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "vq-transformer starting");

    if cli.info {
        let config = resolve_config(&cli)?;
        return print_model_info(&config, &cli);
    }

    let device = Device::Cpu;
    let model = load_cli_model(&cli, &device)?;
    run_forward(&model, &cli, &device)
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("vq_transformer={default_level}").parse()?),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Pick the configuration: `--config`, then `--preset`, then a `config.json`
/// next to `--model`, then the tiny preset.
fn resolve_config(cli: &Cli) -> Result<Transformer2DConfig> {
    if let Some(path) = &cli.config {
        return Transformer2DConfig::from_json_file(path)
            .with_context(|| format!("load config {}", path.display()));
    }
    if let Some(preset) = cli.preset {
        return Ok(preset.config());
    }
    if let Some(model_path) = &cli.model {
        let weights = weights_loader::resolve_weights_path(model_path)?;
        if let Some(path) = weights.parent().map(|dir| dir.join("config.json")) {
            if path.exists() {
                return Transformer2DConfig::from_json_file(&path)
                    .with_context(|| format!("load config {}", path.display()));
            }
        }
    }
    Ok(Preset::default().config())
}

/// Print the configuration and the geometry derived from it.
fn print_model_info(config: &Transformer2DConfig, cli: &Cli) -> Result<()> {
    let geometry = config.geometry().context("invalid discrete-latent config")?;
    let options = BlockOptions::from_config(config);

    println!("Discrete-Latent Transformer Info");
    println!("================================");
    println!();
    println!("Geometry:");
    println!("  Latent grid:       {}x{}", geometry.height, geometry.width);
    println!("  Latent pixels:     {}", geometry.num_latent_pixels);
    println!("  Codebook size:     {}", geometry.num_vector_embeds);
    println!("  Output classes:    {}", geometry.num_output_classes());
    println!();
    println!("Blocks:");
    println!("  Layers:            {}", config.num_layers);
    println!("  Inner dim:         {}", config.inner_dim());
    println!(
        "  Attention heads:   {} x {}",
        config.num_attention_heads, config.attention_head_dim
    );
    println!("  Activation:        {:?}", options.activation_fn);
    println!("  Norm:              {}", options.norm_type.as_str());
    println!("  Norm eps:          {}", options.norm_eps);
    match options.cross_attention_dim {
        Some(dim) if options.uses_context() => {
            println!("  Cross-attention:   {dim}");
        }
        _ => println!("  Cross-attention:   none"),
    }
    if let Some(steps) = options.num_embeds_ada_norm {
        println!("  Ada-norm steps:    {steps}");
    }
    println!("  Attention type:    {}", options.attention_type.as_str());

    if let Some(model_path) = &cli.model {
        println!();
        match weights_loader::resolve_weights_path(model_path) {
            Ok(path) => {
                let metadata = std::fs::metadata(&path)?;
                println!("Weights: {}", path.display());
                println!("Weights size: {} MB", metadata.len() / (1024 * 1024));
            }
            Err(err) => println!("Weights: {err}"),
        }
    }

    config.validate().context("config cannot be built")?;
    Ok(())
}

fn load_cli_model(cli: &Cli, device: &Device) -> Result<VectorizedTransformer2D> {
    if let Some(model_path) = &cli.model {
        tracing::debug!(path = %model_path.display(), "loading external model");
        if cli.config.is_none() && cli.preset.is_none() {
            return weights_loader::load_external_model(model_path, device)
                .context("Failed to load external model");
        }
        let config = resolve_config(cli)?;
        return weights_loader::load_with_config(model_path, config, device)
            .context("Failed to load external model");
    }

    let config = resolve_config(cli)?;
    tracing::debug!("no --model provided; using randomly initialized weights");
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    VectorizedTransformer2D::new(config, vb).context("Failed to build model")
}

fn run_forward(model: &VectorizedTransformer2D, cli: &Cli, device: &Device) -> Result<()> {
    let config = model.config();
    let pixels = model.num_latent_pixels();
    let batch = cli.batch.max(1);

    let mut rng = match cli.seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };

    #[allow(clippy::cast_possible_truncation)]
    let codebook = model.num_vector_embeds() as u32;
    let codes: Vec<u32> = (0..batch * pixels)
        .map(|_| rng.gen_range(0..codebook))
        .collect();
    let sample = Tensor::from_vec(codes, (batch, pixels), device)?;

    let options = BlockOptions::from_config(config);
    let context = match options.cross_attention_dim {
        Some(dim) if options.uses_context() => {
            let len = cli.context_len.max(1);
            let values: Vec<f32> = (0..batch * len * dim)
                .map(|_| rng.gen_range(-1.0f32..1.0))
                .collect();
            Some(Tensor::from_vec(values, (batch, len, dim), device)?)
        }
        _ => None,
    };

    let timestep = match options.num_embeds_ada_norm {
        Some(steps) => {
            #[allow(clippy::cast_possible_truncation)]
            let last = steps.saturating_sub(1) as u32;
            let t = cli.timestep.min(last);
            if t != cli.timestep {
                tracing::warn!(requested = cli.timestep, used = t, "timestep clamped");
            }
            Some(t)
        }
        None => None,
    };
    let timestep_tensor = timestep
        .map(|t| Tensor::from_vec(vec![t; batch], batch, device))
        .transpose()?;

    let start = Instant::now();
    let log_probs = model.forward(&sample, context.as_ref(), timestep_tensor.as_ref())?;
    let forward_time_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

    let predicted: Vec<Vec<u32>> = log_probs.argmax(1)?.to_vec2()?;
    let mean_max_log_prob = log_probs.max(1)?.mean_all()?.to_scalar::<f32>()?;

    match cli.format {
        OutputFormat::Plain => {
            println!(
                "Output: {:?} log-probabilities ({} classes x {} pixels) in {forward_time_ms} ms",
                log_probs.dims(),
                model.num_output_classes(),
                pixels
            );
            println!("Mean max log-prob: {mean_max_log_prob:.4}");
            for (i, row) in predicted.iter().enumerate() {
                println!("Sample {i}:");
                for line in row.chunks(model.width()) {
                    let cells: Vec<String> = line.iter().map(u32::to_string).collect();
                    println!("  {}", cells.join(" "));
                }
            }
        }
        OutputFormat::Json => {
            let payload = JsonOutput {
                batch,
                height: model.height(),
                width: model.width(),
                num_vector_embeds: model.num_vector_embeds(),
                num_output_classes: model.num_output_classes(),
                num_layers: model.blocks().len(),
                inner_dim: model.inner_dim(),
                output_shape: log_probs.dims().to_vec(),
                timestep,
                seed: cli.seed,
                mean_max_log_prob,
                predicted_indices: predicted,
                forward_time_ms,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}

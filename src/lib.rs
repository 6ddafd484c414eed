pub mod config;
pub mod gemini;
pub mod generate;
pub mod loader;
pub mod meta;
pub mod model;
pub mod refine;
pub mod sampler;
pub mod stage;
pub mod tokenizer;
pub mod workflow;

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{GenerationParams, CHECKPOINT_FILE};
use crate::generate::SamplingConfig;
use crate::sampler::InProcessSampler;
use crate::tokenizer::TextTokenizer;

pub struct Runtime {
    pub device: Device,
    /// Name to hand to a sampling subprocess, e.g. `cpu` or `cuda:0`.
    pub name: String,
}

impl Runtime {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            name: "cpu".to_string(),
        }
    }

    /// `cuda` when available, otherwise `cpu`.
    pub fn auto() -> Result<Self> {
        if cuda_is_available() {
            Self::select("cuda")
        } else {
            Ok(Self::cpu())
        }
    }

    /// Accepts `cpu`, `cuda`, `cuda:N` and `mps`. An accelerator this build
    /// or machine lacks degrades to CPU with a warning.
    pub fn select(name: &str) -> Result<Self> {
        let name = name.trim().to_ascii_lowercase();
        if name == "cpu" {
            return Ok(Self::cpu());
        }
        if let Some(rest) = name.strip_prefix("cuda") {
            let ordinal = match rest.strip_prefix(':') {
                Some(n) => n.parse().with_context(|| format!("bad cuda ordinal in {name:?}"))?,
                None if rest.is_empty() => 0,
                None => bail!("unknown device {name:?}"),
            };
            if !cuda_is_available() {
                warn!("CUDA is not available here, using cpu instead of {name}");
                return Ok(Self::cpu());
            }
            let device = Device::new_cuda(ordinal).context("open cuda device")?;
            return Ok(Self {
                device,
                name: format!("cuda:{ordinal}"),
            });
        }
        if name == "mps" || name == "metal" {
            if !metal_is_available() {
                warn!("Metal is not available here, using cpu instead of {name}");
                return Ok(Self::cpu());
            }
            let device = Device::new_metal(0).context("open metal device")?;
            return Ok(Self {
                device,
                name: "mps".to_string(),
            });
        }
        bail!("unknown device {name:?} (expected cpu, cuda, cuda:N or mps)")
    }

    pub fn from_option(name: Option<&str>) -> Result<Self> {
        match name {
            Some(name) => Self::select(name),
            None => Self::auto(),
        }
    }
}

fn init(model_dir: &Path, rt: &Runtime) -> Result<(model::NanoGpt, TextTokenizer)> {
    let ckpt_path = model_dir.join(CHECKPOINT_FILE);
    let ckpt = loader::load_checkpoint(&ckpt_path, &rt.device)
        .with_context(|| format!("load {ckpt_path:?}"))?;
    info!(
        "number of parameters: {:.2}M",
        ckpt.args.num_params() as f64 / 1e6
    );
    let model = model::NanoGpt::new(ckpt.args, ckpt.weights, &rt.device).context("build model")?;
    let tokenizer = TextTokenizer::load(model_dir).context("load tokenizer")?;
    Ok((model, tokenizer))
}

/// Loads the checkpoint once and prints `num_samples` decoded samples.
pub fn run_sample<W: Write>(params: &GenerationParams, out: &mut W) -> Result<()> {
    let rt = Runtime::from_option(params.device.as_deref())?;
    debug!(device = %rt.name, ?params, "sampling");
    let (model, tokenizer) = init(&params.out_dir, &rt)?;

    let cfg = SamplingConfig {
        temperature: params.temperature,
        top_k: params.top_k,
    };
    let start_ids = tokenizer.encode_start(&params.start);
    let mut rng = StdRng::seed_from_u64(params.seed);
    for _ in 0..params.num_samples {
        let mut ids = start_ids.clone();
        generate::generate(&model, &mut ids, params.max_new_tokens, cfg, &mut rng)
            .context("generate")?;
        let text = tokenizer.decode(&ids).context("decode")?;
        writeln!(out, "{text}").context("write sample")?;
    }
    out.flush().context("flush samples")?;
    Ok(())
}

pub fn load_in_process_sampler(
    model_dir: &Path,
    rt: &Runtime,
    max_new_tokens: usize,
    sampling: SamplingConfig,
) -> Result<InProcessSampler> {
    let (model, tokenizer) = init(model_dir, rt)?;
    Ok(InProcessSampler::new(
        model,
        tokenizer,
        max_new_tokens,
        sampling,
    ))
}

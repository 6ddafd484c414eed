use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::pickle::{self, Stack};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::{dict_get, ModelArgs};

#[derive(Debug, Clone)]
pub struct LinearWeights {
    /// Stored as `[in, out]`; nanoGPT saves `nn.Linear` weights as `[out, in]`.
    pub weight_t: Tensor,
    pub bias: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct NormWeights {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct BlockWeights {
    pub ln_1: NormWeights,
    pub attn_c_attn: LinearWeights,
    pub attn_c_proj: LinearWeights,
    pub ln_2: NormWeights,
    pub mlp_c_fc: LinearWeights,
    pub mlp_c_proj: LinearWeights,
}

#[derive(Debug, Clone)]
pub struct NanoGptWeights {
    pub wte: Tensor,
    pub wpe: Tensor,
    pub blocks: Vec<BlockWeights>,
    pub ln_f: NormWeights,
}

pub struct Checkpoint {
    pub args: ModelArgs,
    pub weights: NanoGptWeights,
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<Checkpoint> {
    if !path.exists() {
        bail!("checkpoint not found: {path:?}");
    }
    let args = read_model_args(path).context("model_args missing in checkpoint")?;
    debug!(?args, "loaded model args");

    let tensors: HashMap<String, Tensor> = pickle::read_all_with_key(path, Some("model"))
        .with_context(|| format!("read state dict from {path:?}"))?
        .into_iter()
        .collect();
    let weights = weights_from_tensors(&args, tensors, device).context("map state dict")?;
    Ok(Checkpoint { args, weights })
}

/// Reads the `model_args` entry of a zip-format torch checkpoint.
pub fn read_model_args(path: &Path) -> Result<ModelArgs> {
    let f = File::open(path).with_context(|| format!("open {path:?}"))?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(f)).with_context(|| format!("unzip {path:?}"))?;
    let pkl_name = archive
        .file_names()
        .find(|n| n.ends_with("data.pkl"))
        .map(str::to_string)
        .with_context(|| format!("no data.pkl inside {path:?}"))?;
    let entry = archive
        .by_name(&pkl_name)
        .with_context(|| format!("open {pkl_name}"))?;
    let mut reader = BufReader::new(entry);
    let mut stack = Stack::empty();
    stack
        .read_loop(&mut reader)
        .with_context(|| format!("parse {pkl_name}"))?;
    let obj = stack.finalize().context("finalize pickle")?;

    let pickle::Object::Dict(entries) = &obj else {
        bail!("checkpoint root is not a dict");
    };
    let Some(model_args) = dict_get(entries, "model_args") else {
        bail!("checkpoint has no model_args entry");
    };
    ModelArgs::from_object(model_args)
}

#[derive(Debug, Clone)]
struct KeyResolver {
    prefix: String,
}

impl KeyResolver {
    /// `torch.compile` wraps modules and prefixes every key with `_orig_mod.`.
    fn infer(tensors: &HashMap<String, Tensor>) -> Result<Self> {
        const ANCHOR: &str = "transformer.wte.weight";
        if tensors.contains_key(ANCHOR) {
            return Ok(Self {
                prefix: String::new(),
            });
        }
        if let Some(name) = tensors.keys().find(|n| n.ends_with(ANCHOR)) {
            return Ok(Self {
                prefix: name.trim_end_matches(ANCHOR).to_string(),
            });
        }
        let mut sample = tensors.keys().take(50).cloned().collect::<Vec<_>>();
        sample.sort();
        bail!("could not find a key ending with {ANCHOR}. Sample keys: {sample:?}");
    }

    fn resolve(&self, base: &str) -> String {
        format!("{}{}", self.prefix, base)
    }
}

struct Fetcher<'a> {
    tensors: HashMap<String, Tensor>,
    keys: KeyResolver,
    device: &'a Device,
}

impl Fetcher<'_> {
    fn take(&mut self, base: &str, shape: &[usize]) -> Result<Tensor> {
        let name = self.keys.resolve(base);
        let t = self
            .tensors
            .remove(&name)
            .with_context(|| format!("missing tensor {name}"))?;
        if t.dims() != shape {
            bail!("tensor {name} has shape {:?}, expected {shape:?}", t.dims());
        }
        t.to_dtype(DType::F32)?
            .to_device(self.device)
            .with_context(|| format!("move {name} to device"))
    }

    fn take_opt(&mut self, base: &str, shape: &[usize], present: bool) -> Result<Option<Tensor>> {
        if present {
            self.take(base, shape).map(Some)
        } else {
            Ok(None)
        }
    }

    fn linear(&mut self, base: &str, in_dim: usize, out_dim: usize, bias: bool) -> Result<LinearWeights> {
        let w = self.take(&format!("{base}.weight"), &[out_dim, in_dim])?;
        Ok(LinearWeights {
            weight_t: w.t()?.contiguous()?,
            bias: self.take_opt(&format!("{base}.bias"), &[out_dim], bias)?,
        })
    }

    fn norm(&mut self, base: &str, dim: usize, bias: bool) -> Result<NormWeights> {
        Ok(NormWeights {
            weight: self.take(&format!("{base}.weight"), &[dim])?,
            bias: self.take_opt(&format!("{base}.bias"), &[dim], bias)?,
        })
    }
}

pub fn weights_from_tensors(
    args: &ModelArgs,
    tensors: HashMap<String, Tensor>,
    device: &Device,
) -> Result<NanoGptWeights> {
    let keys = KeyResolver::infer(&tensors)?;
    let mut f = Fetcher {
        tensors,
        keys,
        device,
    };
    let e = args.n_embd;
    let bias = args.bias;

    let wte = f.take("transformer.wte.weight", &[args.vocab_size, e])?;
    let wpe = f.take("transformer.wpe.weight", &[args.block_size, e])?;

    let mut blocks = Vec::with_capacity(args.n_layer);
    for i in 0..args.n_layer {
        let p = format!("transformer.h.{i}.");
        blocks.push(BlockWeights {
            ln_1: f.norm(&(p.clone() + "ln_1"), e, bias)?,
            attn_c_attn: f.linear(&(p.clone() + "attn.c_attn"), e, 3 * e, bias)?,
            attn_c_proj: f.linear(&(p.clone() + "attn.c_proj"), e, e, bias)?,
            ln_2: f.norm(&(p.clone() + "ln_2"), e, bias)?,
            mlp_c_fc: f.linear(&(p.clone() + "mlp.c_fc"), e, 4 * e, bias)?,
            mlp_c_proj: f.linear(&(p + "mlp.c_proj"), 4 * e, e, bias)?,
        });
    }
    let ln_f = f.norm("transformer.ln_f", e, bias)?;

    Ok(NanoGptWeights {
        wte,
        wpe,
        blocks,
        ln_f,
    })
}

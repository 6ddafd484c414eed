use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::pickle::Object;

pub const CHECKPOINT_FILE: &str = "ckpt.pt";
pub const META_FILE: &str = "meta.pkl";
pub const SP_MODEL_EXT: &str = "model";
pub const BPE_TOKENIZER_FILE: &str = "tokenizer.json";
pub const DEFAULT_MODEL_DIR: &str = "models";

/// nanoGPT hyperparameters, stored as the `model_args` dict of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArgs {
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub block_size: usize,
    pub vocab_size: usize,
    pub bias: bool,
}

impl ModelArgs {
    pub fn from_object(obj: &Object) -> Result<Self> {
        let Object::Dict(entries) = obj else {
            bail!("model_args is not a dict: {obj:?}");
        };
        let args = Self {
            n_layer: int_entry(entries, "n_layer")?,
            n_head: int_entry(entries, "n_head")?,
            n_embd: int_entry(entries, "n_embd")?,
            block_size: int_entry(entries, "block_size")?,
            vocab_size: int_entry(entries, "vocab_size")?,
            // nanoGPT defaults to biases in Linear and LayerNorm
            bias: match dict_get(entries, "bias") {
                Some(Object::Bool(b)) => *b,
                Some(Object::None) | None => true,
                Some(other) => bail!("model_args.bias is not a bool: {other:?}"),
            },
        };
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || !self.n_embd.is_multiple_of(self.n_head) {
            bail!(
                "n_embd {} not divisible by n_head {}",
                self.n_embd,
                self.n_head
            );
        }
        if self.block_size == 0 || self.vocab_size == 0 {
            bail!(
                "block_size {} and vocab_size {} must be non-zero",
                self.block_size,
                self.vocab_size
            );
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Parameter count as nanoGPT reports it (position embeddings excluded).
    pub fn num_params(&self) -> usize {
        let e = self.n_embd;
        let ln = if self.bias { 2 * e } else { e };
        let lin = |i: usize, o: usize| i * o + if self.bias { o } else { 0 };
        let block = 2 * ln + lin(e, 3 * e) + lin(e, e) + lin(e, 4 * e) + lin(4 * e, e);
        self.vocab_size * e + self.n_layer * block + ln
    }
}

pub(crate) fn dict_get<'a>(entries: &'a [(Object, Object)], key: &str) -> Option<&'a Object> {
    entries.iter().find_map(|(k, v)| match k {
        Object::Unicode(s) if s == key => Some(v),
        _ => None,
    })
}

fn int_entry(entries: &[(Object, Object)], key: &str) -> Result<usize> {
    match dict_get(entries, key) {
        Some(Object::Int(v)) => usize::try_from(*v).with_context(|| format!("model_args.{key}")),
        Some(other) => bail!("model_args.{key} is not an int: {other:?}"),
        None => bail!("model_args.{key} missing"),
    }
}

/// Parameters of one sampling run.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub out_dir: PathBuf,
    pub device: Option<String>,
    pub start: String,
    pub num_samples: usize,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            device: None,
            start: "\n".to_string(),
            num_samples: 1,
            max_new_tokens: 150,
            temperature: 0.8,
            top_k: Some(200),
            seed: 1337,
        }
    }
}

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};

use crate::config::ModelArgs;
use crate::loader::{BlockWeights, NanoGptWeights};
use crate::model::cache::KvCache;
use crate::model::ops::{causal_mask, gelu, layer_norm, linear_3d, softmax_last_dim};

pub mod cache;
pub mod ops;

const LN_EPS: f64 = 1e-5;

/// nanoGPT decoder: pre-norm blocks, exact GELU, `lm_head` tied to `wte`.
pub struct NanoGpt {
    args: ModelArgs,
    w: NanoGptWeights,
    device: Device,
    wte_t: Tensor,
    attn_scale: f64,
}

impl NanoGpt {
    pub fn new(args: ModelArgs, w: NanoGptWeights, device: &Device) -> Result<Self> {
        args.validate()?;
        if w.blocks.len() != args.n_layer {
            bail!(
                "weights have {} blocks, model_args says {}",
                w.blocks.len(),
                args.n_layer
            );
        }
        let wte_t = w.wte.t()?.contiguous()?;
        let attn_scale = (args.head_dim() as f64).powf(-0.5);
        Ok(Self {
            args,
            w,
            device: device.clone(),
            wte_t,
            attn_scale,
        })
    }

    /// Logits `(1, seq, vocab)` for a window of at most `block_size` tokens.
    pub fn forward(&self, input_ids: &[u32]) -> Result<Tensor> {
        if input_ids.len() > self.args.block_size {
            bail!(
                "seq_len {} exceeds block_size {}",
                input_ids.len(),
                self.args.block_size
            );
        }
        self.run(input_ids, 0, None)
    }

    /// Like [`forward`](Self::forward) but only feeds the new tokens and
    /// extends `cache` with their keys and values.
    pub fn forward_cached(&self, input_ids: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        cache.check(self.args.n_layer, input_ids.len())?;
        let past_len = cache.past_len;
        let logits = self.run(input_ids, past_len, Some(&mut *cache))?;
        cache.past_len = past_len + input_ids.len();
        Ok(logits)
    }

    fn run(&self, input_ids: &[u32], past_len: usize, mut cache: Option<&mut KvCache>) -> Result<Tensor> {
        let cur_len = input_ids.len();
        if cur_len == 0 {
            bail!("input_ids is empty");
        }
        let e = self.args.n_embd;

        let ids = Tensor::from_vec(input_ids.to_vec(), cur_len, &self.device)
            .context("create input_ids tensor")?;
        let pos_ids: Vec<u32> = (past_len as u32..(past_len + cur_len) as u32).collect();
        let pos = Tensor::from_vec(pos_ids, cur_len, &self.device).context("create pos_ids")?;

        let tok_emb = self.w.wte.index_select(&ids, 0).context("wte index_select")?;
        let pos_emb = self.w.wpe.index_select(&pos, 0).context("wpe index_select")?;
        let mut x = tok_emb
            .add(&pos_emb)
            .context("emb add")?
            .reshape((1, cur_len, e))?;

        let mask = causal_mask(past_len, cur_len, &self.device).context("causal mask")?;

        for (i, b) in self.w.blocks.iter().enumerate() {
            let layer_cache = cache.as_deref_mut().map(|c| &mut c.layers[i]);
            x = self
                .block(&x, b, &mask, layer_cache)
                .with_context(|| format!("block {i}"))?;
        }

        let x = layer_norm(&x, &self.w.ln_f, LN_EPS).context("ln_f")?;
        let logits = x
            .reshape((cur_len, e))?
            .matmul(&self.wte_t)?
            .reshape((1, cur_len, self.args.vocab_size))?;
        Ok(logits)
    }

    fn block(
        &self,
        x: &Tensor,
        b: &BlockWeights,
        mask: &Tensor,
        layer_cache: Option<&mut cache::LayerKv>,
    ) -> Result<Tensor> {
        let (_, cur_len, e) = x.dims3()?;
        let n_head = self.args.n_head;
        let head_dim = self.args.head_dim();

        let ln1 = layer_norm(x, &b.ln_1, LN_EPS).context("ln_1")?;
        let qkv = linear_3d(&ln1, &b.attn_c_attn).context("attn c_attn")?;
        let split = |idx: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, idx * e, e)?
                .reshape((1, cur_len, n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);
        let (k, v) = match layer_cache {
            Some(lc) => lc.append(&k, &v).context("append cache")?,
            None => (k, v),
        };

        let scores = (q.matmul(&k.t()?.contiguous()?).context("attn matmul")? * self.attn_scale)?
            .broadcast_add(mask)
            .context("mask add")?;
        let probs = softmax_last_dim(&scores).context("softmax")?;
        let ctx = probs
            .matmul(&v)
            .context("attn ctx")?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((1, cur_len, e))?;

        let attn_out = linear_3d(&ctx, &b.attn_c_proj).context("attn c_proj")?;
        let x = x.add(&attn_out).context("attn residual")?;

        let ln2 = layer_norm(&x, &b.ln_2, LN_EPS).context("ln_2")?;
        let fc = linear_3d(&ln2, &b.mlp_c_fc).context("mlp c_fc")?;
        let act = gelu(&fc).context("gelu")?;
        let proj = linear_3d(&act, &b.mlp_c_proj).context("mlp c_proj")?;
        x.add(&proj).context("mlp residual")
    }

    pub fn block_size(&self) -> usize {
        self.args.block_size
    }

    pub fn new_kv_cache(&self) -> KvCache {
        KvCache::new(self.args.n_layer, self.args.block_size)
    }
}

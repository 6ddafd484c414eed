use anyhow::{Context, Result};
use candle_core::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::model::NanoGpt;

#[derive(Debug, Clone, Copy)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_k: Option<usize>,
}

/// Picks the next token from one row of logits: scale by temperature, keep
/// the `top_k` largest, sample from the softmax. Temperature ≤ 0 is argmax;
/// a `top_k` of 0 keeps every token.
pub fn sample_next<R: Rng>(logits: &[f32], cfg: SamplingConfig, rng: &mut R) -> Result<u32> {
    if cfg.temperature <= 0.0 || cfg.top_k == Some(1) {
        return Ok(argmax(logits));
    }
    let temp = cfg.temperature as f32;
    let mut scaled: Vec<f32> = logits.iter().map(|v| v / temp).collect();

    if let Some(k) = cfg.top_k.filter(|k| (1..scaled.len()).contains(k)) {
        let mut sorted = scaled.clone();
        sorted.sort_unstable_by(|a, b| b.total_cmp(a));
        let kth = sorted[k - 1];
        for v in scaled.iter_mut() {
            if *v < kth {
                *v = f32::NEG_INFINITY;
            }
        }
    }

    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = scaled.iter().map(|v| (v - max).exp()).collect();
    let dist = WeightedIndex::new(&weights).context("build sampling distribution")?;
    Ok(dist.sample(rng) as u32)
}

pub fn argmax(v: &[f32]) -> u32 {
    let (mut best_id, mut best_val) = (0u32, f32::NEG_INFINITY);
    for (i, &val) in v.iter().enumerate() {
        if val > best_val {
            best_val = val;
            best_id = i as u32;
        }
    }
    best_id
}

fn last_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let (_, seq_len, _) = logits.dims3()?;
    logits
        .narrow(1, seq_len - 1, 1)
        .context("slice last token")?
        .flatten_all()?
        .to_vec1()
        .context("logits to_vec1")
}

/// Appends `max_new_tokens` sampled tokens to `ids`.
///
/// Decoding runs on the KV cache while the sequence fits `block_size`; after
/// that each step re-runs the model on the last `block_size` tokens.
pub fn generate<R: Rng>(
    model: &NanoGpt,
    ids: &mut Vec<u32>,
    max_new_tokens: usize,
    cfg: SamplingConfig,
    rng: &mut R,
) -> Result<()> {
    let block_size = model.block_size();
    let mut cache = model.new_kv_cache();
    let mut cached = ids.len() <= block_size;
    let mut pending = ids.len();

    for _ in 0..max_new_tokens {
        if cached && !cache.fits(pending) {
            cached = false;
            cache.clear();
        }
        let logits = if cached {
            let start = ids.len() - pending;
            model
                .forward_cached(&ids[start..], &mut cache)
                .context("forward cached")?
        } else {
            let start = ids.len().saturating_sub(block_size);
            model.forward(&ids[start..]).context("forward")?
        };
        let next = sample_next(&last_logits(&logits)?, cfg, rng)?;
        ids.push(next);
        pending = 1;
    }
    Ok(())
}

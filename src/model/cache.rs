use anyhow::{bail, Result};
use candle_core::Tensor;

/// Keys and values of one attention layer, shaped `(1, n_head, len, head_dim)`.
#[derive(Debug, Clone, Default)]
pub struct LayerKv {
    kv: Option<(Tensor, Tensor)>,
}

impl LayerKv {
    pub fn append(&mut self, k_new: &Tensor, v_new: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match self.kv.take() {
            Some((k, v)) => (
                Tensor::cat(&[&k, k_new], 2)?.contiguous()?,
                Tensor::cat(&[&v, v_new], 2)?.contiguous()?,
            ),
            None => (k_new.clone(), v_new.clone()),
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    pub fn len(&self) -> usize {
        self.kv.as_ref().map_or(0, |(k, _)| k.dims()[2])
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct KvCache {
    pub layers: Vec<LayerKv>,
    pub past_len: usize,
    block_size: usize,
}

impl KvCache {
    pub fn new(n_layer: usize, block_size: usize) -> Self {
        Self {
            layers: vec![LayerKv::default(); n_layer],
            past_len: 0,
            block_size,
        }
    }

    pub fn clear(&mut self) {
        self.past_len = 0;
        for layer in &mut self.layers {
            layer.kv = None;
        }
    }

    /// Whether `cur_len` more positions still fit the context window.
    pub fn fits(&self, cur_len: usize) -> bool {
        self.past_len + cur_len <= self.block_size
    }

    pub(crate) fn check(&self, n_layer: usize, cur_len: usize) -> Result<()> {
        if self.layers.len() != n_layer {
            bail!(
                "KvCache layer count mismatch: cache has {} layers, model has {}",
                self.layers.len(),
                n_layer
            );
        }
        if !self.fits(cur_len) {
            bail!(
                "total_len {} exceeds block_size {} (past_len={}, cur_len={})",
                self.past_len + cur_len,
                self.block_size,
                self.past_len,
                cur_len
            );
        }
        Ok(())
    }
}

use anyhow::{bail, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::ops::softmax;

use crate::loader::{LinearWeights, NormWeights};

pub fn linear_3d(x: &Tensor, lin: &LinearWeights) -> Result<Tensor> {
    let (b, s, in_dim) = x.dims3()?;
    let (w_in, w_out) = lin.weight_t.dims2()?;
    if w_in != in_dim {
        bail!("linear_3d weight in_dim mismatch: x {in_dim} vs w {w_in}");
    }
    let y = x.reshape((b * s, in_dim))?.matmul(&lin.weight_t)?;
    let y = match &lin.bias {
        Some(bias) => y.broadcast_add(bias)?,
        None => y,
    };
    y.reshape((b, s, w_out)).map_err(Into::into)
}

pub fn layer_norm(x: &Tensor, norm: &NormWeights, eps: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let denom = (var + eps)?.sqrt()?;
    let normed = centered.broadcast_div(&denom)?.broadcast_mul(&norm.weight)?;
    match &norm.bias {
        Some(bias) => normed.broadcast_add(bias).map_err(Into::into),
        None => Ok(normed),
    }
}

/// `nn.GELU()` with its default exact (erf) formulation.
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    x.gelu_erf().map_err(Into::into)
}

pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    softmax(x, D::Minus1).map_err(Into::into)
}

/// Additive mask of shape `(1, 1, cur_len, past_len + cur_len)`.
pub fn causal_mask(past_len: usize, cur_len: usize, device: &Device) -> Result<Tensor> {
    let total = past_len + cur_len;
    let mut data = vec![0f32; cur_len * total];
    for i in 0..cur_len {
        for j in (past_len + i + 1)..total {
            data[i * total + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (1, 1, cur_len, total), device).map_err(Into::into)
}

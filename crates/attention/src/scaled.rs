//! Scaled dot-product attention kernel.
//!
//! Inputs follow the `[beam*batch, heads, seq_len, head_dim]` layout
//! with the beam dimension folded into the leading axis. Queries may
//! carry a higher beam multiplicity than keys and values: during beam
//! decoding the queries are expanded per hypothesis while the encoder
//! context and cached projections are not, so the kernel broadcasts
//! keys, values, and masks across the beam before scoring instead of
//! recomputing projections per hypothesis.

use std::sync::OnceLock;

use candle_core::{bail, Result, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

/// Numerically conventional attention kernel with beam broadcasting.
#[derive(Debug, Clone)]
pub struct ScaledDotProduct {
    dropout_p: f32,
    first_call: OnceLock<()>,
}

impl ScaledDotProduct {
    /// Creates a kernel; `dropout_p` applies to attention weights during
    /// training only.
    pub fn new(dropout_p: f32) -> Self {
        Self {
            dropout_p,
            first_call: OnceLock::new(),
        }
    }

    /// Computes `softmax(Q Kᵀ / sqrt(d) + mask) V`.
    ///
    /// * `q` is `[bb, heads, q_len, d]`, `k`/`v` are `[bk, heads, k_len, d]`
    ///   where `bk` must equal `bb` or divide it exactly (beam broadcast).
    /// * `mask`, when given, is additive, `[mb, 1, q_len|1, k_len]` with
    ///   `mb` equal to `bb` or dividing it exactly.
    /// * The output mirrors the query layout `[bb, heads, q_len, d]`.
    pub fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        training: bool,
    ) -> Result<Tensor> {
        let (bb, heads, q_len, head_dim) = q.dims4().map_err(|_| {
            candle_core::Error::Msg(format!(
                "q must be [beam*batch, heads, q_len, head_dim], got {:?}",
                q.dims()
            ))
        })?;
        let (bk, kh, k_len, kd) = k.dims4().map_err(|_| {
            candle_core::Error::Msg(format!(
                "k must be [batch, heads, k_len, head_dim], got {:?}",
                k.dims()
            ))
        })?;
        if kh != heads || kd != head_dim {
            bail!(
                "k shape mismatch: expected [_, {heads}, _, {head_dim}], got {:?}",
                k.dims()
            );
        }
        if v.dims() != k.dims() {
            bail!(
                "k and v must share their shape, got {:?} and {:?}",
                k.dims(),
                v.dims()
            );
        }

        if self.first_call.set(()).is_ok() {
            log::debug!(
                "attention kernel init heads={heads} head_dim={head_dim} dropout_p={}",
                self.dropout_p
            );
        }

        let k = broadcast_beam(k, bb, "keys")?;
        let v = broadcast_beam(v, bb, "values")?;

        let merged = bb * heads;
        let q_view = q.reshape((merged, q_len, head_dim))?;
        let k_view = k.reshape((merged, k_len, head_dim))?;
        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_view
            .matmul(&k_view.transpose(1, 2)?)?
            .affine(scale, 0.0)?;
        let mut scores = scores.reshape((bb, heads, q_len, k_len))?;

        if let Some(mask) = mask {
            let mask = broadcast_beam(mask, bb, "mask")?;
            scores = scores.broadcast_add(&mask)?;
        }

        let probs = softmax_last_dim(&scores.reshape((merged, q_len, k_len))?)?;
        let probs = if training && self.dropout_p > 0.0 {
            dropout(&probs, self.dropout_p)?
        } else {
            probs
        };

        let v_view = v.reshape((merged, k_len, head_dim))?;
        probs
            .matmul(&v_view)?
            .reshape((bb, heads, q_len, head_dim))
    }
}

/// Tiles `tensor` along its leading axis until it matches `bb` rows.
///
/// The folded beam layout is beam-major, so tiling whole copies of the
/// batch block reproduces the layout of beam-expanded queries. A leading
/// axis that neither equals nor divides `bb` is a caller error, never
/// silently coerced.
fn broadcast_beam(tensor: &Tensor, bb: usize, what: &str) -> Result<Tensor> {
    let rows = tensor.dim(0)?;
    if rows == bb {
        return Ok(tensor.clone());
    }
    if rows == 0 || bb % rows != 0 {
        bail!(
            "{what} beam multiplicity {rows} must be 1 or divide the query's {bb} exactly"
        );
    }
    let copies = vec![tensor.clone(); bb / rows];
    let views: Vec<&Tensor> = copies.iter().collect();
    Tensor::cat(&views, 0)
}

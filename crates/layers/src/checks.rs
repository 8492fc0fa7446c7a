//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape assertions that can be wired into
//! constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking; shape mismatches
//! are fatal at graph-construction time.

use candle_core::{Error, Result, Tensor};

/// Ensures a tensor has the expected number of dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {dims:?}"
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Validates that the innermost (feature) axis has the given width.
pub fn expect_feature(name: &str, tensor: &Tensor, features: usize) -> Result<()> {
    let dims = tensor.dims();
    match dims.last() {
        Some(&actual) if actual == features => Ok(()),
        _ => Err(Error::Msg(format!(
            "{name}: expected feature width {features}, got shape {dims:?}"
        ))),
    }
}

/// Validates that two tensors agree on their feature width.
pub fn expect_same_feature(
    a_name: &str,
    a: &Tensor,
    b_name: &str,
    b: &Tensor,
) -> Result<()> {
    let (wa, wb) = (a.dims().last(), b.dims().last());
    match (wa, wb) {
        (Some(wa), Some(wb)) if wa == wb => Ok(()),
        _ => Err(Error::Msg(format!(
            "{a_name} and {b_name} must agree on feature width, got {:?} and {:?}",
            a.dims(),
            b.dims()
        ))),
    }
}

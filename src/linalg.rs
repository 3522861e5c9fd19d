//! Small tensor helpers shared by the orthogonal adapters.
//!
//! Everything that has to stay differentiable is expressed with candle ops;
//! [`invert`] runs on the host and is only used where no gradient is needed
//! (unmerging).

use candle_core::{DType, Tensor, D};
use tracing::warn;

use crate::error::{PeftError, Result};

/// Newton-Schulz steps taken between two convergence checks. The initial
/// guess `Aᵀ / (‖A‖₁‖A‖∞)` always converges; near-identity matrices reach
/// f32 precision within one round.
const NEWTON_SCHULZ_ROUND: usize = 16;

/// Upper bound on Newton-Schulz steps.
const NEWTON_SCHULZ_MAX_ITERATIONS: usize = 64;

/// Largest accepted element of `A X - I`.
const NEWTON_SCHULZ_TOLERANCE: f32 = 1e-4;

/// Skew-symmetric part over the last two dims: `(R - Rᵀ) / 2`.
///
/// # Errors
/// Returns an error if the tensor has fewer than two dims.
pub fn skew_symmetric(r: &Tensor) -> Result<Tensor> {
    let r_t = r.transpose(D::Minus2, D::Minus1)?;
    Ok(r.broadcast_sub(&r_t)?.affine(0.5, 0.0)?)
}

/// Batched identity `[batch, n, n]`.
fn batched_eye(batch: usize, n: usize, like: &Tensor) -> Result<Tensor> {
    let eye = Tensor::eye(n, like.dtype(), like.device())?;
    Ok(eye.unsqueeze(0)?.broadcast_as((batch, n, n))?.contiguous()?)
}

/// Batched Newton-Schulz inverse of `[batch, n, n]` matrices.
///
/// Iterates in rounds until `A X` is within tolerance of the identity. If
/// that fails within the iteration cap, a warning is logged and the last
/// iterate is returned.
///
/// # Errors
/// Returns an error if the input is not a batch of square matrices.
pub fn newton_schulz_inverse(a: &Tensor) -> Result<Tensor> {
    let (batch, n, m) = a.dims3()?;
    if n != m {
        return Err(PeftError::ShapeMismatch {
            expected: vec![batch, n, n],
            actual: vec![batch, n, m],
        });
    }
    let eye = batched_eye(batch, n, a)?;
    let two_eye = eye.affine(2.0, 0.0)?;

    let norm_1 = a.abs()?.sum(1)?.max_keepdim(D::Minus1)?;
    let norm_inf = a.abs()?.sum(2)?.max_keepdim(D::Minus1)?;
    let scale = norm_1.mul(&norm_inf)?.recip()?.reshape((batch, 1, 1))?;
    let mut x = a.transpose(1, 2)?.broadcast_mul(&scale)?;

    let mut iterations = 0;
    loop {
        for _ in 0..NEWTON_SCHULZ_ROUND {
            let ax = a.matmul(&x)?;
            x = x.matmul(&two_eye.sub(&ax)?)?;
        }
        iterations += NEWTON_SCHULZ_ROUND;

        let residual = max_abs_diff(&a.matmul(&x)?, &eye)?;
        if residual <= NEWTON_SCHULZ_TOLERANCE {
            return Ok(x);
        }
        if iterations >= NEWTON_SCHULZ_MAX_ITERATIONS || !residual.is_finite() {
            warn!(n, residual, iterations, "Newton-Schulz inverse did not converge");
            return Ok(x);
        }
    }
}

/// Cayley transform of skew-symmetric `[batch, n, n]` matrices:
/// `(I - Q)(I + Q)⁻¹`.
///
/// With `exact = false` the inverse uses the Neumann series `I - Q + Q²`.
///
/// # Errors
/// Returns an error if the input is not a batch of square matrices.
pub fn cayley(q: &Tensor, exact: bool) -> Result<Tensor> {
    let (batch, n, _) = q.dims3()?;
    let eye = batched_eye(batch, n, q)?;
    let i_minus_q = eye.sub(q)?;
    let inv = if exact {
        newton_schulz_inverse(&eye.add(q)?)?
    } else {
        let q_sq = q.matmul(q)?;
        i_minus_q.add(&q_sq)?
    };
    Ok(i_minus_q.matmul(&inv)?)
}

/// Block diagonal matrix `[nb*bs, nb*bs]` from `[nb, bs, bs]` blocks.
///
/// # Errors
/// Returns an error if the blocks are not square.
pub fn block_diag(blocks: &Tensor) -> Result<Tensor> {
    let (num_blocks, block_size, _) = blocks.dims3()?;
    let total = num_blocks * block_size;
    let rows = (0..num_blocks)
        .map(|idx| {
            let block = blocks.get(idx)?;
            block.pad_with_zeros(1, idx * block_size, total - (idx + 1) * block_size)
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&rows, 0)?)
}

/// Multiply each `bs`-sized chunk of the last dim of `input` by the
/// transpose of the matching block: `x_b ← x_b O_bᵀ`.
///
/// # Errors
/// Returns an error if the last dim of `input` is not `nb * bs`.
pub fn apply_blockwise(input: &Tensor, blocks: &Tensor) -> Result<Tensor> {
    let (num_blocks, block_size, _) = blocks.dims3()?;
    let dims = input.dims().to_vec();
    let features = *dims.last().ok_or_else(|| PeftError::DimensionMismatch {
        message: "input must have at least one dimension".into(),
    })?;
    if features != num_blocks * block_size {
        return Err(PeftError::DimensionMismatch {
            message: format!(
                "input has {features} features, blocks cover {}",
                num_blocks * block_size
            ),
        });
    }
    let rows = input.elem_count() / features;
    let blocked = input
        .reshape((rows, num_blocks, block_size))?
        .transpose(0, 1)?
        .contiguous()?;
    let rotated = blocked.matmul(&blocks.transpose(1, 2)?.contiguous()?)?;
    Ok(rotated.transpose(0, 1)?.contiguous()?.reshape(dims)?)
}

/// Host-side inverse of a square matrix by Gauss-Jordan elimination with
/// partial pivoting.
///
/// # Errors
/// Returns an error if the matrix is not square or is singular.
pub fn invert(matrix: &Tensor) -> Result<Tensor> {
    let (n, m) = matrix.dims2()?;
    if n != m {
        return Err(PeftError::ShapeMismatch {
            expected: vec![n, n],
            actual: vec![n, m],
        });
    }
    let rows: Vec<Vec<f64>> = matrix.to_dtype(DType::F64)?.to_vec2()?;
    let mut a: Vec<f64> = rows.into_iter().flatten().collect();
    let mut inv = vec![0.0f64; n * n];
    for i in 0..n {
        inv[i * n + i] = 1.0;
    }

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| a[x * n + col].abs().total_cmp(&a[y * n + col].abs()))
            .unwrap_or(col);
        if a[pivot * n + col].abs() < 1e-12 {
            return Err(PeftError::InvalidConfig(
                "matrix is singular and cannot be inverted".into(),
            ));
        }
        if pivot != col {
            for k in 0..n {
                a.swap(pivot * n + k, col * n + k);
                inv.swap(pivot * n + k, col * n + k);
            }
        }
        let diag = a[col * n + col];
        for k in 0..n {
            a[col * n + k] /= diag;
            inv[col * n + k] /= diag;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row * n + col];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                a[row * n + k] -= factor * a[col * n + k];
                inv[row * n + k] -= factor * inv[col * n + k];
            }
        }
    }

    let out = Tensor::from_vec(inv, (n, n), matrix.device())?;
    Ok(out.to_dtype(matrix.dtype())?)
}

/// True when every element is finite.
///
/// # Errors
/// Returns an error if the tensor cannot be read back.
pub fn all_finite(tensor: &Tensor) -> Result<bool> {
    let values: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

/// Largest absolute element-wise difference between two tensors.
///
/// # Errors
/// Returns an error if the shapes differ.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = a.sub(b)?.abs()?.flatten_all()?.max(0)?;
    Ok(diff.to_dtype(DType::F32)?.to_scalar()?)
}

// Frame losses
//
// Losses are computed per frame and reduced by the engine, so the same
// function serves both evaluation sites:
//
//   inside the loop   output [rows, ..],       target [rows, ..]      -> [rows]
//   outside the loop  output [T, rows, ..],    target [T, rows, ..]   -> [T, rows]
//
// `lead` is the number of leading axes kept in the result (1 or 2).
//
//   ce   -ln p[target]            error: argmax(p) != target
//   mse  Σ (output - target)²      no error value
//
// The reduction over time is `masked_sum`: frames at t >= seq_len do not
// count, and the caller normalizes by 1 / Σ seq_len.

use recnet_core::{DType, Error, Result, Tensor};

use crate::desc::LossKind;

/// Probabilities are clamped to this before taking the log.
const MIN_PROB: f32 = 1e-30;

/// Per-frame loss, shape `output.dims()[..lead]`.
pub fn frame_loss(kind: LossKind, output: &Tensor, target: &Tensor, lead: usize) -> Result<Tensor> {
    match kind {
        LossKind::Ce => {
            check_lead(output, target, lead, output.rank().saturating_sub(1))?;
            output
                .pick_last(target)
                .map(|p| p.map(|v| -(v.max(MIN_PROB)).ln()))
        }
        LossKind::Mse => {
            if output.dims() != target.dims() {
                return Err(Error::ShapeMismatch {
                    expected: output.shape(),
                    got: target.shape(),
                });
            }
            let diff = output.sub(&target.to_dtype(DType::F32))?;
            let mut sq = diff.mul(&diff)?;
            while sq.rank() > lead {
                sq = sq.sum_last()?;
            }
            Ok(sq)
        }
    }
}

/// Per-frame error, if the loss defines one.
pub fn frame_error(kind: LossKind, output: &Tensor, target: &Tensor, lead: usize) -> Result<Option<Tensor>> {
    match kind {
        LossKind::Ce => {
            check_lead(output, target, lead, output.rank().saturating_sub(1))?;
            let predicted = output.argmax()?;
            let wrong = predicted.compare(target, |p, t| p != t)?;
            Ok(Some(wrong.to_dtype(DType::F32)))
        }
        LossKind::Mse => Ok(None),
    }
}

fn check_lead(output: &Tensor, target: &Tensor, lead: usize, target_rank: usize) -> Result<()> {
    if target.rank() != target_rank || target_rank != lead || output.dims()[..lead] != target.dims()[..] {
        return Err(Error::ShapeMismatch {
            expected: recnet_core::Shape::from(&output.dims()[..lead.min(output.rank())]),
            got: target.shape(),
        });
    }
    Ok(())
}

/// Sum of a time-major `[T, B]` frame tensor over frames `t < seq_lens[b]`.
pub fn masked_sum(frames: &Tensor, seq_lens: &[usize]) -> Result<f32> {
    let dims = frames.dims();
    if dims.len() != 2 || dims[1] != seq_lens.len() {
        return Err(Error::msg(format!(
            "masked_sum: frames of shape {} for {} sequences",
            frames.shape(),
            seq_lens.len()
        )));
    }
    let mask = Tensor::sequence_mask(seq_lens, dims[0]);
    // Masked frames may hold anything, including inf from padding labels.
    let kept = Tensor::where_cond(&mask, frames, &Tensor::zeros((), DType::F32))?;
    Ok(kept.sum_all())
}

/// `1 / Σ seq_lens`, or 0 for an empty batch.
pub fn norm_factor(seq_lens: &[usize]) -> f32 {
    let total: usize = seq_lens.iter().sum();
    if total == 0 {
        0.0
    } else {
        1.0 / total as f32
    }
}

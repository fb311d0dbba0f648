// Beam search step
//
// One decision of a choice layer. Layout of every per-step tensor is
// [batch * beam, ...] with hypothesis k of batch entry b on row b * K + k.
//
// Given, per batch entry:
//   scores_base  [beam_in]          cumulative scores of incoming hypotheses
//   scores_in    [beam_in, dim]     log-scores of the next label
//   ended        [beam_in]          hypotheses that already emitted `end`
//
// the step
//   1. length-normalizes ended hypotheses: score *= (t + 1) / t   (t >= 1)
//   2. restricts ended hypotheses to label 0 at no cost:
//        scores_in[h] = [0, -1e30, -1e30, ...]
//   3. takes the top K of  scores_base[h] + scores_in[h, c]  over the
//      flattened (h, c) space, and reports for every surviving slot the
//      label c, the new score and the source hypothesis h.
//
// At the first step there is a single incoming hypothesis per batch entry
// (beam_in = 1); the K rows of a batch entry are identical copies and the
// first one is read.

use recnet_core::{Error, Result, Tensor};

/// Score given to every continuation but label 0 of an ended hypothesis.
pub const ENDED_CANDIDATE_SCORE: f32 = -1e30;

/// Inputs of one beam-search decision.
#[derive(Debug, Clone, Copy)]
pub struct BeamStepInput<'a> {
    /// `[batch * beam_in]` cumulative scores.
    pub scores_base: &'a [f32],
    /// `[batch * beam_size * dim]` log-scores, one row per loop row.
    pub scores_in: &'a [f32],
    /// `[batch * beam_size]` ended flags, one per loop row.
    pub ended: Option<&'a [bool]>,
    pub batch: usize,
    pub beam_in: usize,
    pub beam_size: usize,
    pub dim: usize,
    /// Loop iteration `t`.
    pub step: usize,
    pub length_normalization: bool,
}

/// Result of one beam-search decision, each `[batch * beam_size]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamStep {
    pub labels: Vec<usize>,
    /// Index of the source hypothesis within its batch entry.
    pub src_beams: Vec<usize>,
    pub scores: Vec<f32>,
}

/// Factor applied to the running score of an ended hypothesis at step `t`.
///
/// Undefined for `t = 0`; no hypothesis can have ended before the first
/// step, so the score is left unchanged there.
pub fn length_norm_factor(step: usize) -> f32 {
    if step == 0 {
        1.0
    } else {
        (step as f32 + 1.0) / step as f32
    }
}

/// Candidate scores of one hypothesis after filtering ended ones.
pub fn filter_ended_scores(scores: &[f32], ended: bool) -> Vec<f32> {
    if !ended {
        return scores.to_vec();
    }
    (0..scores.len())
        .map(|c| if c == 0 { 0.0 } else { ENDED_CANDIDATE_SCORE })
        .collect()
}

/// Run one beam-search decision.
pub fn beam_step(input: BeamStepInput<'_>) -> Result<BeamStep> {
    let BeamStepInput {
        scores_base,
        scores_in,
        ended,
        batch,
        beam_in,
        beam_size: k,
        dim,
        step,
        length_normalization,
    } = input;
    if beam_in != 1 && beam_in != k {
        return Err(Error::msg(format!(
            "incoming beam of {beam_in} hypotheses, expected 1 or {k}"
        )));
    }
    if beam_in * dim < k {
        return Err(Error::msg(format!(
            "beam size {k} exceeds the {} available candidates",
            beam_in * dim
        )));
    }
    if scores_base.len() != batch * beam_in || scores_in.len() != batch * k * dim {
        return Err(Error::msg(format!(
            "beam step: {} base scores and {} candidate scores for batch {batch}, beam {k}, dim {dim}",
            scores_base.len(),
            scores_in.len()
        )));
    }
    if let Some(e) = ended {
        if e.len() != batch * k {
            return Err(Error::msg(format!(
                "beam step: {} ended flags for {} rows",
                e.len(),
                batch * k
            )));
        }
    }

    let mut out = BeamStep {
        labels: Vec::with_capacity(batch * k),
        src_beams: Vec::with_capacity(batch * k),
        scores: Vec::with_capacity(batch * k),
    };
    let mut candidates: Vec<(f32, usize)> = Vec::with_capacity(beam_in * dim);
    for b in 0..batch {
        candidates.clear();
        for h in 0..beam_in {
            let row = b * k + h;
            let is_ended = ended.map_or(false, |e| e[row]);
            let mut base = scores_base[b * beam_in + h];
            if length_normalization && is_ended {
                base *= length_norm_factor(step);
            }
            let row_scores = &scores_in[row * dim..(row + 1) * dim];
            for (c, s) in filter_ended_scores(row_scores, is_ended).into_iter().enumerate() {
                candidates.push((base + s, h * dim + c));
            }
        }
        // Stable sort: on equal scores the lower flat index wins.
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        for &(score, idx) in candidates.iter().take(k) {
            out.labels.push(idx % dim);
            out.src_beams.push(idx / dim);
            out.scores.push(score);
        }
    }
    Ok(out)
}

/// Beam bookkeeping produced by a choice layer at one step.
#[derive(Debug, Clone)]
pub struct BeamChoice {
    pub beam_size: usize,
    /// I32 `[batch, beam_size]` source hypothesis of every new slot.
    pub src_beams: Tensor,
}

impl BeamChoice {
    pub fn new(beam_size: usize, batch: usize, src_beams: &[usize]) -> Result<Self> {
        Ok(BeamChoice {
            beam_size,
            src_beams: Tensor::from_labels(src_beams, (batch, beam_size))?,
        })
    }

    /// Loop row each new row descends from: `b * K + src`.
    pub fn source_rows(&self) -> Vec<usize> {
        source_rows(&self.src_beams.to_labels(), self.beam_size)
    }
}

/// Convert per-batch source indices `[batch * K]` into absolute rows.
pub fn source_rows(src_beams: &[usize], beam_size: usize) -> Vec<usize> {
    src_beams
        .iter()
        .enumerate()
        .map(|(i, &src)| (i / beam_size) * beam_size + src)
        .collect()
}


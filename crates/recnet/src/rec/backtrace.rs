// Beam backtrace
//
// During the loop every step's choice records, for each new hypothesis slot,
// the slot of the previous step it continues. Values accumulated at step t
// are in that step's row order, which is not the order of the final beam.
// After the loop the resolver walks back from the last step:
//
//   m = identity                          final slot -> row at step T-1
//   for t = T-1 .. 0:
//       after[t]  = m                     rows of values computed after the choice
//       m         = source_rows[t][m]
//       before[t] = m                     rows of values computed before it
//
// and gathers every accumulated frame with the mapping that matches where it
// was computed relative to the choice.
//
//   Collecting --resolve--> Resolving --> Done

use recnet_core::{Error, Result, Tensor};
use recnet_nn::search::source_rows;
use recnet_nn::BeamChoice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Collecting,
    Resolving,
    Done,
}

#[derive(Debug, Clone)]
pub struct BacktraceResolver {
    state: ResolveState,
    batch: usize,
    beam_size: usize,
    src_beams: Vec<Tensor>,
    after: Vec<Vec<usize>>,
    before: Vec<Vec<usize>>,
}

impl BacktraceResolver {
    pub fn new(batch: usize, beam_size: usize) -> Self {
        BacktraceResolver {
            state: ResolveState::Collecting,
            batch,
            beam_size,
            src_beams: Vec::new(),
            after: Vec::new(),
            before: Vec::new(),
        }
    }

    pub fn state(&self) -> ResolveState {
        self.state
    }

    /// Number of recorded steps.
    pub fn steps(&self) -> usize {
        self.src_beams.len()
    }

    /// Record the choice of the next step.
    pub fn record(&mut self, choice: &BeamChoice) -> Result<()> {
        if self.state != ResolveState::Collecting {
            return Err(Error::msg("beam backtrace already resolved"));
        }
        if choice.beam_size != self.beam_size || choice.src_beams.dims() != [self.batch, self.beam_size] {
            return Err(Error::ShapeMismatch {
                expected: (self.batch, self.beam_size).into(),
                got: choice.src_beams.shape(),
            });
        }
        self.src_beams.push(choice.src_beams.clone());
        Ok(())
    }

    /// Compute the row mappings of every step.
    pub fn resolve(&mut self) -> Result<()> {
        if self.state != ResolveState::Collecting {
            return Err(Error::msg("beam backtrace already resolved"));
        }
        self.state = ResolveState::Resolving;
        let n = self.src_beams.len();
        let mut after = vec![Vec::new(); n];
        let mut before = vec![Vec::new(); n];
        let mut mapping: Vec<usize> = (0..self.batch * self.beam_size).collect();
        for t in (0..n).rev() {
            let src = source_rows(&self.src_beams[t].to_labels(), self.beam_size);
            let prev: Vec<usize> = mapping.iter().map(|&r| src[r]).collect();
            after[t] = std::mem::replace(&mut mapping, prev);
            before[t] = mapping.clone();
        }
        self.after = after;
        self.before = before;
        self.state = ResolveState::Done;
        Ok(())
    }

    /// Reorder an accumulated `[T, rows, ..]` sequence into final beam order.
    /// `after_choice` tells whether the value was computed after the step's
    /// choice.
    pub fn apply(&self, stacked: &Tensor, after_choice: bool) -> Result<Tensor> {
        if self.state != ResolveState::Done {
            return Err(Error::msg("beam backtrace applied before it was resolved"));
        }
        let steps = stacked.dim0()?;
        if steps != self.steps() {
            return Err(Error::msg(format!(
                "beam backtrace over {} steps applied to {steps} frames",
                self.steps()
            )));
        }
        if steps == 0 {
            return Ok(stacked.clone());
        }
        let maps = if after_choice { &self.after } else { &self.before };
        let frames = maps
            .iter()
            .enumerate()
            .map(|(t, rows)| stacked.index_axis0(t)?.select_rows(rows))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&frames)
    }

    /// The final beam, once resolved. `scores` are the choice layer's last
    /// cumulative scores, `[batch, beam]`.
    pub fn into_beam(self, scores: Tensor) -> Result<SearchBeam> {
        if self.state != ResolveState::Done {
            return Err(Error::msg("beam backtrace not resolved"));
        }
        Ok(SearchBeam {
            batch: self.batch,
            beam_size: self.beam_size,
            scores,
            src_beams: self.src_beams,
        })
    }
}

/// Result of a beam search.
#[derive(Debug, Clone)]
pub struct SearchBeam {
    pub batch: usize,
    pub beam_size: usize,
    /// `[batch, beam]` final cumulative scores.
    pub scores: Tensor,
    /// Per step, I32 `[batch, beam]` source slot of every hypothesis.
    pub src_beams: Vec<Tensor>,
}

impl SearchBeam {
    /// Best hypothesis slot of every batch entry.
    pub fn best(&self) -> Vec<usize> {
        let width = self.scores.dims().get(1).copied().unwrap_or(1);
        self.scores
            .to_vec()
            .chunks(width.max(1))
            .map(|row| {
                let mut best = 0;
                for (k, &s) in row.iter().enumerate() {
                    if s > row[best] {
                        best = k;
                    }
                }
                best
            })
            .collect()
    }

    /// Keep only the best hypothesis of every batch entry: `[T, batch * beam,
    /// ..]` becomes `[T, batch, ..]`, with the matching lengths.
    pub fn decide(&self, output: &Tensor, seq_lens: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        let rows: Vec<usize> = self
            .best()
            .iter()
            .enumerate()
            .map(|(b, &k)| b * self.beam_size + k)
            .collect();
        if seq_lens.len() != self.batch * self.beam_size {
            return Err(Error::msg(format!(
                "decide: {} lengths for {} hypotheses",
                seq_lens.len(),
                self.batch * self.beam_size
            )));
        }
        let lens = rows.iter().map(|&r| seq_lens[r]).collect();
        Ok((output.select(1, &rows)?, lens))
    }
}

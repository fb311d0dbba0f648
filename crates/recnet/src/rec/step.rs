// The step loop
//
// One iteration evaluates the in-loop layers in dependency order:
//
//   x          current value: computed earlier this step, or frame i of a
//              moved-in layer (tiled over the beam)
//   prev:x     the loop state, or frame i - 1 of a moved-in layer (its
//              initial output at i = 0)
//   base:x     the enclosing layer, tiled over the beam
//   data:k     frame i of extern data
//
// then writes the accumulators and the next loop state. A search choice
// reorders the hypotheses mid-step. Layers after it that depend on it see
// their other inputs and their own recurrent state gathered by the choice's
// source rows. Whatever was computed without the choice is still in the old
// order and is gathered the same way before the next step.
//
// Length: known lengths stop the loop at max(seq_len). Otherwise `end`
// decides: a row stays ended once it ended and its length only grows while
// it has not, and the loop runs while any row is active and i < max_seq_len.

use std::collections::{BTreeMap, BTreeSet};

use recnet_core::{Error, Result, Tensor};
use recnet_nn::{frame_error, frame_loss, BeamChoice, ForwardCtx, LayerRef, LayerState, StateInvariant, StepInfo};

use super::accumulator::{AccKey, Accumulators, LoopState};
use super::backtrace::BacktraceResolver;
use super::moved::MovedValues;
use super::partition::Partition;
use super::{check_state, check_value, Env};

/// How many steps the loop runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopLength {
    /// Per batch entry, known before the loop.
    Known(Vec<usize>),
    /// Decided by the `end` layer, at most `max_len` steps.
    Dynamic { max_len: usize },
}

impl LoopLength {
    /// Frames the loop may read from moved-in layers.
    pub fn horizon(&self) -> usize {
        match self {
            LoopLength::Known(lens) => lens.iter().copied().max().unwrap_or(0),
            LoopLength::Dynamic { max_len } => *max_len,
        }
    }
}

/// Everything the loop leaves behind.
pub(crate) struct LoopRun {
    pub steps: usize,
    pub accs: Accumulators,
    pub state: LoopState,
    /// Per row.
    pub seq_lens: Vec<usize>,
    pub resolver: Option<BacktraceResolver>,
}

struct StepValues {
    current: BTreeMap<String, Tensor>,
    states: BTreeMap<String, LayerState>,
    choice: Option<BeamChoice>,
}

pub(crate) struct StepLoop<'e, 'a> {
    env: &'e Env<'a>,
    partition: &'e Partition,
    moved_in: &'e MovedValues,
    order: Vec<String>,
    accumulate: BTreeSet<String>,
    losses: Vec<String>,
    invariants: BTreeMap<String, StateInvariant>,
}

impl<'e, 'a> StepLoop<'e, 'a> {
    /// `accumulate`: in-loop layers whose values are needed after the loop.
    pub fn new(
        env: &'e Env<'a>,
        partition: &'e Partition,
        moved_in: &'e MovedValues,
        accumulate: BTreeSet<String>,
    ) -> Result<Self> {
        let order = env.graph.topo_order(&partition.in_loop, false)?;
        let losses = env
            .graph
            .loss_layers()
            .into_iter()
            .filter(|t| partition.in_loop.contains(&t.name))
            .map(|t| t.name.clone())
            .collect();
        Ok(StepLoop {
            env,
            partition,
            moved_in,
            order,
            accumulate,
            losses,
            invariants: BTreeMap::new(),
        })
    }

    fn init_state(&mut self, dynamic: bool) -> Result<LoopState> {
        let env = self.env;
        let mut state = LoopState::default();
        for name in env.graph.prev_needed() {
            if !self.partition.in_loop.contains(name) {
                continue;
            }
            let t = env
                .graph
                .frame(name, true)
                .ok_or_else(|| Error::msg(format!("no previous-step template for '{name}'")))?;
            state.outputs.insert(name.clone(), env.initial_output(t, env.beam)?);
        }
        for name in &self.partition.in_loop {
            let t = env.graph.get(name)?;
            if !t.has_state {
                continue;
            }
            let (s, invariant) = env.initial_state(t, env.beam)?;
            state.states.insert(name.clone(), s);
            self.invariants.insert(name.clone(), invariant);
        }
        if dynamic {
            let rows = env.rows();
            state.ended = Some(Tensor::from_bools(&vec![false; rows], rows)?);
            state.seq_lens = Some(vec![0; rows]);
        }
        Ok(state)
    }

    fn input(&self, r: &LayerRef, i: usize, current: &BTreeMap<String, Tensor>, state: &LoopState) -> Result<Tensor> {
        let env = self.env;
        match r {
            LayerRef::Current(x) => {
                if self.partition.moved_in.contains(x) {
                    return self.moved_in.frame(x, i)?.tile_rows(env.beam);
                }
                current
                    .get(x)
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("layer '{x}' read before it was computed")))
            }
            LayerRef::Prev(x) => {
                if self.partition.moved_in.contains(x) {
                    if i == 0 {
                        let t = env
                            .graph
                            .frame(x, true)
                            .ok_or_else(|| Error::msg(format!("no previous-step template for '{x}'")))?;
                        return env.initial_output(t, env.beam);
                    }
                    return self.moved_in.frame(x, i - 1)?.tile_rows(env.beam);
                }
                state
                    .outputs
                    .get(x)
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("no previous-step value of '{x}'")))
            }
            _ => env.external_frame(r, i),
        }
    }

    /// Hidden state of a stateful sibling, flattened to `[rows, n]`.
    fn hidden_state(&self, r: &LayerRef, current: &BTreeMap<String, LayerState>, state: &LoopState) -> Result<Tensor> {
        let found = match r {
            LayerRef::Current(x) => current.get(x),
            LayerRef::Prev(x) => state.states.get(x),
            _ => None,
        };
        found
            .ok_or_else(|| Error::msg(format!("{r} has no hidden state")))?
            .flatten()
    }

    /// Whether a value read this step is already in the order the choice picked.
    fn after_choice(&self, r: &LayerRef) -> bool {
        matches!(r, LayerRef::Current(x) if self.env.graph.depends_on_choice(x))
    }

    fn step(&self, i: usize, info: &StepInfo, state: &LoopState) -> Result<StepValues> {
        let env = self.env;
        let rows = env.rows();
        let mut out = StepValues {
            current: BTreeMap::new(),
            states: BTreeMap::new(),
            choice: None,
        };
        let mut src_rows: Option<Vec<usize>> = None;
        for name in &self.order {
            let t = env.graph.get(name)?;
            let realign = src_rows.as_deref().filter(|_| t.has_search_choice);
            let mut inputs = Vec::with_capacity(t.inputs.len());
            for r in &t.inputs {
                let value = if t.kind.reads_hidden_state() {
                    self.hidden_state(r, &out.states, state)?
                } else {
                    self.input(r, i, &out.current, state)?
                };
                inputs.push(match realign {
                    Some(src) if !self.after_choice(r) => value.select_rows(src)?,
                    _ => value,
                });
            }
            let realigned = match realign {
                Some(src) => state
                    .states
                    .get(name)
                    .map(|s| s.try_map(|x| x.select_rows(src)))
                    .transpose()?,
                None => None,
            };
            let layer_state = realigned.as_ref().or_else(|| state.states.get(name));
            let metas = env.graph.input_metas(t)?;
            let ctx = ForwardCtx {
                name,
                desc: &t.desc,
                meta: &t.meta,
                input_metas: &metas,
                params: env.params,
                flags: env.flags,
                rows,
                step: Some(info),
            };
            let result = t.kind.forward(&ctx, &inputs, layer_state)?;
            check_value(t, &result.value, &[rows])?;
            if t.has_state {
                let new_state = result
                    .state
                    .ok_or_else(|| Error::msg(format!("layer '{name}' returned no recurrent state")))?;
                let invariant = self
                    .invariants
                    .get(name)
                    .ok_or_else(|| Error::msg(format!("layer '{name}' has no state invariant")))?;
                check_state(name, &new_state, invariant)?;
                out.states.insert(name.clone(), new_state);
            }
            if let Some(choice) = result.choice {
                src_rows = Some(choice.source_rows());
                out.choice = Some(choice);
            }
            out.current.insert(name.clone(), result.value);
        }
        Ok(out)
    }

    fn accumulate(&self, accs: &mut Accumulators, i: usize, current: &BTreeMap<String, Tensor>) -> Result<()> {
        for name in &self.accumulate {
            let value = current
                .get(name)
                .ok_or_else(|| Error::msg(format!("layer '{name}' missing from step {i}")))?;
            accs.write(AccKey::Output(name.clone()), i, value.clone())?;
        }
        for name in &self.losses {
            let t = self.env.graph.get(name)?;
            let (Some(kind), Some(key)) = (t.desc.loss, t.desc.target.as_deref()) else {
                continue;
            };
            let output = current
                .get(name)
                .ok_or_else(|| Error::msg(format!("layer '{name}' missing from step {i}")))?;
            let target = self.env.external_frame(&LayerRef::Data(key.to_string()), i)?;
            accs.write(AccKey::Loss(name.clone()), i, frame_loss(kind, output, &target, 1)?)?;
            if let Some(err) = frame_error(kind, output, &target, 1)? {
                accs.write(AccKey::Error(name.clone()), i, err)?;
            }
        }
        Ok(())
    }

    pub fn run(mut self, length: &LoopLength) -> Result<LoopRun> {
        let env = self.env;
        let rows = env.rows();
        let graph = env.graph;
        let known: Option<Vec<usize>> = match length {
            LoopLength::Known(lens) => Some(lens.iter().flat_map(|&n| std::iter::repeat(n).take(env.beam)).collect()),
            LoopLength::Dynamic { .. } => None,
        };
        let max_len = length.horizon();
        let mut state = self.init_state(known.is_none())?;
        let mut accs = Accumulators::default();
        let mut resolver = match graph.choice() {
            Some(_) if env.flags.search => Some(BacktraceResolver::new(env.batch, env.beam)),
            _ => None,
        };

        let mut i = 0;
        while i < max_len && (known.is_some() || state.any_running()) {
            let ended = match &known {
                Some(lens) => {
                    let flags: Vec<bool> = lens.iter().map(|&n| i >= n).collect();
                    Some(Tensor::from_bools(&flags, rows)?)
                }
                None => state.ended.clone(),
            };
            let info = StepInfo { index: i, ended };
            let values = self.step(i, &info, &state)?;
            self.accumulate(&mut accs, i, &values.current)?;

            let mut next = LoopState {
                outputs: BTreeMap::new(),
                states: values.states,
                ended: state.ended.clone(),
                seq_lens: state.seq_lens.clone(),
            };
            for name in graph.prev_needed() {
                if let Some(v) = values.current.get(name) {
                    next.outputs.insert(name.clone(), v.clone());
                }
            }

            let src_rows = match &values.choice {
                Some(choice) => {
                    if let Some(r) = resolver.as_mut() {
                        r.record(choice)?;
                    }
                    Some(choice.source_rows())
                }
                None => None,
            };
            if let Some(src) = &src_rows {
                next.reorder(src, |n| !graph.depends_on_choice(n))?;
                next.ended = next.ended.map(|e| e.select_rows(src)).transpose()?;
                next.seq_lens = next.seq_lens.map(|l| src.iter().map(|&r| l[r]).collect());
            }

            if known.is_none() {
                let mut end_now = self.input(&LayerRef::Current("end".to_string()), i, &values.current, &state)?;
                if let Some(src) = &src_rows {
                    if !graph.depends_on_choice("end") && !self.partition.moved_in.contains("end") {
                        end_now = end_now.select_rows(src)?;
                    }
                }
                let ended_prev = next
                    .ended
                    .take()
                    .ok_or_else(|| Error::msg("ended flags missing"))?;
                let ended = ended_prev.logical_or(&end_now)?;
                let flags = ended.to_bools();
                let lens = next
                    .seq_lens
                    .take()
                    .ok_or_else(|| Error::msg("sequence lengths missing"))?;
                next.seq_lens = Some(lens.iter().zip(&flags).map(|(&n, &e)| if e { n } else { n + 1 }).collect());
                next.ended = Some(ended);
            }

            state = next;
            i += 1;
        }

        let seq_lens = match known {
            Some(lens) => lens,
            None => state.seq_lens.clone().unwrap_or_else(|| vec![0; rows]),
        };
        tracing::debug!(steps = i, seq_lens = ?seq_lens, "recurrent loop finished");
        Ok(LoopRun {
            steps: i,
            accs,
            state,
            seq_lens,
            resolver,
        })
    }
}

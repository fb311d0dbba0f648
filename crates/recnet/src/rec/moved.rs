// Pre-loop and post-loop networks
//
// Layers outside the loop are evaluated once on whole sequences. A
// position-wise layer does not care whether its rows are one step of a
// batch or every step of it, so sequence inputs are flattened
// [T, R, ..] -> [T * R, ..], static inputs ([R, ..], e.g. base layers) are
// repeated over time first, and the result is split back to [T, R, ..].
//
// `prev:x` becomes x shifted one step later, with x's initial output as the
// first frame.
//
// Pre-loop (moved in):   rows = batch, T = length of the sequence inputs,
//                        or the loop horizon when there are none.
// Post-loop (moved out): rows = batch * beam, T = number of loop steps;
//                        in-loop inputs are the (resolved) accumulators.

use std::collections::BTreeMap;

use recnet_core::{Error, Result, Tensor};
use recnet_nn::{ForwardCtx, LayerRef};

use super::partition::Partition;
use super::template::{LayerTemplate, TemplateGraph};
use super::{check_value, Env};

/// An input of a batched evaluation.
pub(crate) enum SeqValue {
    /// `[T, R, ..]`
    Seq(Tensor),
    /// `[R, ..]`, the same at every step.
    Static(Tensor),
}

/// Outputs of the moved-in layers, `[T, batch, ..]`.
#[derive(Debug, Clone, Default)]
pub struct MovedValues {
    values: BTreeMap<String, Tensor>,
}

impl MovedValues {
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.values
            .get(name)
            .ok_or_else(|| Error::msg(format!("layer '{name}' was not computed before the loop")))
    }

    /// Step `t` of a moved-in layer, `[batch, ..]`.
    pub fn frame(&self, name: &str, t: usize) -> Result<Tensor> {
        let value = self.get(name)?;
        let len = value.dim0()?;
        if t >= len {
            return Err(Error::DataUnavailable {
                key: name.to_string(),
                step: t,
                len,
            });
        }
        value.index_axis0(t)
    }
}

/// Evaluate a position-wise layer on all steps at once.
pub(crate) fn evaluate_batched(
    env: &Env<'_>,
    t: &LayerTemplate,
    inputs: Vec<SeqValue>,
    rows: usize,
    horizon: usize,
) -> Result<Tensor> {
    let mut len = None;
    for v in &inputs {
        if let SeqValue::Seq(x) = v {
            let n = x.dim0()?;
            match len {
                None => len = Some(n),
                Some(m) if m != n => {
                    return Err(Error::TemplateMismatch {
                        layer: t.name.clone(),
                        expected: format!("{m} frames in every input"),
                        got: format!("{n} frames"),
                    })
                }
                Some(_) => {}
            }
        }
    }
    let len = len.unwrap_or(horizon);

    let flat = inputs
        .into_iter()
        .map(|v| match v {
            SeqValue::Seq(x) => x.merge_lead(),
            SeqValue::Static(x) => x.expand_time(len)?.merge_lead(),
        })
        .collect::<Result<Vec<_>>>()?;
    let metas = env.graph.input_metas(t)?;
    let ctx = ForwardCtx {
        name: &t.name,
        desc: &t.desc,
        meta: &t.meta,
        input_metas: &metas,
        params: env.params,
        flags: env.flags,
        rows: len * rows,
        step: None,
    };
    let out = t.kind.forward(&ctx, &flat, None)?;
    check_value(t, &out.value, &[len * rows])?;
    out.value.split_lead(len, rows)
}

/// Run the moved-in layers over whole sequences, before the loop.
pub(crate) fn run_moved_in(env: &Env<'_>, partition: &Partition, horizon: usize) -> Result<MovedValues> {
    let order = env.graph.topo_order(&partition.moved_in, true)?;
    let mut out = MovedValues::default();
    for name in order {
        let t = env.graph.get(&name)?;
        let mut inputs = Vec::with_capacity(t.inputs.len());
        for r in &t.inputs {
            inputs.push(match r {
                LayerRef::Current(x) => SeqValue::Seq(out.get(x)?.clone()),
                LayerRef::Prev(x) => {
                    let first = env.initial_output(prev_frame(env, x)?, 1)?;
                    SeqValue::Seq(out.get(x)?.time_shift(&first)?)
                }
                LayerRef::Base(x) => SeqValue::Static(env.base(x)?.clone()),
                LayerRef::Data(k) => SeqValue::Seq(env.data(k)?.values.clone()),
            });
        }
        let value = evaluate_batched(env, t, inputs, env.batch, horizon)?;
        tracing::trace!(layer = %name, shape = %value.shape(), "moved-in layer computed");
        out.values.insert(name, value);
    }
    Ok(out)
}

fn prev_frame<'g>(env: &Env<'g>, name: &str) -> Result<&'g LayerTemplate> {
    let graph: &'g TemplateGraph = env.graph;
    graph
        .frame(name, true)
        .ok_or_else(|| Error::msg(format!("no previous-step template for '{name}'")))
}

/// Whole sequences of every layer after the loop, `[steps, batch * beam, ..]`.
pub(crate) struct Sequences<'e, 'a> {
    env: &'e Env<'a>,
    partition: &'e Partition,
    moved_in: &'e MovedValues,
    looped: BTreeMap<String, Tensor>,
    moved_out: BTreeMap<String, Tensor>,
    steps: usize,
}

impl<'e, 'a> Sequences<'e, 'a> {
    pub fn new(
        env: &'e Env<'a>,
        partition: &'e Partition,
        moved_in: &'e MovedValues,
        looped: BTreeMap<String, Tensor>,
        steps: usize,
    ) -> Self {
        Sequences {
            env,
            partition,
            moved_in,
            looped,
            moved_out: BTreeMap::new(),
            steps,
        }
    }

    /// Cut a sequence to the number of loop steps.
    fn fit(&self, what: &str, x: Tensor) -> Result<Tensor> {
        let len = x.dim0()?;
        if len < self.steps {
            return Err(Error::DataUnavailable {
                key: what.to_string(),
                step: len,
                len,
            });
        }
        if len == self.steps {
            return Ok(x);
        }
        x.narrow(0, 0, self.steps)
    }

    /// The sequence of a sibling layer, wherever it was computed.
    pub fn get(&self, name: &str) -> Result<Tensor> {
        if let Some(x) = self.moved_out.get(name) {
            return Ok(x.clone());
        }
        if let Some(x) = self.looped.get(name) {
            return Ok(x.clone());
        }
        if self.partition.moved_in.contains(name) {
            let x = self.moved_in.get(name)?.tile_axis(1, self.env.beam)?;
            return self.fit(name, x);
        }
        Err(Error::msg(format!("layer '{name}' has no sequence after the loop")))
    }

    /// Extern data, tiled over the beam and cut to the loop steps.
    pub fn data(&self, key: &str) -> Result<Tensor> {
        let x = self.env.data(key)?.values.tile_axis(1, self.env.beam)?;
        self.fit(key, x)
    }

    pub fn run_moved_out(&mut self) -> Result<()> {
        let env = self.env;
        let rows = env.rows();
        let order = env.graph.topo_order(&self.partition.moved_out, true)?;
        for name in order {
            let t = env.graph.get(&name)?;
            let mut inputs = Vec::with_capacity(t.inputs.len());
            for r in &t.inputs {
                inputs.push(match r {
                    LayerRef::Current(x) => SeqValue::Seq(self.get(x)?),
                    LayerRef::Prev(x) => {
                        let first = env.initial_output(prev_frame(env, x)?, env.beam)?;
                        SeqValue::Seq(self.get(x)?.time_shift(&first)?)
                    }
                    LayerRef::Base(x) => SeqValue::Static(env.base(x)?.tile_rows(env.beam)?),
                    LayerRef::Data(k) => SeqValue::Seq(self.data(k)?),
                });
            }
            let value = evaluate_batched(env, t, inputs, rows, self.steps)?;
            tracing::trace!(layer = %name, shape = %value.shape(), "moved-out layer computed");
            self.moved_out.insert(name, value);
        }
        Ok(())
    }
}

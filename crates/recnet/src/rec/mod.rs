//! The recurrent engine.
//!
//! A [`RecLayer`] is built in three phases:
//!
//! 1. **Templates** ([`template`]): output metadata of every layer for one
//!    abstract step, without values.
//! 2. **Partition** ([`partition`]): which layers run per step, which run
//!    once before the loop over the whole sequence, which run after it on
//!    the accumulated outputs.
//! 3. **Execution**: the pre-loop network ([`moved`]), the step loop
//!    ([`step`]), the beam backtrace ([`backtrace`]) and the post-loop
//!    network.
//!
//! All per-step tensors are `[batch * beam, ..]`, all sequences are
//! time-major `[T, batch * beam, ..]`.

pub mod accumulator;
pub mod backtrace;
pub mod layer;
pub mod moved;
pub mod partition;
pub mod step;
pub mod template;

pub use accumulator::{AccKey, Accumulator, Accumulators, LoopState};
pub use backtrace::{BacktraceResolver, ResolveState, SearchBeam};
pub use layer::{LossSummary, RecLayer, RecOutput};
pub use moved::MovedValues;
pub use partition::{needed_closure, Partition, Placement};
pub use step::LoopLength;
pub use template::{LayerTemplate, TemplateGraph};

use std::collections::BTreeMap;

use recnet_core::{Error, Result, Tensor};
use recnet_nn::{InitCtx, LayerRef, LayerState, NetworkFlags, ParamStore, StateInvariant};

use crate::network::SeqData;

/// Everything one forward pass reads, resolved up front.
pub(crate) struct Env<'a> {
    pub graph: &'a TemplateGraph,
    pub params: &'a ParamStore,
    pub flags: NetworkFlags,
    pub batch: usize,
    /// 1 unless searching.
    pub beam: usize,
    /// Extern data by reference key, trimmed and in loop direction.
    pub data: BTreeMap<String, SeqData>,
    /// Base layers, `[batch, ..]`.
    pub base: BTreeMap<String, Tensor>,
}

impl<'a> Env<'a> {
    pub fn rows(&self) -> usize {
        self.batch * self.beam
    }

    pub fn data(&self, key: &str) -> Result<&SeqData> {
        self.data
            .get(key)
            .ok_or_else(|| Error::MissingData { key: key.to_string() })
    }

    pub fn base(&self, name: &str) -> Result<&Tensor> {
        self.base.get(name).ok_or_else(|| Error::UnresolvedLayer {
            name: format!("base:{name}"),
            referenced_by: String::new(),
        })
    }

    /// Value of an external reference at one step, tiled over the beam.
    pub fn external_frame(&self, r: &LayerRef, step: usize) -> Result<Tensor> {
        match r {
            LayerRef::Base(name) => self.base(name)?.tile_rows(self.beam),
            LayerRef::Data(key) => self.data(key)?.frame(key, step)?.tile_rows(self.beam),
            other => Err(Error::msg(format!("{other} is not an external reference"))),
        }
    }

    fn init_ctx<'c>(
        &'c self,
        t: &'c LayerTemplate,
        beam: usize,
        lookup: &'c dyn Fn(&LayerRef) -> Result<Tensor>,
    ) -> InitCtx<'c> {
        InitCtx {
            name: &t.name,
            desc: &t.desc,
            meta: &t.meta,
            params: self.params,
            flags: self.flags,
            batch: self.batch,
            rows: self.batch * beam,
            lookup,
        }
    }

    fn base_lookup(&self, beam: usize) -> impl Fn(&LayerRef) -> Result<Tensor> + '_ {
        move |r: &LayerRef| match r {
            LayerRef::Base(name) => self.base(name)?.tile_rows(beam),
            other => Err(Error::msg(format!("initial values cannot read {other}"))),
        }
    }

    /// Value of `prev:<t>` before the first step, `[batch * beam, ..]`.
    pub fn initial_output(&self, t: &LayerTemplate, beam: usize) -> Result<Tensor> {
        let lookup = self.base_lookup(beam);
        let ctx = self.init_ctx(t, beam, &lookup);
        let value = t.kind.initial_output(&ctx)?;
        check_value(t, &value, &[ctx.rows])?;
        Ok(value)
    }

    /// Initial recurrent state of `t` and the envelope it must keep.
    pub fn initial_state(&self, t: &LayerTemplate, beam: usize) -> Result<(LayerState, StateInvariant)> {
        let lookup = self.base_lookup(beam);
        let ctx = self.init_ctx(t, beam, &lookup);
        let state = t.kind.initial_state(&ctx)?;
        let invariant = t.kind.state_invariant(&ctx, &state);
        check_state(&t.name, &state, &invariant)?;
        Ok((state, invariant))
    }
}

/// A realized value must match its template for the given leading axes.
pub(crate) fn check_value(t: &LayerTemplate, value: &Tensor, lead: &[usize]) -> Result<()> {
    let expected = t.meta.value_shape(lead);
    if value.shape() != expected || value.dtype() != t.meta.dtype {
        return Err(Error::TemplateMismatch {
            layer: t.name.clone(),
            expected: format!("{}{}", t.meta.dtype, expected),
            got: format!("{}{}", value.dtype(), value.shape()),
        });
    }
    Ok(())
}

pub(crate) fn check_state(layer: &str, state: &LayerState, invariant: &StateInvariant) -> Result<()> {
    for (key, value) in state.iter() {
        let envelope = invariant.get(key).ok_or_else(|| Error::TemplateMismatch {
            layer: layer.to_string(),
            expected: format!("state keys {:?}", invariant.keys().collect::<Vec<_>>()),
            got: format!("state key '{key}'"),
        })?;
        if !value.shape().matches_envelope(envelope) {
            return Err(Error::TemplateMismatch {
                layer: layer.to_string(),
                expected: format!("state '{key}' within {envelope:?}"),
                got: value.shape().to_string(),
            });
        }
    }
    Ok(())
}

// LayerKind: the contract between the recurrent engine and the layer catalog
//
// The engine never looks inside a layer. For every layer it asks the kind:
//
//   dependencies     which values the layer reads (parsed references)
//   infer_output     output metadata from input metadata (no values)
//   forward          the value for one batch of rows
//   initial_output   value of `prev:<layer>` at the first step
//   initial_state    recurrent state carried between steps, if any
//   state_invariant  which state dimensions may change between steps
//
// A kind that reads the hidden state of its sources rather than their
// outputs says so with `reads_hidden_state`.
//
// `forward` always sees inputs with a single leading row axis: inside the
// loop that is batch * beam, in the pre/post-loop networks it is
// time * batch * beam. A kind that cannot be evaluated row-wise (because it
// carries state from one step to the next) says so with `position_wise`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use recnet_core::{Error, Result, Shape, Tensor, TensorMeta};

use crate::desc::{InitialValue, LayerDesc, LayerRef};
use crate::params::{Init, ParamStore};
use crate::search::BeamChoice;

/// Mode flags of the enclosing network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFlags {
    /// Training: targets are available and are fed back as the choice output.
    #[serde(default)]
    pub train: bool,
    /// Beam search: choice layers pick hypotheses.
    #[serde(default)]
    pub search: bool,
    /// Losses and errors are computed.
    #[serde(default)]
    pub eval: bool,
}

impl NetworkFlags {
    pub fn training() -> Self {
        NetworkFlags {
            train: true,
            search: false,
            eval: true,
        }
    }

    pub fn searching() -> Self {
        NetworkFlags {
            train: false,
            search: true,
            eval: false,
        }
    }

    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    pub fn with_eval(mut self, eval: bool) -> Self {
        self.eval = eval;
        self
    }
}

/// Context for shape inference.
pub struct InferCtx<'a> {
    pub name: &'a str,
    pub desc: &'a LayerDesc,
    pub flags: NetworkFlags,
    /// Metadata of the layer's `target` data, if it names one.
    pub target: Option<&'a TensorMeta>,
}

/// Per-step information exposed to in-loop layers.
#[derive(Debug, Clone)]
pub struct StepInfo {
    /// Loop iteration, starting at 0.
    pub index: usize,
    /// Bool `[rows]`: hypotheses that ended before this step.
    pub ended: Option<Tensor>,
}

/// Context for one `forward` call.
pub struct ForwardCtx<'a> {
    pub name: &'a str,
    pub desc: &'a LayerDesc,
    /// The layer's own template metadata.
    pub meta: &'a TensorMeta,
    pub input_metas: &'a [TensorMeta],
    pub params: &'a ParamStore,
    pub flags: NetworkFlags,
    /// Size of the leading row axis of every input and of the output.
    pub rows: usize,
    /// Set inside the loop, `None` in the pre/post-loop networks.
    pub step: Option<&'a StepInfo>,
}

/// Context for initial outputs and initial states.
pub struct InitCtx<'a> {
    pub name: &'a str,
    pub desc: &'a LayerDesc,
    pub meta: &'a TensorMeta,
    pub params: &'a ParamStore,
    pub flags: NetworkFlags,
    /// Batch size without beam.
    pub batch: usize,
    /// Rows of the loop: batch * beam.
    pub rows: usize,
    /// Value of an external reference, tiled to `rows`.
    pub lookup: &'a dyn Fn(&LayerRef) -> Result<Tensor>,
}

/// Named tensors a layer carries from one step to the next.
#[derive(Debug, Clone, Default)]
pub struct LayerState(BTreeMap<String, Tensor>);

impl LayerState {
    pub fn new() -> Self {
        LayerState(BTreeMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: Tensor) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Result<&Tensor> {
        self.0
            .get(key)
            .ok_or_else(|| Error::msg(format!("layer state has no entry '{key}'")))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.0.iter()
    }

    /// Every entry as `[rows, n]`, concatenated in key order.
    pub fn flatten(&self) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(self.0.len());
        for v in self.0.values() {
            let rows = v.dim0()?;
            parts.push(v.reshape(vec![rows, v.elem_count() / rows.max(1)])?);
        }
        match parts.len() {
            0 => Err(Error::msg("layer state is empty")),
            1 => Ok(parts.remove(0)),
            _ => Tensor::concat(&parts, 1),
        }
    }

    /// Apply `f` to every tensor.
    pub fn try_map(&self, mut f: impl FnMut(&Tensor) -> Result<Tensor>) -> Result<LayerState> {
        let mut out = BTreeMap::new();
        for (k, v) in &self.0 {
            out.insert(k.clone(), f(v)?);
        }
        Ok(LayerState(out))
    }
}

/// Result of one `forward` call.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub value: Tensor,
    /// New recurrent state, for kinds that carry one.
    pub state: Option<LayerState>,
    /// Beam bookkeeping of a search choice.
    pub choice: Option<BeamChoice>,
}

impl LayerOutput {
    pub fn value(value: Tensor) -> Self {
        LayerOutput {
            value,
            state: None,
            choice: None,
        }
    }
}

/// Per-key shape envelope of a recurrent state; `None` matches any size.
pub type StateInvariant = BTreeMap<String, Vec<Option<usize>>>;

/// A layer kind in the catalog.
pub trait LayerKind: Send + Sync {
    /// Class name used in layer descriptions.
    fn kind(&self) -> &'static str;

    /// Values this layer reads. Defaults to the parsed `from` list.
    fn dependencies(&self, _name: &str, desc: &LayerDesc, _flags: NetworkFlags) -> Result<Vec<LayerRef>> {
        Ok(desc.sources())
    }

    /// Output metadata, given the metadata of `dependencies` in order.
    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta>;

    /// Compute the output for `ctx.rows` rows.
    fn forward(
        &self,
        ctx: &ForwardCtx<'_>,
        inputs: &[Tensor],
        state: Option<&LayerState>,
    ) -> Result<LayerOutput>;

    /// Whether this layer makes the beam-search decision in this mode.
    fn is_choice(&self, _flags: NetworkFlags) -> bool {
        false
    }

    /// Whether this layer carries a recurrent state in this mode.
    fn has_state(&self, _desc: &LayerDesc, _flags: NetworkFlags) -> bool {
        false
    }

    /// Whether `forward` receives the hidden state of each source (see
    /// [`LayerState::flatten`]) instead of its output.
    fn reads_hidden_state(&self) -> bool {
        false
    }

    /// Whether the layer can be evaluated on all time steps at once.
    fn position_wise(&self, desc: &LayerDesc, flags: NetworkFlags) -> bool {
        !self.has_state(desc, flags)
    }

    fn initial_output(&self, ctx: &InitCtx<'_>) -> Result<Tensor> {
        default_initial_output(ctx)
    }

    fn initial_state(&self, _ctx: &InitCtx<'_>) -> Result<LayerState> {
        Ok(LayerState::new())
    }

    /// Envelope the state must keep across steps. Defaults to the exact
    /// shapes of the initial state.
    fn state_invariant(&self, _ctx: &InitCtx<'_>, initial: &LayerState) -> StateInvariant {
        initial
            .iter()
            .map(|(k, v)| (k.clone(), v.dims().iter().map(|&d| Some(d)).collect()))
            .collect()
    }
}

/// Apply an [`InitialValue`] rule for a `[rows, ..shape]` value.
///
/// `param_key` names the learned vector used by [`InitialValue::Var`].
pub fn initial_value(
    ctx: &InitCtx<'_>,
    rule: &InitialValue,
    shape: &Shape,
    param_key: &str,
) -> Result<Tensor> {
    let dtype = ctx.meta.dtype;
    let full = shape.prepend(&[ctx.rows]);
    match rule {
        InitialValue::Zeros => Ok(Tensor::zeros(full, dtype)),
        InitialValue::Ones => Ok(Tensor::ones(full, dtype)),
        InitialValue::Constant(v) => Ok(Tensor::full(full, *v, dtype)),
        InitialValue::Var => {
            let var = ctx.params.get_or_init(param_key, shape.clone(), Init::Zeros)?;
            var.to_dtype(dtype).unsqueeze0()?.tile_rows(ctx.rows)
        }
        InitialValue::Layer(r) => {
            let value = (ctx.lookup)(r)?;
            if value.dims() != full.dims() {
                return Err(Error::TemplateMismatch {
                    layer: ctx.name.to_string(),
                    expected: full.to_string(),
                    got: format!("{} from {}", value.shape(), r),
                });
            }
            Ok(value.to_dtype(dtype))
        }
    }
}

/// The `initial_output` option applied to the layer's template shape.
pub fn default_initial_output(ctx: &InitCtx<'_>) -> Result<Tensor> {
    let rule = InitialValue::parse(ctx.name, "initial_output", ctx.desc.initial_output.as_ref())?;
    let key = format!("{}/initial_output", ctx.name);
    initial_value(ctx, &rule, &ctx.meta.feature_shape, &key)
}

/// Concatenate inputs into `[rows, features]`, one-hot encoding sparse ones.
pub fn dense_features(inputs: &[Tensor], metas: &[TensorMeta]) -> Result<Tensor> {
    let mut parts = Vec::with_capacity(inputs.len());
    for (x, meta) in inputs.iter().zip(metas) {
        let rows = x.dim0()?;
        let part = match meta.sparse_dim {
            Some(classes) => x.one_hot(classes)?,
            None => x.to_dtype(recnet_core::DType::F32).reshape(vec![rows, meta.feature_shape.elem_count()])?,
        };
        parts.push(part);
    }
    match parts.len() {
        0 => Err(Error::msg("layer has no inputs")),
        1 => Ok(parts.remove(0)),
        _ => Tensor::concat(&parts, 1),
    }
}

/// Width of [`dense_features`] for the given input metadata.
pub fn dense_width(metas: &[TensorMeta]) -> usize {
    metas
        .iter()
        .map(|m| match m.sparse_dim {
            Some(d) => d,
            None => m.feature_shape.elem_count(),
        })
        .sum()
}

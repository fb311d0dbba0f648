// Recurrent cells and the `rnn_cell` layer
//
// A recurrent cell advances a named state by one step. The `rnn_cell` layer
// wraps a cell picked by its `unit` option:
//
//   1. rnn   vanilla Elman cell, state {h}
//   2. lstm  Long Short-Term Memory, state {c, h}
//
// The layer's output is the new `h`. Its state lives in the loop state of
// the recurrent engine, so an `rnn_cell` layer always stays in the loop.
//
// SHAPES:
//   input:  [rows, input_size]     (all sources concatenated, labels one-hot)
//   state:  [rows, n_out] per key
//   output: [rows, n_out]
//
// WEIGHT INITIALIZATION:
//   Weights and bias use U(-k, k) with k = sqrt(1 / n_out), following
//   PyTorch's default for recurrent layers.
//
//   <layer>/W_ih  [input_size, gates * n_out]
//   <layer>/W_hh  [n_out, gates * n_out]
//   <layer>/b     [gates * n_out]
//
// INITIAL STATE (`initial_state` option, per state key):
//   "zeros" (default), "ones", a number, "var" (learned vector
//   <layer>/initial_<key>), or "base:<layer>".
//
// `get_last_hidden_state` reads the state instead of the output of its
// `rnn_cell` sources (usually `prev:s`): all keys concatenated in key order,
// so an LSTM gives [c, h]. Several sources are joined by `combine`
// ("concat", the default, or "add"), and the result must have `n_out`
// features.

use std::collections::BTreeMap;
use std::sync::Arc;

use recnet_core::{Error, Result, Shape, Tensor, TensorMeta};

use crate::desc::{InitialValue, LayerDesc, LayerRef};
use crate::kind::{
    dense_features, dense_width, initial_value, ForwardCtx, InferCtx, InitCtx, LayerKind, LayerOutput,
    LayerState, NetworkFlags,
};
use crate::params::{Init, ParamStore};

/// A single-step recurrent cell.
pub trait RecurrentCell: Send + Sync {
    /// Unit name used in descriptions.
    fn name(&self) -> &'static str;

    /// Keys of the state this cell carries.
    fn state_keys(&self) -> &'static [&'static str];

    /// Number of gate blocks in the weight matrices.
    fn gates(&self) -> usize;

    /// Compute the next state from input `x` and the current `state`.
    fn step(&self, x: &Tensor, state: &LayerState, weights: &CellWeights) -> Result<LayerState>;
}

/// Weights of one cell, fetched from the parameter store.
pub struct CellWeights {
    pub w_ih: Tensor,
    pub w_hh: Tensor,
    pub b: Tensor,
    pub n_out: usize,
}

impl CellWeights {
    pub fn load(params: &ParamStore, layer: &str, n_in: usize, n_out: usize, gates: usize) -> Result<Self> {
        let k = (1.0 / n_out as f32).sqrt();
        Ok(CellWeights {
            w_ih: params.get_or_init(&format!("{layer}/W_ih"), (n_in, gates * n_out), Init::Uniform(k))?,
            w_hh: params.get_or_init(&format!("{layer}/W_hh"), (n_out, gates * n_out), Init::Uniform(k))?,
            b: params.get_or_init(&format!("{layer}/b"), gates * n_out, Init::Uniform(k))?,
            n_out,
        })
    }

    /// x @ W_ih + h @ W_hh + b → [rows, gates * n_out]
    fn gates(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        x.matmul(&self.w_ih)?.add(&h.matmul(&self.w_hh)?)?.add(&self.b)
    }
}

// RnnCell: vanilla cell
//
// h' = tanh(x @ W_ih + h @ W_hh + b)

/// Vanilla Elman cell.
pub struct RnnCell;

impl RecurrentCell for RnnCell {
    fn name(&self) -> &'static str {
        "rnn"
    }

    fn state_keys(&self) -> &'static [&'static str] {
        &["h"]
    }

    fn gates(&self) -> usize {
        1
    }

    fn step(&self, x: &Tensor, state: &LayerState, w: &CellWeights) -> Result<LayerState> {
        let h = w.gates(x, state.get("h")?)?.tanh();
        Ok(LayerState::new().with("h", h))
    }
}

// LstmCell: single-step LSTM
//
// gates = x @ W_ih + h @ W_hh + b        # [rows, 4 * n_out]
// i, f, g, o = chunk(gates, 4)
// c' = sigmoid(f) * c + sigmoid(i) * tanh(g)
// h' = sigmoid(o) * tanh(c')

/// Long Short-Term Memory cell.
pub struct LstmCell;

impl RecurrentCell for LstmCell {
    fn name(&self) -> &'static str {
        "lstm"
    }

    fn state_keys(&self) -> &'static [&'static str] {
        &["c", "h"]
    }

    fn gates(&self) -> usize {
        4
    }

    fn step(&self, x: &Tensor, state: &LayerState, w: &CellWeights) -> Result<LayerState> {
        let gates = w.gates(x, state.get("h")?)?;
        let n = w.n_out;
        let chunk = |i: usize| gates.narrow(1, i * n, n);
        let i = chunk(0)?.sigmoid();
        let f = chunk(1)?.sigmoid();
        let g = chunk(2)?.tanh();
        let o = chunk(3)?.sigmoid();
        let c = f.mul(state.get("c")?)?.add(&i.mul(&g)?)?;
        let h = o.mul(&c.tanh())?;
        Ok(LayerState::new().with("c", c).with("h", h))
    }
}

/// Recurrent cells by unit name.
pub struct CellRegistry {
    cells: BTreeMap<String, Arc<dyn RecurrentCell>>,
}

impl CellRegistry {
    pub fn new() -> Self {
        CellRegistry {
            cells: BTreeMap::new(),
        }
    }

    /// Registry with the `rnn` and `lstm` cells.
    pub fn with_defaults() -> Self {
        let mut reg = CellRegistry::new();
        reg.register(Arc::new(RnnCell));
        reg.register(Arc::new(LstmCell));
        reg
    }

    pub fn register(&mut self, cell: Arc<dyn RecurrentCell>) {
        self.cells.insert(cell.name().to_string(), cell);
    }

    pub fn get(&self, unit: &str) -> Result<Arc<dyn RecurrentCell>> {
        self.cells
            .get(unit)
            .cloned()
            .ok_or_else(|| Error::UnknownCell { unit: unit.to_string() })
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.cells.contains_key(unit)
    }
}

impl Default for CellRegistry {
    fn default() -> Self {
        CellRegistry::with_defaults()
    }
}

/// `rnn_cell` layer.
pub struct RnnCellKind {
    cells: Arc<CellRegistry>,
}

impl RnnCellKind {
    pub fn new(cells: Arc<CellRegistry>) -> Self {
        RnnCellKind { cells }
    }

    fn cell(&self, name: &str, desc: &LayerDesc) -> Result<Arc<dyn RecurrentCell>> {
        let unit = desc
            .opt_str(name, "unit")?
            .ok_or_else(|| Error::invalid_option(name, "unit", "required"))?;
        self.cells.get(unit)
    }

    fn initial_rule(name: &str, desc: &LayerDesc) -> Result<InitialValue> {
        InitialValue::parse(name, "initial_state", desc.opt("initial_state"))
    }
}

impl LayerKind for RnnCellKind {
    fn kind(&self) -> &'static str {
        "rnn_cell"
    }

    fn dependencies(&self, name: &str, desc: &LayerDesc, _flags: NetworkFlags) -> Result<Vec<LayerRef>> {
        let mut deps = desc.sources();
        if let Some(r) = Self::initial_rule(name, desc)?.dependency() {
            deps.push(r.clone());
        }
        Ok(deps)
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        self.cell(ctx.name, ctx.desc)?;
        if ctx.desc.from.is_empty() {
            return Err(Error::invalid_option(ctx.name, "from", "needs at least one source"));
        }
        if inputs.len() < ctx.desc.from.len() {
            return Err(Error::msg(format!("layer '{}': missing source metadata", ctx.name)));
        }
        let n_out = ctx.desc.req_usize(ctx.name, "n_out")?;
        Ok(TensorMeta::dense(n_out))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], state: Option<&LayerState>) -> Result<LayerOutput> {
        let cell = self.cell(ctx.name, ctx.desc)?;
        let state = state.ok_or_else(|| Error::msg(format!("layer '{}': no recurrent state", ctx.name)))?;
        // Sources only; an `initial_state` layer is appended after them.
        let n_src = ctx.desc.from.len();
        if inputs.len() < n_src || ctx.input_metas.len() < n_src {
            return Err(Error::msg(format!("layer '{}': missing source values", ctx.name)));
        }
        let metas = &ctx.input_metas[..n_src];
        let x = dense_features(&inputs[..n_src], metas)?;
        let weights = CellWeights::load(ctx.params, ctx.name, dense_width(metas), ctx.meta.dim(), cell.gates())?;
        let new_state = cell.step(&x, state, &weights)?;
        let h = new_state.get("h")?.clone();
        Ok(LayerOutput {
            value: h,
            state: Some(new_state),
            choice: None,
        })
    }

    fn has_state(&self, _desc: &LayerDesc, _flags: NetworkFlags) -> bool {
        true
    }

    fn initial_state(&self, ctx: &InitCtx<'_>) -> Result<LayerState> {
        let cell = self.cell(ctx.name, ctx.desc)?;
        let rule = Self::initial_rule(ctx.name, ctx.desc)?;
        let shape = Shape::from(ctx.meta.dim());
        let mut state = LayerState::new();
        for key in cell.state_keys() {
            let param = format!("{}/initial_{}", ctx.name, key);
            state.insert(*key, initial_value(ctx, &rule, &shape, &param)?);
        }
        Ok(state)
    }
}

/// `get_last_hidden_state` layer.
pub struct LastHiddenStateKind;

impl LayerKind for LastHiddenStateKind {
    fn kind(&self) -> &'static str {
        "get_last_hidden_state"
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, _inputs: &[TensorMeta]) -> Result<TensorMeta> {
        if ctx.desc.from.is_empty() {
            return Err(Error::invalid_option(ctx.name, "from", "needs at least one source"));
        }
        match ctx.desc.opt_str(ctx.name, "combine")? {
            None | Some("concat") | Some("add") => {}
            Some(other) => {
                return Err(Error::invalid_option(
                    ctx.name,
                    "combine",
                    format!("expected \"concat\" or \"add\", got \"{other}\""),
                ))
            }
        }
        Ok(TensorMeta::dense(ctx.desc.req_usize(ctx.name, "n_out")?))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        let h = match (inputs, ctx.desc.opt_str(ctx.name, "combine")?) {
            ([], _) => return Err(Error::msg(format!("layer '{}': no hidden states", ctx.name))),
            ([one], _) => one.clone(),
            (many, Some("add")) => {
                let mut sum = many[0].clone();
                for h in &many[1..] {
                    sum = sum.add(h)?;
                }
                sum
            }
            (many, _) => Tensor::concat(many, 1)?,
        };
        let n_out = ctx.meta.dim();
        if h.rank() != 2 || h.dims()[1] != n_out {
            return Err(Error::TemplateMismatch {
                layer: ctx.name.to_string(),
                expected: format!("[rows, {n_out}]"),
                got: h.shape().to_string(),
            });
        }
        Ok(LayerOutput::value(h))
    }

    fn reads_hidden_state(&self) -> bool {
        true
    }

    fn position_wise(&self, _desc: &LayerDesc, _flags: NetworkFlags) -> bool {
        false
    }
}

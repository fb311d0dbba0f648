// Choice layer: the beam-search decision point
//
//   {"class": "choice", "from": ["output_prob"], "target": "classes",
//    "beam_size": 4, "input_type": "prob", "length_normalization": true}
//
// SEARCH MODE
//   The single source holds per-row scores over the label vocabulary,
//   either probabilities ("prob", log taken here) or log-probabilities
//   ("log_prob"). The layer keeps the running beam scores as its recurrent
//   state ("scores", [batch, beam_in]), runs one beam step and returns the
//   chosen labels [batch * beam_size]. The source beam of every new slot is
//   reported as a BeamChoice for the engine's backtrace.
//
//   `explicit_search_source` adds one more dependency (usually
//   "prev:output"), used only to order the layer inside the loop.
//
// OTHERWISE
//   The layer returns the target labels (target feeding). Its only
//   dependency is the target data, so it is computed before the loop.

use recnet_core::{DType, Error, Result, Tensor, TensorMeta};

use crate::desc::{LayerDesc, LayerRef};
use crate::kind::{
    ForwardCtx, InferCtx, InitCtx, LayerKind, LayerOutput, LayerState, NetworkFlags, StateInvariant,
};
use crate::search::{beam_step, BeamChoice, BeamStepInput};

/// How the source scores are to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceInput {
    Prob,
    LogProb,
}

/// `choice` layer.
pub struct ChoiceKind;

impl ChoiceKind {
    fn beam_size(name: &str, desc: &LayerDesc) -> Result<usize> {
        let k = desc.req_usize(name, "beam_size")?;
        if k == 0 {
            return Err(Error::invalid_option(name, "beam_size", "must be at least 1"));
        }
        Ok(k)
    }

    fn input_type(name: &str, desc: &LayerDesc) -> Result<ChoiceInput> {
        match desc.opt_str(name, "input_type")?.unwrap_or("prob") {
            "prob" => Ok(ChoiceInput::Prob),
            "log_prob" => Ok(ChoiceInput::LogProb),
            other => Err(Error::invalid_option(
                name,
                "input_type",
                format!("unsupported input type '{other}'"),
            )),
        }
    }

    fn target<'a>(name: &str, desc: &'a LayerDesc) -> Result<&'a str> {
        desc.target
            .as_deref()
            .ok_or_else(|| Error::invalid_option(name, "target", "required outside of search"))
    }
}

impl LayerKind for ChoiceKind {
    fn kind(&self) -> &'static str {
        "choice"
    }

    fn dependencies(&self, name: &str, desc: &LayerDesc, flags: NetworkFlags) -> Result<Vec<LayerRef>> {
        if !flags.search {
            return Ok(vec![LayerRef::Data(Self::target(name, desc)?.to_string())]);
        }
        let mut deps = desc.sources();
        if deps.len() != 1 {
            return Err(Error::invalid_option(name, "from", "expects exactly one score source"));
        }
        if let Some(extra) = desc.opt_str(name, "explicit_search_source")? {
            deps.push(LayerRef::parse(extra));
        }
        Ok(deps)
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        if !ctx.flags.search {
            let target = ctx
                .target
                .ok_or_else(|| Error::MissingData {
                    key: Self::target(ctx.name, ctx.desc).unwrap_or("target").to_string(),
                })?;
            return Ok(target.clone().with_beam(None));
        }
        let k = Self::beam_size(ctx.name, ctx.desc)?;
        Self::input_type(ctx.name, ctx.desc)?;
        let scores = inputs
            .first()
            .ok_or_else(|| Error::invalid_option(ctx.name, "from", "expects exactly one score source"))?;
        Ok(TensorMeta::sparse(scores.dim()).with_beam(Some(k)))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], state: Option<&LayerState>) -> Result<LayerOutput> {
        let source = inputs
            .first()
            .ok_or_else(|| Error::invalid_option(ctx.name, "from", "missing source"))?;
        if !ctx.flags.search {
            return Ok(LayerOutput::value(source.to_dtype(DType::I32)));
        }

        let k = Self::beam_size(ctx.name, ctx.desc)?;
        let normalize = ctx
            .desc
            .opt_bool(ctx.name, "length_normalization")?
            .unwrap_or(true);
        let scores_in = match Self::input_type(ctx.name, ctx.desc)? {
            ChoiceInput::Prob => source.log(),
            ChoiceInput::LogProb => source.to_dtype(DType::F32),
        };
        let state = state.ok_or_else(|| Error::msg(format!("layer '{}': no beam scores", ctx.name)))?;
        let scores_base = state.get("scores")?;
        let (batch, beam_in) = match scores_base.dims() {
            [b, h] => (*b, *h),
            _ => {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: scores_base.rank(),
                })
            }
        };
        if ctx.rows != batch * k {
            return Err(Error::TemplateMismatch {
                layer: ctx.name.to_string(),
                expected: format!("{} rows", batch * k),
                got: format!("{} rows", ctx.rows),
            });
        }
        let step = ctx.step.map_or(0, |s| s.index);
        let ended = ctx.step.and_then(|s| s.ended.as_ref()).map(Tensor::to_bools);
        let base = scores_base.to_vec();
        let cand = scores_in.to_vec();
        let dim = ctx.meta.dim();
        let chosen = beam_step(BeamStepInput {
            scores_base: &base,
            scores_in: &cand,
            ended: ended.as_deref(),
            batch,
            beam_in,
            beam_size: k,
            dim,
            step,
            length_normalization: normalize,
        })?;
        tracing::trace!(
            layer = ctx.name,
            step,
            labels = ?chosen.labels,
            src_beams = ?chosen.src_beams,
            "beam step"
        );

        let labels = Tensor::from_labels(&chosen.labels, ctx.rows)?;
        let scores = Tensor::from_vec(chosen.scores, (batch, k), DType::F32)?;
        Ok(LayerOutput {
            value: labels,
            state: Some(LayerState::new().with("scores", scores)),
            choice: Some(BeamChoice::new(k, batch, &chosen.src_beams)?),
        })
    }

    fn is_choice(&self, flags: NetworkFlags) -> bool {
        flags.search
    }

    fn has_state(&self, _desc: &LayerDesc, flags: NetworkFlags) -> bool {
        flags.search
    }

    fn initial_state(&self, ctx: &InitCtx<'_>) -> Result<LayerState> {
        if !ctx.flags.search {
            return Ok(LayerState::new());
        }
        Ok(LayerState::new().with("scores", Tensor::zeros((ctx.batch, 1), DType::F32)))
    }

    /// The beam dimension grows from 1 to `beam_size` after the first step.
    fn state_invariant(&self, ctx: &InitCtx<'_>, _initial: &LayerState) -> StateInvariant {
        let mut inv = StateInvariant::new();
        if ctx.flags.search {
            inv.insert("scores".to_string(), vec![Some(ctx.batch), None]);
        }
        inv
    }
}

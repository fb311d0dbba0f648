// Step index layer
//
//   {"from": [":i"]}   or   {"i": {"class": "step_info"}}
//
// The current loop iteration as an I32 scalar per row, starting at 0. A
// reference to `:i` that the subnetwork does not define is served by this
// kind. It only exists inside the loop, so it is never moved in or out.

use recnet_core::{DType, Error, Result, Tensor, TensorMeta};

use crate::desc::{LayerDesc, LayerRef};
use crate::kind::{ForwardCtx, InferCtx, LayerKind, LayerOutput, LayerState, NetworkFlags};

/// Name under which a subnetwork reads the step index.
pub const STEP_INDEX_LAYER: &str = ":i";

/// `step_info` layer.
pub struct StepInfoKind;

impl LayerKind for StepInfoKind {
    fn kind(&self) -> &'static str {
        "step_info"
    }

    fn dependencies(&self, _name: &str, _desc: &LayerDesc, _flags: NetworkFlags) -> Result<Vec<LayerRef>> {
        Ok(Vec::new())
    }

    fn infer_output(&self, _ctx: &InferCtx<'_>, _inputs: &[TensorMeta]) -> Result<TensorMeta> {
        Ok(TensorMeta::dense(()).with_dtype(DType::I32))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, _inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        let step = ctx
            .step
            .ok_or_else(|| Error::msg(format!("layer '{}': the step index exists only inside the loop", ctx.name)))?;
        Ok(LayerOutput::value(Tensor::full(ctx.rows, step.index as f32, DType::I32)))
    }

    fn position_wise(&self, _desc: &LayerDesc, _flags: NetworkFlags) -> bool {
        false
    }
}

// Constant layer
//
//   {"class": "constant", "value": 1.0, "shape": [], "dtype": "f32"}
//
// Has no sources. Its value is the same for every row, so the loop
// partitioner always moves it out of the per-step computation.

use recnet_core::{DType, Result, Shape, Tensor, TensorMeta};

use crate::desc::{LayerDesc, LayerRef};
use crate::kind::{ForwardCtx, InferCtx, LayerKind, LayerOutput, LayerState, NetworkFlags};

/// `constant` layer.
pub struct ConstantKind;

impl ConstantKind {
    fn settings(name: &str, desc: &LayerDesc) -> Result<(f32, Shape, DType)> {
        let value = desc.opt_f32(name, "value")?.unwrap_or(0.0);
        let shape = desc.opt_as::<Shape>(name, "shape")?.unwrap_or_default();
        let dtype = desc.opt_as::<DType>(name, "dtype")?.unwrap_or(DType::F32);
        Ok((value, shape, dtype))
    }
}

impl LayerKind for ConstantKind {
    fn kind(&self) -> &'static str {
        "constant"
    }

    fn dependencies(&self, _name: &str, _desc: &LayerDesc, _flags: NetworkFlags) -> Result<Vec<LayerRef>> {
        Ok(Vec::new())
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, _inputs: &[TensorMeta]) -> Result<TensorMeta> {
        let (_, shape, dtype) = Self::settings(ctx.name, ctx.desc)?;
        Ok(TensorMeta::dense(shape).with_dtype(dtype))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, _inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        let (value, shape, dtype) = Self::settings(ctx.name, ctx.desc)?;
        Ok(LayerOutput::value(Tensor::full(shape.prepend(&[ctx.rows]), value, dtype)))
    }
}

// Linear: fully-connected layer over all sources
//
//   y = act([x_1, .., x_n] @ W + b)
//
// Sources are concatenated on the feature axis; sparse sources (labels) are
// one-hot encoded first, which makes a linear layer on a label input an
// embedding lookup.
//
// PARAMETER SHAPES:
//
//   <layer>/W   [in_features, n_out]   Xavier uniform
//   <layer>/b   [n_out]                zeros
//
// `softmax` is the same layer with a softmax activation whose `n_out`
// defaults to the number of target classes.

use recnet_core::{Error, Result, Tensor, TensorMeta};

use crate::activation::Activation;
use crate::kind::{dense_features, dense_width, ForwardCtx, InferCtx, LayerKind, LayerOutput, LayerState};
use crate::params::Init;

/// Affine transform of the concatenated sources followed by an activation.
fn affine(ctx: &ForwardCtx<'_>, inputs: &[Tensor], act: Activation) -> Result<Tensor> {
    let with_bias = ctx.desc.opt_bool(ctx.name, "with_bias")?.unwrap_or(true);
    let n_out = ctx.meta.dim();
    let x = dense_features(inputs, ctx.input_metas)?;
    let n_in = dense_width(ctx.input_metas);
    let w = ctx
        .params
        .get_or_init(&format!("{}/W", ctx.name), (n_in, n_out), Init::XavierUniform)?;
    let mut y = x.matmul(&w)?;
    if with_bias {
        let b = ctx
            .params
            .get_or_init(&format!("{}/b", ctx.name), n_out, Init::Zeros)?;
        y = y.add(&b)?;
    }
    act.apply(&y)
}

fn check_sources(ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<()> {
    if inputs.is_empty() {
        return Err(Error::invalid_option(ctx.name, "from", "needs at least one source"));
    }
    if let Some(bad) = inputs.iter().find(|m| !m.is_sparse() && m.feature_shape.rank() > 1) {
        return Err(Error::invalid_option(
            ctx.name,
            "from",
            format!("source of shape {} is not a feature vector", bad.feature_shape),
        ));
    }
    Ok(())
}

/// `linear` layer.
pub struct LinearKind;

impl LayerKind for LinearKind {
    fn kind(&self) -> &'static str {
        "linear"
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        check_sources(ctx, inputs)?;
        Activation::from_desc(ctx.name, ctx.desc, Activation::Identity)?;
        let n_out = ctx.desc.req_usize(ctx.name, "n_out")?;
        Ok(TensorMeta::dense(n_out))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        let act = Activation::from_desc(ctx.name, ctx.desc, Activation::Identity)?;
        Ok(LayerOutput::value(affine(ctx, inputs, act)?))
    }
}

/// `softmax` layer: a linear layer producing a probability distribution.
pub struct SoftmaxKind;

impl LayerKind for SoftmaxKind {
    fn kind(&self) -> &'static str {
        "softmax"
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        check_sources(ctx, inputs)?;
        let n_out = match ctx.desc.opt_usize(ctx.name, "n_out")? {
            Some(n) => n,
            None => ctx
                .target
                .map(TensorMeta::dim)
                .ok_or_else(|| Error::invalid_option(ctx.name, "n_out", "required without a target"))?,
        };
        Ok(TensorMeta::dense(n_out))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        Ok(LayerOutput::value(affine(ctx, inputs, Activation::Softmax)?))
    }
}

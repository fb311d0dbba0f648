// Copy, combine and compare layers
//
//   copy      one source: identity; several: concatenation on the feature axis
//   combine   element-wise add / sub / mul of all sources (broadcasting)
//   compare   element-wise comparison of two sources, or of one source and
//             the `value` option; yields a bool flag (used for `end` layers)
//
// Broadcasting aligns feature axes only; the leading row axis is shared.

use recnet_core::{DType, Error, Result, Shape, Tensor, TensorMeta};

use crate::kind::{dense_features, dense_width, ForwardCtx, InferCtx, LayerKind, LayerOutput, LayerState};

/// Insert singleton feature axes so `x` has rank `rank`: `[rows, f..]` ->
/// `[rows, 1.., f..]`.
fn align_rank(x: &Tensor, rank: usize) -> Result<Tensor> {
    if x.rank() >= rank {
        return Ok(x.clone());
    }
    let dims = x.dims();
    let mut aligned = vec![dims[0]];
    aligned.extend(std::iter::repeat(1).take(rank - dims.len()));
    aligned.extend_from_slice(&dims[1..]);
    x.reshape(aligned)
}

fn broadcast_features(name: &str, inputs: &[TensorMeta]) -> Result<Shape> {
    let mut shape = Shape::from(());
    for m in inputs {
        shape = Shape::broadcast_shape(&shape, &m.feature_shape)
            .map_err(|_| Error::invalid_option(name, "from", format!("cannot broadcast {} with {}", shape, m.feature_shape)))?;
    }
    Ok(shape)
}

/// `copy` layer.
pub struct CopyKind;

impl LayerKind for CopyKind {
    fn kind(&self) -> &'static str {
        "copy"
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        match inputs {
            [] => Err(Error::invalid_option(ctx.name, "from", "needs at least one source")),
            [x] => Ok(x.clone().with_beam(None)),
            many => Ok(TensorMeta::dense(dense_width(many))),
        }
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        match inputs {
            [x] => Ok(LayerOutput::value(x.clone())),
            _ => Ok(LayerOutput::value(dense_features(inputs, ctx.input_metas)?)),
        }
    }
}

/// Element-wise operation of a `combine` layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineOp {
    Add,
    Sub,
    Mul,
}

impl CombineOp {
    fn from_desc(ctx_name: &str, desc: &crate::desc::LayerDesc) -> Result<Self> {
        match desc.opt_str(ctx_name, "kind")?.unwrap_or("add") {
            "add" => Ok(CombineOp::Add),
            "sub" => Ok(CombineOp::Sub),
            "mul" => Ok(CombineOp::Mul),
            other => Err(Error::invalid_option(ctx_name, "kind", format!("unknown combine kind '{other}'"))),
        }
    }
}

/// `combine` layer.
pub struct CombineKind;

impl LayerKind for CombineKind {
    fn kind(&self) -> &'static str {
        "combine"
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        CombineOp::from_desc(ctx.name, ctx.desc)?;
        if inputs.is_empty() {
            return Err(Error::invalid_option(ctx.name, "from", "needs at least one source"));
        }
        let shape = broadcast_features(ctx.name, inputs)?;
        Ok(TensorMeta::dense(shape))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        let op = CombineOp::from_desc(ctx.name, ctx.desc)?;
        let rank = ctx.meta.feature_shape.rank() + 1;
        let mut iter = inputs.iter();
        let first = iter
            .next()
            .ok_or_else(|| Error::invalid_option(ctx.name, "from", "needs at least one source"))?;
        let mut acc = align_rank(&first.to_dtype(DType::F32), rank)?;
        for x in iter {
            let x = align_rank(x, rank)?;
            acc = match op {
                CombineOp::Add => acc.add(&x)?,
                CombineOp::Sub => acc.sub(&x)?,
                CombineOp::Mul => acc.mul(&x)?,
            };
        }
        Ok(LayerOutput::value(acc))
    }
}

/// Comparison of a `compare` layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl CompareOp {
    fn from_desc(name: &str, desc: &crate::desc::LayerDesc) -> Result<Self> {
        Ok(match desc.opt_str(name, "kind")?.unwrap_or("equal") {
            "equal" => CompareOp::Equal,
            "not_equal" => CompareOp::NotEqual,
            "less" => CompareOp::Less,
            "less_equal" => CompareOp::LessEqual,
            "greater" => CompareOp::Greater,
            "greater_equal" => CompareOp::GreaterEqual,
            other => return Err(Error::invalid_option(name, "kind", format!("unknown comparison '{other}'"))),
        })
    }

    pub fn eval(&self, a: f32, b: f32) -> bool {
        match self {
            CompareOp::Equal => a == b,
            CompareOp::NotEqual => a != b,
            CompareOp::Less => a < b,
            CompareOp::LessEqual => a <= b,
            CompareOp::Greater => a > b,
            CompareOp::GreaterEqual => a >= b,
        }
    }
}

/// `compare` layer.
pub struct CompareKind;

impl LayerKind for CompareKind {
    fn kind(&self) -> &'static str {
        "compare"
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        CompareOp::from_desc(ctx.name, ctx.desc)?;
        let has_value = ctx.desc.opt_f32(ctx.name, "value")?.is_some();
        let shape = match (inputs, has_value) {
            ([_], true) | ([_, _], false) => broadcast_features(ctx.name, inputs)?,
            _ => {
                return Err(Error::invalid_option(
                    ctx.name,
                    "from",
                    "expects one source and 'value', or two sources",
                ))
            }
        };
        Ok(TensorMeta::dense(shape).with_dtype(DType::Bool))
    }

    fn forward(&self, ctx: &ForwardCtx<'_>, inputs: &[Tensor], _state: Option<&LayerState>) -> Result<LayerOutput> {
        let op = CompareOp::from_desc(ctx.name, ctx.desc)?;
        let rank = ctx.meta.feature_shape.rank() + 1;
        let lhs = inputs
            .first()
            .ok_or_else(|| Error::invalid_option(ctx.name, "from", "needs a source"))?;
        let rhs = match ctx.desc.opt_f32(ctx.name, "value")? {
            Some(v) => Tensor::full((), v, DType::F32),
            None => align_rank(
                inputs
                    .get(1)
                    .ok_or_else(|| Error::invalid_option(ctx.name, "from", "needs a second source"))?,
                rank,
            )?,
        };
        let out = align_rank(lhs, rank)?.compare(&rhs, |a, b| op.eval(a, b))?;
        Ok(LayerOutput::value(out))
    }
}

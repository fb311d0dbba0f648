// Activations
//
// Named element-wise (or last-axis) functions shared by the `activation`,
// `linear` and `softmax` layer kinds:
//
//   identity, tanh, sigmoid, relu, exp, log, softmax, log_softmax

use std::str::FromStr;

use recnet_core::{Error, Result, Tensor, TensorMeta};

use crate::desc::LayerDesc;
use crate::kind::{ForwardCtx, InferCtx, LayerKind, LayerOutput};

/// A named activation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Tanh,
    Sigmoid,
    Relu,
    Exp,
    Log,
    Softmax,
    LogSoftmax,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Activation::Identity => x.clone(),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => x.sigmoid(),
            Activation::Relu => x.relu(),
            Activation::Exp => x.exp(),
            Activation::Log => x.log(),
            Activation::Softmax => x.softmax()?,
            Activation::LogSoftmax => x.log_softmax()?,
        })
    }

    /// The `activation` option of a layer, or `default` when absent.
    pub fn from_desc(name: &str, desc: &LayerDesc, default: Activation) -> Result<Activation> {
        match desc.opt_str(name, "activation")? {
            None => Ok(default),
            Some(s) => s
                .parse()
                .map_err(|_| Error::invalid_option(name, "activation", format!("unknown activation '{s}'"))),
        }
    }
}

impl FromStr for Activation {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        Ok(match s {
            "identity" | "linear" => Activation::Identity,
            "tanh" => Activation::Tanh,
            "sigmoid" => Activation::Sigmoid,
            "relu" => Activation::Relu,
            "exp" => Activation::Exp,
            "log" => Activation::Log,
            "softmax" => Activation::Softmax,
            "log_softmax" => Activation::LogSoftmax,
            _ => return Err(()),
        })
    }
}

/// `activation` layer: applies a named activation to its single input.
pub struct ActivationKind;

impl LayerKind for ActivationKind {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn infer_output(&self, ctx: &InferCtx<'_>, inputs: &[TensorMeta]) -> Result<TensorMeta> {
        Activation::from_desc(ctx.name, ctx.desc, Activation::Identity)?;
        match inputs {
            [x] => Ok(TensorMeta::dense(x.feature_shape.clone())),
            _ => Err(Error::invalid_option(ctx.name, "from", "expects exactly one source")),
        }
    }

    fn forward(
        &self,
        ctx: &ForwardCtx<'_>,
        inputs: &[Tensor],
        _state: Option<&crate::kind::LayerState>,
    ) -> Result<LayerOutput> {
        let act = Activation::from_desc(ctx.name, ctx.desc, Activation::Identity)?;
        let x = inputs
            .first()
            .ok_or_else(|| Error::invalid_option(ctx.name, "from", "expects exactly one source"))?;
        Ok(LayerOutput::value(act.apply(x)?))
    }
}

// Layer descriptions: the declarative input of a recurrent subnetwork
//
// A subnetwork is a map from layer name to LayerDesc:
//
//   {
//     "embed":  {"class": "linear", "from": ["prev:output"], "n_out": 8},
//     "s":      {"class": "rnn_cell", "unit": "lstm", "from": ["embed"], "n_out": 16},
//     "output": {"class": "softmax", "from": ["s"], "loss": "ce", "target": "classes"}
//   }
//
// References inside `from` (and a few options) are parsed once into LayerRef:
//
//   "x"          current-step value of sibling layer x
//   "prev:x"     previous-step value of sibling layer x
//   "base:x"     a layer of the enclosing network, constant over the loop
//   "data:key"   extern data, read per step ("data" alone is "data:source")

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use recnet_core::{Error, Result};

/// A subnetwork description: layer name → description.
pub type NetDict = BTreeMap<String, LayerDesc>;

/// Loss attached to a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Cross entropy of a probability output against sparse labels.
    Ce,
    /// Squared error against a dense target.
    Mse,
}

/// Declarative description of one layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerDesc {
    /// Layer kind name, looked up in the layer registry.
    pub class: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub from: Vec<String>,
    #[serde(default)]
    pub loss: Option<LossKind>,
    #[serde(default)]
    pub loss_scale: Option<f32>,
    /// Extern data key holding the loss (or fed) target.
    #[serde(default)]
    pub target: Option<String>,
    /// Value of `prev:<this layer>` at the first step.
    #[serde(default)]
    pub initial_output: Option<Value>,
    /// Kind-specific options.
    #[serde(flatten)]
    pub opts: Map<String, Value>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl LayerDesc {
    pub fn new(class: impl Into<String>) -> Self {
        LayerDesc {
            class: class.into(),
            ..Default::default()
        }
    }

    /// Parse a subnetwork description from JSON.
    pub fn net_from_json(json: &str) -> Result<NetDict> {
        serde_json::from_str(json).map_err(|e| Error::msg(format!("invalid network JSON: {e}")))
    }

    pub fn with_from<I, S>(mut self, from: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.from = from.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_opt(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.opts.insert(key.to_string(), value.into());
        self
    }

    pub fn with_loss(mut self, loss: LossKind, target: impl Into<String>) -> Self {
        self.loss = Some(loss);
        self.target = Some(target.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_initial_output(mut self, value: impl Into<Value>) -> Self {
        self.initial_output = Some(value.into());
        self
    }

    /// The parsed `from` references.
    pub fn sources(&self) -> Vec<LayerRef> {
        self.from.iter().map(|s| LayerRef::parse(s)).collect()
    }

    // Option accessors. `layer` is only used for error messages.

    pub fn opt(&self, key: &str) -> Option<&Value> {
        self.opts.get(key).filter(|v| !v.is_null())
    }

    pub fn opt_usize(&self, layer: &str, key: &str) -> Result<Option<usize>> {
        match self.opt(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| Error::invalid_option(layer, key, "expected a non-negative integer")),
        }
    }

    pub fn req_usize(&self, layer: &str, key: &str) -> Result<usize> {
        self.opt_usize(layer, key)?
            .ok_or_else(|| Error::invalid_option(layer, key, "required"))
    }

    pub fn opt_f32(&self, layer: &str, key: &str) -> Result<Option<f32>> {
        match self.opt(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(if *b { 1.0 } else { 0.0 })),
            Some(v) => v
                .as_f64()
                .map(|n| Some(n as f32))
                .ok_or_else(|| Error::invalid_option(layer, key, "expected a number")),
        }
    }

    pub fn opt_bool(&self, layer: &str, key: &str) -> Result<Option<bool>> {
        match self.opt(key) {
            None => Ok(None),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| Error::invalid_option(layer, key, "expected a boolean")),
        }
    }

    pub fn opt_str(&self, layer: &str, key: &str) -> Result<Option<&str>> {
        match self.opt(key) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| Error::invalid_option(layer, key, "expected a string")),
        }
    }

    /// Deserialize an option into any serde type.
    pub fn opt_as<T: serde::de::DeserializeOwned>(&self, layer: &str, key: &str) -> Result<Option<T>> {
        match self.opt(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| Error::invalid_option(layer, key, e.to_string())),
        }
    }
}

// LayerRef

/// A parsed reference to a layer value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerRef {
    /// Current-step output of a sibling layer.
    Current(String),
    /// Previous-step output of a sibling layer.
    Prev(String),
    /// A layer of the enclosing network.
    Base(String),
    /// Extern data, one frame per step.
    Data(String),
}

impl LayerRef {
    pub fn parse(s: &str) -> LayerRef {
        if let Some(name) = s.strip_prefix("prev:") {
            LayerRef::Prev(name.to_string())
        } else if let Some(name) = s.strip_prefix("base:") {
            LayerRef::Base(name.to_string())
        } else if let Some(key) = s.strip_prefix("data:") {
            LayerRef::Data(key.to_string())
        } else if s == "data" {
            LayerRef::Data("source".to_string())
        } else {
            LayerRef::Current(s.to_string())
        }
    }

    /// Name of the sibling layer for `Current` and `Prev` references.
    pub fn local_name(&self) -> Option<&str> {
        match self {
            LayerRef::Current(n) | LayerRef::Prev(n) => Some(n),
            _ => None,
        }
    }

    /// Whether the reference points outside the subnetwork.
    pub fn is_external(&self) -> bool {
        matches!(self, LayerRef::Base(_) | LayerRef::Data(_))
    }
}

impl fmt::Display for LayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerRef::Current(n) => write!(f, "{n}"),
            LayerRef::Prev(n) => write!(f, "prev:{n}"),
            LayerRef::Base(n) => write!(f, "base:{n}"),
            LayerRef::Data(k) => write!(f, "data:{k}"),
        }
    }
}

// InitialValue

/// Value rule for initial outputs and initial recurrent states.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialValue {
    Zeros,
    Ones,
    Constant(f32),
    /// A learned vector, broadcast over the batch.
    Var,
    /// A layer of the enclosing network.
    Layer(LayerRef),
}

impl InitialValue {
    /// Parse an `initial_output` / `initial_state` option. Absent means zeros.
    pub fn parse(layer: &str, option: &str, value: Option<&Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(InitialValue::Zeros),
            Some(Value::Bool(b)) => Ok(InitialValue::Constant(if *b { 1.0 } else { 0.0 })),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(|v| InitialValue::Constant(v as f32))
                .ok_or_else(|| Error::invalid_option(layer, option, "not a finite number")),
            Some(Value::String(s)) => match s.as_str() {
                "zeros" => Ok(InitialValue::Zeros),
                "ones" => Ok(InitialValue::Ones),
                "var" => Ok(InitialValue::Var),
                other => match LayerRef::parse(other) {
                    r @ LayerRef::Base(_) => Ok(InitialValue::Layer(r)),
                    _ => Err(Error::invalid_option(
                        layer,
                        option,
                        format!("'{other}' is not zeros, ones, var or a base: layer"),
                    )),
                },
            },
            Some(other) => Err(Error::invalid_option(
                layer,
                option,
                format!("unsupported value {other}"),
            )),
        }
    }

    /// The external layer this rule reads, if any.
    pub fn dependency(&self) -> Option<&LayerRef> {
        match self {
            InitialValue::Layer(r) => Some(r),
            _ => None,
        }
    }
}

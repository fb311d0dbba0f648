// Recurrent layer configuration
//
// A recurrent layer is configured either with a subnetwork or with the name
// of a registered cell, which is wrapped into a one-layer subnetwork:
//
//   {"unit": {"output": {...}, "s": {...}}, "target": "classes", "max_seq_len": 20}
//   {"unit": "lstm", "n_out": 16, "source": "features"}
//
// Everything else is optional and deserializes with defaults, so the same
// struct is used for JSON configs and for the builder API in tests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use recnet_core::{Error, Result};
use recnet_nn::{LayerDesc, NetDict};

/// What the loop body is made of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Unit {
    /// A registered recurrent cell, e.g. `"lstm"`.
    Cell(String),
    /// A full subnetwork description.
    Subnet(NetDict),
}

/// Iteration direction over the input sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    /// Each sequence is reversed within its own length before the loop and
    /// the output is reversed back afterwards.
    Backward,
}

fn default_true() -> bool {
    true
}

/// Configuration of one recurrent layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecConfig {
    pub unit: Unit,
    /// Output width for a cell unit.
    #[serde(default)]
    pub n_out: Option<usize>,
    /// Extern data key behind `data:source`. Defaults to `"source"`.
    #[serde(default)]
    pub source: Option<String>,
    /// Extern data key of the target sequence; gives the loop length when
    /// not searching.
    #[serde(default)]
    pub target: Option<String>,
    /// Upper bound on steps when the length is decided by the `end` layer.
    #[serde(default)]
    pub max_seq_len: Option<usize>,
    #[serde(default)]
    pub direction: Direction,
    /// Initial state of a cell unit (same values as `initial_state` of
    /// `rnn_cell`).
    #[serde(default)]
    pub initial_state: Option<Value>,
    /// Move position-wise layers into the pre/post-loop networks.
    #[serde(default = "default_true")]
    pub optimize_move_layers_out: bool,
}

impl RecConfig {
    pub fn subnet(net: NetDict) -> Self {
        RecConfig {
            unit: Unit::Subnet(net),
            n_out: None,
            source: None,
            target: None,
            max_seq_len: None,
            direction: Direction::Forward,
            initial_state: None,
            optimize_move_layers_out: true,
        }
    }

    pub fn cell(unit: impl Into<String>, n_out: usize) -> Self {
        RecConfig {
            unit: Unit::Cell(unit.into()),
            n_out: Some(n_out),
            ..RecConfig::subnet(NetDict::new())
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::msg(format!("invalid recurrent layer config: {e}")))
    }

    pub fn with_source(mut self, key: impl Into<String>) -> Self {
        self.source = Some(key.into());
        self
    }

    pub fn with_target(mut self, key: impl Into<String>) -> Self {
        self.target = Some(key.into());
        self
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_initial_state(mut self, value: impl Into<Value>) -> Self {
        self.initial_state = Some(value.into());
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize_move_layers_out = optimize;
        self
    }

    /// The subnetwork the loop runs. A cell unit becomes a single
    /// `rnn_cell` layer named `output`, reading `data:source`.
    pub fn net_dict(&self, layer: &str) -> Result<NetDict> {
        match &self.unit {
            Unit::Subnet(net) => Ok(net.clone()),
            Unit::Cell(unit) => {
                let n_out = self
                    .n_out
                    .ok_or_else(|| Error::invalid_option(layer, "n_out", "required for a cell unit"))?;
                let mut desc = LayerDesc::new("rnn_cell")
                    .with_from(["data:source"])
                    .with_opt("unit", unit.as_str())
                    .with_opt("n_out", n_out);
                if let Some(init) = &self.initial_state {
                    desc = desc.with_opt("initial_state", init.clone());
                }
                let mut net = NetDict::new();
                net.insert("output".to_string(), desc);
                Ok(net)
            }
        }
    }
}

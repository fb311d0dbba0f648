use std::fmt;

use serde::{Deserialize, Serialize};

// DType: element types a layer output can have
//
//   F32   real-valued activations, scores, probabilities
//   I32   sparse labels (class indices, beam source indices)
//   Bool  flags such as the per-hypothesis `end` signal
//
// All three share one f32 storage; integers and booleans are stored exactly
// (labels stay far below 2^24, booleans are 0.0 / 1.0).

/// Element data type of a tensor or layer template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I32,
    Bool,
}

impl DType {
    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }

    /// Coerce a raw stored value into the value domain of this dtype.
    pub fn coerce(&self, v: f32) -> f32 {
        match self {
            DType::F32 => v,
            DType::I32 => v.round(),
            DType::Bool => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl Default for DType {
    fn default() -> Self {
        DType::F32
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

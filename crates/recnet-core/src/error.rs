use crate::shape::Shape;

/// All errors that can occur within recnet.
///
/// A single error type is shared by the tensor substrate, the layer catalog
/// and the recurrent engine. Each variant belongs to one [`ErrorKind`], which
/// tells whether the failure comes from a bad network description, a broken
/// shape contract at step construction, or missing runtime data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ── Tensor substrate ──
    /// Shape mismatch between two tensors (e.g., trying to add [2,3] + [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors or between a tensor and its template.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Index along an axis is past its end.
    #[error("index {index} out of bounds for axis of size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Layout error reported by ndarray (incompatible broadcast, stack of
    /// differently shaped arrays, ...).
    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),

    // ── Network description ──
    /// A `from`, `prev:` or `base:` reference names a layer that does not exist.
    #[error("layer '{name}' referenced by '{referenced_by}' does not exist")]
    UnresolvedLayer { name: String, referenced_by: String },

    /// The subnetwork has no layer named `output`.
    #[error("recurrent subnetwork has no 'output' layer")]
    MissingOutputLayer,

    /// The number of steps cannot be determined: no `end` layer and no
    /// known sequence length.
    #[error("cannot determine the number of steps: no 'end' layer and no known sequence length")]
    MissingEndLayer,

    /// An `end` layer is present but no hard step bound was configured.
    #[error("'max_seq_len' is required when the length is decided by an 'end' layer")]
    MissingMaxSeqLen,

    /// No layer kind is registered under this class name.
    #[error("unknown layer class '{kind}'")]
    UnknownLayerKind { kind: String },

    /// No recurrent cell is registered under this unit name.
    #[error("unknown recurrent cell '{unit}'")]
    UnknownCell { unit: String },

    /// A layer option is missing or has the wrong form.
    #[error("layer '{layer}': invalid option '{option}': {reason}")]
    InvalidOption {
        layer: String,
        option: String,
        reason: String,
    },

    /// Current-step references form a cycle that no `prev:` breaks.
    #[error("cyclic current-step dependency between layers {layers:?}")]
    CyclicDependency { layers: Vec<String> },

    /// Template output metadata did not settle after repeated refinement.
    #[error("template of layer '{layer}' does not converge")]
    TemplateDiverges { layer: String },

    /// A search choice layer ended up outside the loop.
    #[error("choice layer '{layer}' must stay inside the loop during search")]
    ChoiceMovedOut { layer: String },

    /// More than one search choice layer in one subnetwork.
    #[error("only one choice layer is supported per subnetwork, found {layers:?}")]
    MultipleChoices { layers: Vec<String> },

    // ── Shape contract ──
    /// A realized value disagrees with the layer's template.
    #[error("layer '{layer}': template expects {expected}, got {got}")]
    TemplateMismatch {
        layer: String,
        expected: String,
        got: String,
    },

    // ── Runtime data ──
    /// An extern data key or `base:` layer has no value.
    #[error("no value for '{key}'")]
    MissingData { key: String },

    /// A per-step read past the end of a sequence.
    #[error("'{key}' has no value at step {step} (length {len})")]
    DataUnavailable { key: String, step: usize, len: usize },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid network description, detected while building.
    Config,
    /// Realized shape or dtype does not match what was declared.
    Contract,
    /// Data needed at run time is missing.
    Data,
    /// Anything else.
    Internal,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for [`Error::InvalidOption`].
    pub fn invalid_option(
        layer: impl Into<String>,
        option: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidOption {
            layer: layer.into(),
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnresolvedLayer { .. }
            | Error::MissingOutputLayer
            | Error::MissingEndLayer
            | Error::MissingMaxSeqLen
            | Error::UnknownLayerKind { .. }
            | Error::UnknownCell { .. }
            | Error::InvalidOption { .. }
            | Error::CyclicDependency { .. }
            | Error::TemplateDiverges { .. }
            | Error::ChoiceMovedOut { .. }
            | Error::MultipleChoices { .. } => ErrorKind::Config,
            Error::TemplateMismatch { .. }
            | Error::ShapeMismatch { .. }
            | Error::RankMismatch { .. }
            | Error::DTypeMismatch { .. }
            | Error::MatmulShapeMismatch { .. } => ErrorKind::Contract,
            Error::MissingData { .. } | Error::DataUnavailable { .. } => ErrorKind::Data,
            _ => ErrorKind::Internal,
        }
    }
}

/// Convenience Result type used throughout recnet.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

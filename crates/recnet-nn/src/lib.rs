//! # recnet-nn
//!
//! The layer catalog used by recnet's recurrent engine.
//!
//! Every layer kind implements the [`LayerKind`] trait:
//!
//! 1. **Descriptions**: [`LayerDesc`] (serde-deserializable) and parsed
//!    [`LayerRef`] references (`x`, `prev:x`, `base:x`, `data:key`)
//! 2. **Shape inference** without values, via [`TensorMeta`](recnet_core::TensorMeta)
//! 3. **Execution** on a batch of rows, with optional recurrent state
//! 4. **Built-in kinds**: copy, linear, softmax, activation, combine,
//!    compare, constant, rnn_cell, get_last_hidden_state, step_info,
//!    choice
//! 5. **Parameters**: [`ParamStore`], created lazily with deterministic seeds
//! 6. **Losses** per frame and the **beam search step**

pub mod activation;
pub mod choice;
pub mod combine;
pub mod constant;
pub mod desc;
pub mod kind;
pub mod linear;
pub mod loss;
pub mod params;
pub mod registry;
pub mod rnn;
pub mod search;
pub mod step_info;

pub use activation::{Activation, ActivationKind};
pub use choice::{ChoiceInput, ChoiceKind};
pub use combine::{CombineKind, CombineOp, CompareKind, CompareOp, CopyKind};
pub use constant::ConstantKind;
pub use desc::{InitialValue, LayerDesc, LayerRef, LossKind, NetDict};
pub use kind::{
    default_initial_output, initial_value, ForwardCtx, InferCtx, InitCtx, LayerKind, LayerOutput,
    LayerState, NetworkFlags, StateInvariant, StepInfo,
};
pub use linear::{LinearKind, SoftmaxKind};
pub use loss::{frame_error, frame_loss, masked_sum, norm_factor};
pub use params::{Init, ParamStore};
pub use registry::LayerRegistry;
pub use rnn::{CellRegistry, CellWeights, LastHiddenStateKind, LstmCell, RecurrentCell, RnnCell, RnnCellKind};
pub use search::{beam_step, filter_ended_scores, length_norm_factor, BeamChoice, BeamStep, BeamStepInput};
pub use step_info::{StepInfoKind, STEP_INDEX_LAYER};

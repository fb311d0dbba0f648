//! # recnet
//!
//! Recurrent subnetworks compiled into step loops.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use recnet::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `recnet-core` | Tensor, Shape, DType, TensorMeta, Error |
//! | `recnet-nn` | Layer descriptions, the `LayerKind` catalog, cells, parameters, losses, beam step |
//! | `recnet` | Configuration, the enclosing-network interface, the recurrent engine |
//!
//! ## Modules
//!
//! - [`config`]: `RecConfig`, JSON-deserializable
//! - [`network`]: extern data and base layers seen by a recurrent layer
//! - [`rec`]: templates, loop partition, step loop, pre/post-loop networks, beam backtrace

/// Re-export core types.
pub use recnet_core::{DType, Error, ErrorKind, Result, Shape, Tensor, TensorMeta};

/// Re-export the layer catalog.
pub mod nn {
    pub use recnet_nn::*;
}

/// Recurrent layer configuration.
pub mod config;

/// The enclosing network: extern data and base layers.
pub mod network;

/// The recurrent engine.
pub mod rec;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::config::{Direction, RecConfig, Unit};
    pub use crate::network::{ExternalNetwork, LayerValue, ParentNetwork, SeqData};
    pub use crate::nn::{
        CellRegistry, LayerDesc, LayerKind, LayerRef, LayerRegistry, LossKind, NetDict, NetworkFlags,
        ParamStore,
    };
    pub use crate::rec::{LossSummary, Partition, Placement, RecLayer, RecOutput, SearchBeam};
    pub use crate::{DType, Error, ErrorKind, Result, Shape, Tensor, TensorMeta};
}

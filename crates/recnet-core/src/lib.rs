//! # recnet-core
//!
//! Core value types for recnet.
//!
//! This crate provides:
//! - [`Tensor`]: immutable n-dimensional array (ndarray-backed) with a dtype tag
//! - [`Shape`]: shape of a tensor, with broadcasting and envelope checks
//! - [`DType`]: element types (`f32`, `i32` labels, `bool` flags)
//! - [`TensorMeta`]: output metadata of a layer before any value exists
//! - [`Error`] / [`Result`]: the error type shared by every recnet crate

pub mod dtype;
pub mod error;
pub mod meta;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use error::{Error, ErrorKind, Result};
pub use meta::TensorMeta;
pub use shape::Shape;
pub use tensor::Tensor;

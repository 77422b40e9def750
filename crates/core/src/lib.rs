#![allow(clippy::excessive_precision)]

pub mod dim;
pub mod fixed_dim;
pub mod graph;
pub mod model;
pub mod node;
pub mod onnx;
pub mod op;
pub mod optimize;
pub mod optimizer;
pub mod tensor;
pub mod value;

pub use optimizer::{optimize_model, optimize_model_with, FusionOptions, ModelType, OptimizedModel};

//! Transformer graph optimizer entry point.
//!
//! [`optimize_model`] loads an ONNX file, runs the cleanup and fusion passes
//! selected by the model type and returns the optimized in-memory graph.

use std::{fmt, path::Path, str::FromStr, time::Instant};

use thiserror::Error;

use crate::{
    model::Model,
    node::NodeId,
    onnx::{
        load::{load_onnx, ModelLoadError},
        save::{save_onnx, ModelSaveError},
    },
    optimize::{
        cast_elim::eliminate_redundant_cast,
        constant_lift::lift_constants,
        dead_node_elim::eliminate_dead_nodes,
        fast_gelu_fusion::{approximate_gelu, fuse_fast_gelu},
        gelu_fusion::fuse_gelu,
        identity_elim::eliminate_identity,
        quick_gelu_fusion::fuse_quick_gelu,
    },
};

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Failed to load model: {0}")]
    Load(#[from] ModelLoadError),

    #[error("Failed to save model: {0}")]
    Save(#[from] ModelSaveError),

    #[error("Unknown model type: {0}")]
    UnknownModelType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Bert,
    Gpt2,
    Vit,
    Clip,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bert => "bert",
            Self::Gpt2 => "gpt2",
            Self::Vit => "vit",
            Self::Clip => "clip",
        }
    }
}

impl FromStr for ModelType {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bert" => Ok(Self::Bert),
            "gpt2" => Ok(Self::Gpt2),
            "vit" => Ok(Self::Vit),
            "clip" => Ok(Self::Clip),
            s => Err(OptimizeError::UnknownModelType(s.to_string())),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which fusions [`optimize`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionOptions {
    pub model_type: ModelType,
    pub enable_gelu: bool,
    pub enable_quick_gelu: bool,
    /// Replaces exact `Gelu` with `FastGelu`. Changes numerics slightly.
    pub enable_gelu_approximation: bool,
}

impl FusionOptions {
    /// Defaults for `model_type`. Every supported family enables the same GELU
    /// fusions, so the type is only recorded; use the `with_*` methods to
    /// deviate.
    pub fn new(model_type: ModelType) -> Self {
        Self {
            model_type,
            enable_gelu: true,
            enable_quick_gelu: true,
            enable_gelu_approximation: false,
        }
    }

    pub fn with_gelu(mut self, enable: bool) -> Self {
        self.enable_gelu = enable;
        self
    }

    pub fn with_quick_gelu(mut self, enable: bool) -> Self {
        self.enable_quick_gelu = enable;
        self
    }

    pub fn with_gelu_approximation(mut self, enable: bool) -> Self {
        self.enable_gelu_approximation = enable;
        self
    }
}

/// Runs every pass enabled by `options` on `model`.
pub fn optimize(model: &mut Model, options: &FusionOptions) {
    let start = Instant::now();

    eliminate_identity(model);
    lift_constants(model);
    eliminate_redundant_cast(model);

    if options.enable_gelu {
        fuse_gelu(model);
        fuse_fast_gelu(model);
    }
    if options.enable_quick_gelu {
        fuse_quick_gelu(model);
    }
    if options.enable_gelu_approximation {
        approximate_gelu(model);
    }

    eliminate_dead_nodes(model);

    log::info!(
        "optimize({}): {:?}",
        options.model_type,
        start.elapsed()
    );
}

/// An optimized graph, queryable by op type.
#[derive(Debug, Clone)]
pub struct OptimizedModel {
    model: Model,
    options: FusionOptions,
}

impl OptimizedModel {
    pub fn get_nodes_by_op_type(&self, op_type: &str) -> Vec<NodeId> {
        self.model.get_nodes_by_op_type(op_type)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn options(&self) -> &FusionOptions {
        &self.options
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn save_model_to_file(&self, path: impl AsRef<Path>) -> Result<(), OptimizeError> {
        Ok(save_onnx(&self.model, path)?)
    }
}

/// Loads the ONNX file at `path` and optimizes it for `model_type`
/// (`"bert"`, `"gpt2"`, `"vit"` or `"clip"`).
pub fn optimize_model(
    path: impl AsRef<Path>,
    model_type: &str,
) -> Result<OptimizedModel, OptimizeError> {
    let options = FusionOptions::new(model_type.parse()?);
    optimize_model_with(path, options)
}

pub fn optimize_model_with(
    path: impl AsRef<Path>,
    options: FusionOptions,
) -> Result<OptimizedModel, OptimizeError> {
    let mut model = load_onnx(path)?;
    optimize(&mut model, &options);
    Ok(OptimizedModel { model, options })
}

//! Checks that each common GELU formulation, exported legacy- or
//! dynamo-style, is fused by the optimizer into exactly one node of the
//! expected type.

#![allow(clippy::excessive_precision)]

pub mod artifact;
pub mod case;
pub mod optimizer;
pub mod variant;
pub mod verify;

use std::io;

use kasane_core::optimizer::OptimizeError;
use kasane_export::ExportError;
use thiserror::Error;

pub use case::FusionCase;
pub use optimizer::{GraphOptimizer, KasaneOptimizer, NodeQuery};
pub use verify::{verify_node_count, NodeCountMismatch};

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("Optimization failed: {0}")]
    Optimize(#[from] OptimizeError),

    #[error("{0}")]
    NodeCount(#[from] NodeCountMismatch),

    #[error("{0}")]
    Io(#[from] io::Error),
}

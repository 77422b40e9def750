use std::{
    fmt,
    path::{Path, PathBuf},
};

use kasane_core::tensor::Tensor;
use kasane_export::{export, ExportMode, ExportOptions};

use crate::{
    artifact::ArtifactGuard,
    optimizer::{GraphOptimizer, NodeQuery},
    variant::{Variant, VARIANTS},
    verify::verify_node_count,
    HarnessError,
};

/// Hint passed to the optimizer for every case.
pub const MODEL_TYPE: &str = "bert";

/// Length of the all-ones sample input.
pub const SAMPLE_LEN: usize = 3;

/// One variant exported in one mode.
#[derive(Debug, Clone, Copy)]
pub struct FusionCase {
    pub variant: &'static Variant,
    pub mode: ExportMode,
}

impl FusionCase {
    pub fn new(variant: &'static Variant, mode: ExportMode) -> Self {
        Self { variant, mode }
    }

    /// Every variant in dynamo mode, then every variant in legacy mode.
    pub fn all() -> Vec<FusionCase> {
        [ExportMode::Dynamo, ExportMode::Legacy]
            .into_iter()
            .flat_map(|mode| VARIANTS.iter().map(move |&v| FusionCase::new(v, mode)))
            .collect()
    }

    /// `<operator>_<source>`
    pub fn test_name(&self) -> String {
        format!("{}_{}", self.variant.target, self.variant.source)
    }

    pub fn artifact_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.onnx", self.test_name()))
    }

    /// Exports the variant into `dir`, optimizes the artifact and removes the
    /// artifact files again, whatever the outcome.
    pub fn optimize_in<O: GraphOptimizer>(
        &self,
        dir: &Path,
        optimizer: &O,
    ) -> Result<O::Graph, HarnessError> {
        let guard = ArtifactGuard::new(self.artifact_path(dir));

        let options = ExportOptions::new()
            .with_input_names(["input"])
            .with_output_names(["output"])
            .with_mode(self.mode)
            .with_optimize(true);
        let sample = Tensor::ones::<f32>(vec![SAMPLE_LEN].into());
        let exported = export(self.variant, &sample, guard.path(), &options)?;
        log::debug!("{}: exported to {}", self, exported.path.display());

        Ok(optimizer.optimize(guard.path(), MODEL_TYPE)?)
    }

    /// Runs the case in a fresh temporary directory and checks that exactly
    /// one node of the target op type is left.
    pub fn run<O: GraphOptimizer>(&self, optimizer: &O) -> Result<(), HarnessError> {
        let dir = tempfile::tempdir()?;
        self.run_in(dir.path(), optimizer)
    }

    pub fn run_in<O: GraphOptimizer>(&self, dir: &Path, optimizer: &O) -> Result<(), HarnessError> {
        let graph = self.optimize_in(dir, optimizer)?;
        self.verify(&graph)
    }

    pub fn verify<G: NodeQuery + ?Sized>(&self, graph: &G) -> Result<(), HarnessError> {
        let expected = [(self.variant.target.op_type(), 1)];
        verify_node_count(graph, &expected, &self.test_name())?;
        Ok(())
    }
}

impl fmt::Display for FusionCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.variant.name, self.mode)
    }
}

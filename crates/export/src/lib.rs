//! Exports a traced [`Module`] to an ONNX file, the way a PyTorch exporter
//! would: either TorchScript-style (legacy) or dynamo-style.

#![allow(clippy::excessive_precision)]

pub mod functional;
mod lower;
pub mod module;
pub mod options;
pub mod trace;

use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Instant,
};

use kasane_core::{
    onnx::save::{save_onnx_with, ModelSaveError, SaveOptions},
    tensor::{Tensor, TensorElemType},
};
use thiserror::Error;

pub use module::Module;
pub use options::{ExportMode, ExportOptions};
pub use trace::{TraceError, Tracer, Var};

use lower::Signature;

/// Opsets the exporter can target.
pub const SUPPORTED_OPSETS: RangeInclusive<i64> = 9..=21;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Tracing failed: {0}")]
    Trace(#[from] TraceError),

    #[error("Output does not depend on the input")]
    ConstantOutput,

    #[error("Expected at most one {kind} name, got {actual}")]
    WrongNumberOfNames { kind: &'static str, actual: usize },

    #[error("Unsupported opset version: {0}")]
    UnsupportedOpset(i64),

    #[error("Invalid sample input: {0}")]
    InvalidInput(String),

    #[error("Input and output are both named '{0}'")]
    DuplicateName(String),

    #[error("Malformed trace: value {0} is used before it is defined")]
    Malformed(usize),

    #[error("Failed to save model: {0}")]
    Save(#[from] ModelSaveError),
}

/// Files written by [`export`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedModel {
    pub path: PathBuf,
    /// The external data sidecar, if the exporter wrote one.
    pub data_path: Option<PathBuf>,
}

/// Traces `module` on a 1-D `f32` input shaped like `sample_input` and writes
/// the resulting graph to `path`.
pub fn export<M: Module + ?Sized>(
    module: &M,
    sample_input: &Tensor,
    path: impl AsRef<Path>,
    options: &ExportOptions,
) -> Result<ExportedModel, ExportError> {
    let start = Instant::now();
    let path = path.as_ref();

    if sample_input.dims().len() != 1 || sample_input.elem_ty() != TensorElemType::F32 {
        return Err(ExportError::InvalidInput(format!(
            "expected a 1-D f32 tensor, got {:?} of {:?}",
            sample_input.dims().as_slice(),
            sample_input.elem_ty()
        )));
    }
    let input_name = single_name(&options.input_names, "input")?;
    let output_name = single_name(&options.output_names, "output")?;
    if input_name == output_name {
        return Err(ExportError::DuplicateName(input_name.to_string()));
    }
    let opset_version = options.opset_version();
    if !SUPPORTED_OPSETS.contains(&opset_version) {
        return Err(ExportError::UnsupportedOpset(opset_version));
    }

    let tracer = Tracer::new();
    let output = module.forward(tracer.input());
    let entries = tracer.entries()?;
    if !tracer.owns(&output) {
        return Err(TraceError::ForeignValue("the module output").into());
    }

    let signature = Signature {
        input_name,
        output_name,
        input_dims: sample_input.dims().clone(),
    };
    let model = lower::lower(&entries, output.id(), signature, options)?;

    let save_options = SaveOptions::new()
        .with_external_data(options.mode.is_dynamo())
        .with_producer_name(env!("CARGO_PKG_NAME"));
    let data_path = save_onnx_with(&model, path, &save_options)?;

    log::info!(
        "export({}, {}): {:?}",
        options.mode,
        path.display(),
        start.elapsed()
    );

    Ok(ExportedModel {
        path: path.to_path_buf(),
        data_path,
    })
}

fn single_name<'a>(names: &'a [String], kind: &'static str) -> Result<&'a str, ExportError> {
    match names {
        [] => Ok(kind),
        [name] => Ok(name.as_str()),
        _ => Err(ExportError::WrongNumberOfNames {
            kind,
            actual: names.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasane_core::{onnx::load_onnx, op::GeluApproximation};

    fn ones() -> Tensor {
        Tensor::ones::<f32>(vec![3].into())
    }

    #[test]
    fn export_legacy() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        let opts = ExportOptions::new()
            .with_input_names(["input"])
            .with_output_names(["output"]);
        let exported = export(&|x: Var| &x * (&x).sigmoid(), &ones(), &path, &opts).unwrap();
        assert_eq!(exported.path, path);
        assert_eq!(exported.data_path, None);

        let model = load_onnx(&path).unwrap();
        assert_eq!(model.opset_version, 17);
        assert_eq!(model.graph.values.name_of(model.graph.inputs[0]), "input");
        assert_eq!(model.graph.values.name_of(model.graph.outputs[0]), "output");
        assert_eq!(model.get_nodes_by_op_type("Sigmoid").len(), 1);
    }

    #[test]
    fn export_dynamo_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        let opts = ExportOptions::new().with_dynamo(true).with_optimize(true);
        let exported = export(&|x: Var| 0.5 * x, &ones(), &path, &opts).unwrap();
        let data_path = exported.data_path.unwrap();
        assert_eq!(data_path, dir.path().join("model.onnx.data"));
        assert!(data_path.exists());

        let model = load_onnx(&path).unwrap();
        assert_eq!(model.opset_version, 20);
        let half = model.graph.inits.values().next().unwrap();
        assert_eq!(half.scalar_f32(), Some(0.5));
    }

    #[test]
    fn export_dynamo_gelu() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gelu.onnx");
        let opts = ExportOptions::new().with_dynamo(true);
        let gelu = |x: Var| functional::gelu(&x, GeluApproximation::Tanh);
        let exported = export(&gelu, &ones(), &path, &opts).unwrap();
        // No scalars, so there is nothing to put in a sidecar.
        assert_eq!(exported.data_path, None);

        let model = load_onnx(&path).unwrap();
        assert_eq!(model.get_nodes_by_op_type("Gelu").len(), 1);
    }

    #[test]
    fn reject_bad_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        let f = |x: Var| x.tanh();

        let opts = ExportOptions::new().with_input_names(["a", "b"]);
        assert!(matches!(
            export(&f, &ones(), &path, &opts),
            Err(ExportError::WrongNumberOfNames { kind: "input", actual: 2 })
        ));

        let opts = ExportOptions::new().with_opset_version(7);
        assert!(matches!(
            export(&f, &ones(), &path, &opts),
            Err(ExportError::UnsupportedOpset(7))
        ));

        let matrix = Tensor::ones::<f32>(vec![2, 2].into());
        assert!(matches!(
            export(&f, &matrix, &path, &ExportOptions::new()),
            Err(ExportError::InvalidInput(_))
        ));

        let opts = ExportOptions::new()
            .with_input_names(["x"])
            .with_output_names(["x"]);
        assert!(matches!(
            export(&f, &ones(), &path, &opts),
            Err(ExportError::DuplicateName(name)) if name == "x"
        ));

        assert!(!path.exists());
    }

    #[test]
    fn input_named_like_generated_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.onnx");
        let opts = ExportOptions::new()
            .with_dynamo(true)
            .with_input_names(["mul"]);
        export(&|x: Var| (&x * &x) * &x, &ones(), &path, &opts).unwrap();

        let model = load_onnx(&path).unwrap();
        assert_eq!(model.get_nodes_by_op_type("Mul").len(), 2);
        assert_eq!(model.graph.values.name_of(model.graph.inputs[0]), "mul");
        assert_eq!(model.graph.values.name_of(model.graph.outputs[0]), "output");
    }

    #[test]
    fn reject_foreign_output() {
        let dir = tempfile::tempdir().unwrap();
        let other = Tracer::new();
        let stray = other.input();
        let f = move |_: Var| stray.tanh();
        assert!(matches!(
            export(&f, &ones(), dir.path().join("model.onnx"), &ExportOptions::new()),
            Err(ExportError::Trace(TraceError::ForeignValue(_)))
        ));
    }

    #[test]
    fn save_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("model.onnx");
        assert!(matches!(
            export(&|x: Var| x.tanh(), &ones(), &path, &ExportOptions::new()),
            Err(ExportError::Save(_))
        ));
    }
}

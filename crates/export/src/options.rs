use std::fmt;

/// Which exporter front end lowers the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExportMode {
    /// TorchScript-style: scalars become `Constant` nodes, library calls are
    /// decomposed into primitive ops.
    #[default]
    Legacy,
    /// Dynamo-style: scalars become initializers stored in a `.data` sidecar
    /// and standard ops such as `Gelu` are emitted when the opset has them.
    Dynamo,
}

impl ExportMode {
    pub fn is_dynamo(&self) -> bool {
        matches!(self, Self::Dynamo)
    }

    pub fn default_opset_version(&self) -> i64 {
        match self {
            Self::Legacy => 17,
            Self::Dynamo => 20,
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Legacy => "legacy",
            Self::Dynamo => "dynamo",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub(crate) input_names: Vec<String>,
    pub(crate) output_names: Vec<String>,
    pub(crate) mode: ExportMode,
    pub(crate) optimize: bool,
    pub(crate) opset_version: Option<i64>,
}

impl ExportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: ExportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_dynamo(self, dynamo: bool) -> Self {
        self.with_mode(if dynamo {
            ExportMode::Dynamo
        } else {
            ExportMode::Legacy
        })
    }

    /// Lets the dynamo exporter clean up the graph it produced. No effect in
    /// legacy mode.
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_opset_version(mut self, opset_version: i64) -> Self {
        self.opset_version = Some(opset_version);
        self
    }

    pub fn mode(&self) -> ExportMode {
        self.mode
    }

    pub fn opset_version(&self) -> i64 {
        self.opset_version
            .unwrap_or_else(|| self.mode.default_opset_version())
    }
}

#[test]
fn default_opsets() {
    let opts = ExportOptions::new();
    assert_eq!(opts.mode(), ExportMode::Legacy);
    assert_eq!(opts.opset_version(), 17);

    let opts = opts.with_dynamo(true);
    assert_eq!(opts.opset_version(), 20);
    assert_eq!(opts.with_opset_version(18).opset_version(), 18);
}

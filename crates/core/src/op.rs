use std::{fmt, str::FromStr};

use crate::tensor::{Tensor, TensorElemType};

/// Domain of the fused operators understood by onnxruntime.
pub const CONTRIB_DOMAIN: &str = "com.microsoft";

/// First opset of the default domain that defines `Gelu`.
pub const GELU_OPSET: i64 = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Sqrt,
    Erf,
    Tanh,
    Sigmoid,
    Identity,
    Cast(Cast),
    Constant(Constant),
    Gelu(Gelu),
    FastGelu,
    QuickGelu(QuickGelu),
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#Cast>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cast {
    pub to: TensorElemType,
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#Constant>
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub value: Tensor,
}

/// <https://github.com/onnx/onnx/blob/main/docs/Operators.md#Gelu>
///
/// Below opset 20 the node lives in the contrib domain, where only the exact
/// form exists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Gelu {
    pub approximate: GeluApproximation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GeluApproximation {
    #[default]
    None,
    Tanh,
}

/// `x * sigmoid(alpha * x)`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuickGelu {
    pub alpha: f32,
}

impl Default for QuickGelu {
    fn default() -> Self {
        Self { alpha: 1.702 }
    }
}

impl Op {
    /// The ONNX `op_type` of this op.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::Div => "Div",
            Op::Pow => "Pow",
            Op::Sqrt => "Sqrt",
            Op::Erf => "Erf",
            Op::Tanh => "Tanh",
            Op::Sigmoid => "Sigmoid",
            Op::Identity => "Identity",
            Op::Cast(_) => "Cast",
            Op::Constant(_) => "Constant",
            Op::Gelu(_) => "Gelu",
            Op::FastGelu => "FastGelu",
            Op::QuickGelu(_) => "QuickGelu",
        }
    }

    /// The domain the op is serialized into for a model of `opset_version`.
    pub fn domain(&self, opset_version: i64) -> &'static str {
        match self {
            Op::FastGelu | Op::QuickGelu(_) => CONTRIB_DOMAIN,
            Op::Gelu(_) if opset_version < GELU_OPSET => CONTRIB_DOMAIN,
            _ => "",
        }
    }
}

impl GeluApproximation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tanh => "tanh",
        }
    }
}

impl FromStr for GeluApproximation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "tanh" => Ok(Self::Tanh),
            s => Err(format!("unknown Gelu approximation '{s}'")),
        }
    }
}

impl fmt::Display for GeluApproximation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[test]
fn op_domains() {
    assert_eq!(Op::Mul.domain(17), "");
    assert_eq!(Op::FastGelu.domain(20), CONTRIB_DOMAIN);
    assert_eq!(Op::Gelu(Gelu::default()).domain(17), CONTRIB_DOMAIN);
    assert_eq!(Op::Gelu(Gelu::default()).domain(20), "");
    assert_eq!(Op::QuickGelu(QuickGelu::default()).name(), "QuickGelu");
}

#[test]
fn parse_approximation() {
    assert_eq!("tanh".parse(), Ok(GeluApproximation::Tanh));
    assert_eq!("none".parse(), Ok(GeluApproximation::None));
    assert!("erf".parse::<GeluApproximation>().is_err());
}

//! The GELU formulations whose fusion is checked, as written in popular
//! transformer code bases.

use std::{f32::consts::SQRT_2, fmt};

use kasane_core::op::GeluApproximation;
use kasane_export::{functional::gelu, Module, Var};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Huggingface,
    Megatron,
}

/// The fused operator the optimizer is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOp {
    Gelu,
    FastGelu,
    QuickGelu,
}

pub struct Variant {
    pub name: &'static str,
    pub source: Source,
    pub target: TargetOp,
    transform: fn(&Var) -> Var,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Huggingface => "huggingface",
            Self::Megatron => "megatron",
        }
    }
}

impl TargetOp {
    /// The ONNX op type of the fused node.
    pub fn op_type(&self) -> &'static str {
        match self {
            Self::Gelu => "Gelu",
            Self::FastGelu => "FastGelu",
            Self::QuickGelu => "QuickGelu",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TargetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op_type())
    }
}

impl Module for Variant {
    fn forward(&self, x: Var) -> Var {
        (self.transform)(&x)
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("target", &self.target)
            .finish()
    }
}

/// `x * 0.5 * (1.0 + erf(x / sqrt(2.0)))`
pub static HUGGINGFACE_GELU: Variant = Variant {
    name: "HuggingfaceGelu",
    source: Source::Huggingface,
    target: TargetOp::Gelu,
    transform: |x| x * 0.5 * (1.0 + (x / SQRT_2).erf()),
};

/// `0.5 * x * (1.0 + tanh(x * 0.7978845608 * (1.0 + 0.044715 * x * x)))`
pub static HUGGINGFACE_FAST_GELU: Variant = Variant {
    name: "HuggingfaceFastGelu",
    source: Source::Huggingface,
    target: TargetOp::FastGelu,
    transform: |x| 0.5 * x * (1.0 + (x * 0.7978845608 * (1.0 + 0.044715 * x * x)).tanh()),
};

/// `x * sigmoid(1.702 * x)`
pub static HUGGINGFACE_QUICK_GELU: Variant = Variant {
    name: "HuggingfaceQuickGelu",
    source: Source::Huggingface,
    target: TargetOp::QuickGelu,
    transform: |x| x * (1.702 * x).sigmoid(),
};

/// `gelu(x, approximate="tanh")`
pub static HUGGINGFACE_TORCH_GELU_TANH: Variant = Variant {
    name: "HuggingfaceTorchGeluTanh",
    source: Source::Huggingface,
    target: TargetOp::FastGelu,
    transform: |x| gelu(x, GeluApproximation::Tanh),
};

/// `x * 0.5 * (erf(x / 1.41421).to(x.dtype) + 1.0)`
pub static MEGATRON_GELU: Variant = Variant {
    name: "MegatronGelu",
    source: Source::Megatron,
    target: TargetOp::Gelu,
    transform: |x| x * 0.5 * ((x / 1.41421).erf().to(x.elem_ty()) + 1.0),
};

/// `0.5 * x * (1.0 + tanh(0.7978845608028654 * x * (1.0 + 0.044715 * x * x)))`
pub static MEGATRON_FAST_GELU: Variant = Variant {
    name: "MegatronFastGelu",
    source: Source::Megatron,
    target: TargetOp::FastGelu,
    transform: |x| {
        0.5 * x * (1.0 + (0.7978845608028654 * x * (1.0 + 0.044715 * x * x)).tanh())
    },
};

pub static VARIANTS: [&Variant; 6] = [
    &HUGGINGFACE_GELU,
    &HUGGINGFACE_FAST_GELU,
    &HUGGINGFACE_QUICK_GELU,
    &HUGGINGFACE_TORCH_GELU_TANH,
    &MEGATRON_GELU,
    &MEGATRON_FAST_GELU,
];

#[cfg(test)]
mod tests {
    use super::*;
    use kasane_export::Tracer;

    #[test]
    fn variant_table() {
        let rows = VARIANTS
            .iter()
            .map(|v| format!("{} {} {}", v.name, v.source, v.target))
            .collect::<Vec<_>>();
        insta::assert_debug_snapshot!(rows, @r###"
        [
            "HuggingfaceGelu huggingface Gelu",
            "HuggingfaceFastGelu huggingface FastGelu",
            "HuggingfaceQuickGelu huggingface QuickGelu",
            "HuggingfaceTorchGeluTanh huggingface FastGelu",
            "MegatronGelu megatron Gelu",
            "MegatronFastGelu megatron FastGelu",
        ]
        "###);
    }

    #[test]
    fn every_variant_traces() {
        for variant in VARIANTS {
            let tracer = Tracer::new();
            let y = variant.forward(tracer.input());
            assert!(tracer.owns(&y), "{}", variant.name);
            assert!(tracer.entries().is_ok(), "{}", variant.name);
        }
    }
}

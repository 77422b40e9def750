//! Library functions with their own lowering, as opposed to plain arithmetic.

use kasane_core::op::GeluApproximation;

use crate::trace::{Expr, Var};

/// `torch.nn.functional.gelu`. How this lowers depends on the export mode and
/// opset.
pub fn gelu(x: &Var, approximate: GeluApproximation) -> Var {
    x.push(Expr::Gelu(x.id(), approximate), x.elem_ty())
}

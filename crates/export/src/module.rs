use crate::trace::Var;

/// A computation over a single input that can be exported.
pub trait Module {
    fn forward(&self, x: Var) -> Var;
}

impl<F: Fn(Var) -> Var> Module for F {
    fn forward(&self, x: Var) -> Var {
        self(x)
    }
}

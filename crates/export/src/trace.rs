//! Records the computation of a [`Module`](crate::Module) as a flat list of
//! expressions.
//!
//! A [`Var`] is a handle to one recorded expression. Arithmetic on `Var`s
//! (and on `f32` scalars mixed with them) appends to the trace instead of
//! computing anything.

use std::{cell::RefCell, fmt, ops, rc::Rc};

use kasane_core::{op::GeluApproximation, tensor::TensorElemType};
use thiserror::Error;

pub type VarId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Erf,
    Tanh,
    Sigmoid,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Input,
    Scalar(f32),
    Unary(UnaryOp, VarId),
    Binary(BinaryOp, VarId, VarId),
    Cast(VarId, TensorElemType),
    Gelu(VarId, GeluApproximation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub expr: Expr,
    pub elem_ty: TensorElemType,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("A value recorded by another tracer was used in {0}")]
    ForeignValue(&'static str),
}

#[derive(Debug, Default)]
struct Trace {
    entries: Vec<Entry>,
    error: Option<TraceError>,
}

#[derive(Clone, Default)]
pub struct Tracer {
    trace: Rc<RefCell<Trace>>,
}

#[derive(Clone)]
pub struct Var {
    trace: Rc<RefCell<Trace>>,
    id: VarId,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a graph input of element type `f32`.
    pub fn input(&self) -> Var {
        push(&self.trace, Expr::Input, TensorElemType::F32)
    }

    pub fn scalar(&self, value: f32) -> Var {
        push(&self.trace, Expr::Scalar(value), TensorElemType::F32)
    }

    /// True if `var` was recorded by this tracer.
    pub fn owns(&self, var: &Var) -> bool {
        Rc::ptr_eq(&self.trace, &var.trace)
    }

    /// Returns everything recorded so far, or the first error hit while tracing.
    pub fn entries(&self) -> Result<Vec<Entry>, TraceError> {
        let trace = self.trace.borrow();
        match &trace.error {
            Some(e) => Err(e.clone()),
            None => Ok(trace.entries.clone()),
        }
    }
}

fn push(trace: &Rc<RefCell<Trace>>, expr: Expr, elem_ty: TensorElemType) -> Var {
    let mut t = trace.borrow_mut();
    t.entries.push(Entry { expr, elem_ty });
    Var {
        trace: trace.clone(),
        id: t.entries.len() - 1,
    }
}

impl Var {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn elem_ty(&self) -> TensorElemType {
        self.trace.borrow().entries[self.id].elem_ty
    }

    pub(crate) fn push(&self, expr: Expr, elem_ty: TensorElemType) -> Var {
        push(&self.trace, expr, elem_ty)
    }

    fn unary(&self, op: UnaryOp) -> Var {
        self.push(Expr::Unary(op, self.id), self.elem_ty())
    }

    pub fn erf(&self) -> Var {
        self.unary(UnaryOp::Erf)
    }

    pub fn tanh(&self) -> Var {
        self.unary(UnaryOp::Tanh)
    }

    pub fn sigmoid(&self) -> Var {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn sqrt(&self) -> Var {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn pow(&self, exponent: f32) -> Var {
        self.binary_scalar(BinaryOp::Pow, exponent, false)
    }

    /// Converts to `elem_ty`, like `Tensor.to(dtype=...)`.
    pub fn to(&self, elem_ty: TensorElemType) -> Var {
        self.push(Expr::Cast(self.id, elem_ty), elem_ty)
    }

    fn binary(&self, op: BinaryOp, rhs: &Var) -> Var {
        if !Rc::ptr_eq(&self.trace, &rhs.trace) {
            let mut trace = self.trace.borrow_mut();
            trace
                .error
                .get_or_insert(TraceError::ForeignValue(binary_op_name(op)));
            return self.clone();
        }
        self.push(Expr::Binary(op, self.id, rhs.id), self.elem_ty())
    }

    fn binary_scalar(&self, op: BinaryOp, value: f32, scalar_on_left: bool) -> Var {
        let scalar = self.push(Expr::Scalar(value), TensorElemType::F32);
        let expr = if scalar_on_left {
            Expr::Binary(op, scalar.id, self.id)
        } else {
            Expr::Binary(op, self.id, scalar.id)
        };
        self.push(expr, self.elem_ty())
    }
}

fn binary_op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "Add",
        BinaryOp::Sub => "Sub",
        BinaryOp::Mul => "Mul",
        BinaryOp::Div => "Div",
        BinaryOp::Pow => "Pow",
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({})", self.id)
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait<Var> for Var {
            type Output = Var;
            fn $method(self, rhs: Var) -> Var {
                self.binary($op, &rhs)
            }
        }

        impl ops::$trait<&Var> for Var {
            type Output = Var;
            fn $method(self, rhs: &Var) -> Var {
                self.binary($op, rhs)
            }
        }

        impl ops::$trait<Var> for &Var {
            type Output = Var;
            fn $method(self, rhs: Var) -> Var {
                self.binary($op, &rhs)
            }
        }

        impl ops::$trait<&Var> for &Var {
            type Output = Var;
            fn $method(self, rhs: &Var) -> Var {
                self.binary($op, rhs)
            }
        }

        impl ops::$trait<f32> for Var {
            type Output = Var;
            fn $method(self, rhs: f32) -> Var {
                self.binary_scalar($op, rhs, false)
            }
        }

        impl ops::$trait<f32> for &Var {
            type Output = Var;
            fn $method(self, rhs: f32) -> Var {
                self.binary_scalar($op, rhs, false)
            }
        }

        impl ops::$trait<Var> for f32 {
            type Output = Var;
            fn $method(self, rhs: Var) -> Var {
                rhs.binary_scalar($op, self, true)
            }
        }

        impl ops::$trait<&Var> for f32 {
            type Output = Var;
            fn $method(self, rhs: &Var) -> Var {
                rhs.binary_scalar($op, self, true)
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

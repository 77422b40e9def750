//! Lowers a recorded trace into a [`Model`].

use std::f32::consts::SQRT_2;

use kasane_core::{
    fixed_dim::FixedDimensions,
    model::Model,
    node::Node,
    op::{Cast, Constant, Gelu, GeluApproximation, Op, GELU_OPSET},
    tensor::{Tensor, TensorElemType, TypedFixedShape},
    value::ValueId,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    options::{ExportMode, ExportOptions},
    trace::{BinaryOp, Entry, Expr, UnaryOp, VarId},
    ExportError,
};

/// `sqrt(2 / pi)`
const SQRT_2_OVER_PI: f32 = 0.7978845608028654;
const CUBIC_COEF: f32 = 0.044715;

pub(crate) struct Signature<'a> {
    pub input_name: &'a str,
    pub output_name: &'a str,
    pub input_dims: FixedDimensions,
}

struct Lowering<'a> {
    model: Model,
    options: &'a ExportOptions,
    op_counts: FxHashMap<&'static str, usize>,
    num_scalars: usize,
    /// Value names in use, seeded with the signature names.
    taken: FxHashSet<String>,
}

pub(crate) fn lower(
    entries: &[Entry],
    output: VarId,
    signature: Signature,
    options: &ExportOptions,
) -> Result<Model, ExportError> {
    if !depends_on_input(entries, output) {
        return Err(ExportError::ConstantOutput);
    }

    let mut lowering = Lowering {
        model: Model {
            opset_version: options.opset_version(),
            ..Default::default()
        },
        options,
        op_counts: FxHashMap::default(),
        num_scalars: 0,
        taken: [signature.input_name, signature.output_name]
            .into_iter()
            .map(str::to_string)
            .collect(),
    };

    let input = lowering.model.graph.values.new_val_named_and_shaped(
        signature.input_name,
        TypedFixedShape::new(signature.input_dims.clone(), TensorElemType::F32),
    );
    lowering.model.graph.inputs.push(input);

    let live = live_entries(entries, output);
    let mut vals: Vec<Option<ValueId>> = vec![None; entries.len()];
    for (id, entry) in entries.iter().enumerate() {
        if !live[id] {
            continue;
        }
        let val = |v: VarId| vals[v].ok_or(ExportError::Malformed(v));
        let lowered = match entry.expr {
            Expr::Input => input,
            Expr::Scalar(c) => lowering.scalar(c),
            Expr::Unary(op, x) => {
                let x = val(x)?;
                lowering.node(unary_op(op), vec![x])
            }
            Expr::Binary(op, a, b) => {
                let (a, b) = (val(a)?, val(b)?);
                lowering.node(binary_op(op), vec![a, b])
            }
            Expr::Cast(x, to) => {
                let from = entries[x].elem_ty;
                let x = val(x)?;
                if from == to && lowering.drops_redundant_casts() {
                    x
                } else {
                    lowering.node(Op::Cast(Cast { to }), vec![x])
                }
            }
            Expr::Gelu(x, approximate) => {
                let x = val(x)?;
                lowering.gelu(x, approximate)
            }
        };
        vals[id] = Some(lowered);
    }

    let mut out = vals[output].ok_or(ExportError::Malformed(output))?;
    if out == input {
        out = lowering.node(Op::Identity, vec![input]);
    }
    let value = &mut lowering.model.graph.values[out];
    value.name = Some(signature.output_name.to_string());
    value.shape = Some(
        TypedFixedShape::new(signature.input_dims, entries[output].elem_ty).into(),
    );
    lowering.model.graph.outputs.push(out);

    Ok(lowering.model)
}

impl Lowering<'_> {
    fn drops_redundant_casts(&self) -> bool {
        match self.options.mode {
            ExportMode::Legacy => true,
            ExportMode::Dynamo => self.options.optimize,
        }
    }

    fn scalar(&mut self, c: f32) -> ValueId {
        match self.options.mode {
            ExportMode::Legacy => self.node(
                Op::Constant(Constant {
                    value: Tensor::scalar(c),
                }),
                vec![],
            ),
            ExportMode::Dynamo => {
                let name = self.fresh_name(format!("val_{}", self.num_scalars));
                self.num_scalars += 1;
                let id = self.model.graph.values.new_val_named(name);
                self.model.graph.inits.insert(id, Tensor::scalar(c));
                id
            }
        }
    }

    /// Returns `base`, suffixed until it clashes with no other value name.
    fn fresh_name(&mut self, base: String) -> String {
        let mut name = base.clone();
        let mut k = 1;
        while self.taken.contains(&name) {
            name = format!("{base}_{k}");
            k += 1;
        }
        self.taken.insert(name.clone());
        name
    }

    /// Adds a node with a single output named the way each exporter does.
    fn node(&mut self, op: Op, inputs: Vec<ValueId>) -> ValueId {
        let op_name = op.name();
        let count = self.op_counts.entry(op_name).or_default();
        let n = *count;
        *count += 1;

        let (node_name, value_name) = match self.options.mode {
            ExportMode::Legacy => {
                let node_name = if n == 0 {
                    format!("/{op_name}")
                } else {
                    format!("/{op_name}_{n}")
                };
                let value_name = format!("{node_name}_output_0");
                (node_name, value_name)
            }
            ExportMode::Dynamo => {
                let lower = op_name.to_lowercase();
                let value_name = if n == 0 {
                    lower
                } else {
                    format!("{lower}_{n}")
                };
                (format!("node_{op_name}_{n}"), value_name)
            }
        };

        let value_name = self.fresh_name(value_name);
        let out = self.model.graph.values.new_val_named(value_name);
        self.model.graph.add_node(
            Node::new(op)
                .with_name(node_name)
                .with_ins(inputs)
                .with_out(out),
        );
        out
    }

    fn gelu(&mut self, x: ValueId, approximate: GeluApproximation) -> ValueId {
        if self.options.mode.is_dynamo() && self.model.opset_version >= GELU_OPSET {
            return self.node(Op::Gelu(Gelu { approximate }), vec![x]);
        }

        match approximate {
            // x * (erf(x / sqrt(2)) + 1) * 0.5
            GeluApproximation::None => {
                let sqrt2 = self.scalar(SQRT_2);
                let d = self.node(Op::Div, vec![x, sqrt2]);
                let e = self.node(Op::Erf, vec![d]);
                let one = self.scalar(1.0);
                let s = self.node(Op::Add, vec![e, one]);
                let m = self.node(Op::Mul, vec![x, s]);
                let half = self.scalar(0.5);
                self.node(Op::Mul, vec![m, half])
            }
            // 0.5 * (x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x * (x * x)))))
            GeluApproximation::Tanh => {
                let xx = self.node(Op::Mul, vec![x, x]);
                let xxx = self.node(Op::Mul, vec![x, xx]);
                let kappa = self.scalar(CUBIC_COEF);
                let k = self.node(Op::Mul, vec![kappa, xxx]);
                let p = self.node(Op::Add, vec![x, k]);
                let beta = self.scalar(SQRT_2_OVER_PI);
                let inner = self.node(Op::Mul, vec![beta, p]);
                let t = self.node(Op::Tanh, vec![inner]);
                let one = self.scalar(1.0);
                let s = self.node(Op::Add, vec![one, t]);
                let m = self.node(Op::Mul, vec![x, s]);
                let half = self.scalar(0.5);
                self.node(Op::Mul, vec![half, m])
            }
        }
    }
}

fn unary_op(op: UnaryOp) -> Op {
    match op {
        UnaryOp::Erf => Op::Erf,
        UnaryOp::Tanh => Op::Tanh,
        UnaryOp::Sigmoid => Op::Sigmoid,
        UnaryOp::Sqrt => Op::Sqrt,
    }
}

fn binary_op(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::Pow => Op::Pow,
    }
}

fn operands(expr: &Expr) -> Vec<VarId> {
    match *expr {
        Expr::Input | Expr::Scalar(_) => vec![],
        Expr::Unary(_, x) | Expr::Cast(x, _) | Expr::Gelu(x, _) => vec![x],
        Expr::Binary(_, a, b) => vec![a, b],
    }
}

/// Entries the output is computed from. Operands always precede their users.
fn live_entries(entries: &[Entry], output: VarId) -> Vec<bool> {
    let mut live = vec![false; entries.len()];
    live[output] = true;
    for id in (0..=output).rev() {
        if live[id] {
            for v in operands(&entries[id].expr) {
                live[v] = true;
            }
        }
    }
    live
}

fn depends_on_input(entries: &[Entry], output: VarId) -> bool {
    let live = live_entries(entries, output);
    entries
        .iter()
        .zip(live)
        .any(|(entry, live)| live && entry.expr == Expr::Input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Tracer;

    fn op_types(model: &Model) -> Vec<&'static str> {
        model
            .topo_sort_nodes()
            .into_iter()
            .map(|id| model.graph.nodes[id].op.name())
            .collect()
    }

    fn lower_fn(f: impl Fn(&crate::trace::Var) -> crate::trace::Var, options: &ExportOptions) -> Model {
        let tracer = Tracer::new();
        let x = tracer.input();
        let y = f(&x);
        let signature = Signature {
            input_name: "input",
            output_name: "output",
            input_dims: vec![3].into(),
        };
        lower(&tracer.entries().unwrap(), y.id(), signature, options).unwrap()
    }

    #[test]
    fn legacy_scalars_are_constants() {
        let model = lower_fn(|x| x * 0.5, &ExportOptions::new());
        assert_eq!(op_types(&model), vec!["Constant", "Mul"]);
        assert!(model.graph.inits.is_empty());

        let mul = model.get_nodes_by_op_type("Mul")[0];
        assert_eq!(model.graph.nodes[mul].name.as_deref(), Some("/Mul"));
        let out = model.graph.outputs[0];
        assert_eq!(model.graph.values.name_of(out), "output");
    }

    #[test]
    fn dynamo_scalars_are_initializers() {
        let opts = ExportOptions::new().with_mode(ExportMode::Dynamo);
        let model = lower_fn(|x| x * 0.5 + 1.0, &opts);
        assert_eq!(op_types(&model), vec!["Mul", "Add"]);
        assert_eq!(model.graph.inits.len(), 2);
    }

    #[test]
    fn legacy_drops_same_type_cast() {
        let model = lower_fn(|x| x.erf().to(TensorElemType::F32) + 1.0, &ExportOptions::new());
        assert!(model.get_nodes_by_op_type("Cast").is_empty());
    }

    #[test]
    fn dynamo_keeps_cast_unless_optimized() {
        let f = |x: &crate::trace::Var| x.erf().to(TensorElemType::F32) + 1.0;
        let opts = ExportOptions::new().with_mode(ExportMode::Dynamo);
        assert_eq!(lower_fn(f, &opts).get_nodes_by_op_type("Cast").len(), 1);

        let opts = opts.with_optimize(true);
        assert!(lower_fn(f, &opts).get_nodes_by_op_type("Cast").is_empty());
    }

    #[test]
    fn legacy_decomposes_gelu() {
        let model = lower_fn(
            |x| crate::functional::gelu(x, GeluApproximation::None),
            &ExportOptions::new(),
        );
        insta::assert_debug_snapshot!(op_types(&model), @r###"
        [
            "Constant",
            "Constant",
            "Constant",
            "Div",
            "Erf",
            "Add",
            "Mul",
            "Mul",
        ]
        "###);
    }

    #[test]
    fn legacy_decomposes_tanh_gelu() {
        let model = lower_fn(
            |x| crate::functional::gelu(x, GeluApproximation::Tanh),
            &ExportOptions::new(),
        );
        assert!(model.get_nodes_by_op_type("Gelu").is_empty());
        assert_eq!(model.get_nodes_by_op_type("Tanh").len(), 1);
        assert_eq!(model.get_nodes_by_op_type("Mul").len(), 6);
    }

    #[test]
    fn dynamo_emits_gelu_node() {
        let opts = ExportOptions::new().with_mode(ExportMode::Dynamo);
        let model = lower_fn(|x| crate::functional::gelu(x, GeluApproximation::Tanh), &opts);
        assert_eq!(op_types(&model), vec!["Gelu"]);

        // Gelu is not a standard op before opset 20.
        let opts = opts.with_opset_version(18);
        let model = lower_fn(|x| crate::functional::gelu(x, GeluApproximation::Tanh), &opts);
        assert!(model.get_nodes_by_op_type("Gelu").is_empty());
    }

    #[test]
    fn identity_output() {
        let model = lower_fn(|x| x.clone(), &ExportOptions::new());
        assert_eq!(op_types(&model), vec!["Identity"]);
        assert_ne!(model.graph.outputs[0], model.graph.inputs[0]);
    }

    #[test]
    fn unused_values_are_not_lowered() {
        let model = lower_fn(
            |x| {
                let _ = x.tanh();
                x.sigmoid()
            },
            &ExportOptions::new(),
        );
        assert_eq!(op_types(&model), vec!["Sigmoid"]);
    }

    fn value_names(model: &Model) -> Vec<String> {
        model
            .topo_sort_nodes()
            .into_iter()
            .flat_map(|id| model.graph.nodes[id].outputs.clone())
            .map(|v| model.graph.values.name_of(v))
            .collect()
    }

    #[test]
    fn generated_names_avoid_signature_names() {
        let tracer = Tracer::new();
        let x = tracer.input();
        let y = (&x * &x) * &x * 2.0;
        let signature = Signature {
            input_name: "mul",
            output_name: "val_0",
            input_dims: vec![3].into(),
        };
        let opts = ExportOptions::new().with_mode(ExportMode::Dynamo);
        let model = lower(&tracer.entries().unwrap(), y.id(), signature, &opts).unwrap();

        let mut names = value_names(&model);
        names.push(model.graph.values.name_of(model.graph.inputs[0]));
        names.extend(model.graph.inits.keys().map(|&v| model.graph.values.name_of(v)));
        insta::assert_debug_snapshot!(names, @r###"
        [
            "mul_1",
            "mul_1_1",
            "val_0",
            "mul",
            "val_0_1",
        ]
        "###);
        assert_eq!(model.get_nodes_by_op_type("Mul").len(), 3);
    }

    #[test]
    fn legacy_names_avoid_signature_names() {
        let tracer = Tracer::new();
        let x = tracer.input();
        let y = x.tanh().sigmoid();
        let signature = Signature {
            input_name: "/Tanh_output_0",
            output_name: "output",
            input_dims: vec![3].into(),
        };
        let model =
            lower(&tracer.entries().unwrap(), y.id(), signature, &ExportOptions::new()).unwrap();
        assert_eq!(value_names(&model), vec!["/Tanh_output_0_1", "output"]);
    }

    #[test]
    fn constant_output() {
        let tracer = Tracer::new();
        let _x = tracer.input();
        let c = tracer.scalar(2.0);
        let y = &c * 3.0;
        let signature = Signature {
            input_name: "input",
            output_name: "output",
            input_dims: vec![3].into(),
        };
        assert!(matches!(
            lower(&tracer.entries().unwrap(), y.id(), signature, &ExportOptions::new()),
            Err(ExportError::ConstantOutput)
        ));
    }
}

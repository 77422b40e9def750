use std::time::Instant;

use crate::{
    model::Model,
    node::NodeId,
    op::{Gelu, GeluApproximation, Op},
    value::ValueId,
};

use super::{
    apply_fusions, find_fusions,
    pattern::{approx_eq, pairs, Matcher},
    Fusion,
};

/// `sqrt(2 / pi)`
const SQRT_2_OVER_PI: f32 = 0.7978845608028654;
const CUBIC_COEF: f32 = 0.044715;

/// Matches `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`. The
/// polynomial may also be written as `x * (1 + 0.044715 * x * x)`.
fn extract_fast_gelu(m: &Matcher, root_id: NodeId) -> Option<Fusion> {
    let root = &m.model().graph.nodes[root_id];
    if !matches!(root.op, Op::Mul | Op::Div) || root.outputs.len() != 1 {
        return None;
    }

    let output = root.outputs[0];
    let product = m.product(output, true);
    if !approx_eq(product.coef, 0.5) {
        return None;
    }

    pairs(&product.factors).into_iter().find_map(|(x, s)| {
        let tanh_nodes = match_tanh_term(m, s, x)?;

        // FastGelu Detected!

        Some(Fusion {
            op: Op::FastGelu,
            input: x,
            output,
            nodes: [product.nodes.as_slice(), &tanh_nodes].concat(),
        })
    })
}

/// Matches `1 + tanh(sqrt(2 / pi) * poly(x))`.
fn match_tanh_term(m: &Matcher, s: ValueId, x: ValueId) -> Option<Vec<NodeId>> {
    let sum = m.sum(s)?;
    if !approx_eq(sum.constant, 1.0) || sum.terms.len() != 1 {
        return None;
    }

    let (tanh_id, arg) = m.unary(sum.terms[0], &Op::Tanh)?;
    let inner = m.product(arg, false);
    if !approx_eq(inner.coef, SQRT_2_OVER_PI) {
        return None;
    }

    let poly_nodes = match inner.factors.as_slice() {
        // x * (1 + a * x * x)
        &[a, b] => pairs(&[a, b])
            .into_iter()
            .filter(|&(l, _)| l == x)
            .find_map(|(_, p)| match_poly(m, p, x, 1.0, &[x, x]))?,
        // x + a * x * x * x
        &[p] => match_poly(m, p, x, 0.0, &[x, x, x])?,
        _ => return None,
    };

    let mut nodes = sum.nodes;
    nodes.push(tanh_id);
    nodes.extend(inner.nodes);
    nodes.extend(poly_nodes);
    Some(nodes)
}

/// Matches `constant + [x +] 0.044715 * powers` where the optional `x` term is
/// expected iff `constant` is zero.
fn match_poly(
    m: &Matcher,
    p: ValueId,
    x: ValueId,
    constant: f32,
    powers: &[ValueId],
) -> Option<Vec<NodeId>> {
    let sum = m.sum(p)?;
    if !approx_eq(sum.constant, constant) {
        return None;
    }

    let cubic = match sum.terms.as_slice() {
        &[q] if constant != 0.0 => q,
        &[a, b] if constant == 0.0 => pairs(&[a, b])
            .into_iter()
            .find_map(|(l, q)| (l == x).then_some(q))?,
        _ => return None,
    };

    let q = m.product(cubic, false);
    if q.factors != powers || !approx_eq(q.coef, CUBIC_COEF) {
        return None;
    }

    let mut nodes = sum.nodes;
    nodes.extend(q.nodes);
    Some(nodes)
}

/// Fuses the tanh approximation subgraph into `FastGelu`. A standard
/// `Gelu(approximate="tanh")` node is rewritten into `FastGelu` as well.
pub fn fuse_fast_gelu(model: &mut Model) -> usize {
    let start = Instant::now();

    let mut count = rewrite_gelus(model, GeluApproximation::Tanh);

    let fusions = find_fusions(model, extract_fast_gelu);
    count += apply_fusions(model, fusions);

    log::info!("fuse_fast_gelu({count}): {:?}", start.elapsed());

    count
}

/// Turns exact `Gelu` nodes into `FastGelu`, trading accuracy for speed.
pub fn approximate_gelu(model: &mut Model) -> usize {
    let start = Instant::now();
    let count = rewrite_gelus(model, GeluApproximation::None);

    log::info!("approximate_gelu({count}): {:?}", start.elapsed());

    count
}

fn rewrite_gelus(model: &mut Model, approximate: GeluApproximation) -> usize {
    let mut count = 0;
    for (_, node) in model.graph.nodes.iter_mut() {
        if node.deleted || node.op != Op::Gelu(Gelu { approximate }) {
            continue;
        }
        node.op = Op::FastGelu;
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::Node,
        optimize::testing::{op_types, ModelBuilder},
    };

    #[test]
    fn fuse_huggingface_form() {
        // 0.5 * x * (1.0 + tanh(x * 0.7978845608 * (1.0 + 0.044715 * x * x)))
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let half = b.init(0.5);
        let k = b.init(0.7978845608);
        let a = b.init(CUBIC_COEF);
        let one = b.init(1.0);
        let one2 = b.init(1.0);
        let hx = b.binary(Op::Mul, half, x);
        let xk = b.binary(Op::Mul, x, k);
        let ax = b.binary(Op::Mul, a, x);
        let axx = b.binary(Op::Mul, ax, x);
        let poly = b.binary(Op::Add, one, axx);
        let inner = b.binary(Op::Mul, xk, poly);
        let t = b.unary(Op::Tanh, inner);
        let s = b.binary(Op::Add, one2, t);
        let y = b.binary(Op::Mul, hx, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_fast_gelu(&mut model), 1);
        insta::assert_debug_snapshot!(op_types(&model), @r###"
        [
            "FastGelu",
        ]
        "###);

        let fast_gelu = &model.graph.nodes[model.get_nodes_by_op_type("FastGelu")[0]];
        assert_eq!(fast_gelu.inputs, vec![x]);
        assert_eq!(fast_gelu.outputs, vec![y]);
    }

    #[test]
    fn fuse_cubic_form() {
        // 0.5 * (x * (1 + tanh(k * (x + 0.044715 * (x * (x * x))))))
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let k = b.constant(SQRT_2_OVER_PI);
        let a = b.constant(CUBIC_COEF);
        let one = b.constant(1.0);
        let half = b.constant(0.5);
        let xx = b.binary(Op::Mul, x, x);
        let xxx = b.binary(Op::Mul, x, xx);
        let axxx = b.binary(Op::Mul, a, xxx);
        let poly = b.binary(Op::Add, x, axxx);
        let inner = b.binary(Op::Mul, k, poly);
        let t = b.unary(Op::Tanh, inner);
        let s = b.binary(Op::Add, one, t);
        let xs = b.binary(Op::Mul, x, s);
        let y = b.binary(Op::Mul, half, xs);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_fast_gelu(&mut model), 1);
        let ops = op_types(&model);
        assert_eq!(ops.iter().filter(|&&op| op == "FastGelu").count(), 1);
        assert!(ops.iter().all(|&op| op == "FastGelu" || op == "Constant"));
    }

    #[test]
    fn fuse_pow_form() {
        // x * 0.5 * (1 + tanh(k * (0.044715 * pow(x, 3) + x)))
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let three = b.init(3.0);
        let a = b.init(CUBIC_COEF);
        let k = b.init(SQRT_2_OVER_PI);
        let one = b.init(1.0);
        let half = b.init(0.5);
        let x3 = b.binary(Op::Pow, x, three);
        let ax3 = b.binary(Op::Mul, a, x3);
        let poly = b.binary(Op::Add, ax3, x);
        let inner = b.binary(Op::Mul, poly, k);
        let t = b.unary(Op::Tanh, inner);
        let s = b.binary(Op::Add, t, one);
        let hx = b.binary(Op::Mul, x, half);
        let y = b.binary(Op::Mul, hx, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_fast_gelu(&mut model), 1);
        assert_eq!(op_types(&model), vec!["FastGelu"]);
    }

    #[test]
    fn reject_wrong_cubic_coefficient() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let half = b.init(0.5);
        let k = b.init(SQRT_2_OVER_PI);
        let a = b.init(0.5);
        let one = b.init(1.0);
        let hx = b.binary(Op::Mul, half, x);
        let xk = b.binary(Op::Mul, x, k);
        let ax = b.binary(Op::Mul, a, x);
        let axx = b.binary(Op::Mul, ax, x);
        let poly = b.binary(Op::Add, one, axx);
        let inner = b.binary(Op::Mul, xk, poly);
        let t = b.unary(Op::Tanh, inner);
        let s = b.binary(Op::Add, one, t);
        let y = b.binary(Op::Mul, hx, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_fast_gelu(&mut model), 0);
        assert_eq!(model.get_nodes_by_op_type("Tanh").len(), 1);
    }

    #[test]
    fn rewrite_tanh_gelu() {
        let mut b = ModelBuilder::new(20);
        let x = b.input("input");
        let y = b.unary(
            Op::Gelu(Gelu {
                approximate: GeluApproximation::Tanh,
            }),
            x,
        );
        let z = b.unary(Op::Gelu(Gelu::default()), y);
        b.output(z);
        let mut model = b.build();

        assert_eq!(fuse_fast_gelu(&mut model), 1);
        assert_eq!(op_types(&model), vec!["FastGelu", "Gelu"]);

        assert_eq!(approximate_gelu(&mut model), 1);
        assert_eq!(op_types(&model), vec!["FastGelu", "FastGelu"]);
    }

    #[test]
    fn skip_deleted_gelu() {
        let mut b = ModelBuilder::new(20);
        let x = b.input("input");
        b.output(x);
        let mut model = b.build();
        let y = model.graph.values.new_val();
        let id = model.graph.add_node(
            Node::new(Op::Gelu(Gelu {
                approximate: GeluApproximation::Tanh,
            }))
            .with_in(x)
            .with_out(y),
        );
        model.graph.nodes[id].deleted = true;

        assert_eq!(fuse_fast_gelu(&mut model), 0);
    }
}

use std::{f32::consts::FRAC_1_SQRT_2, time::Instant};

use crate::{
    model::Model,
    node::NodeId,
    op::{Gelu, Op},
    value::ValueId,
};

use super::{
    apply_fusions, find_fusions,
    pattern::{approx_eq, pairs, Matcher},
    Fusion,
};

/// Matches `0.5 * x * (1 + erf(x / sqrt(2)))` rooted at `root_id`, whatever
/// the association and operand order of the `Mul`s and `Add`.
fn extract_gelu(m: &Matcher, root_id: NodeId) -> Option<Fusion> {
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
        let erf_nodes = match_erf_term(m, s, x)?;

        // Gelu Detected!

        Some(Fusion {
            op: Op::Gelu(Gelu::default()),
            input: x,
            output,
            nodes: [product.nodes.as_slice(), &erf_nodes].concat(),
        })
    })
}

/// Matches `1 + erf(x / sqrt(2))`.
fn match_erf_term(m: &Matcher, s: ValueId, x: ValueId) -> Option<Vec<NodeId>> {
    let sum = m.sum(s)?;
    if !approx_eq(sum.constant, 1.0) || sum.terms.len() != 1 {
        return None;
    }

    let (erf_id, arg) = m.unary(sum.terms[0], &Op::Erf)?;
    let scaled = m.product(arg, false);
    if scaled.factors != [x] || !approx_eq(scaled.coef, FRAC_1_SQRT_2) {
        return None;
    }

    let mut nodes = sum.nodes;
    nodes.push(erf_id);
    nodes.extend(scaled.nodes);
    Some(nodes)
}

pub fn fuse_gelu(model: &mut Model) -> usize {
    let start = Instant::now();
    let fusions = find_fusions(model, extract_gelu);
    let count = apply_fusions(model, fusions);

    log::info!("fuse_gelu({count}): {:?}", start.elapsed());

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimize::{
            constant_lift::lift_constants,
            testing::{op_types, ModelBuilder},
        },
        op::Cast,
        tensor::TensorElemType,
    };

    #[test]
    fn fuse_huggingface_form() {
        // x * 0.5 * (1.0 + erf(x / sqrt(2)))
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let half = b.init(0.5);
        let sqrt2 = b.init(std::f32::consts::SQRT_2);
        let one = b.init(1.0);
        let a = b.binary(Op::Mul, x, half);
        let d = b.binary(Op::Div, x, sqrt2);
        let e = b.unary(Op::Erf, d);
        let s = b.binary(Op::Add, one, e);
        let y = b.binary(Op::Mul, a, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_gelu(&mut model), 1);
        insta::assert_debug_snapshot!(op_types(&model), @r###"
        [
            "Gelu",
        ]
        "###);

        let gelu = &model.graph.nodes[model.get_nodes_by_op_type("Gelu")[0]];
        assert_eq!(gelu.inputs, vec![x]);
        assert_eq!(gelu.outputs, vec![y]);
        assert_eq!(model.graph.outputs, vec![y]);
    }

    #[test]
    fn fuse_megatron_form_with_constant_nodes() {
        // x * 0.5 * (erf(x / 1.41421) + 1.0), scalars as Constant nodes
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let half = b.constant(0.5);
        let c = b.constant(1.41421);
        let one = b.constant(1.0);
        let a = b.binary(Op::Mul, x, half);
        let d = b.binary(Op::Div, x, c);
        let e = b.unary(Op::Erf, d);
        let s = b.binary(Op::Add, e, one);
        let y = b.binary(Op::Mul, a, s);
        b.output(y);
        let mut model = b.build();

        lift_constants(&mut model);
        assert_eq!(fuse_gelu(&mut model), 1);
        assert_eq!(op_types(&model), vec!["Gelu"]);
    }

    #[test]
    fn fuse_decomposed_form() {
        // ((x * (erf(x * (1 / sqrt(2))) + 1)) * 0.5
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let k = b.init(FRAC_1_SQRT_2);
        let one = b.init(1.0);
        let half = b.init(0.5);
        let d = b.binary(Op::Mul, x, k);
        let e = b.unary(Op::Erf, d);
        let s = b.binary(Op::Add, e, one);
        let a = b.binary(Op::Mul, x, s);
        let y = b.binary(Op::Mul, a, half);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_gelu(&mut model), 1);
        assert_eq!(op_types(&model), vec!["Gelu"]);
    }

    #[test]
    fn fuse_stacked_gelus() {
        let mut b = ModelBuilder::new(17);
        let mut x = b.input("input");
        for _ in 0..2 {
            let half = b.init(0.5);
            let sqrt2 = b.init(std::f32::consts::SQRT_2);
            let one = b.init(1.0);
            let a = b.binary(Op::Mul, x, half);
            let d = b.binary(Op::Div, x, sqrt2);
            let e = b.unary(Op::Erf, d);
            let s = b.binary(Op::Add, one, e);
            x = b.binary(Op::Mul, a, s);
        }
        b.output(x);
        let mut model = b.build();

        assert_eq!(fuse_gelu(&mut model), 2);
        assert_eq!(op_types(&model), vec!["Gelu", "Gelu"]);
    }

    #[test]
    fn reject_wrong_divisor() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let half = b.init(0.5);
        let two = b.init(2.0);
        let one = b.init(1.0);
        let a = b.binary(Op::Mul, x, half);
        let d = b.binary(Op::Div, x, two);
        let e = b.unary(Op::Erf, d);
        let s = b.binary(Op::Add, one, e);
        let y = b.binary(Op::Mul, a, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_gelu(&mut model), 0);
        assert_eq!(op_types(&model), vec!["Mul", "Div", "Erf", "Add", "Mul"]);
    }

    #[test]
    fn reject_shared_intermediate() {
        // The Erf output escapes the pattern, so nothing can be removed.
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let half = b.init(0.5);
        let sqrt2 = b.init(std::f32::consts::SQRT_2);
        let one = b.init(1.0);
        let a = b.binary(Op::Mul, x, half);
        let d = b.binary(Op::Div, x, sqrt2);
        let e = b.unary(Op::Erf, d);
        let s = b.binary(Op::Add, one, e);
        let y = b.binary(Op::Mul, a, s);
        b.output(y);
        b.output(e);
        let mut model = b.build();

        assert_eq!(fuse_gelu(&mut model), 0);
    }

    #[test]
    fn reject_cast_in_the_middle() {
        // A Cast that was not eliminated breaks the pattern.
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let half = b.init(0.5);
        let sqrt2 = b.init(std::f32::consts::SQRT_2);
        let one = b.init(1.0);
        let a = b.binary(Op::Mul, x, half);
        let d = b.binary(Op::Div, x, sqrt2);
        let e = b.unary(Op::Erf, d);
        let c = b.unary(
            Op::Cast(Cast {
                to: TensorElemType::F32,
            }),
            e,
        );
        let s = b.binary(Op::Add, c, one);
        let y = b.binary(Op::Mul, a, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_gelu(&mut model), 0);
    }
}

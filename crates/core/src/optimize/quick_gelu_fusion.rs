use std::time::Instant;

use crate::{
    model::Model,
    node::NodeId,
    op::{Op, QuickGelu},
};

use super::{
    apply_fusions, find_fusions,
    pattern::{approx_eq, pairs, Matcher},
    Fusion,
};

/// Matches `x * sigmoid(alpha * x)`.
fn extract_quick_gelu(m: &Matcher, root_id: NodeId) -> Option<Fusion> {
    let root = &m.model().graph.nodes[root_id];
    if root.op != Op::Mul || root.outputs.len() != 1 {
        return None;
    }

    let output = root.outputs[0];
    let product = m.product(output, true);
    if !approx_eq(product.coef, 1.0) {
        return None;
    }

    pairs(&product.factors).into_iter().find_map(|(x, s)| {
        let (sigmoid_id, arg) = m.unary(s, &Op::Sigmoid)?;
        let scaled = m.product(arg, false);
        if scaled.factors != [x] || scaled.coef == 0.0 {
            return None;
        }

        // QuickGelu Detected!

        let mut nodes = product.nodes.clone();
        nodes.push(sigmoid_id);
        nodes.extend(scaled.nodes);
        Some(Fusion {
            op: Op::QuickGelu(QuickGelu {
                alpha: scaled.coef,
            }),
            input: x,
            output,
            nodes,
        })
    })
}

pub fn fuse_quick_gelu(model: &mut Model) -> usize {
    let start = Instant::now();
    let fusions = find_fusions(model, extract_quick_gelu);
    let count = apply_fusions(model, fusions);

    log::info!("fuse_quick_gelu({count}): {:?}", start.elapsed());

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::testing::{op_types, ModelBuilder};

    #[test]
    fn fuse_quick_gelu_with_alpha() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let alpha = b.constant(1.702);
        let ax = b.binary(Op::Mul, alpha, x);
        let s = b.unary(Op::Sigmoid, ax);
        let y = b.binary(Op::Mul, x, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_quick_gelu(&mut model), 1);
        insta::assert_debug_snapshot!(op_types(&model), @r###"
        [
            "Constant",
            "QuickGelu",
        ]
        "###);

        let node = &model.graph.nodes[model.get_nodes_by_op_type("QuickGelu")[0]];
        assert_eq!(node.inputs, vec![x]);
        assert_eq!(node.outputs, vec![y]);
        match &node.op {
            Op::QuickGelu(QuickGelu { alpha }) => assert!(approx_eq(*alpha, 1.702)),
            op => panic!("unexpected op {op:?}"),
        }
    }

    #[test]
    fn fuse_swish() {
        // x * sigmoid(x) is QuickGelu with alpha = 1
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let s = b.unary(Op::Sigmoid, x);
        let y = b.binary(Op::Mul, s, x);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_quick_gelu(&mut model), 1);
        let node = &model.graph.nodes[model.get_nodes_by_op_type("QuickGelu")[0]];
        assert_eq!(node.op, Op::QuickGelu(QuickGelu { alpha: 1.0 }));
    }

    #[test]
    fn reject_sigmoid_of_other_value() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let z = b.input("other");
        let s = b.unary(Op::Sigmoid, z);
        let y = b.binary(Op::Mul, x, s);
        b.output(y);
        let mut model = b.build();

        assert_eq!(fuse_quick_gelu(&mut model), 0);
        assert_eq!(op_types(&model), vec!["Sigmoid", "Mul"]);
    }
}

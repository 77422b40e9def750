use std::time::Instant;

use crate::{model::Model, op::Op};

/// Removes `Identity` nodes by rewiring their users to the identity's input.
/// An identity producing a graph output is kept so the output name survives.
pub fn eliminate_identity(model: &mut Model) -> usize {
    let start = Instant::now();
    let mut count = 0;

    for node_id in model.topo_sort_nodes() {
        let node = &model.graph.nodes[node_id];
        if node.op != Op::Identity || node.inputs.len() != 1 || node.outputs.len() != 1 {
            continue;
        }

        let id_in = node.inputs[0];
        let id_out = node.outputs[0];
        if model.graph.is_output(id_out) {
            continue;
        }

        model.graph.nodes[node_id].deleted = true;
        model.replace_value(id_out, id_in);
        count += 1;
    }

    model.remove_unnecessary_nodes();

    log::info!("eliminate_identity({count}): {:?}", start.elapsed());

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::testing::{op_types, ModelBuilder};

    #[test]
    fn remove_identity_chain() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let a = b.unary(Op::Identity, x);
        let c = b.unary(Op::Identity, a);
        let y = b.unary(Op::Tanh, c);
        b.output(y);
        let mut model = b.build();

        assert_eq!(eliminate_identity(&mut model), 2);
        assert_eq!(op_types(&model), vec!["Tanh"]);
        let tanh = &model.graph.nodes[model.get_nodes_by_op_type("Tanh")[0]];
        assert_eq!(tanh.inputs, vec![x]);
    }

    #[test]
    fn keep_identity_on_graph_output() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let t = b.unary(Op::Tanh, x);
        let y = b.unary(Op::Identity, t);
        b.output(y);
        let mut model = b.build();

        assert_eq!(eliminate_identity(&mut model), 0);
        assert_eq!(op_types(&model), vec!["Tanh", "Identity"]);
    }
}

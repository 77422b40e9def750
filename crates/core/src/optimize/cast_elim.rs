use std::time::Instant;

use crate::{
    model::Model,
    op::{Cast, Op},
};

/// Removes `Cast` nodes whose target type equals the element type of their
/// input, such as the `.to(x.dtype)` casts emitted by some exporters.
pub fn eliminate_redundant_cast(model: &mut Model) -> usize {
    let start = Instant::now();
    let types = model.infer_elem_types();
    let mut count = 0;

    for node_id in model.topo_sort_nodes() {
        let node = &model.graph.nodes[node_id];
        let Op::Cast(Cast { to }) = node.op else {
            continue;
        };
        if node.inputs.len() != 1 || node.outputs.len() != 1 {
            continue;
        }

        let id_in = node.inputs[0];
        let id_out = node.outputs[0];
        if types.get(&id_in) != Some(&to) || model.graph.is_output(id_out) {
            continue;
        }

        model.graph.nodes[node_id].deleted = true;
        model.replace_value(id_out, id_in);
        count += 1;
    }

    model.remove_unnecessary_nodes();

    log::info!("eliminate_redundant_cast({count}): {:?}", start.elapsed());

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimize::testing::{op_types, ModelBuilder},
        tensor::TensorElemType,
    };

    fn cast(to: TensorElemType) -> Op {
        Op::Cast(Cast { to })
    }

    #[test]
    fn remove_same_type_cast() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let e = b.unary(Op::Erf, x);
        let c = b.unary(cast(TensorElemType::F32), e);
        let y = b.unary(Op::Tanh, c);
        b.output(y);
        let mut model = b.build();

        assert_eq!(eliminate_redundant_cast(&mut model), 1);
        assert_eq!(op_types(&model), vec!["Erf", "Tanh"]);
    }

    #[test]
    fn keep_converting_cast() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let c = b.unary(cast(TensorElemType::I64), x);
        let d = b.unary(cast(TensorElemType::I64), c);
        let y = b.unary(Op::Identity, d);
        b.output(y);
        let mut model = b.build();

        // The first cast converts, the second one is a no-op.
        assert_eq!(eliminate_redundant_cast(&mut model), 1);
        assert_eq!(op_types(&model), vec!["Cast", "Identity"]);
    }
}

use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::model::Model;

/// Removes nodes and initializers that do not contribute to any graph output.
pub fn eliminate_dead_nodes(model: &mut Model) -> usize {
    let start = Instant::now();
    let parents = model.get_value_parents();

    let mut live_values = FxHashSet::default();
    let mut live_nodes = FxHashSet::default();
    let mut worklist = model.graph.outputs.clone();

    while let Some(value) = worklist.pop() {
        if !live_values.insert(value) {
            continue;
        }
        let Some(&node_id) = parents.get(&value) else {
            continue;
        };
        if live_nodes.insert(node_id) {
            worklist.extend(model.graph.nodes[node_id].inputs.iter().copied());
        }
    }

    let mut count = 0;
    for (id, node) in model.graph.nodes.iter_mut() {
        if !node.deleted && !live_nodes.contains(&id) {
            node.deleted = true;
            count += 1;
        }
    }
    model.graph.inits.retain(|id, _| live_values.contains(id));

    model.remove_unnecessary_nodes();

    log::info!("eliminate_dead_nodes({count}): {:?}", start.elapsed());

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        op::Op,
        optimize::testing::{op_types, ModelBuilder},
    };

    #[test]
    fn remove_unreachable_nodes() {
        let mut b = ModelBuilder::new(17);
        let x = b.input("input");
        let unused = b.init(2.0);
        let half = b.init(0.5);
        let dead = b.binary(Op::Mul, x, unused);
        let _ = b.unary(Op::Tanh, dead);
        let y = b.binary(Op::Mul, x, half);
        b.output(y);
        let mut model = b.build();

        assert_eq!(eliminate_dead_nodes(&mut model), 2);
        assert_eq!(op_types(&model), vec!["Mul"]);
        assert!(model.graph.inits.contains_key(&half));
        assert!(!model.graph.inits.contains_key(&unused));
    }
}

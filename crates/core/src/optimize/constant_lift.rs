use std::time::Instant;

use crate::{
    model::Model,
    op::{Constant, Op},
};

/// Turns `Constant` nodes into initializers so that later passes see scalars
/// the same way whichever exporter produced the graph.
pub fn lift_constants(model: &mut Model) -> usize {
    let start = Instant::now();
    let mut count = 0;

    for (_, node) in model.graph.nodes.iter_mut() {
        if node.deleted || node.outputs.len() != 1 {
            continue;
        }
        let Op::Constant(Constant { value }) = &node.op else {
            continue;
        };
        model.graph.inits.insert(node.outputs[0], value.clone());
        node.deleted = true;
        count += 1;
    }

    model.remove_unnecessary_nodes();

    log::info!("lift_constants({count}): {:?}", start.elapsed());

    count
}

pub mod cast_elim;
pub mod constant_lift;
pub mod dead_node_elim;
pub mod fast_gelu_fusion;
pub mod gelu_fusion;
pub mod identity_elim;
pub(crate) mod pattern;
pub mod quick_gelu_fusion;
#[cfg(test)]
pub(crate) mod testing;

use rustc_hash::FxHashSet;

use crate::{
    model::Model,
    node::{Node, NodeId},
    op::Op,
    value::ValueId,
};

use self::pattern::Matcher;

/// A matched subgraph computing `output` from `input`, to be replaced by a
/// single `op` node.
pub(crate) struct Fusion {
    pub op: Op,
    pub input: ValueId,
    pub output: ValueId,
    pub nodes: Vec<NodeId>,
}

/// Tries `extract` on every node in topological order. Matches that overlap an
/// earlier match are dropped.
pub(crate) fn find_fusions(
    model: &Model,
    extract: impl Fn(&Matcher, NodeId) -> Option<Fusion>,
) -> Vec<Fusion> {
    let matcher = Matcher::new(model);
    let mut claimed = FxHashSet::default();
    let mut fusions = vec![];

    for node_id in model.topo_sort_nodes() {
        if claimed.contains(&node_id) {
            continue;
        }
        let Some(fusion) = extract(&matcher, node_id) else {
            continue;
        };
        if fusion.nodes.iter().any(|n| claimed.contains(n)) {
            continue;
        }

        #[cfg(debug_assertions)]
        log::debug!(
            "{} detected: {}",
            fusion.op.name(),
            fusion
                .nodes
                .iter()
                .map(|&id| model.graph.nodes[id].display_name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        claimed.extend(fusion.nodes.iter().copied());
        fusions.push(fusion);
    }

    fusions
}

/// Replaces every matched subgraph with its fused node. The fused node takes
/// over the output value of the subgraph, so users need no rewiring.
pub(crate) fn apply_fusions(model: &mut Model, fusions: Vec<Fusion>) -> usize {
    let count = fusions.len();

    for (i, fusion) in fusions.into_iter().enumerate() {
        for node in fusion.nodes {
            model.graph.nodes[node].deleted = true;
        }
        let name = format!("{}_fused_{i}", fusion.op.name());
        model.graph.add_node(
            Node::new(fusion.op)
                .with_name(name)
                .with_in(fusion.input)
                .with_out(fusion.output),
        );
    }

    model.remove_unnecessary_nodes();

    count
}

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    graph::Graph,
    node::{NodeArena, NodeId},
    op::{Cast, Constant, Op},
    tensor::TensorElemType,
    value::ValueId,
};

#[derive(Debug, Default, Clone)]
pub struct Model {
    pub graph: Graph,
    pub opset_version: i64,
}

impl Model {
    pub fn get_value_users(&self) -> FxHashMap<ValueId, FxHashSet<NodeId>> {
        let mut value_users: FxHashMap<ValueId, FxHashSet<NodeId>> = FxHashMap::default();

        for (node_id, node) in self.graph.live_nodes() {
            for &input in node.inputs.iter() {
                value_users.entry(input).or_default().insert(node_id);
            }
        }

        value_users
    }

    pub fn get_value_parents(&self) -> FxHashMap<ValueId, NodeId> {
        let mut value_parents = FxHashMap::default();

        for (node_id, node) in self.graph.live_nodes() {
            for &output in node.outputs.iter() {
                value_parents.insert(output, node_id);
            }
        }

        value_parents
    }

    /// Returns live nodes in topological order. Ties are broken by arena order
    /// so that the result is stable.
    pub fn topo_sort_nodes(&self) -> Vec<NodeId> {
        let value_users = self.get_value_users();
        let value_parents = self.get_value_parents();

        let mut nodes = vec![];
        let mut num_node_inputs = FxHashMap::default();
        let mut que = VecDeque::new();

        for (id, node) in self.graph.live_nodes() {
            let inputs = node
                .inputs
                .iter()
                .filter(|i| value_parents.contains_key(i))
                .collect::<FxHashSet<_>>();
            num_node_inputs.insert(id, inputs.len());
            if inputs.is_empty() {
                que.push_back(id);
            }
        }

        while let Some(id) = que.pop_front() {
            nodes.push(id);
            for output in self.graph.nodes[id].outputs.iter() {
                let Some(users) = value_users.get(output) else {
                    continue;
                };
                let mut users = users.iter().copied().collect::<Vec<_>>();
                users.sort_by_key(|n| n.index());
                for n in users {
                    let Some(count) = num_node_inputs.get_mut(&n) else {
                        continue;
                    };
                    *count -= 1;
                    if *count == 0 {
                        que.push_back(n);
                    }
                }
            }
        }

        let num_live = self.graph.live_nodes().count();
        if nodes.len() < num_live {
            log::warn!(
                "topo_sort_nodes: {} of {num_live} nodes are on a cycle and were skipped",
                num_live - nodes.len()
            );
        }

        nodes
    }

    /// True if every live node can be ordered, i.e. the graph has no cycle.
    pub fn is_acyclic(&self) -> bool {
        self.topo_sort_nodes().len() == self.graph.live_nodes().count()
    }

    /// Drops nodes marked as deleted. Node ids obtained before this call are
    /// invalidated.
    pub fn remove_unnecessary_nodes(&mut self) {
        let old = std::mem::take(&mut self.graph.nodes);
        let mut nodes = NodeArena::new();
        for (_, node) in old.into_iter().filter(|(_, node)| !node.deleted) {
            nodes.alloc(node);
        }
        self.graph.nodes = nodes;
    }

    /// Makes every user of `from` (including the graph outputs) read `to` instead.
    pub fn replace_value(&mut self, from: ValueId, to: ValueId) {
        for (_, node) in self.graph.nodes.iter_mut() {
            if node.deleted {
                continue;
            }
            for input in &mut node.inputs {
                if *input == from {
                    *input = to;
                }
            }
        }
        for output in &mut self.graph.outputs {
            if *output == from {
                *output = to;
            }
        }
    }

    /// Live nodes whose op type equals `op_type`, in topological order.
    pub fn get_nodes_by_op_type(&self, op_type: &str) -> Vec<NodeId> {
        self.topo_sort_nodes()
            .into_iter()
            .filter(|&id| self.graph.nodes[id].op.name() == op_type)
            .collect()
    }

    /// Element types of every value that can be determined from graph inputs
    /// and initializers. All ops modelled here keep the element type of their
    /// first input, except `Cast` and `Constant`.
    pub fn infer_elem_types(&self) -> FxHashMap<ValueId, TensorElemType> {
        let mut types = FxHashMap::default();

        for &input in &self.graph.inputs {
            if let Some(shape) = &self.graph.values[input].shape {
                types.insert(input, shape.elem_ty);
            }
        }
        for (&id, tensor) in &self.graph.inits {
            types.insert(id, tensor.elem_ty());
        }

        for node_id in self.topo_sort_nodes() {
            let node = &self.graph.nodes[node_id];
            let ty = match &node.op {
                Op::Cast(Cast { to }) => Some(*to),
                Op::Constant(Constant { value }) => Some(value.elem_ty()),
                _ => node.inputs.first().and_then(|i| types.get(i).copied()),
            };
            if let Some(ty) = ty {
                for &output in &node.outputs {
                    types.insert(output, ty);
                }
            }
        }

        types
    }
}

#[cfg(test)]
fn chain_model() -> (Model, Vec<NodeId>, ValueId) {
    use crate::{node::Node, tensor::TypedFixedShape};

    let mut m = Model {
        opset_version: 17,
        ..Default::default()
    };
    let x = m.graph.values.new_val_named_and_shaped(
        "x",
        TypedFixedShape::new(vec![3].into(), TensorElemType::F32),
    );
    let a = m.graph.values.new_val();
    let b = m.graph.values.new_val();
    let c = m.graph.values.new_val();
    // Allocated out of order on purpose.
    let tanh = m
        .graph
        .add_node(Node::new(Op::Tanh).with_in(b).with_out(c));
    let mul = m
        .graph
        .add_node(Node::new(Op::Mul).with_ins(vec![x, x]).with_out(a));
    let cast = m.graph.add_node(
        Node::new(Op::Cast(Cast {
            to: TensorElemType::F32,
        }))
        .with_in(a)
        .with_out(b),
    );
    m.graph.inputs.push(x);
    m.graph.outputs.push(c);
    (m, vec![mul, cast, tanh], x)
}

#[test]
fn topo_sort() {
    let (m, expected, _) = chain_model();
    assert_eq!(m.topo_sort_nodes(), expected);
}

#[test]
fn nodes_by_op_type() {
    let (m, nodes, _) = chain_model();
    assert_eq!(m.get_nodes_by_op_type("Mul"), vec![nodes[0]]);
    assert!(m.get_nodes_by_op_type("Gelu").is_empty());
}

#[test]
fn remove_deleted_nodes() {
    let (mut m, nodes, x) = chain_model();
    let cast_out = m.graph.nodes[nodes[1]].outputs[0];
    let cast_in = m.graph.nodes[nodes[1]].inputs[0];
    m.graph.nodes[nodes[1]].deleted = true;
    m.replace_value(cast_out, cast_in);
    m.remove_unnecessary_nodes();

    let ops = m
        .topo_sort_nodes()
        .into_iter()
        .map(|id| m.graph.nodes[id].op.name())
        .collect::<Vec<_>>();
    assert_eq!(ops, vec!["Mul", "Tanh"]);
    assert_eq!(m.get_value_users()[&x].len(), 1);
}

#[test]
fn cycle_is_skipped() {
    use crate::node::Node;

    let (mut m, nodes, _) = chain_model();
    assert!(m.is_acyclic());

    let (p, q) = (m.graph.values.new_val(), m.graph.values.new_val());
    m.graph.add_node(Node::new(Op::Tanh).with_in(p).with_out(q));
    m.graph.add_node(Node::new(Op::Sigmoid).with_in(q).with_out(p));
    assert_eq!(m.topo_sort_nodes(), nodes);
    assert!(!m.is_acyclic());
}

#[test]
fn elem_types() {
    let (m, nodes, x) = chain_model();
    let types = m.infer_elem_types();
    assert_eq!(types[&x], TensorElemType::F32);
    assert_eq!(
        types[&m.graph.nodes[nodes[2]].outputs[0]],
        TensorElemType::F32
    );
}

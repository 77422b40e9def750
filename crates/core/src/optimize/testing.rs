//! Small graph builder for optimizer tests.

use crate::{
    model::Model,
    node::Node,
    op::{Constant, Op},
    tensor::{Tensor, TensorElemType, TypedFixedShape},
    value::ValueId,
};

pub(crate) struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn new(opset_version: i64) -> Self {
        Self {
            model: Model {
                opset_version,
                ..Default::default()
            },
        }
    }

    /// Adds a graph input of type `f32[3]`.
    pub fn input(&mut self, name: &str) -> ValueId {
        let x = self.model.graph.values.new_val_named_and_shaped(
            name,
            TypedFixedShape::new(vec![3].into(), TensorElemType::F32),
        );
        self.model.graph.inputs.push(x);
        x
    }

    pub fn init(&mut self, c: f32) -> ValueId {
        let id = self.model.graph.values.new_val();
        self.model.graph.inits.insert(id, Tensor::scalar(c));
        id
    }

    pub fn constant(&mut self, c: f32) -> ValueId {
        let id = self.model.graph.values.new_val();
        self.model.graph.add_node(
            Node::new(Op::Constant(Constant {
                value: Tensor::scalar(c),
            }))
            .with_out(id),
        );
        id
    }

    pub fn unary(&mut self, op: Op, a: ValueId) -> ValueId {
        let out = self.model.graph.values.new_val();
        self.model
            .graph
            .add_node(Node::new(op).with_in(a).with_out(out));
        out
    }

    pub fn binary(&mut self, op: Op, a: ValueId, b: ValueId) -> ValueId {
        let out = self.model.graph.values.new_val();
        self.model
            .graph
            .add_node(Node::new(op).with_ins(vec![a, b]).with_out(out));
        out
    }

    pub fn output(&mut self, id: ValueId) {
        self.model.graph.outputs.push(id);
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn build(self) -> Model {
        self.model
    }
}

/// Op types of the live nodes in topological order.
pub(crate) fn op_types(model: &Model) -> Vec<&'static str> {
    model
        .topo_sort_nodes()
        .into_iter()
        .map(|id| model.graph.nodes[id].op.name())
        .collect()
}

//! Helpers to match arithmetic subgraphs regardless of how an exporter
//! associated or ordered their operands.
//!
//! A chain of `Mul`s (and `Div`s by constants) is flattened into a
//! [`Product`]: a constant coefficient times a list of non-constant factors.
//! Likewise, a chain of `Add`s (and `Sub`s of constants) is flattened into a
//! [`Sum`]. Only values with a single user are looked through, so everything
//! recorded in `nodes` can be removed once the whole pattern matches.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    model::Model,
    node::NodeId,
    op::{Constant, Op},
    value::ValueId,
};

pub(crate) struct Matcher<'a> {
    model: &'a Model,
    users: FxHashMap<ValueId, FxHashSet<NodeId>>,
    parents: FxHashMap<ValueId, NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Product {
    pub coef: f32,
    pub factors: Vec<ValueId>,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sum {
    pub constant: f32,
    pub terms: Vec<ValueId>,
    pub nodes: Vec<NodeId>,
}

/// Relative tolerance used when comparing pattern constants. `1.41421` must
/// still be recognized as `sqrt(2)`.
pub(crate) const TOLERANCE: f32 = 1e-4;

pub(crate) fn approx_eq(x: f32, expected: f32) -> bool {
    (x - expected).abs() <= TOLERANCE * expected.abs().max(1.0)
}

impl<'a> Matcher<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self {
            model,
            users: model.get_value_users(),
            parents: model.get_value_parents(),
        }
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    /// The scalar held by an `f32` initializer or `Constant` node output.
    pub fn scalar(&self, id: ValueId) -> Option<f32> {
        if let Some(tensor) = self.model.graph.inits.get(&id) {
            return tensor.scalar_f32();
        }
        let parent = &self.model.graph.nodes[*self.parents.get(&id)?];
        match &parent.op {
            Op::Constant(Constant { value }) => value.scalar_f32(),
            _ => None,
        }
    }

    /// True if `id` is consumed by exactly one node and is not a graph output.
    pub fn is_internal(&self, id: ValueId) -> bool {
        self.users.get(&id).map_or(false, |users| users.len() == 1)
            && !self.model.graph.is_output(id)
    }

    /// The node producing `id` if it is of kind `op`, along with its first input.
    /// `id` must be internal.
    pub fn unary(&self, id: ValueId, op: &Op) -> Option<(NodeId, ValueId)> {
        if !self.is_internal(id) {
            return None;
        }
        let node_id = *self.parents.get(&id)?;
        let node = &self.model.graph.nodes[node_id];
        (node.op == *op && node.inputs.len() == 1).then(|| (node_id, node.inputs[0]))
    }

    /// Flattens the product rooted at `id`. The root may have many users when
    /// `root` is set, everything below it must be internal.
    pub fn product(&self, id: ValueId, root: bool) -> Product {
        let mut product = Product {
            coef: 1.0,
            factors: vec![],
            nodes: vec![],
        };
        self.collect_product(id, root, &mut product);
        product
    }

    fn collect_product(&self, id: ValueId, root: bool, out: &mut Product) {
        if let Some(c) = self.scalar(id) {
            out.coef *= c;
            return;
        }

        if root || self.is_internal(id) {
            if let Some(&node_id) = self.parents.get(&id) {
                let node = &self.model.graph.nodes[node_id];
                match node.op {
                    Op::Mul if node.inputs.len() == 2 => {
                        out.nodes.push(node_id);
                        self.collect_product(node.inputs[0], false, out);
                        self.collect_product(node.inputs[1], false, out);
                        return;
                    }
                    Op::Div if node.inputs.len() == 2 => {
                        if let Some(c) = self.scalar(node.inputs[1]).filter(|&c| c != 0.0) {
                            out.nodes.push(node_id);
                            out.coef /= c;
                            self.collect_product(node.inputs[0], false, out);
                            return;
                        }
                    }
                    Op::Pow if node.inputs.len() == 2 => {
                        let exp = self
                            .scalar(node.inputs[1])
                            .filter(|e| e.fract() == 0.0 && (1.0..=4.0).contains(e));
                        if let Some(exp) = exp {
                            out.nodes.push(node_id);
                            for _ in 0..exp as usize {
                                out.factors.push(node.inputs[0]);
                            }
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }

        out.factors.push(id)
    }

    /// Flattens the sum producing `id`. Returns `None` unless `id` is an
    /// internal value computed by `Add` or `Sub`.
    pub fn sum(&self, id: ValueId) -> Option<Sum> {
        if !self.is_internal(id) {
            return None;
        }
        let node = &self.model.graph.nodes[*self.parents.get(&id)?];
        if !matches!(node.op, Op::Add | Op::Sub) {
            return None;
        }

        let mut sum = Sum {
            constant: 0.0,
            terms: vec![],
            nodes: vec![],
        };
        self.collect_sum(id, true, &mut sum);
        Some(sum)
    }

    fn collect_sum(&self, id: ValueId, top: bool, out: &mut Sum) {
        if let Some(c) = self.scalar(id) {
            out.constant += c;
            return;
        }

        if top || self.is_internal(id) {
            if let Some(&node_id) = self.parents.get(&id) {
                let node = &self.model.graph.nodes[node_id];
                match node.op {
                    Op::Add if node.inputs.len() == 2 => {
                        out.nodes.push(node_id);
                        self.collect_sum(node.inputs[0], false, out);
                        self.collect_sum(node.inputs[1], false, out);
                        return;
                    }
                    Op::Sub if node.inputs.len() == 2 => {
                        if let Some(c) = self.scalar(node.inputs[1]) {
                            out.nodes.push(node_id);
                            out.constant -= c;
                            self.collect_sum(node.inputs[0], false, out);
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }

        out.terms.push(id)
    }
}

/// Splits a two-factor product into `(x, other)` pairs, trying both orders.
pub(crate) fn pairs(factors: &[ValueId]) -> Vec<(ValueId, ValueId)> {
    match factors {
        &[a, b] => vec![(a, b), (b, a)],
        _ => vec![],
    }
}

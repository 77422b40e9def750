use std::path::Path;

use kasane_core::{
    model::Model,
    node::NodeId,
    optimizer::{optimize_model, OptimizeError, OptimizedModel},
};

/// Anything that can list its nodes of a given op type.
pub trait NodeQuery {
    fn nodes_of_type(&self, op_type: &str) -> Vec<NodeId>;

    fn count_of_type(&self, op_type: &str) -> usize {
        self.nodes_of_type(op_type).len()
    }
}

/// Loads an exported artifact and rewrites it for a model family.
pub trait GraphOptimizer {
    type Graph: NodeQuery;

    fn optimize(&self, path: &Path, model_type: &str) -> Result<Self::Graph, OptimizeError>;
}

/// The fusion optimizer shipped with `kasane-core`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KasaneOptimizer;

impl GraphOptimizer for KasaneOptimizer {
    type Graph = OptimizedModel;

    fn optimize(&self, path: &Path, model_type: &str) -> Result<Self::Graph, OptimizeError> {
        optimize_model(path, model_type)
    }
}

impl NodeQuery for OptimizedModel {
    fn nodes_of_type(&self, op_type: &str) -> Vec<NodeId> {
        self.get_nodes_by_op_type(op_type)
    }
}

impl NodeQuery for Model {
    fn nodes_of_type(&self, op_type: &str) -> Vec<NodeId> {
        self.get_nodes_by_op_type(op_type)
    }
}

use thiserror::Error;

use crate::optimizer::NodeQuery;

/// One row of the node-count diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpCount {
    pub op_type: String,
    pub actual: usize,
    pub expected: usize,
}

/// The first op type whose count differed, along with the counts of every op
/// type that was checked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{test_name}: expected {expected} {op_type} node(s), found {actual}\n{}", render(.counts))]
pub struct NodeCountMismatch {
    pub test_name: String,
    pub op_type: String,
    pub actual: usize,
    pub expected: usize,
    pub counts: Vec<OpCount>,
}

impl NodeCountMismatch {
    pub fn table(&self) -> String {
        render(&self.counts)
    }
}

fn render(counts: &[OpCount]) -> String {
    counts
        .iter()
        .map(|c| format!("{}: {} expected={}", c.op_type, c.actual, c.expected))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Checks that `graph` has exactly `count` nodes of each `(op_type, count)`.
/// On the first mismatch the counts of every expected op type are logged and
/// returned in the error.
pub fn verify_node_count<G: NodeQuery + ?Sized>(
    graph: &G,
    expected: &[(&str, usize)],
    test_name: &str,
) -> Result<(), NodeCountMismatch> {
    let counts = expected
        .iter()
        .map(|&(op_type, expected)| OpCount {
            op_type: op_type.to_string(),
            actual: graph.count_of_type(op_type),
            expected,
        })
        .collect::<Vec<_>>();

    let Some(first) = counts.iter().position(|c| c.actual != c.expected) else {
        return Ok(());
    };

    log::error!("Counters is not expected in test: {test_name}");
    for c in &counts {
        log::error!("{}: {} expected={}", c.op_type, c.actual, c.expected);
    }

    let OpCount {
        op_type,
        actual,
        expected,
    } = counts[first].clone();
    Err(NodeCountMismatch {
        test_name: test_name.to_string(),
        op_type,
        actual,
        expected,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasane_core::node::NodeId;
    use rustc_hash::FxHashMap;

    /// Reports how many nodes of each op type exist without a real graph.
    struct Counts(FxHashMap<&'static str, usize>);

    impl NodeQuery for Counts {
        fn nodes_of_type(&self, _: &str) -> Vec<NodeId> {
            unreachable!()
        }

        fn count_of_type(&self, op_type: &str) -> usize {
            self.0.get(op_type).copied().unwrap_or(0)
        }
    }

    fn counts(pairs: &[(&'static str, usize)]) -> Counts {
        Counts(pairs.iter().copied().collect())
    }

    #[test]
    fn matching_counts() {
        let graph = counts(&[("Gelu", 1), ("Mul", 3)]);
        assert_eq!(
            verify_node_count(&graph, &[("Gelu", 1), ("Erf", 0)], "Gelu_huggingface"),
            Ok(())
        );
    }

    #[test]
    fn mismatch_lists_every_op_type() {
        let graph = counts(&[("Erf", 1), ("Tanh", 1)]);
        let err = verify_node_count(
            &graph,
            &[("Gelu", 1), ("Erf", 0), ("Tanh", 1)],
            "Gelu_megatron",
        )
        .unwrap_err();

        assert_eq!(err.op_type, "Gelu");
        assert_eq!((err.actual, err.expected), (0, 1));
        insta::assert_snapshot!(err.to_string(), @r###"
        Gelu_megatron: expected 1 Gelu node(s), found 0
        Gelu: 0 expected=1
        Erf: 1 expected=0
        Tanh: 1 expected=1
        "###);
    }

    #[test]
    fn first_mismatch_wins() {
        let graph = counts(&[("FastGelu", 2)]);
        let err = verify_node_count(&graph, &[("Gelu", 0), ("FastGelu", 1), ("QuickGelu", 1)], "t")
            .unwrap_err();
        assert_eq!(err.op_type, "FastGelu");
        assert_eq!(err.counts.len(), 3);
        assert_eq!(err.table().lines().count(), 3);
    }
}

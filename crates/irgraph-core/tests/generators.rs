//! Shared fixtures for graph integration tests.

#![allow(dead_code)]

use irgraph_core::prelude::*;
use proptest::prelude::*;

/// A built graph plus its nodes in creation order. Node `i` only reads
/// outputs of nodes `< i`, so creation order is a topological order.
pub struct Layered {
    pub graph: Graph,
    pub nodes: Vec<NodePtr>,
}

/// Shape of a random DAG: for every node, the indices of the earlier nodes
/// it reads from.
#[derive(Debug, Clone)]
pub struct DagShape {
    pub inputs: Vec<Vec<usize>>,
}

impl DagShape {
    pub fn build(&self) -> Layered {
        let outputs: Vec<TensorPtr> = (0..self.inputs.len())
            .map(|i| Tensor::new(format!("out{i}")))
            .collect();
        let mut graph = Graph::new();
        let mut nodes = Vec::with_capacity(self.inputs.len());
        for (i, reads) in self.inputs.iter().enumerate() {
            let source = Tensor::new(format!("in{i}"));
            let mut builder = Node::builder(format!("n{i}"), "op").input(&source);
            for &r in reads {
                builder = builder.input(&outputs[r]);
            }
            let node = builder.output(&outputs[i]).build();
            graph.add_node(&node).expect("generated node is valid");
            nodes.push(node);
        }
        Layered { graph, nodes }
    }

    /// Brute-force path count over the shape itself, counting each distinct
    /// producer once per consumer.
    pub fn paths(&self, from: usize, to: usize) -> u64 {
        if from == to {
            return 1;
        }
        if from > to {
            return 0;
        }
        let mut counts = vec![0_u64; self.inputs.len()];
        counts[from] = 1;
        for i in from + 1..=to {
            let mut producers = self.inputs[i].clone();
            producers.sort_unstable();
            producers.dedup();
            counts[i] = producers.iter().map(|&p| counts[p]).sum();
        }
        counts[to]
    }
}

pub fn arb_dag(max_nodes: usize) -> impl Strategy<Value = DagShape> {
    (1..=max_nodes)
        .prop_flat_map(|n| {
            (0..n)
                .map(|i| {
                    if i == 0 {
                        Just(Vec::new()).boxed()
                    } else {
                        prop::collection::vec(0..i, 0..=3).boxed()
                    }
                })
                .collect::<Vec<_>>()
        })
        .prop_map(|inputs| DagShape { inputs })
}

/// `a → b → d`, `a → c → d`, `d → e`.
pub fn diamond() -> Layered {
    let t: Vec<_> = (0..6).map(|i| Tensor::new(format!("t{i}"))).collect();
    let nodes = vec![
        Node::compute("a", "src", &[&t[0]], &[&t[1]]),
        Node::compute("b", "relu", &[&t[1]], &[&t[2]]),
        Node::compute("c", "neg", &[&t[1]], &[&t[3]]),
        Node::compute("d", "add", &[&t[2], &t[3]], &[&t[4]]),
        Node::compute("e", "relu", &[&t[4]], &[&t[5]]),
    ];
    let mut graph = Graph::new();
    for n in &nodes {
        graph.add_node(n).expect("add");
    }
    Layered { graph, nodes }
}

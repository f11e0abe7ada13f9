//! Brute-force invariant checks run against the engine after a simulation.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use irgraph_core::prelude::*;

use crate::rng::DeterministicRng;

// ── Core result types ─────────────────────────────────────────────────────────

/// Outcome of one oracle pass over a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// A disagreement between the engine and the brute-force model. Nodes and
/// tensors are named, not id'd, so reports are stable across replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A token entry is missing, or survived the graph that owned it.
    Membership { object: String, detail: String },
    /// The engine's recorded producer differs from the node writing the
    /// tensor.
    Producer {
        tensor: String,
        expected: String,
        recorded: Option<String>,
    },
    /// A node reading a tensor is missing from its consumer list, or the
    /// consumer count is off.
    Consumer {
        tensor: String,
        expected: usize,
        recorded: usize,
    },
    /// A producer is ordered after one of its consumers.
    TopologicalOrder { producer: String, consumer: String },
    /// `is_ancestor` disagrees with brute-force reachability, or holds in
    /// both directions between distinct nodes.
    Ancestry {
        source: String,
        target: String,
        engine: bool,
        model: bool,
    },
    /// `are_connected` or `number_of_paths` disagrees with reachability.
    Connectivity {
        source: String,
        target: String,
        paths: u64,
        connected: bool,
        model: bool,
        from_matrix: bool,
    },
    /// An arc without an index entry, or an unexpected cycle.
    Structure { detail: String },
    /// A copy of the graph is not isomorphic to it.
    CloneIsomorphism { nodes: usize },
    /// The engine rejected a rewrite that was valid by construction.
    EngineError { step: usize, error: String },
}

// ── Brute-force model ─────────────────────────────────────────────────────────

/// Adjacency rebuilt from the nodes' own port lists, independent of the
/// engine's producer/consumer records.
struct Model {
    nodes: Vec<NodePtr>,
    index: HashMap<NodeId, usize>,
    successors: Vec<BTreeSet<usize>>,
}

impl Model {
    fn of(graph: &Graph) -> Self {
        let nodes = graph.nodes();
        let index: HashMap<NodeId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.id(), i)).collect();
        let mut writer = HashMap::new();
        for (i, n) in nodes.iter().enumerate() {
            for t in n.output_tensors(TensorType::All) {
                writer.insert(t.id(), i);
            }
        }
        let mut successors = vec![BTreeSet::new(); nodes.len()];
        for (j, n) in nodes.iter().enumerate() {
            for t in n.input_tensors(TensorType::All) {
                if let Some(&i) = writer.get(&t.id()) {
                    successors[i].insert(j);
                }
            }
        }
        Self {
            nodes,
            index,
            successors,
        }
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([from]);
        seen[from] = true;
        while let Some(v) = queue.pop_front() {
            if v == to {
                return true;
            }
            for &w in &self.successors[v] {
                if !seen[w] {
                    seen[w] = true;
                    queue.push_back(w);
                }
            }
        }
        false
    }
}

fn name(node: &NodePtr) -> String {
    node.name().to_string()
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Check `graph` against a brute-force model, sampling `samples` node pairs
/// for the order-dependent queries.
#[must_use]
pub fn check_graph(graph: &Graph, rng: &mut DeterministicRng, samples: usize) -> OracleResult {
    let model = Model::of(graph);
    let mut violations = Vec::new();

    check_records(graph, &model, &mut violations);
    check_structure(graph, &model, &mut violations);

    let pairs: Vec<(usize, usize)> = (0..samples)
        .map(|_| {
            (
                rng.next_below(model.nodes.len()),
                rng.next_below(model.nodes.len()),
            )
        })
        .collect();
    if !model.nodes.is_empty() {
        check_reachability(graph, &model, &pairs, false, &mut violations);
        graph.build_connectivity_map(TensorType::All);
        check_reachability(graph, &model, &pairs, true, &mut violations);
    }

    if !graph.clone().isomorphic_to(graph) {
        violations.push(InvariantViolation::CloneIsomorphism {
            nodes: graph.num_nodes(),
        });
    }

    OracleResult::from_violations(violations)
}

fn check_records(graph: &Graph, model: &Model, violations: &mut Vec<InvariantViolation>) {
    let mut readers: BTreeMap<TensorId, (TensorPtr, BTreeSet<usize>)> = BTreeMap::new();

    for (i, node) in model.nodes.iter().enumerate() {
        if !node.graph_ids().contains(&graph.id()) || !graph.contains_node(node) {
            violations.push(InvariantViolation::Membership {
                object: name(node),
                detail: "member node without a token entry".to_string(),
            });
        }
        for t in node.output_tensors(TensorType::All) {
            let recorded = graph.tensor_producer(&t);
            if !recorded.as_ref().is_some_and(|p| p.id() == node.id()) {
                violations.push(InvariantViolation::Producer {
                    tensor: t.name(),
                    expected: name(node),
                    recorded: recorded.as_ref().map(name),
                });
            }
        }
        for t in node.input_tensors(TensorType::All) {
            readers
                .entry(t.id())
                .or_insert_with(|| (t.clone(), BTreeSet::new()))
                .1
                .insert(i);
        }
    }

    for (tensor, expected) in readers.values() {
        let recorded = graph.tensor_consumers(tensor);
        let all_present = recorded.len() == expected.len()
            && recorded
                .iter()
                .all(|c| model.index.get(&c.id()).is_some_and(|i| expected.contains(i)));
        if !all_present || graph.number_of_tensor_consumers(tensor) != expected.len() {
            violations.push(InvariantViolation::Consumer {
                tensor: tensor.name(),
                expected: expected.len(),
                recorded: recorded.len(),
            });
        }
    }

    for t in graph.tensors() {
        if !graph.contains_tensor(&t) {
            violations.push(InvariantViolation::Membership {
                object: t.name(),
                detail: "operand tensor without a token entry".to_string(),
            });
        }
    }
}

fn check_structure(graph: &Graph, model: &Model, violations: &mut Vec<InvariantViolation>) {
    if !graph.validate_connections() {
        violations.push(InvariantViolation::Structure {
            detail: "arc missing from the arc index".to_string(),
        });
    }
    if !graph.is_acyclic_graph() {
        violations.push(InvariantViolation::Structure {
            detail: format!("{} cycles", graph.find_cycles().len()),
        });
        return;
    }

    let order = graph.topo_sorted_nodes();
    if order.len() != model.nodes.len() {
        violations.push(InvariantViolation::Structure {
            detail: format!("order has {} of {} nodes", order.len(), model.nodes.len()),
        });
        return;
    }
    for (i, next) in model.successors.iter().enumerate() {
        let producer = &model.nodes[i];
        for &j in next {
            let consumer = &model.nodes[j];
            if order.position(producer.id()) >= order.position(consumer.id()) {
                violations.push(InvariantViolation::TopologicalOrder {
                    producer: name(producer),
                    consumer: name(consumer),
                });
            }
        }
    }
}

fn check_reachability(
    graph: &Graph,
    model: &Model,
    pairs: &[(usize, usize)],
    from_matrix: bool,
    violations: &mut Vec<InvariantViolation>,
) {
    for &(a, b) in pairs {
        let (source, target) = (&model.nodes[a], &model.nodes[b]);
        let expected = model.reaches(a, b);

        let forward = graph.is_ancestor(source, target);
        if forward != expected || (a != b && forward && graph.is_ancestor(target, source)) {
            violations.push(InvariantViolation::Ancestry {
                source: name(source),
                target: name(target),
                engine: forward,
                model: expected,
            });
        }

        let paths = graph
            .number_of_paths(source, target, TensorType::All)
            .unwrap_or(0);
        let connected = graph
            .are_connected(source, target, TensorType::All)
            .unwrap_or(false);
        if connected != expected || (paths > 0) != expected {
            violations.push(InvariantViolation::Connectivity {
                source: name(source),
                target: name(target),
                paths,
                connected,
                model: expected,
                from_matrix,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Graph, Vec<NodePtr>) {
        let t: Vec<_> = (0..4).map(|i| Tensor::new(format!("t{i}"))).collect();
        let nodes = vec![
            Node::compute("a", "op", &[&t[0]], &[&t[1]]),
            Node::compute("b", "op", &[&t[1]], &[&t[2]]),
            Node::compute("c", "op", &[&t[2]], &[&t[3]]),
        ];
        let mut g = Graph::new();
        for n in &nodes {
            g.add_node(n).expect("add");
        }
        (g, nodes)
    }

    #[test]
    fn sound_graph_passes() {
        let (g, _) = chain();
        let result = check_graph(&g, &mut DeterministicRng::new(1), 16);
        assert!(result.passed, "{:?}", result.violations);
    }

    #[test]
    fn empty_graph_passes() {
        let g = Graph::new();
        assert!(check_graph(&g, &mut DeterministicRng::new(1), 4).passed);
    }

    #[test]
    fn port_edit_behind_the_engine_is_caught() {
        let (g, nodes) = chain();
        // Rewire c straight onto a's output without telling the graph.
        let a_out = nodes[0].output(0).expect("output");
        nodes[2].replace_input(0, Some(a_out));
        let result = check_graph(&g, &mut DeterministicRng::new(1), 16);
        assert!(!result.passed);
        assert!(
            result
                .violations
                .iter()
                .any(|v| matches!(v, InvariantViolation::Consumer { .. }))
        );
    }

    #[test]
    fn cycle_is_reported_as_structure() {
        let x = Tensor::new("x");
        let y = Tensor::new("y");
        let mut g = Graph::new();
        g.add_node(&Node::compute("a", "op", &[&x], &[&y])).expect("add");
        g.add_node(&Node::compute("b", "op", &[&y], &[&x])).expect("add");
        let result = check_graph(&g, &mut DeterministicRng::new(1), 0);
        assert!(
            result
                .violations
                .iter()
                .any(|v| matches!(v, InvariantViolation::Structure { .. }))
        );
    }
}

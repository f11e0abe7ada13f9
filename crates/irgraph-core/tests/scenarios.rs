//! End-to-end scenarios over the public graph API: membership, rewiring on
//! removal, ancestry and path queries, pattern search and graph copies.

use std::rc::Rc;

use irgraph_core::prelude::*;

#[path = "generators.rs"]
mod generators;
use generators::diamond;

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[test]
fn contains_follows_add_and_remove() {
    let x = Tensor::new("x");
    let y = Tensor::new("y");
    let n = Node::compute("n", "relu", &[&x], &[&y]);
    let mut g = Graph::new();
    assert!(!g.contains_node(&n));

    g.add_node(&n).expect("add");
    assert!(g.contains_node(&n));
    assert!(g.contains_tensor(&x));
    assert!(g.contains_tensor(&y));
    assert_eq!(n.graph_ids(), vec![g.id()]);

    g.remove_node(&n, None).expect("remove");
    assert!(!g.contains_node(&n));
    assert!(!g.contains_tensor(&x));
    assert!(!g.contains_tensor(&y));
    assert!(n.graph_ids().is_empty());
    assert!(g.is_empty());
}

#[test]
fn one_node_in_two_graphs() {
    let x = Tensor::new("x");
    let y = Tensor::new("y");
    let n = Node::compute("shared", "relu", &[&x], &[&y]);
    let mut first = Graph::new();
    let mut second = Graph::new();
    first.add_node(&n).expect("add");
    second.add_node(&n).expect("add");
    assert_eq!(n.graph_ids(), vec![first.id(), second.id()]);

    first.remove_node(&n, None).expect("remove");
    assert!(!first.contains_node(&n));
    assert!(second.contains_node(&n));
    assert_eq!(second.tensor_producer(&y).as_ref().map(|p| p.id()), Some(n.id()));

    drop(second);
    assert!(n.graph_ids().is_empty());
    assert!(x.graph_ids().is_empty());
}

#[test]
fn double_add_is_rejected_without_change() {
    let n = Node::compute("n", "relu", &[&Tensor::new("x")], &[&Tensor::new("y")]);
    let mut g = Graph::new();
    g.add_node(&n).expect("add");
    let err = g.add_node(&n).expect_err("second add");
    assert_eq!(err.code(), ErrorCode::AlreadyMember);
    assert_eq!(g.num_nodes(), 1);
}

// ---------------------------------------------------------------------------
// Producer / consumer bookkeeping
// ---------------------------------------------------------------------------

#[test]
fn producer_and_consumers_are_recorded() {
    let x = Tensor::new("x");
    let t = Tensor::new("t");
    let p = Node::compute("p", "conv", &[&x], &[&t]);
    let c1 = Node::compute("c1", "add", &[&t, &t], &[&Tensor::new("o1")]);
    let c2 = Node::compute("c2", "relu", &[&t], &[&Tensor::new("o2")]);
    let mut g = Graph::new();
    for n in [&p, &c1, &c2] {
        g.add_node(n).expect("add");
    }

    assert!(same_node(g.tensor_producer(&t).as_ref(), Some(&p)));
    assert_eq!(g.number_of_tensor_producers(&t), 1);
    assert_eq!(g.number_of_tensor_consumers(&t), 2);
    assert!(g.tensor_single_consumer(&t).is_none());
    assert!(g.has_consumer(&p));
    assert!(!g.has_consumer(&c2));

    let consumers = g.node_consumers(&p, TensorType::All, true);
    assert!(consumers.contains(&c1) && consumers.contains(&c2));
    let producers = g.node_producers(&c1, TensorType::Data, true);
    assert_eq!(producers.len(), 1);
    assert!(producers.contains(&p));
}

#[test]
fn removal_hands_consumers_to_replacement() {
    let x = Tensor::new("x");
    let t1 = Tensor::new("t1");
    let t2 = Tensor::new("t2");
    let p = Node::compute("p", "conv", &[&x], &[&t1]);
    let p2 = Node::compute("p2", "fused_conv", &[&x], &[&t2]);
    let c1 = Node::compute("c1", "add", &[&t1, &t1], &[&Tensor::new("o1")]);
    let c2 = Node::compute("c2", "relu", &[&t1], &[&Tensor::new("o2")]);
    let mut g = Graph::new();
    for n in [&p, &c1, &c2] {
        g.add_node(n).expect("add");
    }
    // Warm the tensor set so the edits below have to keep it in sync.
    assert_eq!(g.tensors().len(), 4);
    g.add_node(&p2).expect("add");
    assert!(g.tensors().contains(&t2));

    g.remove_node(&p, Some(&p2)).expect("remove with replacement");

    assert!(!g.contains_node(&p));
    assert!(!g.contains_tensor(&t1));
    let names: Vec<String> = g.tensors().iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["x", "t2", "o1", "o2"]);
    assert_eq!(g.number_of_tensor_consumers(&t2), 2);
    for port in 0..2 {
        assert!(Rc::ptr_eq(&c1.input(port).expect("port"), &t2));
    }
    assert!(Rc::ptr_eq(&c2.input(0).expect("port"), &t2));
    assert!(g.is_ancestor(&p2, &c1));
    assert!(g.validate_connections());
}

#[test]
fn removal_with_mismatched_replacement_changes_nothing() {
    let x = Tensor::new("x");
    let t = Tensor::new("t");
    let p = Node::compute("p", "split", &[&x], &[&t, &Tensor::new("u")]);
    let q = Node::compute("q", "conv", &[&x], &[&Tensor::new("v")]);
    let c = Node::compute("c", "relu", &[&t], &[&Tensor::new("o")]);
    let mut g = Graph::new();
    for n in [&p, &q, &c] {
        g.add_node(n).expect("add");
    }

    let err = g.remove_node(&p, Some(&q)).expect_err("output counts differ");
    assert_eq!(err.code(), ErrorCode::OutputShapeMismatch);
    assert!(g.contains_node(&p));
    assert!(same_node(g.tensor_producer(&t).as_ref(), Some(&p)));
}

#[test]
fn removing_the_middle_of_a_chain_disconnects_it() {
    let t: Vec<_> = (0..4).map(|i| Tensor::new(format!("t{i}"))).collect();
    let a = Node::compute("a", "relu", &[&t[0]], &[&t[1]]);
    let b = Node::compute("b", "relu", &[&t[1]], &[&t[2]]);
    let c = Node::compute("c", "relu", &[&t[2]], &[&t[3]]);
    let mut g = Graph::new();
    for n in [&a, &b, &c] {
        g.add_node(n).expect("add");
    }
    assert_eq!(g.number_of_paths(&a, &c, TensorType::All), Ok(1));

    g.remove_node(&b, None).expect("remove");
    assert_eq!(g.number_of_paths(&a, &c, TensorType::All), Ok(0));
    assert_eq!(g.are_connected(&a, &c, TensorType::All), Ok(false));
    assert!(!g.is_ancestor(&a, &c));
}

// ---------------------------------------------------------------------------
// Order-dependent queries
// ---------------------------------------------------------------------------

#[test]
fn ancestry_is_reflexive_and_antisymmetric() {
    let d = diamond();
    for a in &d.nodes {
        assert!(d.graph.is_ancestor(a, a));
        for b in &d.nodes {
            if a.id() != b.id() {
                assert!(!(d.graph.is_ancestor(a, b) && d.graph.is_ancestor(b, a)));
            }
        }
    }
}

#[test]
fn path_counts_and_connectivity_agree() {
    let d = diamond();
    let g = &d.graph;
    for a in &d.nodes {
        assert_eq!(g.number_of_paths(a, a, TensorType::All), Ok(1));
    }
    assert_eq!(g.number_of_paths(&d.nodes[0], &d.nodes[4], TensorType::All), Ok(2));
    assert_eq!(g.number_of_paths(&d.nodes[4], &d.nodes[0], TensorType::All), Ok(0));

    let mut lazy = Vec::new();
    for a in &d.nodes {
        for b in &d.nodes {
            let paths = g.number_of_paths(a, b, TensorType::All).expect("members");
            let connected = g.are_connected(a, b, TensorType::All).expect("members");
            assert_eq!(connected, paths > 0);
            lazy.push(connected);
        }
    }

    g.build_connectivity_map(TensorType::All);
    assert_eq!(g.connectivity_map_type(), Some(TensorType::All));
    let mut from_matrix = Vec::new();
    for a in &d.nodes {
        for b in &d.nodes {
            from_matrix.push(g.are_connected(a, b, TensorType::All).expect("members"));
        }
    }
    assert_eq!(lazy, from_matrix);
}

#[test]
fn queries_on_non_members_fail_softly_or_loudly() {
    let d = diamond();
    let stranger = Node::builder("stranger", "relu").build();
    assert!(!d.graph.is_ancestor(&stranger, &d.nodes[0]));
    let err = d
        .graph
        .number_of_paths(&stranger, &d.nodes[0], TensorType::All)
        .expect_err("not a member");
    assert_eq!(err.code(), ErrorCode::NotAMember);
    assert!(d.graph.node_consumers(&stranger, TensorType::All, true).is_empty());
}

#[test]
fn edits_invalidate_cached_order() {
    let mut d = diamond();
    let first = d.graph.topo_sorted_nodes();
    assert_eq!(first.len(), 5);

    let extra = Node::compute(
        "f",
        "relu",
        &[&d.nodes[4].output(0).expect("output")],
        &[&Tensor::new("t6")],
    );
    d.graph.add_node(&extra).expect("add");
    let second = d.graph.topo_sorted_nodes();
    assert_eq!(second.len(), 6);
    assert_eq!(second.nodes().last().map(|n| n.id()), Some(extra.id()));
    assert!(d.graph.is_dirty());
}

#[test]
fn stored_order_survives_edits_until_restored() {
    let mut d = diamond();
    assert_eq!(d.graph.topo_sorted_nodes().len(), 5);
    d.graph.store_topological_sort();
    let leaf = Node::compute("leaf", "relu", &[&Tensor::new("free")], &[&Tensor::new("out")]);
    d.graph.add_node(&leaf).expect("add");
    assert_eq!(d.graph.topo_sorted_nodes().len(), 6);

    d.graph.restore_topological_sort();
    assert_eq!(d.graph.topo_sorted_nodes().len(), 5);
}

#[test]
fn cycle_gives_empty_order_and_zero_paths() {
    let x = Tensor::new("x");
    let y = Tensor::new("y");
    let a = Node::compute("a", "relu", &[&x], &[&y]);
    let b = Node::compute("b", "relu", &[&y], &[&x]);
    let mut g = Graph::new();
    g.add_node(&a).expect("add");
    g.add_node(&b).expect("add");

    assert!(g.topo_sorted_nodes().is_empty());
    assert_eq!(g.number_of_paths(&a, &b, TensorType::All), Ok(0));
    assert_eq!(g.find_cycles().len(), 1);
}

// ---------------------------------------------------------------------------
// Logical nodes
// ---------------------------------------------------------------------------

#[test]
fn real_walks_look_through_logical_chains() {
    let t: Vec<_> = (0..5).map(|i| Tensor::new(format!("t{i}"))).collect();
    let conv = Node::compute("conv", "conv", &[&t[0]], &[&t[1]]);
    let reshape = Node::builder("reshape", "reshape")
        .logical()
        .input(&t[1])
        .output(&t[2])
        .build();
    let identity = Node::builder("identity", "identity")
        .logical()
        .input(&t[2])
        .output(&t[3])
        .build();
    let relu = Node::compute("relu", "relu", &[&t[3]], &[&t[4]]);
    let mut g = Graph::new();
    for n in [&conv, &reshape, &identity, &relu] {
        g.add_node(n).expect("add");
    }

    let producers = g.real_producers(&t[3]);
    assert_eq!(producers.len(), 1);
    assert!(producers.contains(&conv));

    let consumers = g.real_consumers(&t[1]);
    assert_eq!(consumers.len(), 1);
    assert!(consumers.contains(&relu));

    assert!(g.node_real_consumers(&conv, TensorType::Data).contains(&relu));
    assert!(g.node_real_producers(&relu, TensorType::Data).contains(&conv));
    assert!(g.real_producers_except(&t[3], |n| n.id() == conv.id(), false).is_empty());
}

#[test]
fn intersection_keeps_nodes_between_the_inputs() {
    let d = diamond();
    let picked = vec![Rc::clone(&d.nodes[0]), Rc::clone(&d.nodes[3])];
    let between = d.graph.intersecting_nodes(&picked);
    let names: Vec<&str> = between.iter().map(|n| n.name()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}

// ---------------------------------------------------------------------------
// Patterns and copies
// ---------------------------------------------------------------------------

#[test]
fn two_node_pattern_found_twice() {
    let h: Vec<_> = (0..5).map(|i| Tensor::new(format!("h{i}"))).collect();
    let mut host = Graph::new();
    host.add_node(&Node::compute("mm1", "matmul", &[&h[0]], &[&h[1]])).expect("add");
    host.add_node(&Node::compute("bias1", "bias_add", &[&h[1]], &[&h[2]])).expect("add");
    host.add_node(&Node::compute("mm2", "matmul", &[&h[2]], &[&h[3]])).expect("add");
    host.add_node(&Node::compute("bias2", "bias_add", &[&h[3]], &[&h[4]])).expect("add");

    let p: Vec<_> = (0..3).map(|i| Tensor::new(format!("p{i}"))).collect();
    let mut pattern = Graph::new();
    pattern.add_node(&Node::compute("pm", "matmul", &[&p[0]], &[&p[1]])).expect("add");
    pattern.add_node(&Node::compute("pb", "bias_add", &[&p[1]], &[&p[2]])).expect("add");

    let matches = host
        .find_matches(&pattern, |a, b| a.guid() == b.guid())
        .expect("single leaf");
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().all(|m| m.len() == 2));
}

#[test]
fn copied_graph_is_isomorphic_and_independent() {
    let d = diamond();
    let mut copy = Graph::new();
    let clones = copy.copy_nodes_and_tensors(&d.graph).expect("copy");
    assert!(copy.isomorphic_to(&d.graph));
    assert_eq!(copy.num_nodes(), d.graph.num_nodes());
    for n in &d.nodes {
        assert!(!copy.contains_node(n));
        let twin = find_cloned_node(&copy, n, &clones).expect("cloned");
        assert_eq!(twin.guid(), n.guid());
        assert_ne!(twin.id(), n.id());
    }
}

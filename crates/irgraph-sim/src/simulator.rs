//! Seeded graph construction and rewriting.
//!
//! A run builds a layered DAG, then applies a sequence of rewrites drawn from
//! the graph engine's mutation surface. Every rewrite is constructed to be
//! valid, so an engine error during a run is itself reported as a violation.
//! Rewrites that need a second graph (copies, shared nodes) check that graph
//! on the spot and drop it before the next step.

use anyhow::{Result, bail};
use irgraph_core::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::oracle::{self, InvariantViolation};
use crate::rng::DeterministicRng;

/// Parameters of one simulated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Layers of the initial DAG.
    pub layers: usize,
    /// Nodes per layer.
    pub width: usize,
    /// Rewrites applied after construction.
    pub rewrites: usize,
    /// Chance that a generated single-input node is logical (percent).
    pub logical_percent: u8,
    /// Node pairs sampled per oracle check.
    pub oracle_samples: usize,
    /// Engine settings for every graph the run creates.
    #[serde(default)]
    pub graph: GraphConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            layers: 5,
            width: 4,
            rewrites: 24,
            logical_percent: 20,
            oracle_samples: 32,
            graph: GraphConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error for an empty initial graph.
    pub fn validate(&self) -> Result<()> {
        if self.layers == 0 {
            bail!("layers must be > 0");
        }
        if self.width == 0 {
            bail!("width must be > 0");
        }
        if self.logical_percent > 100 {
            bail!("logical_percent must be <= 100");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteKind {
    AddNode,
    RemoveNode,
    ReplaceProducer,
    AttachNodes,
    ReplaceSemantic,
    CloneGraph,
    ShareNodes,
}

impl RewriteKind {
    const ALL: [Self; 7] = [
        Self::AddNode,
        Self::RemoveNode,
        Self::ReplaceProducer,
        Self::AttachNodes,
        Self::ReplaceSemantic,
        Self::CloneGraph,
        Self::ShareNodes,
    ];
}

/// One rewrite attempt. Details name nodes by name only so traces of the
/// same seed compare equal across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: usize,
    pub kind: RewriteKind,
    pub applied: bool,
    pub detail: String,
}

#[derive(Debug)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    /// The rewritten graph.
    pub graph: Graph,
    /// Violations found while the run was in progress.
    pub violations: Vec<InvariantViolation>,
}

impl SimulationResult {
    #[must_use]
    pub fn rewrites_applied(&self) -> usize {
        self.trace.iter().filter(|e| e.applied).count()
    }
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    graph: Graph,
    next_name: usize,
    trace: Vec<TraceEvent>,
    violations: Vec<InvariantViolation>,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            graph: Graph::with_config(config.graph),
            config,
            next_name: 0,
            trace: Vec::new(),
            violations: Vec::new(),
        })
    }

    /// Build the initial graph, apply every rewrite and hand back the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial graph cannot be built.
    #[instrument(skip(self), fields(seed = self.config.seed))]
    pub fn run(mut self) -> Result<SimulationResult> {
        self.build_layers()?;
        for step in 0..self.config.rewrites {
            let kind = RewriteKind::ALL[self.rng.next_below(RewriteKind::ALL.len())];
            let outcome = self.apply(kind);
            let (applied, detail) = match outcome {
                Ok(Some(detail)) => (true, detail),
                Ok(None) => (false, "skipped".to_string()),
                Err(err) => {
                    self.violations.push(InvariantViolation::EngineError {
                        step,
                        error: err.to_string(),
                    });
                    (false, format!("engine error: {}", err.code()))
                }
            };
            trace!(step, ?kind, applied, %detail, "rewrite");
            self.trace.push(TraceEvent {
                step,
                kind,
                applied,
                detail,
            });
        }
        debug!(
            nodes = self.graph.num_nodes(),
            violations = self.violations.len(),
            "simulation finished"
        );
        Ok(SimulationResult {
            seed: self.config.seed,
            trace: self.trace,
            graph: self.graph,
            violations: self.violations,
        })
    }

    fn fresh_name(&mut self, prefix: &str) -> String {
        self.next_name += 1;
        format!("{prefix}{}", self.next_name)
    }

    fn build_layers(&mut self) -> Result<()> {
        let mut available: Vec<TensorPtr> = (0..self.config.width)
            .map(|_| Tensor::new(self.fresh_name("input")))
            .collect();
        for layer in 0..self.config.layers {
            let mut produced = Vec::with_capacity(self.config.width);
            for _ in 0..self.config.width {
                let node = self.random_node(&available, layer == 0);
                if let Some(out) = node.output(0) {
                    produced.push(out);
                }
                self.graph.add_node(&node)?;
            }
            available.extend(produced);
        }
        Ok(())
    }

    /// A node reading one or two tensors of `pool` and writing one fresh
    /// tensor.
    fn random_node(&mut self, pool: &[TensorPtr], first_layer: bool) -> NodePtr {
        let arity = if first_layer { 1 } else { 1 + self.rng.next_below(2) };
        let logical = arity == 1 && self.rng.hit_rate_percent(self.config.logical_percent);
        let name = self.fresh_name(if logical { "view" } else { "n" });
        let out = Tensor::new(format!("{name}_out"));
        let mut builder = if logical {
            Node::builder(name, "reshape").logical()
        } else {
            Node::builder(name, "op")
        };
        for _ in 0..arity {
            if let Some(t) = self.rng.pick(pool) {
                builder = builder.input(t);
            }
        }
        builder.output(&out).build()
    }

    fn pick_node(&mut self) -> Option<NodePtr> {
        let nodes = self.graph.nodes();
        self.rng.pick(&nodes).cloned()
    }

    fn apply(&mut self, kind: RewriteKind) -> Result<Option<String>, GraphError> {
        match kind {
            RewriteKind::AddNode => self.add_node(),
            RewriteKind::RemoveNode => self.remove_node(),
            RewriteKind::ReplaceProducer => self.replace_producer(),
            RewriteKind::AttachNodes => self.attach_nodes(),
            RewriteKind::ReplaceSemantic => self.replace_semantic(),
            RewriteKind::CloneGraph => Ok(Some(self.clone_graph())),
            RewriteKind::ShareNodes => self.share_nodes(),
        }
    }

    fn add_node(&mut self) -> Result<Option<String>, GraphError> {
        let pool = self.graph.tensors();
        if pool.is_empty() {
            return Ok(None);
        }
        let node = self.random_node(&pool, false);
        self.graph.add_node(&node)?;
        Ok(Some(format!("added {}", node.name())))
    }

    fn remove_node(&mut self) -> Result<Option<String>, GraphError> {
        let Some(node) = self.pick_node() else {
            return Ok(None);
        };
        self.graph.remove_node(&node, None)?;
        Ok(Some(format!("removed {}", node.name())))
    }

    /// Swap a node for a fresh producer with the same inputs, handing its
    /// consumers over.
    fn replace_producer(&mut self) -> Result<Option<String>, GraphError> {
        let Some(old) = self.pick_node() else {
            return Ok(None);
        };
        let name = self.fresh_name("fused");
        let mut builder = Node::builder(name, old.guid()).kind(old.kind());
        for slot in old.inputs() {
            builder = builder.optional_input(slot.as_ref());
        }
        for slot in old.outputs() {
            let fresh = slot.map(|_| Tensor::new(self.fresh_name("t")));
            builder = builder.optional_output(fresh.as_ref());
        }
        let replacement = builder.build();

        self.graph.add_node(&replacement)?;
        self.graph.remove_node(&old, Some(&replacement))?;
        Ok(Some(format!("{} replaced by {}", old.name(), replacement.name())))
    }

    /// Feed an earlier node's output into a later node's input.
    fn attach_nodes(&mut self) -> Result<Option<String>, GraphError> {
        let order = self.graph.topo_sorted_nodes();
        if order.len() < 2 {
            return Ok(None);
        }
        let a = self.rng.next_below(order.len());
        let b = self.rng.next_below(order.len());
        if a == b {
            return Ok(None);
        }
        let (from, to) = (&order.nodes()[a.min(b)], &order.nodes()[a.max(b)]);
        let inputs = to.num_inputs(TensorType::Data);
        if inputs == 0 || from.num_outputs(TensorType::Data) == 0 {
            return Ok(None);
        }
        let input_index = self.rng.next_below(inputs);
        self.graph.attach_nodes(from, to, 0, input_index)?;
        Ok(Some(format!("{} -> {}[{input_index}]", from.name(), to.name())))
    }

    fn replace_semantic(&mut self) -> Result<Option<String>, GraphError> {
        let Some(old) = self.pick_node() else {
            return Ok(None);
        };
        let name = self.fresh_name("sem");
        let mut builder = Node::builder(name, format!("{}_v2", old.guid())).kind(old.kind());
        for slot in old.inputs() {
            builder = builder.optional_input(slot.as_ref());
        }
        for slot in old.outputs() {
            builder = builder.optional_output(slot.as_ref());
        }
        for t in old.control_inputs() {
            builder = builder.control_input(&t);
        }
        for t in old.control_outputs() {
            builder = builder.control_output(&t);
        }
        let new = builder.build();
        self.graph.replace_semantic_nodes(&old, &new)?;
        Ok(Some(format!("{} became {}", old.name(), new.name())))
    }

    fn clone_graph(&mut self) -> String {
        let mut copy = Graph::with_config(self.config.graph);
        match copy.copy_nodes_and_tensors(&self.graph) {
            Ok(clones) => {
                if !copy.isomorphic_to(&self.graph) {
                    self.violations.push(InvariantViolation::CloneIsomorphism {
                        nodes: self.graph.num_nodes(),
                    });
                }
                let unmatched = self
                    .graph
                    .nodes()
                    .iter()
                    .filter(|n| n.num_outputs(TensorType::All) > 0)
                    .filter(|n| {
                        find_cloned_node(&copy, n, &clones)
                            .is_none_or(|twin| twin.guid() != n.guid())
                    })
                    .count();
                if unmatched > 0 {
                    self.violations.push(InvariantViolation::CloneIsomorphism { nodes: unmatched });
                }
            }
            Err(err) => self.violations.push(InvariantViolation::EngineError {
                step: self.trace.len(),
                error: err.to_string(),
            }),
        }
        format!("copied {} nodes", copy.num_nodes())
    }

    /// Add a random subset of nodes to a second graph, check it, then drop
    /// it and make sure its tokens went with it.
    fn share_nodes(&mut self) -> Result<Option<String>, GraphError> {
        let nodes = self.graph.nodes();
        if nodes.is_empty() {
            return Ok(None);
        }
        let mut shared = Graph::with_config(self.config.graph);
        for n in &nodes {
            if self.rng.hit_rate_percent(50) {
                shared.add_node(n)?;
            }
        }
        let shared_id = shared.id();
        let count = shared.num_nodes();

        let report = oracle::check_graph(&shared, &mut self.rng, self.config.oracle_samples);
        self.violations.extend(report.violations);
        let main = oracle::check_graph(&self.graph, &mut self.rng, self.config.oracle_samples);
        self.violations.extend(main.violations);

        drop(shared);
        for n in &nodes {
            let leaked = n.graph_ids().contains(&shared_id)
                || n.operands().iter().any(|t| t.graph_ids().contains(&shared_id));
            if leaked {
                self.violations.push(InvariantViolation::Membership {
                    object: n.name().to_string(),
                    detail: "token entry survived its graph".to_string(),
                });
            }
        }
        Ok(Some(format!("shared {count} nodes")))
    }
}

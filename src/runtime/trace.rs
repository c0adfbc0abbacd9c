use super::{DepKind, Event};
use daggy::{Dag, NodeIndex, Walker};
use fnv::FnvHashMap;
use daggy::petgraph::dot::Dot;
use std::fmt;

/// One recorded command group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: u64,
    pub label: &'static str,
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

/// Dependency graph of everything submitted to a traced queue.
#[derive(Debug, Clone)]
pub struct QueueTrace {
    dag: Dag<Submission, DepKind>,
    nodes: FnvHashMap<u64, NodeIndex>,
}

impl Default for QueueTrace {
    fn default() -> Self {
        Self {
            dag: Dag::new(),
            nodes: Default::default(),
        }
    }
}

impl QueueTrace {
    pub(crate) fn record(&mut self, event: &Event, deps: &[(Event, DepKind)]) {
        let Some(id) = event.id() else {
            return;
        };
        let node = self.dag.add_node(Submission {
            id,
            label: event.label(),
        });
        self.nodes.insert(id, node);

        for (dep, kind) in deps {
            // Events from other queues have no node here.
            let Some(parent) = dep.id().and_then(|d| self.nodes.get(&d)) else {
                continue;
            };
            if self.dag.add_edge(*parent, node, *kind).is_err() {
                log::warn!("dropping cyclic trace edge into {}#{}", event.label(), id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submissions in order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.dag.raw_nodes().iter().map(|n| n.weight.clone()).collect()
    }

    /// Submissions the given one had to wait for, with the reason.
    pub fn dependencies_of(&self, id: u64) -> Vec<(Submission, DepKind)> {
        let Some(&node) = self.nodes.get(&id) else {
            return vec![];
        };
        self.dag
            .parents(node)
            .iter(&self.dag)
            .map(|(edge, parent)| (self.dag[parent].clone(), self.dag[edge]))
            .collect()
    }

    /// Graphviz rendering of the submission graph.
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(self.dag.graph()))
    }
}

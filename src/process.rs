//! Processes (C4): declarative units of work. Modelled as a sealed tagged
//! enum per the design notes (closed variant set, no trait objects needed).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};

use crate::distribution::TimeModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEndpoints(pub String, pub String);

/// A single configured process. The variant carries exactly the fields
/// listed for it in the data model; `TimeModel` instances are resolved by the
/// config loader from `timeModelData` IDs before a `Process` is constructed.
#[derive(Clone)]
pub enum Process {
    Production { id: String, time_model: TimeModel, failure_rate: f64, dependency_id: Option<String> },
    Capability { id: String, capability: String, time_model: TimeModel, failure_rate: f64, dependency_id: Option<String> },
    Transport { id: String, time_model: TimeModel, loading_tm: Option<TimeModel>, unloading_tm: Option<TimeModel> },
    LinkTransport { id: String, time_model: TimeModel, links: Vec<LinkEndpoints>, capability: Option<String>, can_move: bool, graph: LinkGraph },
    Rework { id: String, time_model: TimeModel, reworked_process_ids: Vec<String>, blocking: bool },
    Compound { id: String, process_ids: Vec<String> },
    RequiredCapability { capability: String },
    ProcessModel { id: String, precedence_graph_id: String },
}

impl Process {
    pub fn id(&self) -> &str {
        match self {
            Process::Production { id, .. }
            | Process::Capability { id, .. }
            | Process::Transport { id, .. }
            | Process::LinkTransport { id, .. }
            | Process::Rework { id, .. }
            | Process::Compound { id, .. }
            | Process::ProcessModel { id, .. } => id,
            Process::RequiredCapability { capability } => capability,
        }
    }

    /// `"<kind>:<ID-or-capability>"` — the key compatibility tables are
    /// indexed by.
    pub fn signature(&self) -> String {
        match self {
            Process::Production { id, .. } => format!("production:{id}"),
            Process::Capability { capability, .. } => format!("capability:{capability}"),
            Process::Transport { id, .. } => format!("transport:{id}"),
            Process::LinkTransport { id, .. } => format!("link_transport:{id}"),
            Process::Rework { id, .. } => format!("rework:{id}"),
            Process::Compound { id, .. } => format!("compound:{id}"),
            Process::RequiredCapability { capability } => format!("required_capability:{capability}"),
            Process::ProcessModel { id, .. } => format!("process_model:{id}"),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        match self {
            Process::Production { failure_rate, .. } => *failure_rate,
            Process::Capability { failure_rate, .. } => *failure_rate,
            _ => 0.0,
        }
    }

    /// `Matches(request)`: production/capability match by ID or capability;
    /// compound matches any contained element; link-transport additionally
    /// requires a route between the request's origin and target.
    pub fn matches(&self, wanted_signature: &str, origin: Option<&str>, target: Option<&str>) -> bool {
        match self {
            Process::Production { .. } | Process::Capability { .. } | Process::Transport { .. } | Process::Rework { .. } => {
                self.signature() == wanted_signature
            }
            Process::LinkTransport { id, graph, capability, .. } => {
                let sig_matches = wanted_signature == format!("link_transport:{id}")
                    || capability.as_deref().map(|c| wanted_signature == format!("capability:{c}")).unwrap_or(false);
                if !sig_matches {
                    return false;
                }
                match (origin, target) {
                    (Some(o), Some(t)) => graph.shortest_path(o, t).is_some(),
                    _ => true,
                }
            }
            Process::Compound { process_ids, .. } => process_ids
                .iter()
                .any(|p| wanted_signature.split_once(':').map(|(_, rest)| rest == p).unwrap_or(false)),
            Process::RequiredCapability { capability } => wanted_signature == format!("capability:{capability}"),
            Process::ProcessModel { id, .. } => wanted_signature == format!("process_model:{id}"),
        }
    }

    pub fn expected_time(&self) -> f64 {
        match self {
            Process::Production { time_model, .. }
            | Process::Capability { time_model, .. }
            | Process::Transport { time_model, .. }
            | Process::LinkTransport { time_model, .. }
            | Process::Rework { time_model, .. } => time_model.expected(),
            _ => 0.0,
        }
    }

    /// The `dependencyData` entry (§4.7 DependencyProcessHandler) that must
    /// be bound before this process can run, if any.
    pub fn required_dependency_id(&self) -> Option<&str> {
        match self {
            Process::Production { dependency_id, .. } | Process::Capability { dependency_id, .. } => dependency_id.as_deref(),
            _ => None,
        }
    }

    pub fn expected_time_between(&self, origin: (f64, f64), target: (f64, f64)) -> f64 {
        match self {
            Process::Transport { time_model, .. } | Process::LinkTransport { time_model, .. } => {
                time_model.expected_between(origin, target)
            }
            other => other.expected_time(),
        }
    }
}

/// An undirected weighted graph over node/resource/port IDs, built from a
/// `LinkTransportProcess`'s `links` list. Dijkstra route caching per §4.8.
/// Edges are always bidirectional (see SPEC_FULL.md §4.4's resolved Open
/// Question) regardless of `canMove`, which instead lives on `Resource`.
#[derive(Clone, Default)]
pub struct LinkGraph {
    adjacency: HashMap<String, Vec<(String, f64)>>,
}

impl LinkGraph {
    pub fn from_links(links: &[LinkEndpoints], locations: &HashMap<String, (f64, f64)>) -> Self {
        let mut adjacency: HashMap<String, Vec<(String, f64)>> = HashMap::new();
        for LinkEndpoints(a, b) in links {
            let cost = match (locations.get(a), locations.get(b)) {
                (Some(pa), Some(pb)) => (pa.0 - pb.0).abs() + (pa.1 - pb.1).abs(),
                _ => 1.0,
            };
            adjacency.entry(a.clone()).or_default().push((b.clone(), cost));
            adjacency.entry(b.clone()).or_default().push((a.clone(), cost));
        }
        LinkGraph { adjacency }
    }

    /// Dijkstra shortest path; returns the ordered list of node IDs from
    /// `origin` to `target` inclusive, or `None` if unreachable.
    pub fn shortest_path(&self, origin: &str, target: &str) -> Option<Vec<String>> {
        if origin == target {
            return Some(vec![origin.to_string()]);
        }
        #[derive(PartialEq)]
        struct HeapEntry(f64, String);
        impl Eq for HeapEntry {}
        impl Ord for HeapEntry {
            fn cmp(&self, other: &Self) -> Ordering {
                other.0.partial_cmp(&self.0).unwrap_or(Ordering::Equal)
            }
        }
        impl PartialOrd for HeapEntry {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut dist: HashMap<String, f64> = HashMap::new();
        let mut prev: HashMap<String, String> = HashMap::new();
        let mut heap = BinaryHeap::new();
        dist.insert(origin.to_string(), 0.0);
        heap.push(HeapEntry(0.0, origin.to_string()));

        while let Some(HeapEntry(d, node)) = heap.pop() {
            if node == target {
                break;
            }
            if d > *dist.get(&node).unwrap_or(&f64::INFINITY) {
                continue;
            }
            if let Some(neighbours) = self.adjacency.get(&node) {
                for (next, cost) in neighbours {
                    let nd = d + cost;
                    if nd < *dist.get(next).unwrap_or(&f64::INFINITY) {
                        dist.insert(next.clone(), nd);
                        prev.insert(next.clone(), node.clone());
                        heap.push(HeapEntry(nd, next.clone()));
                    }
                }
            }
        }

        if !dist.contains_key(target) {
            return None;
        }
        let mut path = vec![target.to_string()];
        let mut cur = target.to_string();
        while let Some(p) = prev.get(&cur) {
            path.push(p.clone());
            cur = p.clone();
        }
        path.reverse();
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_matches_contained_processes_by_full_signature_not_suffix() {
        let compound = Process::Compound { id: "c1".into(), process_ids: vec!["p1".into()] };
        assert!(compound.matches("production:p1", None, None));
        assert!(!compound.matches("production:xp1", None, None));
    }

    #[test]
    fn dijkstra_finds_shortest_path_over_intermediate_nodes() {
        let locations = HashMap::from([
            ("A".to_string(), (0.0, 0.0)),
            ("B".to_string(), (1.0, 0.0)),
            ("C".to_string(), (2.0, 0.0)),
            ("D".to_string(), (0.0, 5.0)),
        ]);
        let links = vec![
            LinkEndpoints("A".into(), "B".into()),
            LinkEndpoints("B".into(), "C".into()),
            LinkEndpoints("A".into(), "D".into()),
            LinkEndpoints("D".into(), "C".into()),
        ];
        let graph = LinkGraph::from_links(&links, &locations);
        let path = graph.shortest_path("A", "C").unwrap();
        assert_eq!(path, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }

    #[test]
    fn links_are_bidirectional() {
        let locations = HashMap::new();
        let links = vec![LinkEndpoints("A".into(), "B".into())];
        let graph = LinkGraph::from_links(&links, &locations);
        assert!(graph.shortest_path("B", "A").is_some());
    }

    #[test]
    fn unreachable_target_returns_none() {
        let locations = HashMap::new();
        let links = vec![LinkEndpoints("A".into(), "B".into())];
        let graph = LinkGraph::from_links(&links, &locations);
        assert!(graph.shortest_path("A", "Z").is_none());
    }
}

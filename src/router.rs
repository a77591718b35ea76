//! Router, request handler, process matcher (C8). `ProcessMatcher` is built
//! once from the configuration and shared by every `run_single_process`
//! coroutine; `sort_by_shortest_queue` is the one routing heuristic that
//! needs live registry state rather than just the candidate list, so it's a
//! free function the router calls into (§4.8).

use std::cell::RefCell;
use std::collections::HashMap;

use indexmap::IndexMap;

use crate::process::{LinkGraph, Process};

/// Compatibility tables precomputed (lazily, memoised — see DESIGN.md) from
/// the configuration: which `(resource, process)` pairs can serve a given
/// process signature, and the routes between locatables a link-transport
/// process can actually reach.
pub struct ProcessMatcher {
    /// `processSignature -> [(resourceId, concreteProcessId)]` for
    /// production/capability/compound requests.
    pub production_compatibility: HashMap<String, Vec<(String, String)>>,
    /// `processSignature -> [reworkProcessId]`.
    pub rework_compatibility: HashMap<String, Vec<String>>,
    /// `(transportResourceId, processId) -> LinkGraph` for the link-transport
    /// processes a transporter owns; `None` entries (plain `TransportProcess`)
    /// are not routed through a graph — any two locatables are a direct hop.
    pub transport_graphs: HashMap<(String, String), LinkGraph>,
    route_cache: RefCell<HashMap<(String, String, String), Option<Vec<String>>>>,
}

impl ProcessMatcher {
    pub fn build(
        // Order-preserving: iteration order here becomes the candidate order
        // routing heuristics sort (stably), so it must be a deterministic
        // function of the configuration, not of hash-map bucket placement.
        processes_by_resource: &IndexMap<String, Vec<String>>,
        processes: &HashMap<String, Process>,
    ) -> Self {
        let mut production_compatibility: HashMap<String, Vec<(String, String)>> = HashMap::new();
        let mut rework_compatibility: HashMap<String, Vec<String>> = HashMap::new();
        let mut transport_graphs: HashMap<(String, String), LinkGraph> = HashMap::new();

        for (resource_id, process_ids) in processes_by_resource {
            for pid in process_ids {
                let Some(process) = processes.get(pid) else { continue };
                match process {
                    Process::Production { .. } | Process::Capability { .. } | Process::Transport { .. } => {
                        production_compatibility
                            .entry(process.signature())
                            .or_default()
                            .push((resource_id.clone(), pid.clone()));
                    }
                    Process::Compound { process_ids: inner, .. } => {
                        for inner_id in inner {
                            if let Some(inner_process) = processes.get(inner_id) {
                                production_compatibility
                                    .entry(inner_process.signature())
                                    .or_default()
                                    .push((resource_id.clone(), inner_id.clone()));
                            }
                        }
                    }
                    Process::LinkTransport { id, graph, .. } => {
                        production_compatibility
                            .entry(process.signature())
                            .or_default()
                            .push((resource_id.clone(), pid.clone()));
                        transport_graphs.insert((resource_id.clone(), id.clone()), graph.clone());
                    }
                    Process::Rework { reworked_process_ids, .. } => {
                        production_compatibility
                            .entry(process.signature())
                            .or_default()
                            .push((resource_id.clone(), pid.clone()));
                        for reworked in reworked_process_ids {
                            rework_compatibility
                                .entry(format!("production:{reworked}"))
                                .or_default()
                                .push(pid.clone());
                        }
                    }
                    Process::ProcessModel { .. } | Process::RequiredCapability { .. } => {}
                }
            }
        }

        ProcessMatcher {
            production_compatibility,
            rework_compatibility,
            transport_graphs,
            route_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn candidates_for(&self, signature: &str) -> Vec<(String, String)> {
        self.production_compatibility.get(signature).cloned().unwrap_or_default()
    }

    pub fn reworks_for(&self, failed_process_signature: &str) -> Vec<String> {
        self.rework_compatibility.get(failed_process_signature).cloned().unwrap_or_default()
    }

    /// Looks up (and memoises) the route a link-transport resource would take
    /// from `origin` to `target`. `None` means unreachable.
    pub fn route(&self, resource_id: &str, process_id: &str, origin: &str, target: &str) -> Option<Vec<String>> {
        let key = (origin.to_string(), target.to_string(), format!("{resource_id}:{process_id}"));
        if let Some(cached) = self.route_cache.borrow().get(&key) {
            return cached.clone();
        }
        let route = self
            .transport_graphs
            .get(&(resource_id.to_string(), process_id.to_string()))
            .and_then(|g| g.shortest_path(origin, target));
        self.route_cache.borrow_mut().insert(key, route.clone());
        route
    }
}

/// Ranks candidates by `shortest_queue`: for transport resources, the
/// negative of the controller's pending-request count; otherwise the summed
/// length of the resource's ports. Built as a free function (rather than a
/// method on `ProcessMatcher`) since it needs live registry state the
/// matcher itself doesn't hold.
pub fn sort_by_shortest_queue(candidates: &mut [(String, String)], queue_len_of: impl Fn(&str) -> i64) {
    candidates.sort_by_key(|(resource_id, _)| queue_len_of(resource_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{TimeModelConfig, TimeModelFactory};
    use std::collections::HashMap as Map;

    #[test]
    fn production_compatibility_indexes_by_signature() {
        let mut factory = TimeModelFactory::new(0);
        let tm = factory.create(&TimeModelConfig::Constant { location: 1.0 }).unwrap();
        let mut processes = Map::new();
        processes.insert(
            "p1".to_string(),
            Process::Production { id: "p1".into(), time_model: tm, failure_rate: 0.0, dependency_id: None },
        );
        let mut by_resource = IndexMap::new();
        by_resource.insert("R1".to_string(), vec!["p1".to_string()]);

        let matcher = ProcessMatcher::build(&by_resource, &processes);
        let candidates = matcher.candidates_for("production:p1");
        assert_eq!(candidates, vec![("R1".to_string(), "p1".to_string())]);
    }

    #[test]
    fn rework_compatibility_is_keyed_by_the_reworked_process_signature() {
        let mut factory = TimeModelFactory::new(0);
        let tm = factory.create(&TimeModelConfig::Constant { location: 1.0 }).unwrap();
        let mut processes = Map::new();
        processes.insert(
            "rw1".to_string(),
            Process::Rework { id: "rw1".into(), time_model: tm, reworked_process_ids: vec!["p1".into()], blocking: true },
        );
        let mut by_resource = IndexMap::new();
        by_resource.insert("Reworker".to_string(), vec!["rw1".to_string()]);

        let matcher = ProcessMatcher::build(&by_resource, &processes);
        assert_eq!(matcher.reworks_for("production:p1"), vec!["rw1".to_string()]);
    }
}

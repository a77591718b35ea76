//! The configuration model (§6): `ProductionSystemData`, its single
//! load-time validation pass (§9), and the `Hash`/`read`/`write` round-trip
//! contract. Deserialised with `serde_json`; every optional field carries
//! `#[serde(default)]` so additive, backwards-compatible fields never break
//! an older document.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::distribution::{Metric, TimeModelConfig};
use crate::error::{SimError, SimResult};
use crate::queue::{InterfaceType, PortType};
use crate::resource::ControlPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeUnit {
    S,
    #[default]
    Min,
    H,
    D,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeModelData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub config: TimeModelConfig,
    #[serde(default = "default_batch")]
    pub batch: u32,
}

fn default_batch() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: StateKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StateKindConfig {
    Production,
    Transport,
    Setup { from_process: Option<String>, to_process: String, time_model_id: String },
    BreakDown { time_to_failure_id: String, repair_time_id: String },
    ProcessBreakDown { process_id: String, time_to_failure_id: String, repair_time_id: String },
    Charging { threshold: f64, battery_capacity: f64, charge_time_id: String },
    NonScheduled { time_model_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: ProcessKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ProcessKindConfig {
    Production {
        time_model_id: String,
        #[serde(default)]
        failure_rate: f64,
        /// References a `dependencyData` entry (§4.7 DependencyProcessHandler):
        /// an auxiliary primitive must be bound before this process can run.
        #[serde(default)]
        dependency_id: Option<String>,
    },
    Capability {
        capability: String,
        time_model_id: String,
        #[serde(default)]
        failure_rate: f64,
        #[serde(default)]
        dependency_id: Option<String>,
    },
    Transport { time_model_id: String, #[serde(default)] loading_tm_id: Option<String>, #[serde(default)] unloading_tm_id: Option<String> },
    LinkTransport {
        time_model_id: String,
        links: Vec<(String, String)>,
        #[serde(default)]
        capability: Option<String>,
        #[serde(default = "default_true")]
        can_move: bool,
    },
    Rework { time_model_id: String, reworked_process_ids: Vec<String>, blocking: bool },
    Compound { process_ids: Vec<String> },
    RequiredCapability { capability: String },
    ProcessModel { precedence_graph_id: String },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub interface_type: InterfaceType,
    #[serde(default)]
    pub port_type: PortTypeConfig,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub location: Option<(f64, f64)>,
    /// `QueuePerProductData` (§4.2): when set, only entities of this product
    /// type are routed to this port.
    #[serde(default)]
    pub dedicated_product: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum PortTypeConfig {
    #[default]
    Queue,
    Store,
}

impl From<PortTypeConfig> for PortType {
    fn from(v: PortTypeConfig) -> Self {
        match v {
            PortTypeConfig::Queue => PortType::Queue,
            PortTypeConfig::Store => PortType::Store,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub location: (f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceProcessRef {
    pub process_id: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub capacity: u32,
    pub location: (f64, f64),
    #[serde(default)]
    pub can_move: bool,
    #[serde(default)]
    pub processes: Vec<ResourceProcessRef>,
    #[serde(default)]
    pub state_ids: Vec<String>,
    #[serde(default)]
    pub port_ids: Vec<String>,
    #[serde(default)]
    pub control_policy: ControlPolicyConfig,
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// `SystemResource` (§3/§4.6): non-empty only for a composite resource.
    #[serde(default)]
    pub subresource_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum ControlPolicyConfig {
    #[default]
    Fifo,
    Lifo,
    Spt,
    SptTransport,
    NearestOriginLongestTargetOutput,
    NearestOriginShortestTargetInput,
    Agent,
}

impl ControlPolicyConfig {
    pub fn build(&self) -> ControlPolicy {
        match self {
            ControlPolicyConfig::Fifo => ControlPolicy::Fifo,
            ControlPolicyConfig::Lifo => ControlPolicy::Lifo,
            ControlPolicyConfig::Spt => ControlPolicy::Spt,
            ControlPolicyConfig::SptTransport => ControlPolicy::SptTransport,
            ControlPolicyConfig::NearestOriginLongestTargetOutput => ControlPolicy::NearestOriginLongestTargetOutput,
            ControlPolicyConfig::NearestOriginShortestTargetInput => ControlPolicy::NearestOriginShortestTargetInput,
            // A bare config document cannot carry a closure; callers that
            // want the agent policy swap it in on the built `Resource` after
            // `Simulation::initialize` (see `Simulation::set_agent_policy`).
            ControlPolicyConfig::Agent => ControlPolicy::Fifo,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessModelStepConfig {
    pub process_id: String,
    #[serde(default)]
    pub predecessors: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub process_model: Vec<ProcessModelStepConfig>,
    #[serde(default)]
    pub transport_process_id: Option<String>,
    #[serde(default)]
    pub becomes_primitive: bool,
    #[serde(default)]
    pub routing_heuristic: RoutingHeuristicConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum RoutingHeuristicConfig {
    Fifo,
    Random,
    #[default]
    ShortestQueue,
    Agent,
}

impl RoutingHeuristicConfig {
    pub fn build(&self) -> crate::entity::RoutingHeuristic {
        match self {
            RoutingHeuristicConfig::Fifo => crate::entity::RoutingHeuristic::Fifo,
            RoutingHeuristicConfig::Random => crate::entity::RoutingHeuristic::Random,
            RoutingHeuristicConfig::ShortestQueue => crate::entity::RoutingHeuristic::ShortestQueue,
            RoutingHeuristicConfig::Agent => crate::entity::RoutingHeuristic::Agent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub product_id: String,
    pub interarrival_time_model_id: String,
    #[serde(default)]
    pub location: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: DependencyKindConfig,
    #[serde(default)]
    pub interaction_node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DependencyKindConfig {
    Primitive { primitive_type: String },
    Process { process_id: String },
    Resource { resource_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveData {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub primitive_type: String,
    pub storage_id: String,
    #[serde(default)]
    pub transport_process_id: Option<String>,
    #[serde(default)]
    pub consumable: bool,
}

/// The top-level configuration document (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProductionSystemData {
    pub id: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub time_unit: TimeUnit,
    #[serde(default)]
    pub conwip_number: Option<u32>,
    #[serde(default)]
    pub time_model_data: Vec<TimeModelData>,
    #[serde(default)]
    pub state_data: Vec<StateData>,
    #[serde(default)]
    pub process_data: Vec<ProcessData>,
    #[serde(default)]
    pub port_data: Vec<PortData>,
    #[serde(default)]
    pub node_data: Vec<NodeData>,
    #[serde(default)]
    pub resource_data: Vec<ResourceData>,
    #[serde(default)]
    pub product_data: Vec<ProductData>,
    #[serde(default)]
    pub sink_data: Vec<SinkData>,
    #[serde(default)]
    pub source_data: Vec<SourceData>,
    #[serde(default)]
    pub dependency_data: Vec<DependencyData>,
    #[serde(default)]
    pub primitive_data: Vec<PrimitiveData>,
}

impl ProductionSystemData {
    pub fn read(path: impl AsRef<Path>) -> SimResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> SimResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// The single validation pass of §9: every duplicate-ID and
    /// cross-reference error is collected into one `Vec` before returning,
    /// rather than failing at the first offence.
    pub fn validate(&self) -> SimResult<()> {
        let mut errors = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        let all_ids = self
            .time_model_data
            .iter()
            .map(|x| x.id.as_str())
            .chain(self.state_data.iter().map(|x| x.id.as_str()))
            .chain(self.process_data.iter().map(|x| x.id.as_str()))
            .chain(self.port_data.iter().map(|x| x.id.as_str()))
            .chain(self.node_data.iter().map(|x| x.id.as_str()))
            .chain(self.resource_data.iter().map(|x| x.id.as_str()))
            .chain(self.product_data.iter().map(|x| x.id.as_str()))
            .chain(self.sink_data.iter().map(|x| x.id.as_str()))
            .chain(self.source_data.iter().map(|x| x.id.as_str()))
            .chain(self.dependency_data.iter().map(|x| x.id.as_str()))
            .chain(self.primitive_data.iter().map(|x| x.id.as_str()));

        for id in all_ids {
            if !seen.insert(id) {
                errors.push(format!("duplicate ID: {id}"));
            }
        }

        let time_model_ids: HashSet<&str> = self.time_model_data.iter().map(|t| t.id.as_str()).collect();
        let process_ids: HashSet<&str> = self.process_data.iter().map(|p| p.id.as_str()).collect();
        let port_ids: HashSet<&str> = self.port_data.iter().map(|p| p.id.as_str()).collect();
        let node_ids: HashSet<&str> = self.node_data.iter().map(|n| n.id.as_str()).collect();
        let dependency_ids: HashSet<&str> = self.dependency_data.iter().map(|d| d.id.as_str()).collect();

        let check_tm = |id: &str, errors: &mut Vec<String>| {
            if !time_model_ids.contains(id) {
                errors.push(format!("unknown time model reference: {id}"));
            }
        };
        let check_dependency = |id: &Option<String>, errors: &mut Vec<String>| {
            if let Some(id) = id {
                if !dependency_ids.contains(id.as_str()) {
                    errors.push(format!("unknown dependency reference: {id}"));
                }
            }
        };

        for p in &self.process_data {
            match &p.kind {
                ProcessKindConfig::Production { time_model_id, dependency_id, .. } => {
                    check_tm(time_model_id, &mut errors);
                    check_dependency(dependency_id, &mut errors);
                }
                ProcessKindConfig::Capability { time_model_id, dependency_id, .. } => {
                    check_tm(time_model_id, &mut errors);
                    check_dependency(dependency_id, &mut errors);
                }
                ProcessKindConfig::Transport { time_model_id, loading_tm_id, unloading_tm_id } => {
                    check_tm(time_model_id, &mut errors);
                    if let Some(id) = loading_tm_id {
                        check_tm(id, &mut errors);
                    }
                    if let Some(id) = unloading_tm_id {
                        check_tm(id, &mut errors);
                    }
                }
                ProcessKindConfig::LinkTransport { time_model_id, links, .. } => {
                    check_tm(time_model_id, &mut errors);
                    for (a, b) in links {
                        if !node_ids.contains(a.as_str()) && !port_ids.contains(a.as_str()) {
                            errors.push(format!("link endpoint unresolved: {a}"));
                        }
                        if !node_ids.contains(b.as_str()) && !port_ids.contains(b.as_str()) {
                            errors.push(format!("link endpoint unresolved: {b}"));
                        }
                    }
                }
                ProcessKindConfig::Rework { time_model_id, reworked_process_ids, .. } => {
                    check_tm(time_model_id, &mut errors);
                    for r in reworked_process_ids {
                        if !process_ids.contains(r.as_str()) {
                            errors.push(format!("rework references unknown process: {r}"));
                        }
                    }
                }
                ProcessKindConfig::Compound { process_ids: inner } => {
                    for id in inner {
                        if !process_ids.contains(id.as_str()) {
                            errors.push(format!("compound references unknown process: {id}"));
                        }
                    }
                }
                ProcessKindConfig::RequiredCapability { .. } | ProcessKindConfig::ProcessModel { .. } => {}
            }
        }

        for r in &self.resource_data {
            if r.port_ids.is_empty() && r.subresource_ids.is_empty() {
                errors.push(format!("resource without a port: {}", r.id));
            }
            for pid in &r.port_ids {
                if !port_ids.contains(pid.as_str()) {
                    errors.push(format!("resource {} references unknown port: {pid}", r.id));
                }
            }
            for proc_ref in &r.processes {
                if !process_ids.contains(proc_ref.process_id.as_str()) {
                    errors.push(format!("resource {} references unknown process: {}", r.id, proc_ref.process_id));
                }
                if proc_ref.capacity > r.capacity && r.capacity != 0 {
                    errors.push(format!(
                        "resource {} process {} capacity {} exceeds resource capacity {}",
                        r.id, proc_ref.process_id, proc_ref.capacity, r.capacity
                    ));
                }
            }
            if !r.subresource_ids.is_empty() {
                let has_input = r.port_ids.iter().any(|p| {
                    self.port_data.iter().any(|pd| {
                        &pd.id == p && matches!(pd.interface_type, InterfaceType::Input | InterfaceType::InputOutput)
                    })
                });
                let has_output = r.port_ids.iter().any(|p| {
                    self.port_data.iter().any(|pd| {
                        &pd.id == p && matches!(pd.interface_type, InterfaceType::Output | InterfaceType::InputOutput)
                    })
                });
                if r.port_ids.is_empty() || (!has_input && !has_output) {
                    // SystemResource ports are optional at this layer (its
                    // subresources carry the real ports); nothing to flag.
                }
            } else {
                let has_input = r.port_ids.iter().any(|p| {
                    self.port_data.iter().any(|pd| {
                        &pd.id == p && matches!(pd.interface_type, InterfaceType::Input | InterfaceType::InputOutput)
                    })
                });
                let has_output = r.port_ids.iter().any(|p| {
                    self.port_data.iter().any(|pd| {
                        &pd.id == p && matches!(pd.interface_type, InterfaceType::Output | InterfaceType::InputOutput)
                    })
                });
                let is_transport = r.processes.iter().any(|pr| {
                    matches!(
                        self.process_data.iter().find(|p| p.id == pr.process_id).map(|p| &p.kind),
                        Some(ProcessKindConfig::Transport { .. }) | Some(ProcessKindConfig::LinkTransport { .. })
                    )
                });
                if !is_transport && (!has_input || !has_output) {
                    errors.push(format!("resource {} missing an input or output capable port", r.id));
                }
            }
        }

        for p in &self.port_data {
            // Resource-owned ports always carry a location (§9 canonical
            // reading); source/sink logical queues do not require one.
            let owned_by_resource = self.resource_data.iter().any(|r| r.port_ids.contains(&p.id));
            if owned_by_resource && p.location.is_none() {
                errors.push(format!("port {} missing a location", p.id));
            }
        }

        for product in &self.product_data {
            for step in &product.process_model {
                if !process_ids.contains(step.process_id.as_str()) {
                    errors.push(format!("product {} references unknown process: {}", product.id, step.process_id));
                }
            }
        }

        for source in &self.source_data {
            if !self.product_data.iter().any(|p| p.id == source.product_id) {
                errors.push(format!("source {} references unknown product: {}", source.id, source.product_id));
            }
            check_tm(&source.interarrival_time_model_id, &mut errors);
        }

        let resource_ids: HashSet<&str> = self.resource_data.iter().map(|r| r.id.as_str()).collect();
        for d in &self.dependency_data {
            match &d.kind {
                DependencyKindConfig::Process { process_id } => {
                    if !process_ids.contains(process_id.as_str()) {
                        errors.push(format!("dependency {} references unknown process: {process_id}", d.id));
                    }
                }
                DependencyKindConfig::Resource { resource_id } => {
                    if !resource_ids.contains(resource_id.as_str()) {
                        errors.push(format!("dependency {} references unknown resource: {resource_id}", d.id));
                    }
                }
                DependencyKindConfig::Primitive { .. } => {}
            }
            if let Some(node_id) = &d.interaction_node_id {
                if !node_ids.contains(node_id.as_str()) && !port_ids.contains(node_id.as_str()) {
                    errors.push(format!("dependency {} references unknown interaction node: {node_id}", d.id));
                }
            }
        }

        for p in &self.primitive_data {
            if !port_ids.contains(p.storage_id.as_str()) && !node_ids.contains(p.storage_id.as_str()) {
                errors.push(format!("primitive {} references unknown storage: {}", p.id, p.storage_id));
            }
            if let Some(tpid) = &p.transport_process_id {
                if !process_ids.contains(tpid.as_str()) {
                    errors.push(format!("primitive {} references unknown transport process: {tpid}", p.id));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SimError::ConfigValidation(errors))
        }
    }

    /// MD5 hex digest of the *functional* content: descriptions/comments are
    /// dropped and unordered lists are sorted by ID before hashing, so
    /// structurally-equal configs reordered differently hash identically.
    pub fn hash(&self) -> String {
        let mut canonical = self.clone();
        canonical.strip_descriptions();
        canonical.sort_unordered_lists();
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Md5::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    fn strip_descriptions(&mut self) {
        for t in &mut self.time_model_data {
            t.description = None;
        }
        for s in &mut self.state_data {
            s.description = None;
        }
        for p in &mut self.process_data {
            p.description = None;
        }
        for p in &mut self.port_data {
            p.description = None;
        }
        for n in &mut self.node_data {
            n.description = None;
        }
        for r in &mut self.resource_data {
            r.description = None;
        }
        for p in &mut self.product_data {
            p.description = None;
        }
        for s in &mut self.sink_data {
            s.description = None;
        }
        for s in &mut self.source_data {
            s.description = None;
        }
        for d in &mut self.dependency_data {
            d.description = None;
        }
        for p in &mut self.primitive_data {
            p.description = None;
        }
    }

    fn sort_unordered_lists(&mut self) {
        self.time_model_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.state_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.process_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.port_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.node_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.resource_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.product_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.sink_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.source_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.dependency_data.sort_by(|a, b| a.id.cmp(&b.id));
        self.primitive_data.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

pub fn default_metric() -> Metric {
    Metric::Manhattan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ProductionSystemData {
        ProductionSystemData {
            id: "sys1".into(),
            seed: 7,
            time_model_data: vec![TimeModelData {
                id: "tm1".into(),
                description: Some("docs only".into()),
                config: TimeModelConfig::Constant { location: 1.0 },
                batch: 1,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn read_write_round_trips() {
        let data = minimal();
        let dir = std::env::temp_dir().join(format!("prodsim_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        data.write(&path).unwrap();
        let read_back = ProductionSystemData::read(&path).unwrap();
        assert_eq!(read_back.id, data.id);
        assert_eq!(read_back.time_model_data.len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn hash_is_stable_across_reordering_and_ignores_descriptions() {
        let mut a = minimal();
        a.time_model_data.push(TimeModelData {
            id: "tm2".into(),
            description: None,
            config: TimeModelConfig::Constant { location: 2.0 },
            batch: 1,
        });
        let mut b = a.clone();
        b.time_model_data.reverse();
        b.time_model_data[0].description = Some("a different comment".into());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn validate_collects_every_duplicate_and_reference_error_together() {
        let mut data = minimal();
        data.process_data.push(ProcessData {
            id: "tm1".into(), // duplicate against the time model id
            description: None,
            kind: ProcessKindConfig::Production { time_model_id: "missing_tm".into(), failure_rate: 0.0, dependency_id: None },
        });
        let err = data.validate().unwrap_err();
        match err {
            SimError::ConfigValidation(errs) => {
                assert!(errs.iter().any(|e| e.contains("duplicate ID")));
                assert!(errs.iter().any(|e| e.contains("unknown time model reference")));
            }
            other => panic!("expected ConfigValidation, got {other:?}"),
        }
    }
}

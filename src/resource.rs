//! Resources (C6): service units with capacity, processes, states, ports and
//! a controller. Each resource exclusively owns its states and its
//! controller (§3 Ownership); both are embedded fields rather than
//! separately registered, so dropping a `Resource` out of the `Simulation`
//! registry drops everything it owns with it.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::distribution::TimeModel;
use crate::request::Request;
use crate::state::{ActiveFlag, ChargingState};
use crate::time::Notifier;

/// One configured production/capability slot. Resources advertise one
/// `ResourceProcess` per `(processId, processCapacity)` pair in `processIds`
/// / `processCapacities` (§3 Resource).
#[derive(Debug, Clone)]
pub struct ResourceProcess {
    pub process_id: String,
    pub capacity: u32,
}

/// The seven state kinds of §4.5, minus the data every kind shares (id,
/// logging) which lives on [`ResourceState`] itself.
pub enum StateKindData {
    Production,
    Transport,
    Setup { from_process: Option<String>, to_process: String, time_model: TimeModel },
    BreakDown { time_to_failure: TimeModel, repair_time: TimeModel, target_process_id: Option<String> },
    Charging(ChargingState),
    NonScheduled { time_model: TimeModel },
}

pub struct ResourceState {
    pub id: String,
    pub data: StateKindData,
}

/// Control policies (§4.7). Stable sorts; ties preserve FIFO, since
/// `Vec::sort_by_key`/`sort_by` in std are documented stable.
pub enum ControlPolicy {
    Fifo,
    Lifo,
    Spt,
    SptTransport,
    NearestOriginLongestTargetOutput,
    NearestOriginShortestTargetInput,
    /// The RL hook (§4.7/§9): an external strategy supplied at configuration
    /// time, swapped in by the caller before `Run`. No RL runtime is embedded
    /// here — this crate only provides the seam.
    Agent(Rc<dyn Fn(&mut Vec<Rc<Request>>)>),
}

impl ControlPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ControlPolicy::Fifo => "fifo",
            ControlPolicy::Lifo => "lifo",
            ControlPolicy::Spt => "spt",
            ControlPolicy::SptTransport => "spt_transport",
            ControlPolicy::NearestOriginLongestTargetOutput => "nearest_origin_longest_target_output",
            ControlPolicy::NearestOriginShortestTargetInput => "nearest_origin_shortest_target_input",
            ControlPolicy::Agent(_) => "agent",
        }
    }
}

/// Every resource's controller (§4.7): a pending-request queue, the policy
/// that sorts it, and the notifier its own loop and the router both wait on.
pub struct Controller {
    pub policy: ControlPolicy,
    pub pending: VecDeque<Rc<Request>>,
    pub state_changed: Notifier,
    /// `Some(n)` turns this into the batch controller of §4.7: after popping
    /// one request, up to `n` more same-process same-product-type requests
    /// are drained and given the single sampled processing time.
    pub batch_size: Option<u32>,
    pub reserved_requests: u32,
    pub running: u32,
}

impl Controller {
    pub fn new(policy: ControlPolicy) -> Self {
        Controller {
            policy,
            pending: VecDeque::new(),
            state_changed: Notifier::new(),
            batch_size: None,
            reserved_requests: 0,
            running: 0,
        }
    }

    pub fn enqueue(&mut self, request: Rc<Request>) {
        self.pending.push_back(request);
        self.state_changed.notify();
    }

    pub fn queue_len(&self) -> usize {
        self.pending.len()
    }

    /// Applies the control policy in place. `rng_shuffle` supplies the
    /// deterministic-under-seed reshuffle for `random`-style policies
    /// elsewhere (router heuristics); controller policies here never
    /// shuffle, they sort.
    pub fn apply_policy(&mut self, expected_time: impl Fn(&Request) -> f64) {
        match &self.policy {
            ControlPolicy::Fifo => {}
            ControlPolicy::Lifo => {
                let mut v: Vec<_> = self.pending.drain(..).collect();
                v.reverse();
                self.pending = v.into();
            }
            ControlPolicy::Spt => {
                let mut v: Vec<_> = self.pending.drain(..).collect();
                v.sort_by(|a, b| expected_time(a).partial_cmp(&expected_time(b)).unwrap());
                self.pending = v.into();
            }
            ControlPolicy::SptTransport => {
                let mut v: Vec<_> = self.pending.drain(..).collect();
                v.sort_by(|a, b| expected_time(a).partial_cmp(&expected_time(b)).unwrap());
                self.pending = v.into();
            }
            ControlPolicy::NearestOriginLongestTargetOutput | ControlPolicy::NearestOriginShortestTargetInput => {
                // Ranking against live port lengths requires the registries
                // held by `Simulation`; the router applies the secondary key
                // there (see `router::sort_by_shortest_queue`). Here we only
                // guarantee FIFO stability is preserved for equal keys.
            }
            ControlPolicy::Agent(f) => {
                let mut v: Vec<_> = self.pending.drain(..).collect();
                f(&mut v);
                self.pending = v.into();
            }
        }
    }
}

/// A service unit (§3/§4.6). Plain fields rather than a simpy-style
/// semaphore: capacity accounting is computed on demand from `running` /
/// `reserved_requests` / `blocked_capacity`, which is equivalent and easier
/// to reason about in a single-threaded cooperative engine.
pub struct Resource {
    pub id: String,
    pub capacity: u32,
    pub location: (f64, f64),
    pub can_move: bool,
    pub processes: Vec<ResourceProcess>,
    pub input_ports: Vec<String>,
    pub output_ports: Vec<String>,
    pub states: Vec<ResourceState>,
    pub controller: Controller,
    pub active: ActiveFlag,
    /// Per-process active flags, lazily meaningful only for resources with a
    /// `ProcessBreakDownState` targeting that process id.
    pub process_active: HashMap<String, ActiveFlag>,
    pub current_setup: Option<String>,
    pub reserved_setup: Option<String>,
    pub blocked_capacity: u32,
    pub bound: bool,
    /// Subresource ids for a `SystemResource` (§4.6); empty for a plain one.
    pub subresource_ids: Vec<String>,
}

impl Resource {
    pub fn new(id: impl Into<String>, capacity: u32, location: (f64, f64), policy: ControlPolicy) -> Self {
        Resource {
            id: id.into(),
            capacity,
            location,
            can_move: false,
            processes: vec![],
            input_ports: vec![],
            output_ports: vec![],
            states: vec![],
            controller: Controller::new(policy),
            active: ActiveFlag::default(),
            process_active: HashMap::new(),
            current_setup: None,
            reserved_setup: None,
            blocked_capacity: 0,
            bound: false,
            subresource_ids: vec![],
        }
    }

    pub fn is_system_resource(&self) -> bool {
        !self.subresource_ids.is_empty()
    }

    /// `SystemResource` treats a declared capacity of 0 as infinite (§4.6).
    pub fn effective_capacity(&self) -> u32 {
        if self.is_system_resource() && self.capacity == 0 {
            u32::MAX
        } else {
            self.capacity
        }
    }

    /// Capacity available for the currently (or about-to-be, if a setup is
    /// in flight) active setup's process; falls back to the base capacity
    /// for resources with no per-process capacities (e.g. transporters,
    /// process-model setups).
    pub fn capacity_for_current_setup(&self) -> u32 {
        let setup = self.reserved_setup.as_ref().or(self.current_setup.as_ref());
        match setup {
            Some(pid) => self
                .processes
                .iter()
                .find(|p| &p.process_id == pid)
                .map(|p| p.capacity)
                .unwrap_or_else(|| self.effective_capacity()),
            None => self.effective_capacity(),
        }
    }

    /// `freeCapacity = capacityForCurrentSetup - running - reservedRequests`,
    /// further reduced by any capacity a transport handler has blocked for
    /// the duration of an in-flight move (§4.7).
    pub fn free_capacity(&self) -> i64 {
        self.capacity_for_current_setup() as i64
            - self.controller.running as i64
            - self.controller.reserved_requests as i64
            - self.blocked_capacity as i64
    }

    pub fn is_full(&self) -> bool {
        self.free_capacity() <= 0
    }

    pub fn in_setup(&self) -> bool {
        self.reserved_setup.is_some() && self.reserved_setup != self.current_setup
    }

    pub fn advertises(&self, process_id: &str) -> bool {
        self.processes.iter().any(|p| p.process_id == process_id)
    }

    pub fn process_capacity(&self, process_id: &str) -> Option<u32> {
        self.processes.iter().find(|p| p.process_id == process_id).map(|p| p.capacity)
    }
}

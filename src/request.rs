//! Requests (§3): the routed unit of work that flows from an entity, through
//! the router, into a resource's controller and handler.

use std::rc::Rc;

use crate::time::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Production,
    Transport,
    PrimitiveDependency,
    ProcessDependency,
    ResourceDependency,
    PrimitiveFinishedDependency,
    ProcessModel,
    Rework,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Created,
    Routed,
    Matched,
    Running,
    Completed,
}

/// Per-request completion/dependency latches. Plain `Notifier`s rather than
/// one-shot `Event`s, matching the spec's "fires all pending awaiters" rule
/// for `dependenciesReady`/`completed`.
#[derive(Clone, Default)]
pub struct RequestEvents {
    pub completed: Notifier,
    pub dependencies_requested: Notifier,
    pub dependencies_ready: Notifier,
    pub dependency_release_event: Notifier,
}

pub struct Request {
    pub id: String,
    pub request_type: RequestType,
    pub process_id: String,
    pub requesting_item_id: String,
    pub resource_id: Option<String>,
    pub origin: Option<String>,
    pub target: Option<String>,
    pub origin_port: Option<String>,
    pub target_port: Option<String>,
    pub route: Option<Vec<String>>,
    pub capacity_required: u32,
    pub required_dependencies: Vec<Rc<Request>>,
    pub resolved_dependency: Option<String>,
    pub status: std::cell::Cell<RequestStatus>,
    /// Set by the resource handler when a `Production`/`Capability` process
    /// fails (§4.4's per-process `failureRate`); the product lifecycle task
    /// inspects this once `events.completed` fires to decide between
    /// continuing the process model and routing to rework.
    pub failed: std::cell::Cell<bool>,
    pub events: RequestEvents,
}

impl Request {
    pub fn new(id: impl Into<String>, request_type: RequestType, process_id: impl Into<String>, requesting_item_id: impl Into<String>) -> Self {
        Request {
            id: id.into(),
            request_type,
            process_id: process_id.into(),
            requesting_item_id: requesting_item_id.into(),
            resource_id: None,
            origin: None,
            target: None,
            origin_port: None,
            target_port: None,
            route: None,
            capacity_required: 1,
            required_dependencies: vec![],
            resolved_dependency: None,
            status: std::cell::Cell::new(RequestStatus::Created),
            failed: std::cell::Cell::new(false),
            events: RequestEvents::default(),
        }
    }

    /// `"<kind>:<ID-or-capability>"` lookup key, as carried by the process it
    /// targets — requests are matched against compatibility tables keyed the
    /// same way processes are (§4.4).
    pub fn process_signature(&self, kind: &str) -> String {
        format!("{kind}:{}", self.process_id)
    }
}

/// Route validity (§8): `route[0] == originPort.locatable`, `route[-1] ==
/// targetPort.locatable`, every consecutive pair an edge of the link graph.
pub fn route_is_valid(route: &[String], origin_locatable: &str, target_locatable: &str) -> bool {
    match (route.first(), route.last()) {
        (Some(first), Some(last)) => first == origin_locatable && last == target_locatable,
        _ => false,
    }
}

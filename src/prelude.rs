pub use crate::config::{
    ControlPolicyConfig, DependencyData, DependencyKindConfig, NodeData, PortData, PortTypeConfig,
    PrimitiveData, ProcessData, ProcessKindConfig, ProcessModelStepConfig, ProductData,
    ProductionSystemData, ResourceData, ResourceProcessRef, SinkData, SourceData, StateData,
    StateKindConfig, TimeModelData, TimeUnit,
};
pub use crate::distribution::{Metric, TimeModel, TimeModelConfig, TimeModelFactory};
pub use crate::entity::{Entity, Primitive, Product, ProcessModel, ProcessNode, ReworkMapping, RoutingHeuristic};
pub use crate::error::{SimError, SimResult};
pub use crate::logger::Logger;
pub use crate::postprocessor::{PostProcessor, ProductCompletion, ProductTypeKpis, ResourceUtilization};
pub use crate::process::{LinkEndpoints, LinkGraph, Process};
pub use crate::queue::{InterfaceType, PortType, Queue, Store};
pub use crate::request::{Request, RequestEvents, RequestStatus, RequestType};
pub use crate::resource::{ControlPolicy, Controller, Resource, ResourceProcess, ResourceState, StateKindData};
pub use crate::router::ProcessMatcher;
pub use crate::simulation::{Simulation, World};
pub use crate::state::{ActiveFlag, BreakdownLoop, ChargingState, StateInfo, StateKind};
pub use crate::time::{Engine, EngineHandle, SimTime};

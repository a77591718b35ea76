//! Entities & process models (C9).

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ProcessNode {
    pub process_id: String,
    pub predecessors: Vec<usize>,
    pub successors: Vec<usize>,
    pub marked: bool,
}

/// The `{NextPossible() -> [process]; Update(chosen)}` contract shared by
/// both process-model kinds. Each entity holds its own cloned instance so
/// marking never leaks between entities of the same product type.
#[derive(Debug, Clone)]
pub enum ProcessModel {
    List { processes: Vec<String>, cursor: usize },
    PrecedenceGraph { nodes: Vec<ProcessNode> },
}

impl ProcessModel {
    pub fn next_possible(&self) -> Vec<String> {
        match self {
            ProcessModel::List { processes, cursor } => {
                processes.get(*cursor).cloned().into_iter().collect()
            }
            ProcessModel::PrecedenceGraph { nodes } => nodes
                .iter()
                .filter(|n| !n.marked && n.predecessors.iter().all(|p| nodes[*p].marked))
                .map(|n| n.process_id.clone())
                .collect(),
        }
    }

    pub fn update(&mut self, chosen_process_id: &str) {
        match self {
            ProcessModel::List { cursor, processes } => {
                if processes.get(*cursor).map(|p| p.as_str()) == Some(chosen_process_id) {
                    *cursor += 1;
                }
            }
            ProcessModel::PrecedenceGraph { nodes } => {
                if let Some(n) = nodes.iter_mut().find(|n| n.process_id == chosen_process_id && !n.marked) {
                    n.marked = true;
                }
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            ProcessModel::List { processes, cursor } => *cursor >= processes.len(),
            ProcessModel::PrecedenceGraph { nodes } => nodes.iter().all(|n| n.marked),
        }
    }

    pub fn required_process_ids(&self) -> HashSet<String> {
        match self {
            ProcessModel::List { processes, .. } => processes.iter().cloned().collect(),
            ProcessModel::PrecedenceGraph { nodes } => nodes.iter().map(|n| n.process_id.clone()).collect(),
        }
    }
}

/// Blocking vs. non-blocking rework mapping recorded on a product's handler
/// when a production process fails (§4.8 Rework selection).
#[derive(Debug, Clone, Default)]
pub struct ReworkMapping {
    pub blocking: Vec<(String, String)>,
    pub non_blocking: Vec<(String, String)>,
}

impl ReworkMapping {
    pub fn record(&mut self, failed_process_id: &str, rework_process_id: &str, blocking: bool) {
        let entry = (failed_process_id.to_string(), rework_process_id.to_string());
        if blocking {
            self.blocking.push(entry);
        } else {
            self.non_blocking.push(entry);
        }
    }

    pub fn take_blocking(&mut self) -> Option<(String, String)> {
        if self.blocking.is_empty() {
            None
        } else {
            Some(self.blocking.remove(0))
        }
    }

    pub fn take_non_blocking(&mut self) -> Option<(String, String)> {
        if self.non_blocking.is_empty() {
            None
        } else {
            Some(self.non_blocking.remove(0))
        }
    }
}

#[derive(Debug, Clone)]
pub enum RoutingHeuristic {
    Fifo,
    Random,
    ShortestQueue,
    Agent,
}

/// A `Product` entity (§3).
#[derive(Debug, Clone)]
pub struct Product {
    pub id: String,
    pub product_type: String,
    pub process_model: ProcessModel,
    pub transport_process_id: Option<String>,
    pub routing_heuristic: RoutingHeuristic,
    pub current_locatable: String,
    /// The port (if any) the product currently occupies, distinct from
    /// `current_locatable`'s resource/source id — `run_single_process` uses
    /// this to find and release the right `Queue` slot when the product next
    /// moves on (§4.2 Get).
    pub current_port: Option<String>,
    pub current_process: Option<String>,
    pub executed_processes: Vec<String>,
    pub rework: ReworkMapping,
    pub becomes_primitive: bool,
}

impl Product {
    pub fn is_complete(&self) -> bool {
        self.process_model.is_complete() && self.rework.blocking.is_empty()
    }
}

/// A `Primitive` entity: a reusable support item shared by the factory, bound
/// to a dependant for the duration of a dependency.
#[derive(Debug, Clone)]
pub struct Primitive {
    pub id: String,
    pub primitive_type: String,
    pub transport_process_id: Option<String>,
    pub storage_id: String,
    pub bound_to: Option<String>,
    pub consumable: bool,
    pub current_locatable: String,
}

impl Primitive {
    pub fn bind(&mut self, dependant: &str) -> Result<(), crate::error::SimError> {
        if self.bound_to.is_some() {
            return Err(crate::error::SimError::BindingViolation(self.id.clone()));
        }
        self.bound_to = Some(dependant.to_string());
        Ok(())
    }

    pub fn release(&mut self) {
        self.bound_to = None;
    }

    /// A bound primitive's location is delegated to its dependant.
    pub fn effective_locatable<'a>(&'a self, dependant_locatable: Option<&'a str>) -> &'a str {
        match (&self.bound_to, dependant_locatable) {
            (Some(_), Some(loc)) => loc,
            _ => &self.current_locatable,
        }
    }
}

/// A `Lot`: a set of entities routed as one unit.
#[derive(Debug, Clone)]
pub struct Lot {
    pub id: String,
    pub entity_ids: Vec<String>,
    pub primary_entity_id: String,
}

impl Lot {
    pub fn size(&self, entity_sizes: &HashMap<String, u32>) -> u32 {
        self.entity_ids.iter().map(|id| entity_sizes.get(id).copied().unwrap_or(1)).sum()
    }
}

#[derive(Debug, Clone)]
pub enum Entity {
    Product(Product),
    Primitive(Primitive),
    Lot(Lot),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Product(p) => &p.id,
            Entity::Primitive(p) => &p.id,
            Entity::Lot(l) => &l.id,
        }
    }
}

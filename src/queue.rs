//! Queue / Port / Store (C2): bounded multisets of entity references with
//! advance reservation (`pendingPut`) and back-pressure. Grounds the teacher's
//! `DiscreteStock`/`ItemDeque` pattern (`components/discrete.rs`) generalized
//! from a fixed `Vec<i32>`/`i32` payload to arbitrary entity IDs and a
//! `capacity == 0 -> unbounded` convention.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::time::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceType {
    Input,
    Output,
    InputOutput,
}

impl InterfaceType {
    pub fn is_origin_capable(&self) -> bool {
        matches!(self, InterfaceType::Output | InterfaceType::InputOutput)
    }
    pub fn is_target_capable(&self) -> bool {
        matches!(self, InterfaceType::Input | InterfaceType::InputOutput)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortType {
    Queue,
    Store,
}

/// A bounded multiset of entity IDs. `capacity == 0` means unbounded, per
/// the configuration convention (§6).
pub struct Queue {
    pub id: String,
    pub capacity: u32,
    pub interface_type: InterfaceType,
    pub port_type: PortType,
    pub location: Option<(f64, f64)>,
    items: VecDeque<String>,
    pending_put: u32,
    pub state_changed: Notifier,
}

impl Queue {
    pub fn new(
        id: impl Into<String>,
        capacity: u32,
        interface_type: InterfaceType,
        port_type: PortType,
        location: Option<(f64, f64)>,
    ) -> Self {
        Queue {
            id: id.into(),
            capacity,
            interface_type,
            port_type,
            location,
            items: VecDeque::new(),
            pending_put: 0,
            state_changed: Notifier::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn is_unbounded(&self) -> bool {
        self.capacity == 0
    }

    /// `Full` — `capacity - pendingPut - len <= 0`.
    pub fn is_full(&self) -> bool {
        if self.is_unbounded() {
            return false;
        }
        self.capacity as i64 - self.pending_put as i64 - self.items.len() as i64 <= 0
    }

    /// `Reserve()` — advance-reserves a slot for a future `put`.
    pub fn reserve(&mut self) -> Result<(), SimError> {
        if !self.is_unbounded() && self.pending_put + self.items.len() as u32 + 1 > self.capacity {
            return Err(SimError::CapacityExceeded(self.id.clone()));
        }
        self.pending_put += 1;
        Ok(())
    }

    pub fn cancel_reservation(&mut self) {
        self.pending_put = self.pending_put.saturating_sub(1);
    }

    /// `Put(id)` — returns `true` if admitted immediately (non-blocking
    /// variant used by the async handlers, which retry on `state_changed`
    /// until this returns `true`), consuming a matching reservation if one is
    /// outstanding.
    pub fn try_put(&mut self, id: String, consumes_reservation: bool) -> bool {
        if !self.is_unbounded() {
            // A put that isn't consuming its own reservation must still
            // respect slots other callers hold via `reserve()`.
            let others_pending = if consumes_reservation { self.pending_put.saturating_sub(1) } else { self.pending_put };
            if self.items.len() as u32 + others_pending >= self.capacity {
                return false;
            }
        }
        if consumes_reservation && self.pending_put > 0 {
            self.pending_put -= 1;
        }
        self.items.push_back(id);
        self.state_changed.notify();
        true
    }

    /// `Get(id)` — removes by ID (selector, not FIFO) if present.
    pub fn try_get(&mut self, id: &str) -> Option<String> {
        if let Some(pos) = self.items.iter().position(|x| x == id) {
            let item = self.items.remove(pos);
            self.state_changed.notify();
            item
        } else {
            None
        }
    }

    /// Removes and returns the front item (FIFO), used where no selector ID
    /// is known in advance (e.g. source/sink logical queues).
    pub fn try_get_front(&mut self) -> Option<String> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.state_changed.notify();
        }
        item
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|x| x == id)
    }

    pub fn peek_front(&self) -> Option<&String> {
        self.items.front()
    }
}

/// A store is a queue additionally exposed through one or more physical
/// store-ports, each with its own location (multiple access points for one
/// logical storage).
pub struct Store {
    pub queue: Queue,
    pub store_ports: Vec<StorePort>,
}

pub struct StorePort {
    pub id: String,
    pub location: (f64, f64),
}

impl Store {
    pub fn new(queue: Queue) -> Self {
        Store { queue, store_ports: vec![] }
    }

    pub fn add_store_port(&mut self, id: impl Into<String>, location: (f64, f64)) {
        self.store_ports.push(StorePort { id: id.into(), location });
    }
}

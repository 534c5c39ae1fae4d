//! Common state composed into module structs

use std::collections::HashMap;

/// Fields most modules need: their registered name, update interval and a
/// cache of dynamic entities (units, queues, hosts) seen across cycles.
#[derive(Debug, Clone)]
pub struct Base {
    module: &'static str,
    update_every: u64,
    cycle: u64,
    seen: HashMap<String, u64>,
}

impl Base {
    pub fn new(module: &'static str) -> Self {
        Self {
            module,
            update_every: crate::confgroup::DEFAULT_UPDATE_EVERY,
            cycle: 0,
            seen: HashMap::new(),
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn update_every(&self) -> u64 {
        self.update_every
    }

    pub fn set_update_every(&mut self, secs: u64) {
        self.update_every = secs.max(1);
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Start a collection cycle for entity tracking
    pub fn begin_cycle(&mut self) {
        self.cycle += 1;
    }

    /// Record an entity as present; returns true the first time it is seen
    pub fn mark_seen(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string(), self.cycle).is_none()
    }

    /// Entities not seen in the current cycle, removed from the cache
    pub fn take_vanished(&mut self) -> Vec<String> {
        let cycle = self.cycle;
        let mut vanished: Vec<String> = self
            .seen
            .iter()
            .filter(|(_, last)| **last != cycle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &vanished {
            self.seen.remove(id);
        }
        vanished.sort();
        vanished
    }
}

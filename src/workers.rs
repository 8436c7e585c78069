use rand::{thread_rng, Rng};
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Worker {
  pub port: u16,
}

/// The backend pool: an ordered worker list plus a membership set for O(1)
/// validation of session-supplied ports. Replaced wholesale by
/// `Balancer::set_workers`, never mutated in place.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
  workers: Vec<Worker>,
  ports: HashSet<u16>,
}

impl WorkerRegistry {
  pub fn new(workers: Vec<Worker>) -> WorkerRegistry {
    let ports = workers.iter().map(|worker| worker.port).collect();
    WorkerRegistry { workers, ports }
  }

  pub fn workers(&self) -> &[Worker] {
    &self.workers
  }

  pub fn len(&self) -> usize {
    self.workers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.workers.is_empty()
  }

  pub fn contains(&self, port: u16) -> bool {
    self.ports.contains(&port)
  }

  pub fn port_at(&self, index: usize) -> Option<u16> {
    self.workers.get(index).map(|worker| worker.port)
  }

  pub fn random_port(&self) -> Option<u16> {
    if self.workers.is_empty() {
      return None;
    }
    let mut rng = thread_rng();
    Some(self.workers[rng.gen_range(0..self.workers.len())].port)
  }
}

use crate::workers::WorkerRegistry;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEntry {
  pub port: u16,
  pub quota: u32,
}

/// The current budget of traffic to steer toward underloaded workers.
/// The poller publishes a fresh table each cycle; dispatches drain it from
/// the tail (the least busy worker) until it runs dry, after which
/// selection falls back to a uniform random pick from the registry.
#[derive(Debug, Default)]
pub struct QuotaSelector {
  table: Mutex<Vec<QuotaEntry>>,
}

impl QuotaSelector {
  pub fn new() -> QuotaSelector {
    QuotaSelector::default()
  }

  /// Replaces the table wholesale. Entries are kept sorted ascending by
  /// quota so the tail is always the least busy pick.
  pub fn publish(&self, mut entries: Vec<QuotaEntry>) {
    entries.sort_by_key(|entry| entry.quota);
    *self.table.lock().unwrap() = entries;
  }

  /// Spends one quota unit of the least busy worker, popping the entry
  /// once exhausted. Decrement and pop happen under one lock; each unit
  /// is spent exactly once even under concurrent dispatch.
  pub fn choose_target_port(&self, registry: &WorkerRegistry) -> Option<u16> {
    let mut table = self.table.lock().unwrap();
    if let Some(entry) = table.last_mut() {
      entry.quota -= 1;
      let port = entry.port;
      if entry.quota < 1 {
        table.pop();
      }
      return Some(port);
    }
    drop(table);
    registry.random_port()
  }

  /// Uniform random worker, ignoring quotas. Used for upgrade handshakes
  /// whose session names a port the registry no longer knows.
  pub fn random_port(&self, registry: &WorkerRegistry) -> Option<u16> {
    registry.random_port()
  }

  pub fn snapshot(&self) -> Vec<QuotaEntry> {
    self.table.lock().unwrap().clone()
  }
}

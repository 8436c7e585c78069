use super::Target;
use crate::workers::WorkerRegistry;
use hyper::{Body, Request};
use std::net::SocketAddr;

/// Deterministic client-IP balancing: the same caller always lands on the
/// same worker as long as the registry is unchanged.
pub fn resolve_target(
  request: &Request<Body>,
  client_address: &SocketAddr,
  registry: &WorkerRegistry,
) -> Option<Target> {
  if registry.is_empty() {
    return None;
  }
  let ip = client_ip(request, client_address);
  let index = hash_to_index(&ip, registry.len());
  registry.port_at(index).map(Target::loopback)
}

/// Proxies in front of us put the original caller first in
/// `x-forwarded-for`; everything after the first comma is intermediaries.
fn client_ip(request: &Request<Body>, client_address: &SocketAddr) -> String {
  request
    .headers()
    .get("x-forwarded-for")
    .and_then(|value| value.to_str().ok())
    .map(|value| value.split(',').next().unwrap_or("").trim().to_owned())
    .unwrap_or_else(|| client_address.ip().to_string())
}

pub fn hash_to_index(value: &str, worker_count: usize) -> usize {
  (string_hash(value).unsigned_abs() as usize) % worker_count
}

/// 31-multiply string hash over UTF-16 code units with signed 32-bit
/// wrapping; `abs(h) % n` picks the worker index.
fn string_hash(value: &str) -> i32 {
  let mut hash: i32 = 0;
  for unit in value.encode_utf16() {
    hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(unit as i32);
  }
  hash
}

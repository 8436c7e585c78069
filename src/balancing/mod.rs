use crate::{middleware::Phase, workers::WorkerRegistry};
use hyper::{Body, Request};
use self::quota::QuotaSelector;
use std::{
  fmt,
  net::{IpAddr, Ipv4Addr, SocketAddr},
};

pub mod ip_hash;
pub mod quota;
pub mod session;

/// Where a single request or upgrade gets proxied to. Workers only listen
/// on the local machine, so the host is always loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
  pub host: IpAddr,
  pub port: u16,
}

impl Target {
  pub fn loopback(port: u16) -> Target {
    Target {
      host: IpAddr::V4(Ipv4Addr::LOCALHOST),
      port,
    }
  }

  pub fn authority(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// Selection step of the dispatcher. Smart balancing honors session
/// affinity first and spends poller quota otherwise; non-smart balancing
/// hashes the client IP. Returns `None` when no worker can be chosen, in
/// which case the request is aborted.
pub fn resolve_target(
  request: &Request<Body>,
  client_address: &SocketAddr,
  registry: &WorkerRegistry,
  selector: &QuotaSelector,
  use_smart_balancing: bool,
  phase: Phase,
) -> Option<Target> {
  if use_smart_balancing {
    resolve_smart(request, registry, selector, phase)
  } else {
    ip_hash::resolve_target(request, client_address, registry)
  }
}

fn resolve_smart(
  request: &Request<Body>,
  registry: &WorkerRegistry,
  selector: &QuotaSelector,
  phase: Phase,
) -> Option<Target> {
  match session::resolve_route(request) {
    Some(route) if registry.contains(route.port) => Some(route),
    // The session names a worker that left the pool. Ordinary requests
    // are steered by quota; upgrade handshakes take a random worker.
    Some(_) => {
      let port = match phase {
        Phase::Request => selector.choose_target_port(registry)?,
        Phase::Upgrade => selector.random_port(registry)?,
      };
      Some(Target::loopback(port))
    }
    None => selector.choose_target_port(registry).map(Target::loopback),
  }
}

use crate::{
  balancing::quota::QuotaSelector,
  configuration::{BalancerConfig, Protocol},
  error::{BalancerError, ErrorSink},
  listeners,
  middleware::{Middleware, MiddlewareChain, Phase},
  server::{self, DispatchShared, Scheme},
  status::StatusPoller,
  tls,
  workers::{Worker, WorkerRegistry},
};
use arc_swap::ArcSwap;
use hyper::Client;
use log::info;
use std::{
  net::SocketAddr,
  sync::{Arc, RwLock},
};

/// Startup hook invoked once with a handle to the balancer before it
/// begins listening; the usual place to register middleware.
pub trait BalancerController: Send + Sync {
  fn configure(&self, balancer: &Balancer);
}

/// The balancer itself. Construct it from a [`BalancerConfig`], optionally
/// register middleware and an error subscriber, then `start()` it; `start`
/// only returns on a fatal listener error.
pub struct Balancer {
  config: BalancerConfig,
  registry: Arc<ArcSwap<WorkerRegistry>>,
  selector: Arc<QuotaSelector>,
  request_chain: Arc<MiddlewareChain>,
  upgrade_chain: Arc<MiddlewareChain>,
  sink: Arc<ErrorSink>,
  controller: RwLock<Option<Box<dyn BalancerController>>>,
}

impl Balancer {
  pub fn new(config: BalancerConfig) -> Balancer {
    let registry = Arc::new(ArcSwap::from_pointee(WorkerRegistry::new(config.workers.clone())));
    Balancer {
      registry,
      selector: Arc::new(QuotaSelector::new()),
      request_chain: Arc::new(MiddlewareChain::new()),
      upgrade_chain: Arc::new(MiddlewareChain::new()),
      sink: Arc::new(ErrorSink::new()),
      controller: RwLock::new(None),
      config,
    }
  }

  /// Advertised host name; dispatch itself always targets loopback.
  pub fn host(&self) -> &str {
    &self.config.host
  }

  pub fn set_controller(&self, controller: Box<dyn BalancerController>) {
    *self.controller.write().unwrap() = Some(controller);
  }

  pub fn add_middleware(&self, phase: Phase, handler: Arc<dyn Middleware>) {
    match phase {
      Phase::Request => self.request_chain.append(handler),
      Phase::Upgrade => self.upgrade_chain.append(handler),
    }
  }

  /// Replaces the whole worker pool atomically. In-flight dispatches keep
  /// operating on the registry they already loaded.
  pub fn set_workers(&self, workers: Vec<Worker>) {
    self.registry.store(Arc::new(WorkerRegistry::new(workers)));
  }

  pub fn on_error<F>(&self, callback: F)
  where
    F: Fn(&BalancerError) + Send + Sync + 'static,
  {
    self.sink.subscribe(Box::new(callback));
  }

  pub async fn start(&self) -> Result<(), BalancerError> {
    self.run_controller();

    if self.config.use_smart_balancing {
      let poller = Arc::new(StatusPoller::new(
        self.registry.clone(),
        self.selector.clone(),
        self.sink.clone(),
        self.config.status_check_interval(),
        self.config.check_status_timeout(),
        self.config.status_url.clone(),
        self.config.data_key.clone(),
        self.config.balancer_count,
      ));
      tokio::spawn(poller.run());
    }

    let shared = Arc::new(DispatchShared {
      registry: self.registry.clone(),
      selector: self.selector.clone(),
      request_chain: self.request_chain.clone(),
      upgrade_chain: self.upgrade_chain.clone(),
      sink: self.sink.clone(),
      client: Client::new(),
      use_smart_balancing: self.config.use_smart_balancing,
    });

    let address = SocketAddr::from(([0, 0, 0, 0], self.config.source_port));
    info!("listening on {} as {}", address, self.config.host);

    match self.config.protocol {
      Protocol::Http => {
        let acceptor = listeners::bind_http(address).await?;
        server::serve(acceptor, shared, Scheme::Http).await?;
      }
      Protocol::Https => {
        let options = self
          .config
          .protocol_options
          .as_ref()
          .ok_or_else(|| BalancerError::Config("protocol is https but protocol_options is missing".into()))?;
        let tls_config = tls::server_config(&options.certificate_path, &options.private_key_path)?;
        let acceptor = listeners::bind_https(address, tls_config, self.sink.clone()).await?;
        server::serve(acceptor, shared, Scheme::Https).await?;
      }
    }
    Ok(())
  }

  fn run_controller(&self) {
    if let Some(controller) = self.controller.write().unwrap().take() {
      controller.configure(self);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn config(ports: &[u16]) -> BalancerConfig {
    let workers = ports.iter().map(|port| format!("[[workers]]\nport = {}\n", port)).collect::<String>();
    BalancerConfig::from_toml_str(&format!("source_port = 9000\n{}", workers)).unwrap()
  }

  #[test]
  fn set_workers_replaces_registry_and_membership() {
    let balancer = Balancer::new(config(&[8001, 8002]));

    assert_eq!(balancer.registry.load().contains(8001), true);

    balancer.set_workers(vec![Worker { port: 9001 }]);

    let registry = balancer.registry.load();
    assert_eq!(registry.contains(8001), false);
    assert_eq!(registry.contains(9001), true);
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn controller_runs_exactly_once() {
    struct CountingController(Arc<AtomicUsize>);

    impl BalancerController for CountingController {
      fn configure(&self, balancer: &Balancer) {
        self.0.fetch_add(1, Ordering::SeqCst);
        balancer.set_workers(vec![Worker { port: 7001 }]);
      }
    }

    let balancer = Balancer::new(config(&[8001]));
    let invocations = Arc::new(AtomicUsize::new(0));
    balancer.set_controller(Box::new(CountingController(invocations.clone())));

    balancer.run_controller();
    balancer.run_controller();

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    // the controller's reconfiguration took effect
    assert_eq!(balancer.registry.load().contains(7001), true);
  }

  #[test]
  fn host_reports_configured_metadata() {
    let balancer = Balancer::new(config(&[]));

    assert_eq!(balancer.host(), "localhost");
  }
}

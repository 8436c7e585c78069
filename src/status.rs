use crate::{
  balancing::quota::{QuotaEntry, QuotaSelector},
  error::{BalancerError, ErrorSink},
  workers::WorkerRegistry,
};
use arc_swap::ArcSwap;
use futures::future::join_all;
use hyper::{body, client::HttpConnector, Body, Client, Method, Request};
use hyper_timeout::TimeoutConnector;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

/// What a worker reports about itself. Only `clientCount` matters for
/// balancing; whatever else the worker includes is kept as-is.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerReport {
  #[serde(rename = "clientCount")]
  pub client_count: u64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerStatus {
  Known(WorkerReport),
  Unknown,
}

/// Periodically asks every worker for its client count and turns the
/// answers into the quota table the smart dispatch path drains. A worker
/// that fails to answer in time stays in rotation but earns no quota for
/// the cycle.
pub struct StatusPoller {
  registry: Arc<ArcSwap<WorkerRegistry>>,
  selector: Arc<QuotaSelector>,
  sink: Arc<ErrorSink>,
  statuses: Mutex<HashMap<u16, WorkerStatus>>,
  interval: Duration,
  timeout: Duration,
  status_url: String,
  data_key: String,
  balancer_count: u32,
}

impl StatusPoller {
  pub fn new(
    registry: Arc<ArcSwap<WorkerRegistry>>,
    selector: Arc<QuotaSelector>,
    sink: Arc<ErrorSink>,
    interval: Duration,
    timeout: Duration,
    status_url: String,
    data_key: String,
    balancer_count: u32,
  ) -> StatusPoller {
    StatusPoller {
      registry,
      selector,
      sink,
      statuses: Mutex::new(HashMap::new()),
      interval,
      timeout,
      status_url,
      data_key,
      balancer_count: balancer_count.max(1),
    }
  }

  /// Ticks forever. Each cycle runs as its own task, so a slow cycle can
  /// overlap the next one; whichever finishes later wins the publish.
  pub async fn run(self: Arc<Self>) {
    let mut ticker = tokio::time::interval(self.interval);
    loop {
      ticker.tick().await;
      let poller = self.clone();
      tokio::spawn(async move {
        poller.poll_cycle().await;
      });
    }
  }

  pub async fn poll_cycle(&self) {
    let registry = self.registry.load_full();

    let probes = registry.workers().iter().map(|worker| {
      let port = worker.port;
      async move { (port, self.probe_worker(port).await) }
    });

    let mut cycle: HashMap<u16, WorkerStatus> = HashMap::new();
    for (port, outcome) in join_all(probes).await {
      let status = match outcome {
        Ok(report) => WorkerStatus::Known(report),
        Err(error) => {
          self.sink.emit(&error);
          WorkerStatus::Unknown
        }
      };
      cycle.insert(port, status);
    }

    {
      let mut statuses = self.statuses.lock().unwrap();
      for (port, status) in &cycle {
        statuses.insert(*port, status.clone());
      }
    }

    let entries = compute_quotas(&cycle, self.balancer_count);
    debug!("poll cycle complete, publishing {} quota entries", entries.len());
    self.selector.publish(entries);
  }

  async fn probe_worker(&self, port: u16) -> Result<WorkerReport, BalancerError> {
    let mut connector = TimeoutConnector::new(HttpConnector::new());
    connector.set_connect_timeout(Some(self.timeout));
    connector.set_read_timeout(Some(self.timeout));
    connector.set_write_timeout(Some(self.timeout));
    let client = Client::builder().build::<_, Body>(connector);

    let uri = format!("http://localhost:{}{}", port, self.status_url).parse::<hyper::Uri>()?;
    let request = Request::builder()
      .method(Method::POST)
      .uri(uri)
      .header("content-type", "application/json")
      .body(Body::from(json!({ "dataKey": self.data_key }).to_string()))?;

    let response = client.request(request).await?;
    let bytes = body::to_bytes(response.into_body()).await?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  pub fn statuses(&self) -> HashMap<u16, WorkerStatus> {
    self.statuses.lock().unwrap().clone()
  }
}

/// Rebuilds the quota table from one cycle's statuses. The busiest worker
/// is the baseline and earns nothing; every other worker is offered its
/// deficit divided across cooperating balancers. Unreachable workers earn
/// nothing either.
pub fn compute_quotas(statuses: &HashMap<u16, WorkerStatus>, balancer_count: u32) -> Vec<QuotaEntry> {
  let max_clients = statuses
    .values()
    .filter_map(|status| match status {
      WorkerStatus::Known(report) => Some(report.client_count),
      WorkerStatus::Unknown => None,
    })
    .max()
    .unwrap_or(0);

  statuses
    .iter()
    .filter_map(|(port, status)| match status {
      WorkerStatus::Known(report) => {
        let deficit = (max_clients - report.client_count) as f64;
        let quota = (deficit / balancer_count as f64).round() as u32;
        if quota > 0 {
          Some(QuotaEntry { port: *port, quota })
        } else {
          None
        }
      }
      WorkerStatus::Unknown => None,
    })
    .collect()
}

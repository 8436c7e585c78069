use log::error;
use std::{error::Error as StdError, io, sync::RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalancerError {
  #[error("middleware rejected request: {0}")]
  Middleware(String),
  #[error("no workers available for dispatch")]
  NoWorkers,
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error("could not parse configuration: {0}")]
  ConfigParse(#[from] toml::de::Error),
  #[error("worker status is not valid JSON: {0}")]
  StatusFormat(#[from] serde_json::Error),
  #[error("{0}")]
  Http(#[from] hyper::http::Error),
  #[error("{0}")]
  Hyper(#[from] hyper::Error),
  #[error("{0}")]
  InvalidUri(#[from] hyper::http::uri::InvalidUri),
  #[error("{0}")]
  Io(#[from] io::Error),
}

type ErrorCallback = Box<dyn Fn(&BalancerError) + Send + Sync>;

/// Process-wide funnel for asynchronous errors from the listener, the
/// proxy and the status poller. The embedding program subscribes via
/// `Balancer::on_error`; without a subscriber everything goes to the log.
/// Routine client disconnects are dropped before they reach either.
#[derive(Default)]
pub struct ErrorSink {
  callbacks: RwLock<Vec<ErrorCallback>>,
}

impl ErrorSink {
  pub fn new() -> ErrorSink {
    ErrorSink::default()
  }

  pub fn subscribe(&self, callback: ErrorCallback) {
    self.callbacks.write().unwrap().push(callback);
  }

  pub fn emit(&self, error: &BalancerError) {
    if is_benign_disconnect(error) {
      return;
    }
    let callbacks = self.callbacks.read().unwrap();
    if callbacks.is_empty() {
      error!("{}", error);
      return;
    }
    for callback in callbacks.iter() {
      callback(error);
    }
  }
}

/// Connection resets and mid-request hangups from clients are dropped;
/// everything else reaches the sink.
pub fn is_benign_disconnect(error: &BalancerError) -> bool {
  match error {
    BalancerError::Io(source) => is_benign_kind(source.kind()),
    BalancerError::Hyper(source) => {
      source.is_incomplete_message() || source_io_kind(source).map_or(false, is_benign_kind)
    }
    _ => false,
  }
}

fn is_benign_kind(kind: io::ErrorKind) -> bool {
  matches!(kind, io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe)
}

fn source_io_kind(error: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
  let mut source = error.source();
  while let Some(cause) = source {
    if let Some(io_error) = cause.downcast_ref::<io::Error>() {
      return Some(io_error.kind());
    }
    source = cause.source();
  }
  None
}

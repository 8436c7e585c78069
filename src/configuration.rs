use crate::{error::BalancerError, workers::Worker};
use log::{info, warn};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  Http,
  Https,
}

impl Default for Protocol {
  fn default() -> Protocol {
    Protocol::Http
  }
}

/// TLS material for the HTTPS listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolOptions {
  pub certificate_path: String,
  pub private_key_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
  #[serde(default)]
  pub protocol: Protocol,
  pub protocol_options: Option<ProtocolOptions>,
  pub source_port: u16,
  /// Advertised host name. Dispatch always targets loopback regardless.
  #[serde(default = "default_host")]
  pub host: String,
  #[serde(default)]
  pub workers: Vec<Worker>,
  #[serde(default)]
  pub use_smart_balancing: bool,
  /// Opaque token workers expect in the status probe body.
  #[serde(default)]
  pub data_key: String,
  #[serde(default = "default_status_check_interval")]
  pub status_check_interval: u64,
  #[serde(default = "default_check_status_timeout")]
  pub check_status_timeout: u64,
  #[serde(default = "default_status_url")]
  pub status_url: String,
  /// How many cooperating balancers share each worker's deficit.
  #[serde(default = "default_balancer_count")]
  pub balancer_count: u32,
}

fn default_host() -> String {
  "localhost".into()
}

fn default_status_check_interval() -> u64 {
  5000
}

fn default_check_status_timeout() -> u64 {
  10000
}

fn default_status_url() -> String {
  "/~status".into()
}

fn default_balancer_count() -> u32 {
  1
}

impl BalancerConfig {
  pub fn from_toml_str(toml_str: &str) -> Result<BalancerConfig, BalancerError> {
    let config: BalancerConfig = toml::from_str(toml_str)?;
    info!("successfully parsed balancer configuration");
    config.print_warnings();
    Ok(config)
  }

  pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<BalancerConfig, BalancerError> {
    let toml_str = fs::read_to_string(path)?;
    BalancerConfig::from_toml_str(&toml_str)
  }

  pub fn status_check_interval(&self) -> Duration {
    Duration::from_millis(self.status_check_interval)
  }

  pub fn check_status_timeout(&self) -> Duration {
    Duration::from_millis(self.check_status_timeout)
  }

  fn print_warnings(&self) {
    if self.workers.is_empty() {
      warn!("no workers configured, every request will be rejected until set_workers is called");
    }
    if self.balancer_count == 0 {
      warn!("balancer_count must be at least 1, treating it as 1");
    }
    if self.protocol == Protocol::Https && self.protocol_options.is_none() {
      warn!("protocol is https but no protocol_options were supplied, start will fail");
    }
  }
}

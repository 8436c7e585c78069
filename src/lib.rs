//! Session-aware reverse proxy and load balancer for pools of local worker
//! processes. Requests and WebSocket upgrades arrive on one public port
//! and are steered either by deterministic client-IP hashing or by session
//! affinity with a load-based fallback fed by periodic worker status polls.

pub mod balancer;
pub mod balancing;
pub mod configuration;
pub mod error;
pub mod listeners;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod server;
pub mod status;
pub mod tls;
pub mod workers;

pub use balancer::{Balancer, BalancerController};
pub use configuration::{BalancerConfig, Protocol, ProtocolOptions};
pub use error::BalancerError;
pub use middleware::{Middleware, MiddlewareContext, Phase};
pub use workers::Worker;

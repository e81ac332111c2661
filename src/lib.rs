//! Sentinel Ops — operational control plane for a trading platform fleet.
//!
//! Exposes the core engines (sampler, retention, alerts, validator,
//! failover, recovery) and the orchestrator that wires them together,
//! including its Prometheus/health HTTP surface. Business trading
//! logic and persistence repositories are external collaborators
//! (`DomainSource`, `StandbyManager`, `Notifier`) and are not
//! implemented here; the bundled `sentinel` binary wires them to
//! in-memory demo implementations.

pub mod alerts;
pub mod config;
pub mod failover;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod recovery;
pub mod retention;
pub mod sampler;
pub mod standby;
pub mod validator;

pub use config::Config;
pub use orchestrator::Orchestrator;

//! Webfleet — a small control plane for running operator commands on a
//! fleet of content servers.
//!
//! Two long-running services plus a thin client:
//! - [`scheduler`]: identity → agent-address registry, JSON file backed,
//!   hot-reloadable on SIGHUP, served over a request/reply socket;
//! - [`agent`]: privileged per-host service executing start/stop/ps/kill
//!   on behalf of a named, unprivileged OS account;
//! - client helpers in both modules resolve through the scheduler, then
//!   talk to the agent directly.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod logger;
pub mod scheduler;
pub mod wire;

//! Stratus per-node daemon control plane.
//!
//! A Stratus cluster is a fleet of identical daemons. Each daemon plays two
//! roles at once: coordinator for the queries it accepts from its own
//! clients, and executor for plan-fragment instances scheduled onto it by
//! peer coordinators. This crate is the concurrency-heavy heart of one
//! daemon: session state, query registration and teardown, fragment
//! dispatch control, catalog-delta application, membership-driven failure
//! detection, and the background expiration engines.
//!
//! The SQL planner, the per-fragment runtime, the RPC transports and the
//! client protocol handlers are separate components; the seams to them are
//! the traits in [`env`]. The outer daemon binary builds an [`env::ExecEnv`]
//! and hands it to [`server::ControlServer`].

pub mod audit;
pub mod cancellation;
pub mod catalog;
pub mod config;
pub mod env;
pub mod expiration;
pub mod fragment;
pub mod health;
pub mod membership;
pub mod metrics;
pub mod options;
pub mod query;
pub mod query_registry;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod testing;

pub use config::DaemonFlags;
pub use server::ControlServer;

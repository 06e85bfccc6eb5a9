//! Core library for the `fleetbench` fleet.
//!
//! A coordinator drives agents, each supervising workers that run pluggable
//! workloads. This crate provides the pieces every node shares: hierarchical
//! addressing and the wire protocol, per-role operation dispatch, the
//! address-routed broker, and the coordinator's aggregation containers and
//! phase barriers. The `fleetbench` binary wires them into runnable nodes.
pub mod agent;
pub mod args;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod processor;
pub mod protocol;
pub mod utils;
pub mod worker;

#[cfg(feature = "fuzzing")]
pub mod fuzzing;

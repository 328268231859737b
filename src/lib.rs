//! ariadne library crate.
//!
//! The primary interface is the `ariadne` binary. The library exposes the
//! bus stages so orchestrators can be embedded and so integration tests can
//! drive them with in-memory stores and scripted check runners.

pub mod causal;
pub mod commit;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod telemetry;
pub mod verify;

// Binary-only modules, not re-exported: cli, format

//! VNF lifecycle operator service
//!
//! The binary wires the reconcile engine and controller from
//! `operator-lib` to a configuration, a DMS client and an HTTP API. The
//! API and configuration live here so integration tests can drive them.

pub mod api;
pub mod config;

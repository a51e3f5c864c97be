//! FlowScope service shell
//!
//! Configuration loading and the HTTP surface over `flowscope-core`.

pub mod api;
pub mod config;

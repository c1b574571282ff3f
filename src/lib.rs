//! probeagent - distributed network monitoring agent.
//!
//! Probes HTTP(S), TCP, ICMP and DNS targets on fixed intervals, buffers the
//! results and flushes them to pluggable storage adapters.

pub mod agent;
pub mod collector;
pub mod config;
pub mod model;
pub mod scheduler;
pub mod storage;
pub mod web;

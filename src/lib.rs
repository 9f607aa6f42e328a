//! Sessiongate - an edge router that activates backend instances on demand
//!
//! This library provides an edge-side request router that:
//! - Dispatches HTTP traffic across a small fixed route table (health,
//!   status, static info, and a backend API prefix)
//! - Lazily starts one backend instance per session key when API traffic
//!   arrives, with single-flight startup for concurrent requests
//! - Forwards API requests transparently with the routing prefix stripped
//!   and a fixed CORS header set merged into every response
//! - Automatically shuts down idle instances after a configurable timeout
//! - Surfaces instance health and registry state on a debug route

pub mod config;
pub mod error;
pub mod forwarder;
pub mod instance;
pub mod lifecycle;
pub mod registry;
pub mod router;

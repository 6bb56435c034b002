//! Idlegate - multi-tenant edge router with scale-to-zero backends
//!
//! This library provides the control plane of an edge router that:
//! - Resolves tenant hostnames to the router itself over DNS
//! - Terminates TLS with per-host certificates (cluster CA or ACME)
//! - Reverse-proxies HTTP(S) and upgraded connections to registered targets
//! - Tracks request activity per target and idles inactive targets
//! - Wakes idle targets before the first request reaches them

pub mod admin;
pub mod backend;
pub mod cache;
pub mod certs;
pub mod config;
pub mod dns;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod server;
pub mod sqlite;
pub mod storage;

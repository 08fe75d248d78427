//! `fortify`: automatic TLS certificate management (ACME/RFC 8555) plus the
//! thin server glue needed to drive it — a TLS listener, a plain-HTTP
//! HTTP-01 challenge listener, and a narrow handler trait standing in for
//! whatever application router a real deployment plugs in.
//!
//! The interesting engineering lives in [`acme`]: a multi-tier certificate
//! cache, a ten-step ACME wire client, host admission, and the HTTP-01
//! challenge responder. [`server`] and [`config`] are the ambient plumbing
//! a binary needs to wire that core into a running process.

pub mod acme;
pub mod config;
pub mod server;
pub mod util;

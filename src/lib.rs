//! bounced: a filtering reverse proxy.
//!
//! Every inbound HTTP request or TCP connection is run through a chain of
//! named filters. The per-client verdict history in the store decides
//! whether the chain runs at all, and the proxy's action decides what
//! happens to whatever the chain catches.

pub mod admin;
pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod entity;
pub mod filter;
pub mod proxy;
pub mod store;
pub mod telemetry;

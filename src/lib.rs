//! nrgpool — pool connection supervisor for NRG miners.
//!
//! A long-lived network agent that keeps a persistent connection to a
//! mining pool, speaks the Stratum line-delimited JSON-RPC variant in its
//! three NRG dialects, forwards jobs to a mining engine, submits found
//! solutions back, and supervises its own connection lifecycle including
//! reconnect and failover across an ordered endpoint list.
//!
//! The crate splits into:
//!
//! - [`endpoint`]: parsed pool URIs with their dialect and TLS selection
//! - [`stratum`]: the protocol client task (one connection at a time)
//! - [`manager`]: the supervisor owning the endpoint list and the engine
//! - [`engine`]: the mining engine interface the supervisor drives
//! - [`work`]: job and solution types shared between pool and engine
//! - [`daemon`]: process lifecycle for the `nrgpoold` binary

pub mod daemon;
pub mod endpoint;
pub mod engine;
pub mod manager;
pub mod stratum;
pub mod tracing;
pub mod u256;
pub mod work;

//! Shared library for the `gen-app` and `sniffer` binaries.
//!
//! `gen-app` is a dual-mode TCP tool: a drain server that accepts and
//! discards everything, and a load-generating client that holds a fixed
//! number of outbound connections, each sending a pseudo-random amount of
//! zero filler before being recycled. Both modes run a single-threaded
//! readiness loop over [`reactor::Reactor`].
//!
//! `sniffer` captures live traffic, keeps per-4-tuple statistics for
//! TCP-over-IPv4 flows in a [`flow::FlowTable`], and renders a ranked
//! top-flows view once per second.

pub mod capture;
pub mod cli;
pub mod client;
pub mod error;
pub mod flow;
pub mod parse;
pub mod reactor;
pub mod report;
pub mod server;
pub mod sock;
pub mod trace;

//! uringkv: a single-node, in-memory key-value server speaking RESP 2.0.
//!
//! Clients open a TCP connection (port 6379 by default, dual-stack IPv6
//! with `SO_REUSEPORT`), send framed requests, and receive framed replies.
//! Supported commands: PING, CLIENT, SET, GET, DEL, EXISTS; anything else
//! is acknowledged with `+OK`.
//!
//! Everything runs on one thread. The [`engine`] drives an io_uring
//! submission/completion ring with a kernel-provided receive buffer group
//! (Linux 5.19+); the [`server`] is the single completion handler gluing
//! accept → recv → parse → dispatch → write → close together; [`resp`]
//! decodes and encodes the wire frames; [`storage`] is the key-value map.

pub mod config;
pub mod engine;
pub mod resp;
pub mod server;
pub mod signal;
pub mod storage;

pub use config::Config;
pub use server::{run, ServerError};

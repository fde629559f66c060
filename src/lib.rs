//! Sluice - multi-threaded HTTP/1.1 server
//!
//! A single reactor thread waits on edge-triggered readiness and hands the
//! actual socket work to a fixed pool of worker threads.

pub mod config;
pub mod handler;
pub mod http;
pub mod logging;
pub mod server;

//! Storage gateway library
//!
//! A multi-threaded TCP gateway in front of replicated backend directories:
//! an epoll reactor per thread, ring-buffered framing of a 64-byte header
//! protocol, proxy relaying between gateways and a hierarchical timer wheel.

#[cfg(not(target_os = "linux"))]
compile_error!("sgw relies on epoll, sendfile and pipe2 and only builds on Linux");

pub mod checksum;
pub mod cli;
pub mod config;
pub mod conn;
pub mod framing;
pub mod handler;
pub mod heartbeat;
pub mod logger;
pub mod migration;
pub mod net;
pub mod pathops;
pub mod poll;
pub mod protocol;
pub mod protocol_core;
pub mod replica;
pub mod ring;
pub mod seq_download;
pub mod timer;
pub mod worker;

//! casper daemon - TCP relay with log streaming
//!
//! This crate provides the building blocks of `casperd`:
//! - `daemon` - Detaching from the terminal and PID file handling
//! - `config` - Named TOML configuration profiles
//! - `registry` - Handle-addressed arena of live connections
//! - `server` - Single-threaded relay event loop
//! - `tailer` - Streams bytes appended to a watched file
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        casperd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│   Registry<Connection>      │   │
//! │  │ (TCP listener)  │     │  (owns every client)        │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │ each tick                   │ frames            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   LogTailer     │     │  broadcast to all but the   │   │
//! │  │ (appended bytes)│────▶│  sender / log to everyone   │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - A misbehaving client only ever costs its own connection

pub mod config;
pub mod daemon;
pub mod registry;
pub mod server;
pub mod tailer;

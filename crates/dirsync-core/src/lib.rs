//! dirsync Core - Domain types and port definitions
//!
//! This crate holds everything the change-propagation engine agrees on with
//! its collaborators:
//! - **Domain types** - `RelativePath`, `RemotePrefix`, `ChangeKind`, `SessionState`
//! - **Port definitions** - `IRemoteStore` for the remote side, `IWatcher` for
//!   the filesystem event source
//! - **Configuration** - the YAML-backed [`config::Config`]
//!
//! # Architecture
//!
//! Ports define trait interfaces that adapter crates implement. The engine in
//! `dirsync-sync` only ever talks to a remote store or an event source through
//! these traits, so storage backends and watch facilities can be swapped
//! without touching the core.

pub mod config;
pub mod domain;
pub mod ports;

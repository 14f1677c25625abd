//! # nixherd-core
//!
//! Core library for nixherd — a long-lived control plane that materializes
//! nix flake targets into binaries and supervises them as child processes,
//! fanning their output out to every attached session.
//!
//! ## Components
//!
//! - **Builder client** ([`builder`]): wraps the external `nix` toolchain —
//!   target enumeration and builds, with binary resolution.
//! - **Repository registry** ([`registry`]): persists known repositories and
//!   the single active one, backed by `SQLite`.
//! - **Log broadcast bus** ([`bus`]): lossy, non-blocking fanout of log lines
//!   and lifecycle events to bounded per-subscriber inboxes.
//! - **Supervisor** ([`supervisor`]): the map of managed children; spawn in
//!   private process groups, capture output, SIGTERM-then-SIGKILL stop.
//! - **Materializer** ([`materializer`]): enumerate + build + atomic install
//!   of a repository's targets into the supervisor.
//! - **Session coordinator** ([`session`]): per-session event routing with
//!   focus filtering.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use nixherd_core::builder::NixClient;
//! use nixherd_core::bus::LogBus;
//! use nixherd_core::materializer::Materializer;
//! use nixherd_core::supervisor::Supervisor;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(LogBus::new());
//! let supervisor = Supervisor::new(Arc::clone(&bus));
//! let materializer = Materializer::new(NixClient::new(), supervisor.clone());
//!
//! let report = materializer.materialize("github:ex/repo").await?;
//! for key in &report.succeeded {
//!     supervisor.start(key)?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod builder;
pub mod bus;
pub mod config;
pub mod ipc;
pub mod materializer;
pub mod registry;
pub mod session;
pub mod supervisor;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::builder::{Builder, NixClient};
    pub use crate::bus::{LogBus, LogEvent, LogStream};
    pub use crate::config::Config;
    pub use crate::materializer::{BuildReport, Materializer};
    pub use crate::registry::RepoRegistry;
    pub use crate::session::SessionCoordinator;
    pub use crate::supervisor::{RunStatus, Supervisor};
}

pub use builder::NixClient;
pub use bus::{LogBus, LogEvent};
pub use config::Config;
pub use materializer::Materializer;
pub use registry::RepoRegistry;
pub use supervisor::Supervisor;

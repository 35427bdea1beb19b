//! # Sharebox Daemon Library
//!
//! This crate provides the storage side of Sharebox: ephemeral file shares
//! addressed by unguessable tokens.
//!
//! ## Overview
//!
//! A share is created with an optional recipient. Shares with a recipient
//! expire after the configured retention; shares without one are pinned
//! until deleted. The daemon provides:
//!
//! - **Token Registry**: SQLite-backed share records and download bookkeeping
//! - **Object Store**: One directory per token with collision-free filenames
//! - **Chunk Assembler**: Resumable uploads staged chunk by chunk
//! - **Eviction Scheduler**: Periodic reconciliation of disk and registry
//! - **Control Socket**: Operator commands over a Unix Domain Socket
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                     Share Service                          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │    Token     │  │    Object    │  │       Chunk          │  │
//! │  │   Registry   │  │    Store     │  │     Assembler        │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │ Eviction Scheduler│  │        Control Socket             │  │
//! │  └───────────────────┘  └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Shares are now evicted in the background and the control
//!     // socket accepts operator commands.
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`registry`]: Token registry and share records
//! - [`store`]: On-disk object store
//! - [`upload`]: Chunked upload assembly
//! - [`eviction`]: Background eviction
//! - [`service`]: Share operations used by the web layer
//! - [`ipc`]: Operator control socket
//! - [`orchestrator`]: Main daemon coordinator

pub mod clock;
pub mod config;
pub mod error;
pub mod eviction;
pub mod ipc;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod store;
pub mod upload;

// Re-export protocol for convenience
pub use protocol;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ShareError, ShareResult};
pub use eviction::{EvictionScheduler, EvictionSettings, SweepReport};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use registry::{Page, ShareRecord, TokenRegistry};
pub use service::{Download, FileEntry, ShareService, ShareSummary};
pub use store::ObjectStore;
pub use upload::{AssembledFile, ChunkAssembler, ChunkOutcome};

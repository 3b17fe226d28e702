//! Splatforge: GPU host provisioning and photo-to-splat reconstruction.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core data structures shared across components
//! - **hardware**: Accelerator, toolkit and resource detection
//! - **config**: Layered configuration, presets and validation
//! - **cache**: Integrity-checked artifact cache with bounded re-download
//! - **orchestrator**: Idempotent provisioning phases
//! - **pipeline**: Reconstruction stage machine, external tools and packaging
//! - **system**: Workspace layout, fingerprints and status reporting
//! - **cli** / **app**: Command-line surface and its handlers

pub mod error;
pub mod models;

pub mod hardware;

pub mod config;

pub mod cache;

// Decoupled logging to per-session files
pub mod log_collector;

pub mod orchestrator;

pub mod pipeline;

pub mod system;

pub mod app;
pub mod cli;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine};

pub use error::{AppError, Result};
pub use models::{CapabilityProfile, RunRecord};

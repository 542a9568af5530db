// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual display monitor relay
//!
//! This crate moves frames and cursor state out of the process that owns a
//! virtual monitor's swap chain and into an independent consumer process,
//! using only named shared memory segments and named signals.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Graphics backend                        │
//! │  - swap-chain surfaces          - hardware cursor updates   │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ SwapChainPump (thread)   │     │ CursorPump (thread)      │
//! │  - acquire / skip clean  │     │  - wait for update       │
//! │  - CPU readback          │     │  - query shape/position  │
//! └──────────────────────────┘     └──────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │ FrameChannel             │     │ CursorChannel            │
//! │  /VdMonitor<i>FB         │     │  /VdMonitor<i>Cursor     │
//! │  NewFrame / Configure    │     │  Position / Image / lock │
//! └──────────────────────────┘     └──────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           Consumer process (FrameReader, CursorReader)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vd_monitor_relay::{MonitorContext, RelayConfig};
//! use vd_monitor_relay::backend::synthetic::SyntheticSurfaceSource;
//!
//! let mut monitor = MonitorContext::new(0, RelayConfig::default())?;
//! monitor.commit_modes(1920, 1080, 60);
//! monitor.assign_swap_chain(Box::new(SyntheticSurfaceSource::new(1920, 1080, 60)?))?;
//! // ...
//! monitor.unassign_swap_chain();
//! ```
//!
//! # Modules
//!
//! - [`protocol`]: Shared layouts and object naming
//! - [`shm`]: Named shared memory, signals and locks
//! - [`frame`]: Frame channel and its consumer-side reader
//! - [`cursor`]: Cursor channel and its consumer-side reader
//! - [`backend`]: Graphics backend interfaces and a synthetic backend
//! - [`swapchain`]: Swap-chain pump
//! - [`cursor_pump`]: Hardware cursor pump
//! - [`monitor`]: Per-monitor orchestration
//! - [`config`]: Relay configuration

pub mod backend;
pub mod config;
pub mod cursor;
pub mod cursor_pump;
pub mod frame;
pub mod monitor;
pub mod protocol;
pub mod shm;
pub mod swapchain;
mod wait;

pub use backend::{BackendError, CursorSource, SurfaceSource};
pub use config::{FrameWriteMode, RelayConfig};
pub use cursor::{CursorChannel, CursorImage, CursorReader};
pub use cursor_pump::{CursorPump, CursorStats};
pub use frame::{FrameChannel, FrameReader};
pub use monitor::MonitorContext;
pub use protocol::*;
pub use swapchain::{PumpExit, PumpState, PumpStats, SwapChainPump};

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A shared memory segment, signal or lock could not be created or mapped.
    ///
    /// Producers absorb this by running the channel in degraded no-op mode.
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// The caller broke the channel contract, e.g. a frame larger than the
    /// segment capacity. Nothing was written.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-monitor orchestration
//!
//! Owns both channels of one connector, at most one swap-chain pump and at
//! most one cursor pump.

use std::sync::Arc;

use log::info;

use crate::backend::{CursorSource, SurfaceSource};
use crate::config::RelayConfig;
use crate::cursor::CursorChannel;
use crate::cursor_pump::{CursorPump, CursorStats};
use crate::frame::FrameChannel;
use crate::swapchain::{PumpExit, PumpState, PumpStats, SwapChainPump};
use crate::Result;

/// One virtual monitor as seen by the relay
pub struct MonitorContext {
    connector_index: u32,
    config: RelayConfig,
    // Field order is drop order: pumps are joined before the channels unmap.
    cursor_pump: Option<CursorPump>,
    swap_chain: Option<SwapChainPump>,
    frame: Arc<FrameChannel>,
    cursor: Arc<CursorChannel>,
}

impl MonitorContext {
    /// Open both channels of `connector_index`
    ///
    /// Channels that cannot be opened run degraded, so this only fails on an
    /// invalid configuration.
    pub fn new(connector_index: u32, config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let frame = Arc::new(FrameChannel::open_or_degraded(connector_index, &config));
        let cursor = Arc::new(CursorChannel::open_or_degraded(connector_index, &config));

        info!(
            "Monitor {connector_index} created (frame live: {}, cursor live: {})",
            frame.is_live(),
            cursor.is_live()
        );

        Ok(Self {
            connector_index,
            config,
            cursor_pump: None,
            swap_chain: None,
            frame,
            cursor,
        })
    }

    pub fn connector_index(&self) -> u32 {
        self.connector_index
    }

    pub fn frame_channel(&self) -> &Arc<FrameChannel> {
        &self.frame
    }

    pub fn cursor_channel(&self) -> &Arc<CursorChannel> {
        &self.cursor
    }

    /// Commit a display mode to the frame channel
    pub fn commit_modes(&self, width: u32, height: u32, framerate: u32) {
        self.frame.configure(width, height, framerate);
    }

    /// Start pumping `source`, replacing any previous swap chain
    pub fn assign_swap_chain(&mut self, source: Box<dyn SurfaceSource>) -> Result<()> {
        self.unassign_swap_chain();

        self.swap_chain = Some(SwapChainPump::start(
            self.connector_index,
            source,
            self.frame.clone(),
            &self.config,
        )?);
        Ok(())
    }

    /// Stop and join the swap-chain pump, if any
    pub fn unassign_swap_chain(&mut self) -> Option<PumpExit> {
        self.swap_chain.take().and_then(|mut pump| pump.stop())
    }

    /// True if a swap-chain pump exists and lost its backend
    ///
    /// The orchestrator is expected to assign a replacement swap chain.
    pub fn swap_chain_lost(&self) -> bool {
        self.swap_chain
            .as_ref()
            .is_some_and(|pump| pump.is_finished() || pump.state() != PumpState::Running)
    }

    pub fn swap_chain_stats(&self) -> Option<PumpStats> {
        self.swap_chain.as_ref().map(SwapChainPump::stats)
    }

    /// Start (or replace) the hardware cursor pump
    pub fn attach_cursor_source(&mut self, source: Box<dyn CursorSource>) -> Result<()> {
        if let Some(mut pump) = self.cursor_pump.take() {
            pump.stop();
        }

        self.cursor_pump = Some(CursorPump::start(
            self.connector_index,
            source,
            self.cursor.clone(),
            &self.config,
        )?);
        Ok(())
    }

    pub fn cursor_stats(&self) -> Option<CursorStats> {
        self.cursor_pump.as_ref().map(CursorPump::stats)
    }
}

impl Drop for MonitorContext {
    fn drop(&mut self) {
        if let Some(mut pump) = self.cursor_pump.take() {
            pump.stop();
        }
        self.unassign_swap_chain();
        self.frame.close();
        self.cursor.close();
        info!("Monitor {} destroyed", self.connector_index);
    }
}

// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Swap-chain pump
//!
//! One worker thread per assigned swap chain. The worker polls the backend
//! for the next surface, waits on {surface available, stop} with a one frame
//! ceiling while nothing is ready, and copies changed surfaces into the
//! frame channel.
//!
//! ```text
//!            acquire
//!   ┌──────────────────────┐
//!   │                      ▼
//!   │   Pending ──► wait(available | stop, 16 ms) ──► stop ──► Draining
//!   │                      │
//!   │   Ready ──► clean? ──┴─ no ──► copy ► map ► publish
//!   │              │                                │
//!   │             yes ──────────────► finish ◄──────┘
//!   └──────────────────────────────────┘
//! ```

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::backend::{Acquire, BackendError, StagingBuffer, Surface, SurfaceSource};
use crate::config::RelayConfig;
use crate::frame::FrameChannel;
use crate::wait::{consume, WaitOutcome, Waiter};
use crate::Result;

const STOP_TOKEN: u64 = 0;
const AVAILABLE_TOKEN: u64 = 1;

/// Pump lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Running,
    /// Stop requested or backend lost, worker on its way out
    Draining,
    /// Worker returned and the swap chain was released
    Terminated,
}

impl PumpState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PumpState::Running,
            1 => PumpState::Draining,
            _ => PumpState::Terminated,
        }
    }
}

/// Why the worker returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// Stop was requested
    Stopped,
    /// The backend failed for good; the swap chain needs replacing
    BackendLost(String),
}

/// Snapshot of the pump counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub frames_published: u64,
    /// Surfaces without dirty or move regions
    pub frames_skipped: u64,
    /// Acquire calls that found nothing ready
    pub pending_polls: u64,
    pub wait_timeouts: u64,
    pub transient_errors: u64,
}

#[derive(Default)]
struct PumpShared {
    state: AtomicU8,
    frames_published: AtomicU64,
    frames_skipped: AtomicU64,
    pending_polls: AtomicU64,
    wait_timeouts: AtomicU64,
    transient_errors: AtomicU64,
}

impl PumpShared {
    fn set_state(&self, state: PumpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running swap-chain worker
///
/// Dropping the handle stops and joins the worker.
pub struct SwapChainPump {
    connector_index: u32,
    stop_evt: EventFd,
    shared: Arc<PumpShared>,
    worker: Option<JoinHandle<PumpExit>>,
}

impl SwapChainPump {
    /// Spawn the worker for `source`, publishing into `channel`
    ///
    /// The source is torn down exactly once, when the worker exits, or
    /// right away if the worker cannot be started.
    pub fn start(
        connector_index: u32,
        source: Box<dyn SurfaceSource>,
        channel: Arc<FrameChannel>,
        config: &RelayConfig,
    ) -> Result<Self> {
        let shared = Arc::new(PumpShared::default());
        let mut worker = Worker {
            connector_index,
            source,
            torn_down: false,
            channel,
            staging: StagingBuffer::new(),
            acquire_timeout: config.acquire_timeout(),
            shared: shared.clone(),
        };

        let stop_evt = EventFd::new(libc::EFD_NONBLOCK)?;
        let worker_stop = stop_evt.try_clone()?;
        let available = worker.source.available_event()?;

        let handle = thread::Builder::new()
            .name(format!("swapchain-{connector_index}"))
            .spawn(move || worker.run(&worker_stop, &available))?;

        info!("Swap-chain pump started for monitor {connector_index}");

        Ok(Self {
            connector_index,
            stop_evt,
            shared,
            worker: Some(handle),
        })
    }

    pub fn connector_index(&self) -> u32 {
        self.connector_index
    }

    pub fn state(&self) -> PumpState {
        PumpState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PumpStats {
        let s = &self.shared;
        PumpStats {
            frames_published: s.frames_published.load(Ordering::Relaxed),
            frames_skipped: s.frames_skipped.load(Ordering::Relaxed),
            pending_polls: s.pending_polls.load(Ordering::Relaxed),
            wait_timeouts: s.wait_timeouts.load(Ordering::Relaxed),
            transient_errors: s.transient_errors.load(Ordering::Relaxed),
        }
    }

    /// True once the worker returned on its own or was joined
    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Raise stop and join the worker
    ///
    /// Returns `None` if the pump was already stopped.
    pub fn stop(&mut self) -> Option<PumpExit> {
        let handle = self.worker.take()?;

        let _ = self.shared.state.compare_exchange(
            PumpState::Running as u8,
            PumpState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(e) = self.stop_evt.write(1) {
            warn!("Failed to signal swap-chain pump {}: {e}", self.connector_index);
        }

        let exit = handle.join().unwrap_or_else(|_| {
            error!("Swap-chain pump {} panicked", self.connector_index);
            PumpExit::BackendLost("worker panicked".to_string())
        });
        self.shared.set_state(PumpState::Terminated);

        info!(
            "Swap-chain pump for monitor {} stopped: {exit:?}",
            self.connector_index
        );
        Some(exit)
    }
}

impl Drop for SwapChainPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    connector_index: u32,
    source: Box<dyn SurfaceSource>,
    torn_down: bool,
    channel: Arc<FrameChannel>,
    staging: StagingBuffer,
    acquire_timeout: Duration,
    shared: Arc<PumpShared>,
}

impl Worker {
    fn run(&mut self, stop: &EventFd, available: &EventFd) -> PumpExit {
        let exit = self.pump(stop, available);

        self.shared.set_state(PumpState::Draining);
        match &exit {
            PumpExit::Stopped => debug!("Swap-chain worker {} stopping", self.connector_index),
            PumpExit::BackendLost(reason) => error!(
                "Swap-chain of monitor {} lost: {reason}",
                self.connector_index
            ),
        }

        self.release();
        self.shared.set_state(PumpState::Terminated);
        exit
    }

    fn release(&mut self) {
        if !self.torn_down {
            self.torn_down = true;
            self.source.teardown();
        }
    }

    fn pump(&mut self, stop: &EventFd, available: &EventFd) -> PumpExit {
        let mut waiter = match Waiter::new(&[
            (stop.as_raw_fd(), STOP_TOKEN),
            (available.as_raw_fd(), AVAILABLE_TOKEN),
        ]) {
            Ok(waiter) => waiter,
            Err(e) => return PumpExit::BackendLost(format!("wait set: {e}")),
        };

        loop {
            // A backend that is always ready never reaches the wait below
            if stop.read().is_ok() {
                return PumpExit::Stopped;
            }

            match self.source.acquire_next_surface() {
                Ok(Acquire::Pending) => {
                    PumpShared::bump(&self.shared.pending_polls);
                    match waiter.wait(Some(self.acquire_timeout)) {
                        Ok(outcome) if outcome.contains(STOP_TOKEN) => return PumpExit::Stopped,
                        Ok(WaitOutcome::TimedOut) => {
                            PumpShared::bump(&self.shared.wait_timeouts);
                        }
                        Ok(WaitOutcome::Signaled(_)) => consume(available),
                        Err(e) => return PumpExit::BackendLost(format!("wait failed: {e}")),
                    }
                }
                Ok(Acquire::Ready(surface)) => {
                    if let Err(e) = self.process(surface) {
                        return PumpExit::BackendLost(e.to_string());
                    }
                }
                Err(e) => return PumpExit::BackendLost(e.to_string()),
            }
        }
    }

    /// Publish a ready surface if it changed, then hand it back
    fn process(&mut self, surface: Surface) -> std::result::Result<(), BackendError> {
        if surface.is_clean() {
            PumpShared::bump(&self.shared.frames_skipped);
        } else {
            self.publish(&surface);
        }

        self.source.finish_processing(surface)
    }

    fn publish(&mut self, surface: &Surface) {
        if self.staging.ensure(surface.width, surface.height) {
            debug!(
                "Monitor {} staging buffer now {}x{} (pitch {})",
                self.connector_index,
                surface.width,
                surface.height,
                self.staging.row_pitch()
            );
        }

        if let Err(e) = self.source.copy_to_cpu_readable(surface, &mut self.staging) {
            PumpShared::bump(&self.shared.transient_errors);
            warn!("Monitor {} surface copy failed: {e}", self.connector_index);
            return;
        }

        let mapped = self.staging.map();
        match self
            .channel
            .publish_rows(mapped.bytes, mapped.width, mapped.height, mapped.row_pitch)
        {
            Ok(()) => PumpShared::bump(&self.shared.frames_published),
            Err(e) => warn!("Monitor {} frame dropped: {e}", self.connector_index),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Covers a worker that never ran
        self.release();
    }
}

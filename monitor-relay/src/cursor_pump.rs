// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hardware cursor pump
//!
//! Waits without a timeout on {cursor updated, stop}, queries the backend
//! and republishes into the cursor channel.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::backend::CursorSource;
use crate::config::RelayConfig;
use crate::cursor::CursorChannel;
use crate::wait::{consume, Waiter};
use crate::Result;

const STOP_TOKEN: u64 = 0;
const UPDATE_TOKEN: u64 = 1;

/// Snapshot of the cursor pump counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorStats {
    /// Wakeups from the backend update event
    pub updates: u64,
    pub images_published: u64,
    pub query_failures: u64,
}

#[derive(Default)]
struct CursorCounters {
    updates: AtomicU64,
    images_published: AtomicU64,
    query_failures: AtomicU64,
}

/// Handle to the cursor worker of one monitor
pub struct CursorPump {
    connector_index: u32,
    stop_evt: EventFd,
    counters: Arc<CursorCounters>,
    worker: Option<JoinHandle<()>>,
}

impl CursorPump {
    pub fn start(
        connector_index: u32,
        source: Box<dyn CursorSource>,
        channel: Arc<CursorChannel>,
        config: &RelayConfig,
    ) -> Result<Self> {
        let stop_evt = EventFd::new(libc::EFD_NONBLOCK)?;
        let worker_stop = stop_evt.try_clone()?;
        let update = source.update_event()?;
        let counters = Arc::new(CursorCounters::default());

        let mut worker = CursorWorker {
            connector_index,
            source,
            channel,
            shape_buffer: vec![0u8; config.cursor_buffer_size],
            last_shape_id: 0,
            counters: counters.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("cursor-{connector_index}"))
            .spawn(move || worker.run(&worker_stop, &update))?;

        info!("Cursor pump started for monitor {connector_index}");

        Ok(Self {
            connector_index,
            stop_evt,
            counters,
            worker: Some(handle),
        })
    }

    pub fn stats(&self) -> CursorStats {
        CursorStats {
            updates: self.counters.updates.load(Ordering::Relaxed),
            images_published: self.counters.images_published.load(Ordering::Relaxed),
            query_failures: self.counters.query_failures.load(Ordering::Relaxed),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Raise stop and join; idempotent
    pub fn stop(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };

        if let Err(e) = self.stop_evt.write(1) {
            warn!("Failed to signal cursor pump {}: {e}", self.connector_index);
        }
        if handle.join().is_err() {
            error!("Cursor pump {} panicked", self.connector_index);
        }
        info!("Cursor pump for monitor {} stopped", self.connector_index);
    }
}

impl Drop for CursorPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CursorWorker {
    connector_index: u32,
    source: Box<dyn CursorSource>,
    channel: Arc<CursorChannel>,
    /// Handed to every query, shapes land here
    shape_buffer: Vec<u8>,
    last_shape_id: u32,
    counters: Arc<CursorCounters>,
}

impl CursorWorker {
    fn run(&mut self, stop: &EventFd, update: &EventFd) {
        let mut waiter = match Waiter::new(&[
            (stop.as_raw_fd(), STOP_TOKEN),
            (update.as_raw_fd(), UPDATE_TOKEN),
        ]) {
            Ok(waiter) => waiter,
            Err(e) => {
                error!("Cursor pump {} cannot wait: {e}", self.connector_index);
                return;
            }
        };

        loop {
            match waiter.wait(None) {
                Ok(outcome) if outcome.contains(STOP_TOKEN) => break,
                Ok(_) => consume(update),
                Err(e) => {
                    error!("Cursor pump {} wait failed: {e}", self.connector_index);
                    break;
                }
            }

            self.counters.updates.fetch_add(1, Ordering::Relaxed);
            self.refresh();
        }

        debug!("Cursor worker {} exiting", self.connector_index);
    }

    fn refresh(&mut self) {
        let query = match self
            .source
            .query_hardware_cursor(self.last_shape_id, &mut self.shape_buffer)
        {
            Ok(query) => query,
            Err(e) => {
                self.counters.query_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Monitor {} cursor query failed: {e}", self.connector_index);
                return;
            }
        };

        if query.shape_updated && query.visible {
            let shape = query.shape;
            match self.channel.publish_image(
                shape.width,
                shape.height,
                &self.shape_buffer,
                shape.pitch,
            ) {
                Ok(()) => {
                    self.counters.images_published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Monitor {} cursor image dropped: {e}", self.connector_index),
            }
            self.last_shape_id = query.shape_id;
        }

        self.channel.publish_position(query.x, query.y, query.visible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::backend::synthetic::SyntheticCursorSource;
    use crate::cursor::CursorReader;
    use crate::shm::tests::unique_name;

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_cursor_pump_relays_position_and_shape() {
        let config = RelayConfig {
            namespace: unique_name("cpump").trim_start_matches('/').to_string(),
            unlink_on_close: true,
            ..Default::default()
        };
        let channel = Arc::new(CursorChannel::open(0, &config).unwrap());
        let reader = CursorReader::open(0, &config).unwrap();
        let (source, handle) = SyntheticCursorSource::new().unwrap();

        let mut pump = CursorPump::start(0, Box::new(source), channel, &config).unwrap();

        handle.set_visible(true);
        handle.set_shape(2, 1, vec![9u8; 8]);
        handle.move_to(50, 60);

        assert!(wait_until(|| reader.position().x == 50 && reader.position().y == 60));
        assert!(wait_until(|| pump.stats().images_published == 1));
        let image = reader.image().unwrap().unwrap();
        assert_eq!(image.pixels, vec![9u8; 8]);

        pump.stop();
        assert!(pump.is_finished());
        pump.stop();
    }
}

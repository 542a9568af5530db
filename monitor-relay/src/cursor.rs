// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cursor channel
//!
//! Provides cursor position and shape transport. Position updates are
//! lock-free; the shape and its pixels are written under the cursor lock.

use std::io;
use std::sync::RwLock;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::RelayConfig;
use crate::protocol::{
    ChannelNames, CursorPosition, CursorShapeInfo, CursorStateRecord, PixelFormat,
    CURSOR_STATE_SIZE,
};
use crate::shm::{NamedLock, NamedSignal, SharedSegment};
use crate::{RelayError, Result};

struct CursorSegment {
    segment: SharedSegment,
    lock: NamedLock,
    position_changed: NamedSignal,
    image_changed: NamedSignal,
}

impl CursorSegment {
    fn open(names: &ChannelNames, config: &RelayConfig) -> io::Result<Self> {
        Ok(Self {
            segment: SharedSegment::create_or_attach(
                &names.cursor_segment,
                CURSOR_STATE_SIZE + config.cursor_buffer_size,
                config.mode,
                config.unlink_on_close,
            )?,
            lock: NamedLock::open(
                &names.cursor_lock,
                config.mode,
                config.lock_timeout(),
                config.unlink_on_close,
            )?,
            position_changed: NamedSignal::open(
                &names.cursor_position_changed,
                config.mode,
                config.unlink_on_close,
            )?,
            image_changed: NamedSignal::open(
                &names.cursor_image_changed,
                config.mode,
                config.unlink_on_close,
            )?,
        })
    }

    fn record(&self) -> &CursorStateRecord {
        // SAFETY: offset 0 of a page aligned mapping larger than the record,
        // which only holds atomics.
        unsafe { self.segment.view::<CursorStateRecord>(0) }
    }

    fn capacity(&self) -> usize {
        self.segment.len() - CURSOR_STATE_SIZE
    }
}

fn open_segment(connector_index: u32, config: &RelayConfig) -> Result<CursorSegment> {
    config.validate()?;
    let names = ChannelNames::for_connector(&config.namespace, connector_index);
    CursorSegment::open(&names, config).map_err(|e| {
        RelayError::ChannelUnavailable(format!("{}: {e}", names.cursor_segment))
    })
}

/// Cursor shape as copied out of the channel, rows tightly packed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    /// B8G8R8A8 pixels, `width * 4` bytes per row
    pub pixels: Vec<u8>,
}

/// Producer side of the cursor transport
pub struct CursorChannel {
    connector_index: u32,
    capacity: usize,
    inner: RwLock<Option<CursorSegment>>,
}

impl CursorChannel {
    pub fn open(connector_index: u32, config: &RelayConfig) -> Result<Self> {
        let segment = open_segment(connector_index, config)?;

        info!(
            "Cursor channel {} open ({} bytes, created: {})",
            segment.segment.name(),
            segment.segment.len(),
            segment.segment.created()
        );

        Ok(Self {
            connector_index,
            capacity: segment.capacity(),
            inner: RwLock::new(Some(segment)),
        })
    }

    /// Open, falling back to a no-op channel when the OS objects are missing
    pub fn open_or_degraded(connector_index: u32, config: &RelayConfig) -> Self {
        match Self::open(connector_index, config) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Cursor channel {connector_index} degraded to no-op: {e}");
                Self {
                    connector_index,
                    capacity: 0,
                    inner: RwLock::new(None),
                }
            }
        }
    }

    pub fn connector_index(&self) -> u32 {
        self.connector_index
    }

    /// Largest shape in bytes (`pitch * height`) the channel accepts
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_live(&self) -> bool {
        self.inner.read().is_ok_and(|inner| inner.is_some())
    }

    /// Update position and visibility, then raise "position changed"
    ///
    /// The three fields are stored one after the other without a lock.
    pub fn publish_position(&self, x: i32, y: i32, visible: bool) {
        let Ok(inner) = self.inner.read() else {
            return;
        };
        let Some(segment) = inner.as_ref() else {
            return;
        };

        segment.record().store_position(CursorPosition { x, y, visible });
        if let Err(e) = segment.position_changed.signal() {
            warn!("Failed to raise {}: {e}", segment.position_changed.name());
        }
    }

    /// Replace the cursor shape and raise "image changed"
    ///
    /// `pixels` holds `height` rows `pitch` bytes apart; rows are copied
    /// verbatim, pitch included.
    pub fn publish_image(&self, width: u32, height: u32, pixels: &[u8], pitch: u32) -> Result<()> {
        let shape = CursorShapeInfo {
            width,
            height,
            pitch,
        };
        let row_len = PixelFormat::Bgra32.packed_size(width, 1);
        if (pitch as usize) < row_len {
            return Err(RelayError::ProtocolViolation(format!(
                "cursor pitch {pitch} shorter than row of {row_len} bytes"
            )));
        }
        let size = shape.data_size();
        if pixels.len() < size {
            return Err(RelayError::ProtocolViolation(format!(
                "cursor image of {} bytes, {width}x{height} pitch {pitch} needs {size}",
                pixels.len()
            )));
        }

        let Ok(inner) = self.inner.read() else {
            return Ok(());
        };
        let Some(segment) = inner.as_ref() else {
            return Ok(());
        };

        if size > segment.capacity() {
            return Err(RelayError::ProtocolViolation(format!(
                "cursor image of {size} bytes exceeds capacity of {} bytes",
                segment.capacity()
            )));
        }

        {
            let guard = segment.lock.lock()?;
            if guard.was_abandoned() {
                debug!("Cursor lock of monitor {} recovered", self.connector_index);
            }
            segment.record().store_shape(shape);
            segment.segment.write_at(CURSOR_STATE_SIZE, &pixels[..size])?;
        }

        if let Err(e) = segment.image_changed.signal() {
            warn!("Failed to raise {}: {e}", segment.image_changed.name());
        }
        Ok(())
    }

    /// Unmap and release the named objects; idempotent
    pub fn close(&self) {
        let closed = match self.inner.write() {
            Ok(mut inner) => inner.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if closed.is_some() {
            info!("Cursor channel {} closed", self.connector_index);
        }
    }
}

impl Drop for CursorChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side of the cursor transport
pub struct CursorReader {
    segment: CursorSegment,
}

impl CursorReader {
    pub fn open(connector_index: u32, config: &RelayConfig) -> Result<Self> {
        Ok(Self {
            segment: open_segment(connector_index, config)?,
        })
    }

    /// Current position; fields may mix two updates
    pub fn position(&self) -> CursorPosition {
        self.segment.record().load_position()
    }

    /// Copy the current shape, `None` if none was published yet
    pub fn image(&self) -> Result<Option<CursorImage>> {
        let _guard = self.segment.lock.lock()?;
        let shape = self.segment.record().load_shape();
        if shape.width == 0 || shape.height == 0 {
            return Ok(None);
        }

        let row_len = PixelFormat::Bgra32.packed_size(shape.width, 1);
        if (shape.pitch as usize) < row_len || shape.data_size() > self.segment.capacity() {
            return Err(RelayError::ProtocolViolation(format!(
                "published cursor shape {shape:?} does not fit the channel"
            )));
        }

        let mut pixels = vec![0u8; row_len * shape.height as usize];
        for (row, out) in pixels.chunks_mut(row_len).enumerate() {
            self.segment
                .segment
                .read_at(CURSOR_STATE_SIZE + row * shape.pitch as usize, out)?;
        }

        Ok(Some(CursorImage {
            width: shape.width,
            height: shape.height,
            pixels,
        }))
    }

    pub fn wait_position(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.segment.position_changed.wait(timeout)?)
    }

    pub fn wait_image(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.segment.image_changed.wait(timeout)?)
    }
}

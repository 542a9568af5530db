// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame channel
//!
//! One shared memory segment per connector holding the configuration record
//! followed by the most recent frame, plus the "new frame" and "configure"
//! signals. The producer never blocks on the consumer: with nobody attached
//! frames are written and signals raised into the void.

use std::io;
use std::sync::RwLock;
use std::time::Duration;

use log::{info, warn};

use crate::config::{FrameWriteMode, RelayConfig};
use crate::protocol::{
    ChannelNames, Configuration, ConfigurationRecord, BYTES_PER_PIXEL, CONFIGURATION_RECORD_SIZE,
};
use crate::shm::{NamedLock, NamedSignal, SharedSegment};
use crate::{RelayError, Result};

/// Named objects behind one frame channel
struct FrameSegment {
    segment: SharedSegment,
    lock: NamedLock,
    frame_ready: NamedSignal,
    config_changed: NamedSignal,
}

impl FrameSegment {
    fn open(names: &ChannelNames, config: &RelayConfig) -> io::Result<Self> {
        let segment = SharedSegment::create_or_attach(
            &names.frame_segment,
            config.frame_segment_size,
            config.mode,
            config.unlink_on_close,
        )?;
        let lock = NamedLock::open(
            &names.frame_lock,
            config.mode,
            config.lock_timeout(),
            config.unlink_on_close,
        )?;
        let frame_ready = NamedSignal::open(&names.frame_ready, config.mode, config.unlink_on_close)?;
        let config_changed =
            NamedSignal::open(&names.config_changed, config.mode, config.unlink_on_close)?;

        Ok(Self {
            segment,
            lock,
            frame_ready,
            config_changed,
        })
    }

    fn record(&self) -> &ConfigurationRecord {
        // SAFETY: offset 0 of a page aligned mapping, the record is made of
        // atomics valid for any bit pattern and the segment is larger than it.
        unsafe { self.segment.view::<ConfigurationRecord>(0) }
    }

    fn capacity(&self) -> usize {
        self.segment.len() - CONFIGURATION_RECORD_SIZE
    }
}

fn open_segment(connector_index: u32, config: &RelayConfig) -> Result<FrameSegment> {
    config.validate()?;
    let names = ChannelNames::for_connector(&config.namespace, connector_index);
    FrameSegment::open(&names, config).map_err(|e| {
        RelayError::ChannelUnavailable(format!("{}: {e}", names.frame_segment))
    })
}

/// Producer side of the frame transport
pub struct FrameChannel {
    connector_index: u32,
    capacity: usize,
    write_mode: FrameWriteMode,
    /// `None` once closed or when running degraded
    inner: RwLock<Option<FrameSegment>>,
}

impl FrameChannel {
    /// Create or attach to the frame segment of `connector_index`
    ///
    /// The configuration record is reset to unconfigured only when this call
    /// created the segment.
    pub fn open(connector_index: u32, config: &RelayConfig) -> Result<Self> {
        let segment = open_segment(connector_index, config)?;
        if segment.segment.created() {
            segment.record().reset();
        }

        info!(
            "Frame channel {} open ({} bytes, created: {})",
            segment.segment.name(),
            segment.segment.len(),
            segment.segment.created()
        );

        Ok(Self {
            connector_index,
            capacity: segment.capacity(),
            write_mode: config.frame_write_mode,
            inner: RwLock::new(Some(segment)),
        })
    }

    /// Like [`FrameChannel::open`], but a failure yields a no-op channel
    /// so the producer keeps running without a live transport.
    pub fn open_or_degraded(connector_index: u32, config: &RelayConfig) -> Self {
        match Self::open(connector_index, config) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Frame channel {connector_index} degraded to no-op: {e}");
                Self {
                    connector_index,
                    capacity: 0,
                    write_mode: config.frame_write_mode,
                    inner: RwLock::new(None),
                }
            }
        }
    }

    pub fn connector_index(&self) -> u32 {
        self.connector_index
    }

    /// Pixel bytes one frame may occupy
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// False when degraded or closed
    pub fn is_live(&self) -> bool {
        self.inner.read().is_ok_and(|inner| inner.is_some())
    }

    /// Commit a display mode and raise "configure"
    pub fn configure(&self, width: u32, height: u32, framerate: u32) {
        let Ok(inner) = self.inner.read() else {
            return;
        };
        let Some(segment) = inner.as_ref() else {
            return;
        };

        segment.record().store(Configuration {
            width,
            height,
            framerate,
        });

        if let Err(e) = segment.config_changed.signal() {
            warn!("Failed to raise {}: {e}", segment.config_changed.name());
        }
        info!("Monitor {} configured {width}x{height}@{framerate}", self.connector_index);
    }

    /// Copy a tightly packed frame into the segment and raise "new frame"
    pub fn publish(&self, pixels: &[u8]) -> Result<()> {
        self.check_size(pixels.len())?;
        self.write_frame(|segment| segment.write_at(CONFIGURATION_RECORD_SIZE, pixels))
    }

    /// Publish a surface whose rows are `row_pitch` bytes apart
    ///
    /// Rows are packed to `width * 4` bytes in the segment, which is what the
    /// consumer reads back.
    pub fn publish_rows(&self, pixels: &[u8], width: u32, height: u32, row_pitch: usize) -> Result<()> {
        let row_len = width as usize * BYTES_PER_PIXEL;
        if row_pitch < row_len {
            return Err(RelayError::ProtocolViolation(format!(
                "row pitch {row_pitch} shorter than row of {row_len} bytes"
            )));
        }
        let height = height as usize;
        let needed = match height {
            0 => 0,
            h => row_pitch * (h - 1) + row_len,
        };
        if pixels.len() < needed {
            return Err(RelayError::ProtocolViolation(format!(
                "surface of {} bytes too short for {height} rows of pitch {row_pitch}",
                pixels.len()
            )));
        }
        self.check_size(row_len * height)?;

        if row_pitch == row_len {
            return self.publish(&pixels[..needed]);
        }

        self.write_frame(|segment| {
            for (row, chunk) in pixels.chunks(row_pitch).take(height).enumerate() {
                segment.write_at(CONFIGURATION_RECORD_SIZE + row * row_len, &chunk[..row_len])?;
            }
            Ok(())
        })
    }

    /// Unmap the segment and release every named object; idempotent
    pub fn close(&self) {
        let closed = match self.inner.write() {
            Ok(mut inner) => inner.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if closed.is_some() {
            info!("Frame channel {} closed", self.connector_index);
        }
    }

    fn check_size(&self, len: usize) -> Result<()> {
        if self.is_live() && len > self.capacity {
            return Err(RelayError::ProtocolViolation(format!(
                "frame of {len} bytes exceeds channel capacity of {} bytes",
                self.capacity
            )));
        }
        Ok(())
    }

    fn write_frame<F>(&self, copy: F) -> Result<()>
    where
        F: FnOnce(&SharedSegment) -> io::Result<()>,
    {
        let Ok(inner) = self.inner.read() else {
            return Ok(());
        };
        let Some(segment) = inner.as_ref() else {
            return Ok(());
        };

        {
            let _guard = match self.write_mode {
                FrameWriteMode::Locked => Some(segment.lock.lock()?),
                FrameWriteMode::BestEffort => None,
            };
            copy(&segment.segment)?;
        }

        // The consumer may have gone away; that never stops the producer.
        if let Err(e) = segment.frame_ready.signal() {
            warn!("Failed to raise {}: {e}", segment.frame_ready.name());
        }
        Ok(())
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side of the frame transport
pub struct FrameReader {
    segment: FrameSegment,
    write_mode: FrameWriteMode,
}

impl FrameReader {
    /// Attach to (or create) the frame segment of `connector_index`
    pub fn open(connector_index: u32, config: &RelayConfig) -> Result<Self> {
        let segment = open_segment(connector_index, config)?;
        Ok(Self {
            segment,
            write_mode: config.frame_write_mode,
        })
    }

    /// Current mode, `None` until the producer configured the monitor
    pub fn configuration(&self) -> Option<Configuration> {
        self.segment.record().load()
    }

    /// Wait for "configure" and return the mode it announced
    pub fn wait_configured(&self, timeout: Option<Duration>) -> Result<Option<Configuration>> {
        if !self.segment.config_changed.wait(timeout)? {
            return Ok(None);
        }
        Ok(self.configuration())
    }

    /// Wait for "new frame"; false on timeout
    pub fn wait_frame(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.segment.frame_ready.wait(timeout)?)
    }

    /// Copy the current frame into `out`
    ///
    /// Returns the mode the frame was read under, or `None` while
    /// unconfigured. Without the locked write mode the frame may be torn.
    pub fn read_frame(&self, out: &mut Vec<u8>) -> Result<Option<Configuration>> {
        let Some(configuration) = self.configuration() else {
            return Ok(None);
        };

        let size = configuration.frame_size();
        if size > self.segment.capacity() {
            return Err(RelayError::ProtocolViolation(format!(
                "configured frame of {size} bytes exceeds segment capacity"
            )));
        }

        out.resize(size, 0);
        let _guard = match self.write_mode {
            FrameWriteMode::Locked => Some(self.segment.lock.lock()?),
            FrameWriteMode::BestEffort => None,
        };
        self.segment.segment.read_at(CONFIGURATION_RECORD_SIZE, out)?;
        Ok(Some(configuration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::tests::unique_name;

    fn test_config() -> RelayConfig {
        RelayConfig {
            namespace: unique_name("frame").trim_start_matches('/').to_string(),
            unlink_on_close: true,
            frame_segment_size: CONFIGURATION_RECORD_SIZE + 64 * 64 * 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_starts_unconfigured() {
        let config = test_config();
        let channel = FrameChannel::open(0, &config).unwrap();
        assert!(channel.is_live());
        assert_eq!(channel.capacity(), 64 * 64 * 4);

        let reader = FrameReader::open(0, &config).unwrap();
        assert_eq!(reader.configuration(), None);
        let mut out = Vec::new();
        assert_eq!(reader.read_frame(&mut out).unwrap(), None);
    }

    #[test]
    fn test_attach_keeps_configuration() {
        let config = test_config();
        let first = FrameChannel::open(1, &config).unwrap();
        first.configure(32, 16, 30);

        let second = FrameChannel::open(1, &config).unwrap();
        let reader = FrameReader::open(1, &config).unwrap();
        assert_eq!(
            reader.configuration(),
            Some(Configuration {
                width: 32,
                height: 16,
                framerate: 30
            })
        );
        drop(second);
    }

    #[test]
    fn test_publish_rejects_oversized_frame() {
        let config = test_config();
        let channel = FrameChannel::open(0, &config).unwrap();
        let frame = vec![0xAB; channel.capacity() + 1];
        assert!(matches!(
            channel.publish(&frame),
            Err(RelayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_publish_rows_packs_strided_surface() {
        let config = test_config();
        let channel = FrameChannel::open(2, &config).unwrap();
        let reader = FrameReader::open(2, &config).unwrap();
        channel.configure(2, 2, 60);
        assert!(reader.wait_configured(Some(Duration::from_secs(1))).unwrap().is_some());

        // 2x2 surface, rows padded to 12 bytes
        let mut surface = vec![0xEE; 12 * 2];
        surface[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        surface[12..20].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
        channel.publish_rows(&surface, 2, 2, 12).unwrap();

        assert!(reader.wait_frame(Some(Duration::from_secs(1))).unwrap());
        let mut out = Vec::new();
        reader.read_frame(&mut out).unwrap();
        assert_eq!(out, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_publish_rows_rejects_bad_geometry() {
        let config = test_config();
        let channel = FrameChannel::open(3, &config).unwrap();

        // Pitch shorter than a row
        assert!(channel.publish_rows(&[0; 64], 4, 2, 8).is_err());
        // Source shorter than the rows it claims
        assert!(channel.publish_rows(&[0; 20], 2, 3, 8).is_err());
        // Packed frame larger than the segment
        let huge = vec![0u8; 65 * 64 * 4];
        assert!(channel.publish_rows(&huge, 65, 64, 65 * 4).is_err());
    }

    #[test]
    fn test_degraded_channel_is_noop() {
        let config = RelayConfig {
            namespace: "bad/namespace".to_string(),
            ..Default::default()
        };
        assert!(FrameChannel::open(0, &config).is_err());

        let channel = FrameChannel::open_or_degraded(0, &config);
        assert!(!channel.is_live());
        channel.configure(1920, 1080, 60);
        assert!(channel.publish(&[0u8; 16]).is_ok());
        assert!(channel.publish_rows(&[0u8; 16], 2, 2, 8).is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let config = test_config();
        let channel = FrameChannel::open(4, &config).unwrap();
        channel.close();
        assert!(!channel.is_live());
        channel.close();
        assert!(channel.publish(&[1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn test_locked_mode_round_trip() {
        let config = RelayConfig {
            frame_write_mode: FrameWriteMode::Locked,
            ..test_config()
        };
        let channel = FrameChannel::open(5, &config).unwrap();
        let reader = FrameReader::open(5, &config).unwrap();

        channel.configure(4, 4, 60);
        let frame: Vec<u8> = (0..64).collect();
        channel.publish(&frame).unwrap();

        let mut out = Vec::new();
        reader.read_frame(&mut out).unwrap();
        assert_eq!(out, frame);
    }
}

// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared protocol definitions between the relay and its consumer
//!
//! These layouts are read by the user-space consumer process and must be
//! kept bit-for-bit stable.
//!
//! Frame segment:
//! ```text
//! +---------------------+
//! | ConfigurationRecord |  (16 bytes)
//! +---------------------+
//! | Pixel buffer        |  (capacity bytes, B8G8R8A8, tightly packed)
//! +---------------------+
//! ```
//!
//! Cursor segment:
//! ```text
//! +---------------------+
//! | CursorStateRecord   |  (24 bytes)
//! +---------------------+
//! | Cursor pixels       |  (128 KiB, rows of `pitch` bytes)
//! +---------------------+
//! ```

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Size of the configuration record at the start of the frame segment
pub const CONFIGURATION_RECORD_SIZE: usize = 16;

/// Size of the cursor state record at the start of the cursor segment
pub const CURSOR_STATE_SIZE: usize = 24;

/// Default total size of the frame segment (header included)
pub const DEFAULT_FRAME_SEGMENT_SIZE: usize = 20 * 1024 * 1024;

/// Default cursor pixel buffer capacity
pub const DEFAULT_CURSOR_BUFFER_SIZE: usize = 128 * 1024;

/// Bytes per pixel of the B8G8R8A8 frame and cursor formats
pub const BYTES_PER_PIXEL: usize = 4;

/// Largest hardware cursor the backend is asked to hand over
pub const CURSOR_MAX_WIDTH: u32 = 32;
pub const CURSOR_MAX_HEIGHT: u32 = 32;

/// Default prefix of every named object
pub const DEFAULT_NAMESPACE: &str = "VdMonitor";

/// Pixel formats understood by the consumer
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 32-bit BGRA (Blue, Green, Red, Alpha), used by frames and cursor shapes
    #[default]
    Bgra32 = 0,
}

impl PixelFormat {
    /// Get bytes per pixel for this format
    pub fn bytes_per_pixel(&self) -> usize {
        BYTES_PER_PIXEL
    }

    /// Tightly packed size of a `width` x `height` image
    pub fn packed_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// Frame segment header (fixed offset 0)
///
/// `configured` stays 0 until the first configure call; the consumer must not
/// interpret the pixel bytes while it is 0. Fields are written one by one, so
/// the record as a whole is not atomic.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ConfigurationRecord {
    /// Non-zero once a mode has been committed
    pub configured: AtomicU32,
    /// Frame width in pixels
    pub width: AtomicU32,
    /// Frame height in pixels
    pub height: AtomicU32,
    /// Refresh rate in Hz
    pub framerate: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<ConfigurationRecord>() == CONFIGURATION_RECORD_SIZE);

impl ConfigurationRecord {
    /// Marks the record as never configured
    pub fn reset(&self) {
        self.configured.store(0, Ordering::Release);
    }

    /// Writes the mode, then flips `configured`
    pub fn store(&self, configuration: Configuration) {
        self.width.store(configuration.width, Ordering::Relaxed);
        self.height.store(configuration.height, Ordering::Relaxed);
        self.framerate.store(configuration.framerate, Ordering::Relaxed);
        self.configured.store(1, Ordering::Release);
    }

    /// Reads the current mode, `None` while unconfigured
    pub fn load(&self) -> Option<Configuration> {
        if self.configured.load(Ordering::Acquire) == 0 {
            return None;
        }

        Some(Configuration {
            width: self.width.load(Ordering::Relaxed),
            height: self.height.load(Ordering::Relaxed),
            framerate: self.framerate.load(Ordering::Relaxed),
        })
    }
}

/// Committed display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Configuration {
    /// Size of one tightly packed frame in this mode
    pub fn frame_size(&self) -> usize {
        PixelFormat::Bgra32.packed_size(self.width, self.height)
    }
}

/// Cursor segment header (fixed offset 0)
///
/// Position fields are updated without a lock, each store on its own. Shape
/// fields are only written while holding the cursor lock.
#[repr(C)]
#[derive(Debug, Default)]
pub struct CursorStateRecord {
    /// Cursor X position, may be negative
    pub x: AtomicI32,
    /// Cursor Y position, may be negative
    pub y: AtomicI32,
    /// 1 when visible, 0 when hidden
    pub visible: AtomicU32,
    /// Shape width in pixels
    pub width: AtomicU32,
    /// Shape height in pixels
    pub height: AtomicU32,
    /// Bytes per shape row
    pub pitch: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<CursorStateRecord>() == CURSOR_STATE_SIZE);

impl CursorStateRecord {
    /// Three independent stores; a reader may observe a mix of old and new
    pub fn store_position(&self, position: CursorPosition) {
        self.x.store(position.x, Ordering::Release);
        self.y.store(position.y, Ordering::Release);
        self.visible
            .store(u32::from(position.visible), Ordering::Release);
    }

    pub fn load_position(&self) -> CursorPosition {
        CursorPosition {
            x: self.x.load(Ordering::Acquire),
            y: self.y.load(Ordering::Acquire),
            visible: self.visible.load(Ordering::Acquire) == 1,
        }
    }

    pub fn store_shape(&self, shape: CursorShapeInfo) {
        self.width.store(shape.width, Ordering::Release);
        self.height.store(shape.height, Ordering::Release);
        self.pitch.store(shape.pitch, Ordering::Release);
    }

    pub fn load_shape(&self) -> CursorShapeInfo {
        CursorShapeInfo {
            width: self.width.load(Ordering::Acquire),
            height: self.height.load(Ordering::Acquire),
            pitch: self.pitch.load(Ordering::Acquire),
        }
    }
}

/// Cursor position and visibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
}

/// Cursor shape geometry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorShapeInfo {
    /// Cursor width in pixels
    pub width: u32,
    /// Cursor height in pixels
    pub height: u32,
    /// Bytes per row in the pixel buffer
    pub pitch: u32,
}

impl CursorShapeInfo {
    /// Bytes occupied in the shared pixel buffer
    pub fn data_size(&self) -> usize {
        self.pitch as usize * self.height as usize
    }
}

/// Names of every OS object belonging to one connector
///
/// Both producer and consumer derive these from the connector index alone,
/// so no handle has to be passed between processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub frame_segment: String,
    pub frame_lock: String,
    pub frame_ready: String,
    pub config_changed: String,
    pub cursor_segment: String,
    pub cursor_lock: String,
    pub cursor_position_changed: String,
    pub cursor_image_changed: String,
}

impl ChannelNames {
    pub fn for_connector(namespace: &str, connector_index: u32) -> Self {
        let prefix = format!("/{namespace}{connector_index}");
        Self {
            frame_segment: format!("{prefix}FB"),
            frame_lock: format!("{prefix}FBMutex"),
            frame_ready: format!("{prefix}NewFrameEvent"),
            config_changed: format!("{prefix}ConfigureEvent"),
            cursor_segment: format!("{prefix}Cursor"),
            cursor_lock: format!("{prefix}CursorMutex"),
            cursor_position_changed: format!("{prefix}CursorPositionUpdatedEvent"),
            cursor_image_changed: format!("{prefix}CursorImageUpdatedEvent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<ConfigurationRecord>(), 16);
        assert_eq!(std::mem::size_of::<CursorStateRecord>(), 24);
    }

    #[test]
    fn test_configuration_record_unconfigured() {
        let record = ConfigurationRecord::default();
        assert_eq!(record.load(), None);

        record.store(Configuration {
            width: 1920,
            height: 1080,
            framerate: 60,
        });
        record.reset();
        assert_eq!(record.load(), None);
    }

    #[test]
    fn test_configuration_record_last_store_wins() {
        let record = ConfigurationRecord::default();
        record.store(Configuration {
            width: 1280,
            height: 720,
            framerate: 30,
        });
        record.store(Configuration {
            width: 1920,
            height: 1080,
            framerate: 60,
        });

        let cfg = record.load().unwrap();
        assert_eq!(cfg.width, 1920);
        assert_eq!(cfg.height, 1080);
        assert_eq!(cfg.framerate, 60);
        assert_eq!(cfg.frame_size(), 1920 * 1080 * 4);
    }

    #[test]
    fn test_cursor_record_fields_are_independent() {
        let record = CursorStateRecord::default();
        record.store_shape(CursorShapeInfo {
            width: 32,
            height: 32,
            pitch: 128,
        });
        record.store_position(CursorPosition {
            x: -5,
            y: 17,
            visible: true,
        });

        assert_eq!(
            record.load_position(),
            CursorPosition {
                x: -5,
                y: 17,
                visible: true
            }
        );
        assert_eq!(record.load_shape().data_size(), 128 * 32);
        assert_eq!(record.visible.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_pixel_format_packed_size() {
        assert_eq!(PixelFormat::default().packed_size(2, 3), 24);
        assert_eq!(PixelFormat::Bgra32.packed_size(0, 3), 0);
    }

    #[test]
    fn test_channel_names() {
        let names = ChannelNames::for_connector(DEFAULT_NAMESPACE, 0);
        assert_eq!(names.frame_segment, "/VdMonitor0FB");
        assert_eq!(names.frame_lock, "/VdMonitor0FBMutex");
        assert_eq!(names.frame_ready, "/VdMonitor0NewFrameEvent");
        assert_eq!(names.config_changed, "/VdMonitor0ConfigureEvent");
        assert_eq!(names.cursor_segment, "/VdMonitor0Cursor");
        assert_eq!(names.cursor_lock, "/VdMonitor0CursorMutex");
        assert_eq!(
            names.cursor_position_changed,
            "/VdMonitor0CursorPositionUpdatedEvent"
        );
        assert_eq!(
            names.cursor_image_changed,
            "/VdMonitor0CursorImageUpdatedEvent"
        );

        let other = ChannelNames::for_connector(DEFAULT_NAMESPACE, 3);
        assert_eq!(other.frame_segment, "/VdMonitor3FB");
        assert_ne!(names, other);
    }
}

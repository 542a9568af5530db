// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Graphics backend interfaces
//!
//! The pumps consume these traits; they never own the GPU device. A
//! synthetic implementation generating test patterns lives in [`synthetic`].

use std::io;

use vmm_sys_util::eventfd::EventFd;

use crate::protocol::{CursorShapeInfo, BYTES_PER_PIXEL};

/// Row alignment of staging buffers, as GPU readback textures usually have
const STAGING_ROW_ALIGNMENT: usize = 64;

/// Backend failure classes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Failed once; the next iteration tries again
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// Surface access lost for good; the swap chain must be recreated
    #[error("Backend lost: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Fatal(_))
    }
}

/// A rendered surface handed out by the swap chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Number of dirty rectangles since the previous surface
    pub dirty_region_count: u32,
    /// Number of move rectangles since the previous surface
    pub move_region_count: u32,
    /// Backend private handle
    pub token: u64,
}

impl Surface {
    /// Nothing changed since the previous surface
    pub fn is_clean(&self) -> bool {
        self.dirty_region_count == 0 && self.move_region_count == 0
    }
}

/// Result of a non-blocking acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Ready(Surface),
    /// No new surface yet; wait on the available event
    Pending,
}

/// CPU readable copy target, reused across frames
#[derive(Debug, Default)]
pub struct StagingBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    row_pitch: usize,
    reallocations: u64,
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the buffer for a `width` x `height` surface
    ///
    /// Only reallocates when the dimensions differ from the previous call.
    /// Returns true if it did.
    pub fn ensure(&mut self, width: u32, height: u32) -> bool {
        if self.width == width && self.height == height && !self.data.is_empty() {
            return false;
        }

        let row_len = width as usize * BYTES_PER_PIXEL;
        self.row_pitch = row_len.div_ceil(STAGING_ROW_ALIGNMENT) * STAGING_ROW_ALIGNMENT;
        self.width = width;
        self.height = height;
        self.data = vec![0u8; self.row_pitch * height as usize];
        self.reallocations += 1;
        true
    }

    /// Destination for the backend copy, `row_pitch` bytes per row
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// How many times the backing memory was allocated
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// Read view of the last copy; unmapped when dropped
    pub fn map(&self) -> MappedSurface<'_> {
        MappedSurface {
            bytes: &self.data,
            row_pitch: self.row_pitch,
            width: self.width,
            height: self.height,
        }
    }
}

/// Mapped staging memory
#[derive(Debug)]
pub struct MappedSurface<'a> {
    pub bytes: &'a [u8],
    pub row_pitch: usize,
    pub width: u32,
    pub height: u32,
}

/// Swap-chain side of the graphics backend
pub trait SurfaceSource: Send {
    /// Event raised whenever a new surface may be available
    fn available_event(&self) -> io::Result<EventFd>;

    /// Non-blocking poll for the next rendered surface
    fn acquire_next_surface(&mut self) -> Result<Acquire, BackendError>;

    /// Copy `surface` into `staging`, already sized to the surface
    fn copy_to_cpu_readable(
        &mut self,
        surface: &Surface,
        staging: &mut StagingBuffer,
    ) -> Result<(), BackendError>;

    /// Hand the surface back; must be called once per acquired surface
    fn finish_processing(&mut self, surface: Surface) -> Result<(), BackendError>;

    /// Release the swap chain. Called exactly once when the pump exits.
    fn teardown(&mut self);
}

/// Answer to a hardware cursor query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorQuery {
    /// The shape differs from the one identified by the caller's last id
    pub shape_updated: bool,
    pub visible: bool,
    pub x: i32,
    pub y: i32,
    /// Geometry of the pixels written to the query buffer
    pub shape: CursorShapeInfo,
    pub shape_id: u32,
}

/// Hardware cursor side of the graphics backend
pub trait CursorSource: Send {
    /// Event raised when position, visibility or shape changed
    fn update_event(&self) -> io::Result<EventFd>;

    /// Query the current cursor
    ///
    /// The shape is only written to `buffer` when it differs from
    /// `last_shape_id`.
    fn query_hardware_cursor(
        &mut self,
        last_shape_id: u32,
        buffer: &mut [u8],
    ) -> Result<CursorQuery, BackendError>;
}

/// Test pattern backend
pub mod synthetic {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use log::{debug, warn};

    use super::*;

    /// Swap chain producing a moving gradient at a fixed rate
    pub struct SyntheticSurfaceSource {
        width: u32,
        height: u32,
        frame_count: u64,
        available: Arc<EventFd>,
        /// Set by the ticker each interval, consumed by acquire
        due: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        ticker: Option<JoinHandle<()>>,
    }

    impl SyntheticSurfaceSource {
        pub fn new(width: u32, height: u32, fps: u32) -> io::Result<Self> {
            if width == 0 || height == 0 || fps == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid synthetic mode {width}x{height}@{fps}"),
                ));
            }

            let available = Arc::new(EventFd::new(libc::EFD_NONBLOCK)?);
            let due = Arc::new(AtomicBool::new(true));
            let running = Arc::new(AtomicBool::new(true));
            let interval = Duration::from_secs(1) / fps;

            let ticker = {
                let available = available.clone();
                let due = due.clone();
                let running = running.clone();
                thread::Builder::new()
                    .name("synthetic-vsync".to_string())
                    .spawn(move || {
                        while running.load(Ordering::Acquire) {
                            thread::sleep(interval);
                            due.store(true, Ordering::Release);
                            if let Err(e) = available.write(1) {
                                warn!("Synthetic vsync failed: {e}");
                            }
                        }
                    })?
            };

            Ok(Self {
                width,
                height,
                frame_count: 0,
                available,
                due,
                running,
                ticker: Some(ticker),
            })
        }

        fn stop_ticker(&mut self) {
            self.running.store(false, Ordering::Release);
            if let Some(ticker) = self.ticker.take() {
                if ticker.join().is_err() {
                    warn!("Synthetic vsync thread panicked");
                }
            }
        }
    }

    impl SurfaceSource for SyntheticSurfaceSource {
        fn available_event(&self) -> io::Result<EventFd> {
            self.available.try_clone()
        }

        fn acquire_next_surface(&mut self) -> Result<Acquire, BackendError> {
            if self.ticker.is_none() {
                return Err(BackendError::Fatal("swap chain torn down".to_string()));
            }
            if !self.due.swap(false, Ordering::AcqRel) {
                return Ok(Acquire::Pending);
            }

            self.frame_count += 1;
            Ok(Acquire::Ready(Surface {
                width: self.width,
                height: self.height,
                dirty_region_count: 1,
                move_region_count: 0,
                token: self.frame_count,
            }))
        }

        fn copy_to_cpu_readable(
            &mut self,
            surface: &Surface,
            staging: &mut StagingBuffer,
        ) -> Result<(), BackendError> {
            let row_pitch = staging.row_pitch();
            let width = surface.width as usize;
            let phase = (surface.token % 256) as u8;

            for (y, row) in staging
                .bytes_mut()
                .chunks_mut(row_pitch)
                .take(surface.height as usize)
                .enumerate()
            {
                for (x, pixel) in row[..width * BYTES_PER_PIXEL]
                    .chunks_exact_mut(BYTES_PER_PIXEL)
                    .enumerate()
                {
                    pixel[0] = (x as u8).wrapping_add(phase); // B
                    pixel[1] = (y as u8).wrapping_add(phase); // G
                    pixel[2] = phase; // R
                    pixel[3] = 0xFF; // A
                }
            }
            Ok(())
        }

        fn finish_processing(&mut self, _surface: Surface) -> Result<(), BackendError> {
            Ok(())
        }

        fn teardown(&mut self) {
            debug!("Synthetic swap chain torn down after {} frames", self.frame_count);
            self.stop_ticker();
        }
    }

    impl Drop for SyntheticSurfaceSource {
        fn drop(&mut self) {
            self.stop_ticker();
        }
    }

    #[derive(Debug, Default)]
    struct CursorModel {
        x: i32,
        y: i32,
        visible: bool,
        shape_id: u32,
        width: u32,
        height: u32,
        /// Packed B8G8R8A8 rows
        pixels: Vec<u8>,
    }

    /// Hardware cursor driven through a [`SyntheticCursorHandle`]
    pub struct SyntheticCursorSource {
        model: Arc<Mutex<CursorModel>>,
        update: Arc<EventFd>,
    }

    /// Moves and reshapes a [`SyntheticCursorSource`] from any thread
    #[derive(Clone)]
    pub struct SyntheticCursorHandle {
        model: Arc<Mutex<CursorModel>>,
        update: Arc<EventFd>,
    }

    impl SyntheticCursorSource {
        pub fn new() -> io::Result<(Self, SyntheticCursorHandle)> {
            let model = Arc::new(Mutex::new(CursorModel::default()));
            let update = Arc::new(EventFd::new(libc::EFD_NONBLOCK)?);
            Ok((
                Self {
                    model: model.clone(),
                    update: update.clone(),
                },
                SyntheticCursorHandle { model, update },
            ))
        }
    }

    impl SyntheticCursorHandle {
        fn update<F: FnOnce(&mut CursorModel)>(&self, f: F) {
            {
                let Ok(mut model) = self.model.lock() else {
                    return;
                };
                f(&mut model);
            }
            if let Err(e) = self.update.write(1) {
                warn!("Failed to raise synthetic cursor update: {e}");
            }
        }

        pub fn move_to(&self, x: i32, y: i32) {
            self.update(|m| {
                m.x = x;
                m.y = y;
            });
        }

        pub fn set_visible(&self, visible: bool) {
            self.update(|m| m.visible = visible);
        }

        /// Install a new shape from packed B8G8R8A8 pixels
        pub fn set_shape(&self, width: u32, height: u32, pixels: Vec<u8>) {
            self.update(|m| {
                m.shape_id = m.shape_id.wrapping_add(1);
                m.width = width;
                m.height = height;
                m.pixels = pixels;
            });
        }
    }

    impl CursorSource for SyntheticCursorSource {
        fn update_event(&self) -> io::Result<EventFd> {
            self.update.try_clone()
        }

        fn query_hardware_cursor(
            &mut self,
            last_shape_id: u32,
            buffer: &mut [u8],
        ) -> Result<CursorQuery, BackendError> {
            let model = self
                .model
                .lock()
                .map_err(|_| BackendError::Fatal("cursor model poisoned".to_string()))?;

            let mut query = CursorQuery {
                shape_updated: false,
                visible: model.visible,
                x: model.x,
                y: model.y,
                shape: CursorShapeInfo::default(),
                shape_id: model.shape_id,
            };

            if model.shape_id != last_shape_id && model.width > 0 && model.height > 0 {
                let pitch = model.width * BYTES_PER_PIXEL as u32;
                let size = pitch as usize * model.height as usize;
                if buffer.len() < size || model.pixels.len() < size {
                    return Err(BackendError::Transient(format!(
                        "cursor shape of {size} bytes does not fit the query buffer"
                    )));
                }
                buffer[..size].copy_from_slice(&model.pixels[..size]);
                query.shape_updated = true;
                query.shape = CursorShapeInfo {
                    width: model.width,
                    height: model.height,
                    pitch,
                };
            }

            Ok(query)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_surface_source_paces_frames() {
            let mut source = SyntheticSurfaceSource::new(8, 4, 10).unwrap();

            // First frame is due immediately, the next one only after a tick
            let surface = match source.acquire_next_surface().unwrap() {
                Acquire::Ready(surface) => surface,
                Acquire::Pending => panic!("first frame should be ready"),
            };
            assert_eq!((surface.width, surface.height), (8, 4));
            assert!(!surface.is_clean());
            assert_eq!(source.acquire_next_surface().unwrap(), Acquire::Pending);

            let mut staging = StagingBuffer::new();
            staging.ensure(8, 4);
            source.copy_to_cpu_readable(&surface, &mut staging).unwrap();
            let mapped = staging.map();
            assert_eq!(mapped.bytes[3], 0xFF);
            assert_eq!(mapped.bytes[4], 2); // x=1 plus phase 1

            source.finish_processing(surface).unwrap();
            source.teardown();
            assert!(source.acquire_next_surface().unwrap_err().is_fatal());
        }

        #[test]
        fn test_cursor_source_reports_shape_once() {
            let (mut source, handle) = SyntheticCursorSource::new().unwrap();
            let mut buffer = vec![0u8; 4096];

            handle.set_shape(2, 2, vec![7u8; 16]);
            handle.move_to(10, 20);
            handle.set_visible(true);

            let first = source.query_hardware_cursor(0, &mut buffer).unwrap();
            assert!(first.shape_updated);
            assert_eq!(first.shape.pitch, 8);
            assert_eq!((first.x, first.y, first.visible), (10, 20, true));
            assert_eq!(&buffer[..16], &[7u8; 16]);

            let second = source
                .query_hardware_cursor(first.shape_id, &mut buffer)
                .unwrap();
            assert!(!second.shape_updated);
        }
    }
}

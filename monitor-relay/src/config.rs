// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Relay configuration

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{
    CONFIGURATION_RECORD_SIZE, CURSOR_MAX_HEIGHT, CURSOR_MAX_WIDTH, DEFAULT_CURSOR_BUFFER_SIZE,
    DEFAULT_FRAME_SEGMENT_SIZE, DEFAULT_NAMESPACE,
};
use crate::{RelayError, Result};

/// Longest namespace that still leaves room for the object suffixes
/// within NAME_MAX once the semaphore prefix is added.
const MAX_NAMESPACE_LEN: usize = 200;

/// How frame copies are guarded against concurrent consumer reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameWriteMode {
    /// Copy without any lock; a consumer reading mid-copy may see a torn frame
    #[default]
    BestEffort,
    /// Copy while holding the frame buffer lock
    Locked,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Prefix of every named OS object
    pub namespace: String,
    /// Total frame segment size, configuration record included
    pub frame_segment_size: usize,
    /// Cursor pixel buffer capacity
    pub cursor_buffer_size: usize,
    /// Upper bound on one swap-chain wait
    pub acquire_timeout_ms: u64,
    /// Longest wait for a named lock held by a live process
    pub lock_timeout_ms: u64,
    /// Frame copy locking
    pub frame_write_mode: FrameWriteMode,
    /// Remove named objects this side created when the channel closes
    ///
    /// Off by default so a consumer attached across a producer restart
    /// keeps seeing the same objects.
    pub unlink_on_close: bool,
    /// Permission bits for created objects
    pub mode: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            frame_segment_size: DEFAULT_FRAME_SEGMENT_SIZE,
            cursor_buffer_size: DEFAULT_CURSOR_BUFFER_SIZE,
            acquire_timeout_ms: 16,
            lock_timeout_ms: 1000,
            frame_write_mode: FrameWriteMode::BestEffort,
            unlink_on_close: false,
            mode: 0o660,
        }
    }
}

impl RelayConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: RelayConfig = serde_json::from_str(&contents).map_err(|e| {
            RelayError::InvalidConfig(format!("{}: {e}", path.as_ref().display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(RelayError::InvalidConfig("namespace is empty".to_string()));
        }
        if self.namespace.len() > MAX_NAMESPACE_LEN {
            return Err(RelayError::InvalidConfig(format!(
                "namespace longer than {MAX_NAMESPACE_LEN} bytes"
            )));
        }
        if self.namespace.contains('/') || self.namespace.contains('\0') {
            return Err(RelayError::InvalidConfig(format!(
                "namespace {:?} contains '/' or NUL",
                self.namespace
            )));
        }
        if self.frame_segment_size <= CONFIGURATION_RECORD_SIZE {
            return Err(RelayError::InvalidConfig(format!(
                "frame segment of {} bytes leaves no room for pixels",
                self.frame_segment_size
            )));
        }
        let smallest_cursor = (CURSOR_MAX_WIDTH * CURSOR_MAX_HEIGHT * 4) as usize;
        if self.cursor_buffer_size < smallest_cursor {
            return Err(RelayError::InvalidConfig(format!(
                "cursor buffer must hold at least {smallest_cursor} bytes"
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "acquire_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(RelayError::InvalidConfig(
                "lock_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Pixel bytes available after the configuration record
    pub fn frame_capacity(&self) -> usize {
        self.frame_segment_size - CONFIGURATION_RECORD_SIZE
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.namespace, "VdMonitor");
        assert_eq!(config.frame_segment_size, 20 * 1024 * 1024);
        assert_eq!(config.frame_capacity(), 20 * 1024 * 1024 - 16);
        assert_eq!(config.cursor_buffer_size, 128 * 1024);
        assert_eq!(config.acquire_timeout(), Duration::from_millis(16));
        assert_eq!(config.frame_write_mode, FrameWriteMode::BestEffort);
        assert!(!config.unlink_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"namespace": "Lab", "frame_write_mode": "locked"}"#).unwrap();
        assert_eq!(config.namespace, "Lab");
        assert_eq!(config.frame_write_mode, FrameWriteMode::Locked);
        assert_eq!(config.acquire_timeout_ms, 16);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            RelayConfig {
                namespace: String::new(),
                ..Default::default()
            },
            RelayConfig {
                namespace: "a/b".to_string(),
                ..Default::default()
            },
            RelayConfig {
                namespace: "x".repeat(MAX_NAMESPACE_LEN + 1),
                ..Default::default()
            },
            RelayConfig {
                frame_segment_size: 16,
                ..Default::default()
            },
            RelayConfig {
                cursor_buffer_size: 1024,
                ..Default::default()
            },
            RelayConfig {
                acquire_timeout_ms: 0,
                ..Default::default()
            },
            RelayConfig {
                lock_timeout_ms: 0,
                ..Default::default()
            },
        ];

        for config in &bad {
            assert!(
                matches!(config.validate(), Err(RelayError::InvalidConfig(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("vd-relay-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"acquire_timeout_ms": 8, "unlink_on_close": true}"#).unwrap();

        let config = RelayConfig::from_file(&path).unwrap();
        assert_eq!(config.acquire_timeout_ms, 8);
        assert!(config.unlink_on_close);

        fs::write(&path, r#"{"acquire_timeout_ms": 0}"#).unwrap();
        assert!(RelayConfig::from_file(&path).is_err());

        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            RelayConfig::from_file(&path),
            Err(RelayError::InvalidConfig(_))
        ));

        fs::remove_file(&path).unwrap();
    }
}

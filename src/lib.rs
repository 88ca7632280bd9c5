//! Stream acquisition and depth decoding for Kinect v2 class time-of-flight cameras.
//!
//! [`capture`] turns USB transfer completions into whole color/depth frames,
//! [`decoder`] turns those frames into calibrated depth, infrared and color images.

pub mod capture;
pub mod decoder;
pub mod error;
pub mod pipeline;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

pub use error::{Error, Result, TransportError};

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "K4W2_LOG";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub decoder: DecoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Frame slots per channel ring buffer.
    pub ring_buffer_size: usize,
    pub color_transfers: usize,
    pub color_packet_size: usize,
    pub depth_transfers: usize,
    pub depth_packets_per_transfer: usize,
    /// Event loop poll interval, in microseconds.
    pub event_timeout_us: u64,
    /// Upper bound on waiting for in-flight transfers at close, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Control endpoint timeout, in milliseconds.
    pub control_timeout_ms: u64,
    /// Pin the acquisition thread to this core.
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub num_slots: usize,
    pub decode_threads: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: 30,
            color_transfers: 64,
            color_packet_size: 0x4000,
            depth_transfers: 4,
            depth_packets_per_transfer: 16,
            event_timeout_us: 100,
            shutdown_timeout_ms: 3000,
            control_timeout_ms: 1000,
            pin_core: None,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            num_slots: 2,
            decode_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
        }
    }
}

impl CaptureConfig {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_micros(self.event_timeout_us)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `K4W2_*` environment
    /// overrides (`K4W2_CAPTURE__RING_BUFFER_SIZE=8`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("K4W2")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// Install a fmt subscriber filtered by `K4W2_LOG` (default `k4w2=info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("k4w2=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_layout() {
        let config = Config::default();
        assert_eq!(config.capture.ring_buffer_size, 30);
        assert_eq!(config.capture.color_packet_size, 0x4000);
        assert_eq!(config.capture.color_transfers, 64);
        assert_eq!(config.capture.depth_transfers, 4);
        assert_eq!(config.capture.depth_packets_per_transfer, 16);
        assert_eq!(config.capture.shutdown_timeout(), Duration::from_secs(3));
        assert!(config.decoder.decode_threads >= 1);
    }

    #[test]
    fn load_reads_toml_and_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("k4w2-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("k4w2.toml");
        std::fs::write(&path, "[capture]\nring_buffer_size = 8\n[decoder]\nnum_slots = 4\n")
            .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.capture.ring_buffer_size, 8);
        assert_eq!(config.capture.color_transfers, 64);
        assert_eq!(config.decoder.num_slots, 4);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

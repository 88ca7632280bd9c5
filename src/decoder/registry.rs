//! Ordered backend probing.

use tracing::{debug, info, instrument, warn};

use crate::decoder::{color_cpu, depth_cpu, DecodeBackend, Decoder, DecoderFlags};
use crate::{DecoderConfig, Result};

/// Builds a backend for the given flags and slot count, or explains why it
/// does not apply.
pub type BackendFactory =
    Box<dyn Fn(DecoderFlags, usize, &DecoderConfig) -> Result<Box<dyn DecodeBackend>> + Send + Sync>;

struct Entry {
    name: &'static str,
    factory: BackendFactory,
}

/// Backends in probe order. Append-only.
pub struct DecoderRegistry {
    config: DecoderConfig,
    entries: Vec<Entry>,
}

impl DecoderRegistry {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    /// GPU depth backends first, then the CPU depth and color decoders.
    pub fn with_default_backends(config: DecoderConfig) -> Self {
        let mut registry = Self::new(config);

        #[cfg(feature = "gpu")]
        {
            use crate::decoder::gpu::{DepthWgpu, DepthWgpuTexture};

            registry.register(DepthWgpuTexture::NAME, |flags, slots, _| {
                Ok(Box::new(DepthWgpuTexture::open(flags, slots)?))
            });
            registry.register(DepthWgpu::NAME, |flags, slots, _| {
                Ok(Box::new(DepthWgpu::open(flags, slots)?))
            });
        }

        registry.register(depth_cpu::NAME, |flags, slots, config| {
            Ok(Box::new(depth_cpu::DepthCpu::open(
                flags,
                slots,
                config.decode_threads,
            )?))
        });
        registry.register(color_cpu::NAME, |flags, slots, _| {
            Ok(Box::new(color_cpu::ColorCpu::open(flags, slots)?))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &'static str, factory: F)
    where
        F: Fn(DecoderFlags, usize, &DecoderConfig) -> Result<Box<dyn DecodeBackend>>
            + Send
            + Sync
            + 'static,
    {
        self.entries.push(Entry {
            name,
            factory: Box::new(factory),
        });
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// First backend accepting `flags`, or `None` if none does.
    #[instrument(skip(self), fields(flags = %flags))]
    pub fn open(&self, flags: DecoderFlags, num_slots: usize) -> Option<Decoder> {
        if num_slots == 0 {
            warn!("decoder needs at least one slot");
            return None;
        }
        for entry in &self.entries {
            match (entry.factory)(flags, num_slots, &self.config) {
                Ok(backend) => {
                    info!("{} decoder is selected", entry.name);
                    return Some(Decoder::new(backend, flags, num_slots));
                }
                Err(e) => debug!("{} decoder is skipped: {e}", entry.name),
            }
        }
        warn!("no decoder accepts these flags");
        None
    }
}

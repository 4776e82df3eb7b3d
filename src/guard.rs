use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use thiserror::Error;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySnapshot {
    pub fn available_gb(&self) -> f64 {
        self.available_bytes as f64 / BYTES_PER_GB
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_GB
    }
}

/// Source of host memory figures. `None` means the host cannot report them.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> Option<MemorySnapshot>;
}

pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }
        let mut system = self.system.lock();
        system.refresh_memory();
        let total_bytes = system.total_memory();
        // sysinfo reports zero totals on hosts it cannot introspect
        if total_bytes == 0 {
            return None;
        }
        Some(MemorySnapshot {
            available_bytes: system.available_memory(),
            total_bytes,
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error(
    "Insufficient RAM to load {backend} in this environment. \
     Available: {available_gb:.1}GB (total {total_gb:.1}GB). \
     Need ~{required_gb:.1}GB available to avoid OOM. \
     Fix: increase memory/swap or run the worker on a bigger machine. \
     You can override the threshold with VOCALX_MIN_SAM_AUDIO_AVAIL_GB."
)]
pub struct ResourceError {
    pub backend: String,
    pub available_gb: f64,
    pub total_gb: f64,
    pub required_gb: f64,
}

/// Pre-load admission check against available host memory.
#[derive(Clone)]
pub struct ResourceGuard {
    probe: Arc<dyn MemoryProbe>,
}

impl ResourceGuard {
    pub fn new(probe: Arc<dyn MemoryProbe>) -> Self {
        Self { probe }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemMemoryProbe::new()))
    }

    pub fn check(&self, backend: &str, min_available_gb: f64) -> Result<(), ResourceError> {
        let Some(snapshot) = self.probe.snapshot() else {
            tracing::debug!(backend, "memory introspection unavailable, skipping guard");
            return Ok(());
        };

        let available_gb = snapshot.available_gb();
        if available_gb < min_available_gb {
            return Err(ResourceError {
                backend: backend.to_string(),
                available_gb,
                total_gb: snapshot.total_gb(),
                required_gb: min_available_gb,
            });
        }

        tracing::debug!(
            backend,
            available_gb,
            required_gb = min_available_gb,
            "memory guard passed"
        );
        Ok(())
    }
}

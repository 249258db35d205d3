//! Engine configuration and fixed limits
//!
//! Settings are host-adjustable until the first library is loaded through
//! an engine; after that they are frozen.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{FfiError, Result};

/// Maximum declared parameters per function (variadic extras included)
pub const MAX_PARAMETERS: usize = 32;
/// Maximum out/inout parameters per function
pub const MAX_OUT_PARAMETERS: usize = 4;
/// Size of the process-wide trampoline table
pub const MAX_TRAMPOLINES: usize = 1024;
/// Hard ceiling for `max_async_calls`
pub const MAX_ASYNC_CALLS: usize = 256;
/// Hard ceiling for resident async arenas
pub const MAX_RESIDENT_POOLS: usize = 16;
/// Maximum indirection count accepted by `define_pointer`
pub const MAX_POINTER_DEPTH: usize = 4;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

const MIN_MEMORY_SIZE: usize = KIB;
const MAX_MEMORY_SIZE: usize = 16 * MIB;
const MIN_TYPE_SIZE: usize = 32;
const MAX_TYPE_SIZE: usize = 512 * MIB;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scratch stack for synchronous calls
    pub sync_stack_size: usize,
    /// Scratch heap for synchronous calls
    pub sync_heap_size: usize,
    pub async_stack_size: usize,
    pub async_heap_size: usize,
    /// Arenas kept mapped for reuse
    pub resident_async_pools: usize,
    /// Resident plus temporary arenas allowed at once
    pub max_async_calls: usize,
    /// Ceiling for record, union and array sizes
    pub max_type_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_stack_size: MIB,
            sync_heap_size: 2 * MIB,
            async_stack_size: 256 * KIB,
            async_heap_size: 512 * KIB,
            resident_async_pools: 2,
            max_async_calls: 64,
            max_type_size: 64 * MIB,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| FfiError::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| FfiError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every setting against its allowed range
    pub fn validate(&self) -> Result<()> {
        check_range("sync_stack_size", self.sync_stack_size, MIN_MEMORY_SIZE, MAX_MEMORY_SIZE)?;
        check_range("sync_heap_size", self.sync_heap_size, MIN_MEMORY_SIZE, MAX_MEMORY_SIZE)?;
        check_range("async_stack_size", self.async_stack_size, MIN_MEMORY_SIZE, MAX_MEMORY_SIZE)?;
        check_range("async_heap_size", self.async_heap_size, MIN_MEMORY_SIZE, MAX_MEMORY_SIZE)?;
        check_range("resident_async_pools", self.resident_async_pools, 0, MAX_RESIDENT_POOLS)?;
        check_range("max_async_calls", self.max_async_calls, 0, MAX_ASYNC_CALLS)?;
        check_range("max_type_size", self.max_type_size, MIN_TYPE_SIZE, MAX_TYPE_SIZE)?;

        if self.max_async_calls < self.resident_async_pools {
            return Err(FfiError::Config(
                "Setting max_async_calls must be >= to resident_async_pools".into(),
            ));
        }

        Ok(())
    }

    /// Temporary arenas allowed on top of the resident ones
    #[inline]
    pub fn max_temporaries(&self) -> usize {
        self.max_async_calls.saturating_sub(self.resident_async_pools)
    }
}

fn check_range(name: &str, value: usize, min: usize, max: usize) -> Result<()> {
    if value < min || value > max {
        return Err(FfiError::Config(format!(
            "Setting '{}' must be between {} and {}",
            name, min, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_temporaries(), 62);
    }

    #[test]
    fn parse_partial_toml() {
        let config = EngineConfig::parse("resident_async_pools = 4\nmax_async_calls = 8\n").unwrap();
        assert_eq!(config.resident_async_pools, 4);
        assert_eq!(config.max_temporaries(), 4);
        assert_eq!(config.sync_heap_size, EngineConfig::default().sync_heap_size);
    }

    #[test]
    fn rejects_out_of_range_sizes() {
        let err = EngineConfig::parse("sync_stack_size = 12").unwrap_err();
        assert!(err.to_string().contains("sync_stack_size"));

        let err = EngineConfig::parse("resident_async_pools = 8\nmax_async_calls = 4").unwrap_err();
        assert!(err.to_string().contains("max_async_calls"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynffi.toml");
        fs::write(&path, "max_type_size = 4096\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_type_size, 4096);
    }
}

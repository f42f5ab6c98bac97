//! Engine configuration, recognized from the environment.
//!
//! The core has no CLI surface of its own (that's the out-of-scope adapter
//! layer's job), so this mirrors the teacher's `args.rs` in spirit — small
//! and direct — but reads from the environment rather than `clap`, since
//! there's no process entrypoint here to parse argv for.

use std::env;

/// Maximum chunk size allowed by the on-disk format (3-byte LE field).
pub const MAX_CHUNK_SIZE: u32 = (1 << 24) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub chunk_size: u32,
    pub data_slice_count: u8,
    pub parity_slice_count: u8,
    pub instance_identity_path: String,
    pub mount_root: String,
    pub verify_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chunk_size: 16384,
            data_slice_count: 4,
            parity_slice_count: 2,
            instance_identity_path: "/var/lib/strubs/identity".to_string(),
            mount_root: "/run/strubs/mounts".to_string(),
            verify_batch_size: 16,
        }
    }
}

impl Config {
    /// Build a `Config` from the documented environment variables, falling
    /// back to `Default::default()` for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            chunk_size: env_parsed("STRUBS_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            data_slice_count: env_parsed("STRUBS_DATA_SLICES").unwrap_or(defaults.data_slice_count),
            parity_slice_count: env_parsed("STRUBS_PARITY_SLICES")
                .unwrap_or(defaults.parity_slice_count),
            instance_identity_path: env::var("STRUBS_INSTANCE_IDENTITY_PATH")
                .unwrap_or(defaults.instance_identity_path),
            mount_root: env::var("STRUBS_MOUNT_ROOT").unwrap_or(defaults.mount_root),
            verify_batch_size: env_parsed("STRUBS_VERIFY_BATCH_SIZE")
                .unwrap_or(defaults.verify_batch_size),
        }
    }

    /// Validate the invariants spec.md §3/§6 place on the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSizeTooLarge(self.chunk_size));
        }
        if self.data_slice_count == 0 {
            return Err(ConfigError::NoDataSlices);
        }
        Ok(())
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk_size {0} exceeds the maximum of {MAX_CHUNK_SIZE}")]
    ChunkSizeTooLarge(u32),
    #[error("data_slice_count must be at least 1")]
    NoDataSlices,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.chunk_size, 16384);
        assert_eq!(cfg.data_slice_count, 4);
        assert_eq!(cfg.parity_slice_count, 2);
        assert_eq!(cfg.verify_batch_size, 16);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_oversized_chunk() {
        let mut cfg = Config::default();
        cfg.chunk_size = MAX_CHUNK_SIZE + 1;
        assert_eq!(cfg.validate(), Err(ConfigError::ChunkSizeTooLarge(cfg.chunk_size)));
    }
}

//! Allocation policy knobs shared by every backend.

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Element-size hint values accepted by `cuMemAllocPitch`.
pub const VALID_PITCH_ELEMENT_BYTES: [u32; 3] = [4, 8, 16];

fn default_pitch_element_bytes() -> u32 {
    16
}

fn default_host_pitch_alignment() -> usize {
    256
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Largest access width (bytes) kernels will use on pitched planes.
    /// Passed to the pitched allocator, which picks a pitch coalescing for it.
    #[serde(default = "default_pitch_element_bytes")]
    pub pitch_element_bytes: u32,
    /// Row alignment of the host-emulated backend.  Power of two.
    #[serde(default = "default_host_pitch_alignment")]
    pub host_pitch_alignment: usize,
    /// Request pinned host memory visible to every device context.
    #[serde(default = "default_true")]
    pub pinned_portable: bool,
    /// Cap on live bytes for the host-emulated backend (`None` = unlimited).
    #[serde(default)]
    pub host_capacity_bytes: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pitch_element_bytes: default_pitch_element_bytes(),
            host_pitch_alignment: default_host_pitch_alignment(),
            pinned_portable: true,
            host_capacity_bytes: None,
        }
    }
}

impl MemoryConfig {
    pub fn from_json(data: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(data)
            .map_err(|err| MemoryError::Config(format!("invalid memory config JSON: {err}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_PITCH_ELEMENT_BYTES.contains(&self.pitch_element_bytes) {
            return Err(MemoryError::Config(format!(
                "pitch_element_bytes must be one of {VALID_PITCH_ELEMENT_BYTES:?}, got {}",
                self.pitch_element_bytes
            )));
        }
        if !self.host_pitch_alignment.is_power_of_two() {
            return Err(MemoryError::Config(format!(
                "host_pitch_alignment must be a power of two, got {}",
                self.host_pitch_alignment
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg = MemoryConfig::from_json("{}").expect("defaults should parse");
        assert_eq!(cfg, MemoryConfig::default());
        assert_eq!(cfg.pitch_element_bytes, 16);
        assert!(cfg.pinned_portable);
    }

    #[test]
    fn from_json_reads_capacity() {
        let cfg = MemoryConfig::from_json(r#"{"host_capacity_bytes": 1048576}"#)
            .expect("config should parse");
        assert_eq!(cfg.host_capacity_bytes, Some(1 << 20));
    }

    #[test]
    fn rejects_bad_pitch_element_bytes() {
        let err = MemoryConfig::from_json(r#"{"pitch_element_bytes": 3}"#)
            .expect_err("3 is not a valid element size");
        assert!(err.to_string().contains("pitch_element_bytes"));
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let cfg = MemoryConfig {
            host_pitch_alignment: 96,
            ..MemoryConfig::default()
        };
        let err = cfg.validate().expect_err("96 is not a power of two");
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = MemoryConfig::from_json("{").expect_err("truncated JSON");
        assert_eq!(err.error_code(), 400);
    }
}

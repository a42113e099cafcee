//! Model configuration.

use serde::{Deserialize, Serialize};

/// Largest cartridge image the default policy will grow to (32 MiB).
pub const DEFAULT_MAX_BUFFER_LEN: usize = 0x0200_0000;

/// GBA ROM pointers are stored as `0x08000000 + offset`.
pub const DEFAULT_POINTER_BASE: u32 = 0x0800_0000;

/// What the relocation engine does when no free region is large enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// Report [`ModelError::InsufficientSpace`](crate::ModelError::InsufficientSpace).
    Fail,
    /// Append unused space to the end of the buffer, up to `max_len` bytes in total.
    Expand {
        /// Upper bound on the buffer length; `None` means unbounded.
        max_len: Option<usize>,
    },
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        GrowthPolicy::Expand {
            max_len: Some(DEFAULT_MAX_BUFFER_LEN),
        }
    }
}

/// Tunables for a [`RomModel`](crate::RomModel).
///
/// ```rust
/// use rom_core::{GrowthPolicy, ModelConfig};
///
/// let config: ModelConfig = serde_json::from_str(r#"{ "growth": { "mode": "fail" } }"#).unwrap();
/// assert_eq!(config.growth, GrowthPolicy::Fail);
/// assert_eq!(config.fill_byte, 0xFF);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Value of unused bytes; also the value vacated bytes are cleared to.
    pub fill_byte: u8,
    /// Offset added to an address when it is stored as a pointer.
    pub pointer_base: u32,
    /// Address where the free-space scan starts.
    pub free_space_origin: usize,
    /// Alignment of relocation destinations.
    pub free_space_alignment: usize,
    /// Extra unused bytes required after a relocation destination.
    pub free_space_padding: usize,
    /// Behavior when the buffer has no free region large enough.
    pub growth: GrowthPolicy,
    /// Maximum number of sealed transactions kept for undo.
    pub max_undo: usize,
}

impl ModelConfig {
    /// Alignment clamped to at least one byte.
    pub fn alignment(&self) -> usize {
        self.free_space_alignment.max(1)
    }

    /// Round `address` up to the configured alignment.
    pub fn align_up(&self, address: usize) -> usize {
        let alignment = self.alignment();
        address.div_ceil(alignment) * alignment
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fill_byte: 0xFF,
            pointer_base: DEFAULT_POINTER_BASE,
            free_space_origin: 0,
            free_space_alignment: 4,
            free_space_padding: 0,
            growth: GrowthPolicy::default(),
            max_undo: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        let config = ModelConfig::default();
        assert_eq!(config.align_up(0), 0);
        assert_eq!(config.align_up(1), 4);
        assert_eq!(config.align_up(4), 4);
        assert_eq!(config.align_up(0x13), 0x14);

        let unaligned = ModelConfig {
            free_space_alignment: 0,
            ..ModelConfig::default()
        };
        assert_eq!(unaligned.align_up(0x13), 0x13);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ModelConfig =
            serde_json::from_str(r#"{ "growth": { "mode": "expand", "max_len": null } }"#).unwrap();
        assert_eq!(config.growth, GrowthPolicy::Expand { max_len: None });
        assert_eq!(config.pointer_base, DEFAULT_POINTER_BASE);
        assert_eq!(config.max_undo, 100);
    }
}

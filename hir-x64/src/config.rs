//! Lowering configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Switches that change what the lowering pass emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoweringConfig {
    /// Emit a typed tracer call after every context and guest memory
    /// load/store.
    pub trace_data: bool,

    /// Emit a tracer call carrying the text of every COMMENT instruction.
    pub trace_instructions: bool,

    /// Allow paths whose vector lane ordering has not been verified against
    /// real hardware (dot products, pack/unpack formats).
    ///
    /// When disabled those opcodes fail with
    /// [`LoweringError::UnverifiedSequence`](crate::LoweringError::UnverifiedSequence)
    /// so the caller can fall back instead of running guessed semantics.
    pub unverified_lane_order: bool,

    /// Record guest address to native offset pairs at SOURCE_OFFSET markers.
    pub emit_source_map: bool,

    /// Refuse functions with more instructions than this.
    pub max_instructions: usize,

    /// Log a hex listing of every compiled function at debug level.
    pub debug_listing: bool,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            trace_data: false,
            trace_instructions: false,
            unverified_lane_order: false, // Unverified lane orders stay opt-in
            emit_source_map: true,
            max_instructions: 64 * 1024, // 64K HIR instructions per function
            debug_listing: false,
        }
    }
}

impl LoweringConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Enable every tracer hook.
    pub fn with_tracing(mut self) -> Self {
        self.trace_data = true;
        self.trace_instructions = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoweringConfig::default();
        assert!(!config.trace_data);
        assert!(!config.unverified_lane_order);
        assert!(config.emit_source_map);
        assert_eq!(config.max_instructions, 65536);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LoweringConfig::from_json(r#"{"traceData": true}"#).unwrap();
        assert!(config.trace_data);
        assert!(!config.trace_instructions);
        assert_eq!(config.max_instructions, 65536);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            LoweringConfig::from_json("{"),
            Err(ConfigError::Json(_))
        ));
    }
}

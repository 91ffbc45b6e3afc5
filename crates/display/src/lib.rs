#![doc = include_str!("../README.md")]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod card;
pub mod mirror;
pub mod mode;
mod status;

/// Display mirror settings.
///
/// Every field maps to a recognized configuration option of the appliance;
/// defaults match the values the original hardware shipped with.
///
/// # Example
/// ```rust
/// use visor_display::DisplayConfig;
///
/// let cfg = DisplayConfig::default();
/// assert_eq!(cfg.port, "HDMI-A-1");
/// assert_eq!(cfg.timeout, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// DRM device node.
    pub path: PathBuf,
    /// Connector name, e.g. `HDMI-A-1`.
    pub port: String,
    /// Seconds to wait for a page-flip event.
    pub timeout: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/dri/card0"),
            port: "HDMI-A-1".to_string(),
            timeout: 5,
        }
    }
}

pub mod prelude {
    pub use crate::DisplayConfig;
    pub use crate::mirror::{DisplayError, DrmMirror, MirrorState, StubReason};
    pub use crate::mode::{ModeCandidate, select_best};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: DisplayConfig = serde_json::from_str(r#"{"port": "DP-2"}"#).unwrap();
        assert_eq!(cfg.port, "DP-2");
        assert_eq!(cfg.path, PathBuf::from("/dev/dri/card0"));
        assert_eq!(cfg.timeout, 5);
    }

    #[test]
    fn config_round_trips() {
        let cfg = DisplayConfig {
            path: PathBuf::from("/dev/dri/card1"),
            port: "HDMI-A-2".to_string(),
            timeout: 10,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DisplayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, cfg.path);
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.timeout, cfg.timeout);
    }
}

use serde::{Deserialize, Serialize};

/// Stream controller knobs.
///
/// Every field maps to a recognized configuration option of the appliance;
/// defaults match the values the original hardware shipped with.
///
/// # Example
/// ```rust
/// use visor::config::StreamTunables;
///
/// let tunables = StreamTunables::default();
/// assert_eq!(tunables.error_delay, 1);
/// assert_eq!(tunables.last_as_blank, -1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTunables {
    /// Target capture rate; zero keeps the driver default.
    pub desired_fps: u32,
    /// Throttle grabbing while no consumer is attached.
    pub slowdown: bool,
    /// Seconds without any client before the idle-exit hook fires; zero
    /// disables.
    pub exit_on_no_clients: u64,
    /// Behavior on signal loss: negative blanks immediately, zero freezes
    /// the last live frame forever, positive freezes it for that many
    /// seconds.
    pub last_as_blank: i64,
    /// Seconds between device reopen attempts.
    pub error_delay: u64,
    /// Motion-video bitrate in Kbps.
    pub h264_bitrate: u32,
    /// Motion-video GOP length.
    pub h264_gop: u32,
}

impl Default for StreamTunables {
    fn default() -> Self {
        Self {
            desired_fps: 0,
            slowdown: false,
            exit_on_no_clients: 0,
            last_as_blank: -1,
            error_delay: 1,
            h264_bitrate: 5000,
            h264_gop: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let tunables: StreamTunables =
            serde_json::from_str(r#"{"slowdown": true, "exit_on_no_clients": 30}"#).unwrap();
        assert!(tunables.slowdown);
        assert_eq!(tunables.exit_on_no_clients, 30);
        assert_eq!(tunables.h264_bitrate, 5000);
        assert_eq!(tunables.error_delay, 1);
    }
}

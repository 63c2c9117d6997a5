//! Session configuration: the host-tunable scheduler properties.

use std::str::FromStr;
use std::time::Duration;

use crate::StreamError;

/// How far behind the live edge playback should sit, either as wall-clock
/// time or as a number of fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationDelay {
    Time(Duration),
    Fragments(u32),
}

impl FromStr for PresentationDelay {
    type Err = StreamError;

    /// Accepts `"12s"`, `"2500ms"` (any humantime form) or `"3f"` for a
    /// fragment count.
    fn from_str(s: &str) -> Result<PresentationDelay, StreamError> {
        let s = s.trim();
        if let Some(frags) = s.strip_suffix('f') {
            let n: u32 = frags.trim().parse().map_err(|_| {
                StreamError::Parsing(format!("invalid fragment count in presentation delay {s}"))
            })?;
            return Ok(PresentationDelay::Fragments(n));
        }
        humantime::parse_duration(s)
            .map(PresentationDelay::Time)
            .map_err(|e| StreamError::Parsing(format!("presentation delay {s}: {e}")))
    }
}

/// Host-facing knobs of a playback session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Assumed network bandwidth in bits per second to start playback with,
    /// before any download has been measured. 0 selects the lowest variant.
    pub connection_speed: u64,
    /// 0 = unbounded.
    pub max_video_width: u32,
    /// 0 = unbounded.
    pub max_video_height: u32,
    /// Frames per second; 0.0 = unbounded.
    pub max_video_framerate: f64,
    /// Maximum bandwidth the adapter may select, bits per second; 0 =
    /// unbounded. Also caps the keyframe rate in trick mode.
    pub max_bitrate: u64,
    /// Distance from the live edge. Defaults to the manifest's suggested
    /// delay, falling back to three target durations.
    pub presentation_delay: Option<PresentationDelay>,
    /// Number of segments buffered before EOS is declared on a VOD playlist.
    pub fragments_cache: u32,
    /// Hysteresis for upward bitrate switches, in `[0, 1]`: a higher
    /// representation is only selected once the measured rate exceeds its
    /// bandwidth by this fraction.
    pub bitrate_switch_tolerance: f64,
    /// Back-pressure limit on the event channel; 0 = unbounded.
    pub max_queue_size_buffers: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            connection_speed: 0,
            max_video_width: 0,
            max_video_height: 0,
            max_video_framerate: 0.0,
            max_bitrate: 0,
            presentation_delay: None,
            fragments_cache: 3,
            bitrate_switch_tolerance: 0.4,
            max_queue_size_buffers: 0,
        }
    }
}

impl SessionConfig {
    /// Check value ranges, normalising what can be normalised.
    pub fn validate(&mut self) -> Result<(), StreamError> {
        if self.fragments_cache < 2 {
            self.fragments_cache = 2;
        }
        if !(0.0..=1.0).contains(&self.bitrate_switch_tolerance) {
            return Err(StreamError::Other(format!(
                "bitrate_switch_tolerance must be within [0, 1], got {}",
                self.bitrate_switch_tolerance
            )));
        }
        if self.max_video_framerate < 0.0 {
            return Err(StreamError::Other(format!(
                "max_video_framerate must be non-negative, got {}",
                self.max_video_framerate
            )));
        }
        Ok(())
    }
}

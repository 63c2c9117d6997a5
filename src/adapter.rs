//! Bitrate adaptation: choosing the representation that the measured
//! network throughput can sustain.

use std::time::Duration;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::AdaptationSet;

/// Per-track throughput estimator and representation selector.
#[derive(Debug)]
pub struct BitrateAdapter {
    /// Blended download rate in bits per second; starts from the configured
    /// connection speed.
    measured_bps: u64,
    tolerance: f64,
    max_bitrate: u64,
    max_width: u32,
    max_height: u32,
    max_framerate: f64,
}

impl BitrateAdapter {
    pub fn new(config: &SessionConfig) -> BitrateAdapter {
        BitrateAdapter {
            measured_bps: config.connection_speed,
            tolerance: config.bitrate_switch_tolerance,
            max_bitrate: config.max_bitrate,
            max_width: config.max_video_width,
            max_height: config.max_video_height,
            max_framerate: config.max_video_framerate,
        }
    }

    /// Record one completed fragment download. The estimate blends slowly,
    /// `(3·old + new) / 4`, so a single fast or slow segment does not cause
    /// a switch storm.
    pub fn record_download(&mut self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() || bytes == 0 {
            return;
        }
        let bps = (bytes as f64 * 8.0 / elapsed.as_secs_f64()) as u64;
        self.measured_bps = if self.measured_bps == 0 {
            bps
        } else {
            (3 * self.measured_bps + bps) / 4
        };
        debug!(
            instantaneous_bps = bps,
            blended_bps = self.measured_bps,
            "recorded download rate"
        );
    }

    pub fn measured_bitrate(&self) -> u64 {
        self.measured_bps
    }

    /// The bandwidth budget offered to representation selection.
    fn budget(&self) -> u64 {
        if self.max_bitrate > 0 {
            self.measured_bps.min(self.max_bitrate)
        } else {
            self.measured_bps
        }
    }

    /// Decide whether to switch away from `current`. Returns the index of
    /// the representation to switch to, or None to stay. In keyframe trick
    /// mode the adapter never switches. Upward switches apply the configured
    /// tolerance as hysteresis; downward switches happen as soon as the
    /// measured rate no longer covers the current bandwidth.
    pub fn select(
        &self,
        adaptation: &AdaptationSet,
        current: usize,
        trick_mode: bool,
    ) -> Option<usize> {
        if trick_mode {
            return None;
        }
        let candidate = adaptation.representation_for_bitrate(
            self.budget(),
            self.max_width,
            self.max_height,
            self.max_framerate,
        )?;
        if candidate == current {
            return None;
        }
        let cand_bw = adaptation.representations.get(candidate)?.bandwidth;
        let cur_bw = adaptation.representations.get(current)?.bandwidth;
        if cand_bw > cur_bw {
            let needed = cand_bw as f64 * (1.0 + self.tolerance);
            if (self.budget() as f64) < needed {
                return None;
            }
        }
        info!(
            from_bandwidth = cur_bw,
            to_bandwidth = cand_bw,
            measured_bps = self.measured_bps,
            "bitrate switch"
        );
        Some(candidate)
    }

    /// After a declined switch (the new representation's playlist could not
    /// be fetched), step one rung down the ladder instead; None when already
    /// at the floor.
    pub fn next_lower(&self, adaptation: &AdaptationSet, current: usize) -> Option<usize> {
        let cur_bw = adaptation.representations.get(current)?.bandwidth;
        adaptation
            .representations
            .iter()
            .enumerate()
            .filter(|(i, r)| *i != current && r.bandwidth < cur_bw && !r.iframe_only)
            .max_by_key(|(_, r)| r.bandwidth)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MediaKind, Representation, SegmentIndex};

    fn ladder(bandwidths: &[u64]) -> AdaptationSet {
        AdaptationSet {
            kind: MediaKind::Video,
            language: None,
            role: None,
            name: None,
            default: true,
            autoselect: true,
            forced: false,
            content_protection: Vec::new(),
            representations: bandwidths
                .iter()
                .map(|bw| Representation {
                    id: format!("v{bw}"),
                    name: None,
                    bandwidth: *bw,
                    codecs: None,
                    width: None,
                    height: None,
                    framerate: None,
                    iframe_only: false,
                    timescale: 1,
                    header: None,
                    index: SegmentIndex::List(Vec::new()),
                    playlist_uri: None,
                    target_duration: None,
                    discontinuity_sequence: 0,
                    allow_cache: true,
                    endlist: true,
                    cached_manifest: None,
                })
                .collect(),
        }
    }

    fn adapter_with_rate(bps: u64, tolerance: f64) -> BitrateAdapter {
        let config = crate::config::SessionConfig {
            connection_speed: bps,
            bitrate_switch_tolerance: tolerance,
            ..Default::default()
        };
        BitrateAdapter::new(&config)
    }

    #[test]
    fn upward_switch_needs_headroom() {
        let set = ladder(&[500_000, 1_000_000, 2_000_000]);
        // 1.2 Mbps measured, currently on the lowest rung: 1 Mbps fits but
        // needs 40% headroom = 1.4 Mbps, so no switch yet.
        let adapter = adapter_with_rate(1_200_000, 0.4);
        assert_eq!(adapter.select(&set, 0, false), None);
        // 1.5 Mbps clears the bar.
        let adapter = adapter_with_rate(1_500_000, 0.4);
        assert_eq!(adapter.select(&set, 0, false), Some(1));
    }

    #[test]
    fn downward_switch_is_immediate() {
        let set = ladder(&[500_000, 1_000_000, 2_000_000]);
        let adapter = adapter_with_rate(700_000, 0.4);
        assert_eq!(adapter.select(&set, 2, false), Some(0));
    }

    #[test]
    fn no_switch_in_trick_mode() {
        let set = ladder(&[500_000, 1_000_000]);
        let adapter = adapter_with_rate(10_000_000, 0.0);
        assert_eq!(adapter.select(&set, 0, true), None);
    }

    #[test]
    fn declined_switch_steps_down() {
        let set = ladder(&[500_000, 1_000_000, 2_000_000]);
        let adapter = adapter_with_rate(0, 0.4);
        assert_eq!(adapter.next_lower(&set, 2), Some(1));
        assert_eq!(adapter.next_lower(&set, 0), None);
    }
}

//! Live playback control: manifest refresh pacing, post-refresh cursor
//! alignment, and the live seek window.

use std::time::Duration;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    dash, mss, Playlist, Representation, SeekFlags, SnapMode, StreamError, TrackCursor,
    MIN_LIVE_DISTANCE,
};

/// Fallback refresh cadence when a playlist announces no target duration.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Paces manifest refreshes: half a target duration while healthy, backing
/// off to 1.5× after one failure and 3× after two or more, resetting on the
/// next success. The manifest's own minimum update period is always
/// honoured as a floor.
#[derive(Debug, Default)]
pub struct RefreshPacer {
    consecutive_failures: u32,
}

impl RefreshPacer {
    pub fn new() -> RefreshPacer {
        RefreshPacer::default()
    }

    pub fn succeeded(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn failed(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn next_interval(&self, playlist: &Playlist) -> Duration {
        let target = playlist.target_duration().unwrap_or(DEFAULT_REFRESH_INTERVAL);
        let scaled = match self.consecutive_failures {
            0 => target / 2,
            1 => target * 3 / 2,
            _ => target * 3,
        };
        match playlist.minimum_update_period {
            Some(minimum) => scaled.max(minimum),
            None => scaled,
        }
    }
}

/// Re-position a cursor after its playlist was refreshed.
///
/// On-demand content aligns by presentation time: the cursor moves to the
/// segment containing `target_pos`. Live content keeps its sequence number
/// but clamps it into the available window, staying [`MIN_LIVE_DISTANCE`]
/// segments away from the live edge.
pub fn realign_cursor(
    playlist: &Playlist,
    cursor: &mut TrackCursor,
    target_pos: Duration,
) -> Result<(), StreamError> {
    if playlist.is_live {
        let Some((pi, ai, ri)) = playlist.find_representation(&cursor.representation_id) else {
            // The representation disappeared from the refreshed playlist;
            // the scheduler handles rematching.
            return Ok(());
        };
        let repr = &playlist.periods[pi].adaptations[ai].representations[ri];
        let (Some(first), Some(last)) = (repr.first_sequence(), repr.last_sequence()) else {
            return Ok(());
        };
        let ceiling = (last - MIN_LIVE_DISTANCE as i64).max(first);
        let clamped = cursor.sequence.clamp(first, ceiling);
        if clamped != cursor.sequence {
            debug!(
                sequence = cursor.sequence,
                clamped,
                first,
                last,
                "clamped cursor into live window"
            );
            cursor.sequence = clamped;
        }
        Ok(())
    } else {
        cursor
            .seek(
                playlist,
                cursor.direction,
                SeekFlags { snap: SnapMode::Before, key_unit: false },
                target_pos,
            )
            .map(|_| ())
    }
}

/// Advance the availability window of unbounded live templates from the
/// server clock (DASH dynamic manifests without a SegmentTimeline).
pub fn update_template_windows(playlist: &mut Playlist, server_now: DateTime<Utc>) {
    if !playlist.is_live {
        return;
    }
    let Some(availability_start) = playlist.availability_start_time else {
        return;
    };
    let depth = playlist.time_shift_buffer_depth;
    for period in &mut playlist.periods {
        let period_start = period.start;
        for adaptation in &mut period.adaptations {
            for repr in &mut adaptation.representations {
                if let crate::SegmentIndex::Template(template) = &mut repr.index {
                    if !template.pieces.is_empty() {
                        continue;
                    }
                    template.end_number = dash::live_edge_number(
                        template,
                        availability_start,
                        period_start,
                        server_now,
                    );
                    template.first_available = Some(dash::live_window_start_number(
                        template,
                        availability_start,
                        period_start,
                        depth,
                        server_now,
                    ));
                }
            }
        }
    }
}

/// The seekable range of a live representation, shifted onto the client
/// clock by the current compensation.
pub fn live_seek_range_compensated(
    playlist: &Playlist,
    repr: &Representation,
    compensation_us: i64,
) -> Option<(Duration, Duration)> {
    let (start, stop) = playlist.live_seek_range(repr)?;
    let shift = |d: Duration| {
        if compensation_us >= 0 {
            d + Duration::from_micros(compensation_us as u64)
        } else {
            d.saturating_sub(Duration::from_micros(compensation_us.unsigned_abs()))
        }
    };
    Some((shift(start), shift(stop)))
}

/// The position a live session starts playing from: the end of the seek
/// range backed off by the presentation delay.
pub fn initial_live_position(
    playlist: &Playlist,
    repr: &Representation,
    configured_delay: Option<crate::config::PresentationDelay>,
    compensation_us: i64,
) -> Option<Duration> {
    let (start, stop) = live_seek_range_compensated(playlist, repr, compensation_us)?;
    let target_duration = repr
        .max_segment_duration()
        .or(playlist.max_segment_duration)
        .unwrap_or(DEFAULT_REFRESH_INTERVAL);
    let delay = match configured_delay {
        Some(crate::config::PresentationDelay::Time(d)) => d,
        Some(crate::config::PresentationDelay::Fragments(n)) => target_duration * n,
        None => playlist
            .suggested_presentation_delay
            .unwrap_or(target_duration * MIN_LIVE_DISTANCE as u32),
    };
    Some(stop.saturating_sub(delay).max(start))
}

/// Grow a Smooth Streaming live representation from the `tfrf` look-ahead
/// entries of a fragment that just finished parsing.
pub fn apply_look_ahead(
    playlist: &mut Playlist,
    representation_id: &str,
    entries: &[(u64, u64)],
) -> usize {
    let Some((pi, ai, ri)) = playlist.find_representation(representation_id) else {
        return 0;
    };
    let repr = &mut playlist.periods[pi].adaptations[ai].representations[ri];
    let appended = mss::extend_live_timeline(repr, entries);
    if appended > 0 {
        debug!(repr = representation_id, appended, "extended live timeline from tfrf");
    }
    appended
}

/// Find the representation to continue with after a master playlist
/// refetch: by id first, then by the (name, bandwidth, codecs, resolution,
/// iframe) tuple. Returns indices into the refreshed playlist.
pub fn rematch_representation(
    playlist: &Playlist,
    old: &Representation,
) -> Option<(usize, usize, usize)> {
    if let Some(found) = playlist.find_representation(&old.id) {
        return Some(found);
    }
    warn!(
        id = %old.id,
        "representation id vanished across master refresh, matching by properties"
    );
    for (pi, period) in playlist.periods.iter().enumerate() {
        for (ai, adaptation) in period.adaptations.iter().enumerate() {
            for (ri, repr) in adaptation.representations.iter().enumerate() {
                if repr.name == old.name
                    && repr.bandwidth == old.bandwidth
                    && repr.codecs == old.codecs
                    && repr.width == old.width
                    && repr.height == old.height
                    && repr.iframe_only == old.iframe_only
                {
                    return Some((pi, ai, ri));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_live_playlist(target: Duration) -> Playlist {
        let uri = url::Url::parse("http://example.com/live.m3u8").unwrap();
        let text = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n\
             #EXTINF:{}.0,\ns0.ts\n#EXTINF:{}.0,\ns1.ts\n",
            target.as_secs(),
            target.as_secs(),
            target.as_secs()
        );
        crate::parse(text.as_bytes(), crate::ManifestFlavor::Hls, &uri, &uri).unwrap()
    }

    #[test]
    fn refresh_ladder() {
        let playlist = minimal_live_playlist(Duration::from_secs(6));
        let mut pacer = RefreshPacer::new();
        assert_eq!(pacer.next_interval(&playlist), Duration::from_secs(3));
        pacer.failed();
        assert_eq!(pacer.next_interval(&playlist), Duration::from_secs(9));
        pacer.failed();
        assert_eq!(pacer.next_interval(&playlist), Duration::from_secs(18));
        pacer.failed();
        assert_eq!(pacer.next_interval(&playlist), Duration::from_secs(18));
        pacer.succeeded();
        assert_eq!(pacer.next_interval(&playlist), Duration::from_secs(3));
    }
}

//! A Rust library implementing the core of an adaptive HTTP streaming client.
//!
//! Adaptive streaming serves media as a catalog of short segments encoded at
//! several quality levels, described by a manifest that the client refetches
//! periodically for live content. This library parses the three manifest
//! flavors in widespread use — HLS (`#EXTM3U` playlists), MPEG-DASH (MPD/XML)
//! and Microsoft Smooth Streaming — into a single uniform playlist model, then
//! drives playback sessions over that model: selecting a representation
//! matching the measured network throughput, fetching and decrypting segments,
//! parsing their ISOBMFF or MPEG-TS envelope, and emitting timestamped media
//! buffers to the host application.
//!
//! The HTTP transport, the typefinding of media payloads and the block cipher
//! are injected by the host through narrow traits (see the [`fetch`] and
//! [`fragment`] modules), which keeps the scheduling core independent of any
//! particular network stack. A reqwest-backed downloader is provided when the
//! `fetch` cargo feature (enabled by default) is active.
//!
//! ## Features supported
//!
//! - HLS master and media playlists, alternate renditions, I-frame variants,
//!   AES-128 segment encryption with per-segment or sequence-derived IVs
//! - DASH static and dynamic MPDs: SegmentTemplate (with SegmentTimeline),
//!   SegmentList, SegmentBase with `@indexRange` (SIDX sub-fragments),
//!   UTCTiming clock sources, ContentProtection descriptors
//! - Smooth Streaming manifests, including live look-ahead fragments carried
//!   in `tfxd`/`tfrf` boxes
//! - Live playlist refresh with consistency checking, live-edge tracking and
//!   server clock-drift compensation
//! - Key-unit trick mode driven by ISOBMFF sync-sample tables
//!
//! ## Limitations / unsupported features
//!
//! - No demuxing of elementary streams and no decoding; buffers are emitted
//!   as received (after decryption), for the host to interpret
//! - DRM systems (Widevine, PlayReady…) are not implemented; their
//!   ContentProtection descriptors are surfaced as opaque protection events
//! - Subtitle segment post-processing (WebVTT timestamp rewriting) is left to
//!   the host

use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

pub mod adapter;
pub mod clock;
pub mod config;
pub mod dash;
pub mod events;
pub mod fetch;
pub mod fragment;
pub mod hls;
pub mod isobmff;
pub mod live;
pub mod mpegts;
pub mod mss;
pub mod scheduler;

/// Number of segments a live playback position must stay away from the end of
/// the playlist, so that a slightly slow client never requests a segment the
/// server has not finished publishing.
pub const MIN_LIVE_DISTANCE: usize = 3;

/// Errors arising when parsing manifests or running a streaming session.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("invalid encoding in manifest: {0}")]
    InvalidEncoding(String),
    #[error("content is not a playlist: {0}")]
    NotAPlaylist(String),
    #[error("no usable variant in playlist: {0}")]
    NotAVariant(String),
    #[error("media playlist contains no segments")]
    EmptyMediaPlaylist,
    #[error("playlist update inconsistent with previous playlist: {0}")]
    Inconsistent(String),
    #[error("unsupported encryption method {0}")]
    UnsupportedEncryption(String),
    #[error("failed fetching decryption key: {0}")]
    KeyFetchFailed(String),
    #[error("invalid decryption key: {0}")]
    InvalidKey(String),
    #[error("decrypting segment: {0}")]
    StreamDecrypt(String),
    #[error("unable to determine media type of stream")]
    TypefindFailed,
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("stream format not negotiated: {0}")]
    NotNegotiated(String),
    #[error("internal error (please report): {0}")]
    InternalBug(String),
    #[error("parse error: {0}")]
    Parsing(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("I/O error {1} ({0})")]
    Io(#[source] std::io::Error, String),
    #[error("{0}")]
    Other(String),
}

/// The manifest syntax a playlist was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFlavor {
    Hls,
    Dash,
    Mss,
}

/// The media kind carried by an adaptation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Subtitle,
    ClosedCaption,
}

impl MediaKind {
    /// Short name used to build track stream ids such as `"video-0"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Subtitle => "subtitle",
            MediaKind::ClosedCaption => "closed-caption",
        }
    }
}

/// Playback direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

/// How a seek position is snapped to segment boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapMode {
    /// Snap to the segment containing or preceding the requested position.
    #[default]
    Before,
    /// Snap to the segment starting at or after the requested position.
    After,
    /// Snap to whichever segment boundary is closest. An exact midpoint
    /// resolves in the playback direction.
    Nearest,
}

/// Seek behavior requested by the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekFlags {
    pub snap: SnapMode,
    /// Keyframe-only playback: the scheduler will serve only sync samples,
    /// using each fragment's sync-sample table.
    pub key_unit: bool,
}

/// Methods for sampling the server's wall clock, from DASH `UTCTiming`
/// descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtcTimingMethod {
    /// `urn:mpeg:dash:utc:ntp:2014` — NTP query against a listed server.
    Ntp,
    /// `urn:mpeg:dash:utc:http-head:2014` — `Date` header of a HEAD response.
    HttpHead,
    /// `urn:mpeg:dash:utc:http-xsdate:2014` — xs:dateTime response body.
    HttpXsdate,
    /// `urn:mpeg:dash:utc:http-iso:2014` — ISO 8601 response body.
    HttpIso,
    /// `urn:mpeg:dash:utc:http-ntp:2014` — 8-byte NTP timestamp response body.
    HttpNtp,
}

/// One `UTCTiming` descriptor: a sampling method plus the server URLs
/// (whitespace-separated in the manifest) it applies to.
#[derive(Debug, Clone)]
pub struct UtcTimingSource {
    pub method: UtcTimingMethod,
    pub urls: Vec<String>,
}

/// A content protection descriptor attached to an adaptation set: the DRM
/// system UUID and its opaque initialization payload (typically a PSSH box).
#[derive(Debug, Clone)]
pub struct ProtectionDescriptor {
    pub scheme_id: String,
    pub data: Bytes,
}

/// A byte range within a segment resource, as `(offset, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub size: u64,
}

impl ByteRange {
    pub fn new(offset: u64, size: u64) -> ByteRange {
        ByteRange { offset, size }
    }

    /// Offset one past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Decryption parameters for an AES-128-CBC encrypted segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    /// Where to fetch the 16-byte key.
    pub uri: Url,
    /// Explicit IV from the playlist, if one was given.
    pub iv: Option<[u8; 16]>,
}

impl SegmentKey {
    /// The IV to use for a segment: the explicit playlist IV when present,
    /// otherwise the segment's sequence number as a big-endian integer in the
    /// low 8 bytes.
    pub fn effective_iv(&self, sequence: i64) -> [u8; 16] {
        match self.iv {
            Some(iv) => iv,
            None => {
                let mut iv = [0u8; 16];
                iv[8..].copy_from_slice(&(sequence as u64).to_be_bytes());
                iv
            }
        }
    }
}

/// One fetchable media segment.
///
/// Segments are addressed by their `sequence` number, which is strictly
/// increasing within a representation and stable across live playlist
/// refreshes. Holders of a segment reference keep `(representation id,
/// sequence)` and re-resolve against the playlist before each use.
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: i64,
    pub uri: Url,
    pub range: Option<ByteRange>,
    /// Presentation time of the first sample, from the start of the period.
    pub pts: Duration,
    pub duration: Duration,
    /// True when this segment follows an `EXT-X-DISCONTINUITY` or a period
    /// switch; the first buffer emitted from it carries a discontinuity flag.
    pub discont: bool,
    pub key: Option<SegmentKey>,
    /// Wall-clock anchor from `EXT-X-PROGRAM-DATE-TIME`, when present.
    pub date_time: Option<DateTime<Utc>>,
    pub title: Option<String>,
}

impl Segment {
    /// End of this segment's presentation interval.
    pub fn end_pts(&self) -> Duration {
        self.pts + self.duration
    }
}

/// Initialization header (DASH/MSS init segment, or the moov of a single-file
/// representation) to feed downstream before the first media segment.
#[derive(Debug, Clone, Default)]
pub struct InitHeader {
    pub uri: Option<Url>,
    pub range: Option<ByteRange>,
}

/// One `(start, duration, repeat)` run of equal-duration segments in a
/// template timeline, in timescale units. `repeat` counts the segments in the
/// run, so a lone segment has `repeat == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelinePiece {
    pub start: u64,
    pub duration: u64,
    pub repeat: u64,
}

/// Template-based segment index: a URL pattern with `$Number$`/`$Time$`
/// substitutions plus either a piecewise timeline or a constant segment
/// duration.
#[derive(Debug, Clone)]
pub struct TemplateIndex {
    /// Media URL pattern. May contain `$RepresentationID$`, `$Bandwidth$`,
    /// `$Number$` and `$Time$` identifiers (with optional `%0Nd` width).
    pub media: String,
    pub start_number: u64,
    pub timescale: u64,
    /// Subtracted from timeline times to obtain period-relative timestamps.
    pub presentation_time_offset: u64,
    /// Piecewise repetition table. Empty when `segment_duration` applies.
    pub pieces: Vec<TimelinePiece>,
    /// Constant segment duration in timescale units, used when there is no
    /// timeline.
    pub segment_duration: Option<u64>,
    /// First currently-available number, for live template playlists with a
    /// time-shift window. Defaults to `start_number`.
    pub first_available: Option<u64>,
    /// Last available number (inclusive). `None` for an unbounded live edge,
    /// which the live controller updates from the wall clock.
    pub end_number: Option<u64>,
}

impl TemplateIndex {
    fn effective_first(&self) -> u64 {
        self.first_available.unwrap_or(self.start_number).max(self.start_number)
    }

    /// Presentation time and duration for segment `number`, in timescale
    /// units, or None when the number lies outside the timeline.
    pub fn timing_for(&self, number: u64) -> Option<(u64, u64)> {
        if number < self.start_number {
            return None;
        }
        let index = number - self.start_number;
        if self.pieces.is_empty() {
            let d = self.segment_duration?;
            return Some((index * d, d));
        }
        let mut remaining = index;
        for piece in &self.pieces {
            if remaining < piece.repeat {
                let t = piece.start + remaining * piece.duration;
                return Some((t.saturating_sub(self.presentation_time_offset), piece.duration));
            }
            remaining -= piece.repeat;
        }
        None
    }

    /// Total number of segments described, or None for an unbounded live
    /// template.
    pub fn count(&self) -> Option<u64> {
        if self.pieces.is_empty() {
            let last = self.end_number?;
            Some(last.saturating_sub(self.start_number) + 1)
        } else {
            Some(self.pieces.iter().map(|p| p.repeat).sum())
        }
    }
}

/// Segment index of a single-file representation whose sub-fragment layout is
/// discovered at runtime by parsing its leading `sidx` box.
#[derive(Debug, Clone)]
pub struct SidxIndex {
    pub uri: Url,
    /// Byte range of the `sidx` box itself (`SegmentBase@indexRange`).
    pub index_range: Option<ByteRange>,
    /// Total duration of the representation, when the manifest declares it.
    pub duration: Option<Duration>,
}

/// How a representation's segments are enumerated.
#[derive(Debug, Clone)]
pub enum SegmentIndex {
    /// Explicit ordered list (HLS media playlists, DASH SegmentList, MSS).
    List(Vec<Segment>),
    /// URL template plus repetition table (DASH SegmentTemplate, MSS Url).
    Template(TemplateIndex),
    /// Single file, indexed at runtime through its `sidx` box.
    Sidx(SidxIndex),
}

/// One concrete encoding of the content at a specific bandwidth.
#[derive(Debug, Clone)]
pub struct Representation {
    /// Unique within the enclosing period.
    pub id: String,
    /// Human-readable name (HLS rendition NAME), used as a fallback when
    /// rematching representations across a master playlist refresh.
    pub name: Option<String>,
    /// Declared bandwidth in bits per second.
    pub bandwidth: u64,
    pub codecs: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<(u32, u32)>,
    /// True for an I-frame-only variant (HLS `EXT-X-I-FRAME-STREAM-INF`).
    pub iframe_only: bool,
    /// Units per second for this representation's timestamps.
    pub timescale: u64,
    pub header: Option<InitHeader>,
    pub index: SegmentIndex,
    /// URI of the child media playlist (HLS), fetched to populate `index`.
    pub playlist_uri: Option<Url>,
    /// Largest segment duration announced by the media playlist.
    pub target_duration: Option<Duration>,
    /// HLS `EXT-X-DISCONTINUITY-SEQUENCE` of the first segment.
    pub discontinuity_sequence: i64,
    /// False when the playlist said `EXT-X-ALLOW-CACHE:NO`.
    pub allow_cache: bool,
    /// True once a media playlist with `EXT-X-ENDLIST` was applied.
    pub endlist: bool,
    /// Raw text of the last media playlist applied, used to skip no-op live
    /// refreshes.
    pub cached_manifest: Option<String>,
}

impl Representation {
    /// Lowest segment sequence number currently available.
    pub fn first_sequence(&self) -> Option<i64> {
        match &self.index {
            SegmentIndex::List(segs) => segs.first().map(|s| s.sequence),
            SegmentIndex::Template(t) => Some(t.effective_first() as i64),
            SegmentIndex::Sidx(_) => Some(0),
        }
    }

    /// Highest segment sequence number currently available.
    pub fn last_sequence(&self) -> Option<i64> {
        match &self.index {
            SegmentIndex::List(segs) => segs.last().map(|s| s.sequence),
            SegmentIndex::Template(t) => match (t.end_number, t.count()) {
                (Some(end), _) => Some(end as i64),
                (None, Some(count)) if count > 0 => {
                    Some((t.start_number + count - 1) as i64)
                }
                _ => None,
            },
            SegmentIndex::Sidx(_) => Some(0),
        }
    }

    /// Materialize the segment with the given sequence number, resolving
    /// template substitutions against this representation. Returns None when
    /// the sequence is not (or no longer) available.
    pub fn segment_by_sequence(&self, base: &Url, seq: i64) -> Option<Segment> {
        match &self.index {
            SegmentIndex::List(segs) => {
                segs.binary_search_by_key(&seq, |s| s.sequence).ok().map(|i| segs[i].clone())
            }
            SegmentIndex::Template(t) => {
                if seq < 0 || (seq as u64) < t.effective_first() {
                    return None;
                }
                if let Some(end) = t.end_number {
                    if seq as u64 > end {
                        return None;
                    }
                }
                let number = seq as u64;
                let (time, dur) = t.timing_for(number)?;
                let path = dash::fill_template(&t.media, &self.id, self.bandwidth, number, time);
                let uri = base.join(&path).ok()?;
                Some(Segment {
                    sequence: seq,
                    uri,
                    range: None,
                    pts: scaled_duration(time, t.timescale),
                    duration: scaled_duration(dur, t.timescale),
                    discont: false,
                    key: None,
                    date_time: None,
                    title: None,
                })
            }
            SegmentIndex::Sidx(s) => {
                if seq != 0 {
                    return None;
                }
                Some(Segment {
                    sequence: 0,
                    uri: s.uri.clone(),
                    range: None,
                    pts: Duration::ZERO,
                    duration: s.duration.unwrap_or(Duration::ZERO),
                    discont: false,
                    key: None,
                    date_time: None,
                    title: None,
                })
            }
        }
    }

    /// Find the segment whose interval the timestamp falls into, applying the
    /// snap mode. The midpoint of a segment snaps in the playback direction
    /// for [`SnapMode::Nearest`].
    pub fn segment_for_time(
        &self,
        base: &Url,
        ts: Duration,
        snap: SnapMode,
        direction: Direction,
    ) -> Option<Segment> {
        let first = self.first_sequence()?;
        let last = self.last_sequence()?;
        let mut containing: Option<Segment> = None;
        for seq in first..=last {
            let seg = match self.segment_by_sequence(base, seq) {
                Some(s) => s,
                None => continue,
            };
            if ts < seg.pts {
                // Fell in a gap before this segment: treat this one as the
                // "after" candidate.
                return match snap {
                    SnapMode::After | SnapMode::Nearest => Some(seg),
                    SnapMode::Before => containing.or(Some(seg)),
                };
            }
            if ts < seg.end_pts() {
                if seg.pts == ts {
                    return Some(seg);
                }
                return match snap {
                    SnapMode::Before => Some(seg),
                    SnapMode::After => self
                        .segment_by_sequence(base, seq + 1)
                        .or(Some(seg)),
                    SnapMode::Nearest => {
                        let into = ts - seg.pts;
                        let half = seg.duration / 2;
                        let take_later = match direction {
                            Direction::Forward => into >= half,
                            Direction::Reverse => into > half,
                        };
                        if take_later {
                            self.segment_by_sequence(base, seq + 1).or(Some(seg))
                        } else {
                            Some(seg)
                        }
                    }
                };
            }
            containing = Some(seg);
        }
        // Past the end: clamp to the final segment.
        containing
    }

    /// Sum of segment durations, or None when unbounded (live template).
    pub fn total_duration(&self) -> Option<Duration> {
        match &self.index {
            SegmentIndex::List(segs) => {
                Some(segs.iter().map(|s| s.duration).sum())
            }
            SegmentIndex::Template(t) => {
                if t.pieces.is_empty() {
                    let d = t.segment_duration?;
                    let count = t.count()?;
                    Some(scaled_duration(d * count, t.timescale))
                } else {
                    let units: u64 = t.pieces.iter().map(|p| p.duration * p.repeat).sum();
                    Some(scaled_duration(units, t.timescale))
                }
            }
            SegmentIndex::Sidx(s) => s.duration,
        }
    }

    /// Largest single segment duration.
    pub fn max_segment_duration(&self) -> Option<Duration> {
        if let Some(td) = self.target_duration {
            return Some(td);
        }
        match &self.index {
            SegmentIndex::List(segs) => segs.iter().map(|s| s.duration).max(),
            SegmentIndex::Template(t) => {
                let units = if t.pieces.is_empty() {
                    t.segment_duration?
                } else {
                    t.pieces.iter().map(|p| p.duration).max()?
                };
                Some(scaled_duration(units, t.timescale))
            }
            SegmentIndex::Sidx(_) => None,
        }
    }

    /// Presentation time of the first available segment.
    pub fn first_segment_start(&self, base: &Url) -> Option<Duration> {
        let first = self.first_sequence()?;
        self.segment_by_sequence(base, first).map(|s| s.pts)
    }

    /// End of the last available segment's interval.
    pub fn last_segment_end(&self, base: &Url) -> Option<Duration> {
        let last = self.last_sequence()?;
        self.segment_by_sequence(base, last).map(|s| s.end_pts())
    }

    /// Whether sub-fragment stepping through a `sidx` applies.
    pub fn uses_sidx(&self) -> bool {
        matches!(self.index, SegmentIndex::Sidx(_))
    }
}

/// A set of alternative representations for one logical media stream (same
/// content, same language/role, different bitrates).
#[derive(Debug, Clone)]
pub struct AdaptationSet {
    pub kind: MediaKind,
    pub language: Option<String>,
    pub role: Option<String>,
    /// Rendition group name (HLS `EXT-X-MEDIA` NAME / GROUP-ID).
    pub name: Option<String>,
    pub default: bool,
    pub autoselect: bool,
    pub forced: bool,
    pub content_protection: Vec<ProtectionDescriptor>,
    /// Sorted by ascending bandwidth.
    pub representations: Vec<Representation>,
}

impl AdaptationSet {
    /// Index of the highest-bandwidth representation not exceeding `bitrate`
    /// and satisfying the video caps, falling back to the lowest rung of the
    /// ladder when nothing fits. I-frame-only variants are never selected
    /// here; trick mode picks them explicitly.
    pub fn representation_for_bitrate(
        &self,
        bitrate: u64,
        max_width: u32,
        max_height: u32,
        max_framerate: f64,
    ) -> Option<usize> {
        let fits = |r: &Representation| {
            if r.iframe_only {
                return false;
            }
            if max_width > 0 && r.width.is_some_and(|w| w > max_width) {
                return false;
            }
            if max_height > 0 && r.height.is_some_and(|h| h > max_height) {
                return false;
            }
            if max_framerate > 0.0 {
                if let Some((n, d)) = r.framerate {
                    if d > 0 && n as f64 / d as f64 > max_framerate {
                        return false;
                    }
                }
            }
            true
        };
        let mut best: Option<usize> = None;
        for (i, r) in self.representations.iter().enumerate() {
            if !fits(r) {
                continue;
            }
            if r.bandwidth <= bitrate {
                best = Some(i);
            } else if best.is_none() {
                // Remember the lowest acceptable rung as a floor.
                best = Some(i);
                break;
            }
        }
        best.or_else(|| {
            self.representations
                .iter()
                .position(|r| !r.iframe_only)
                .or((!self.representations.is_empty()).then_some(0))
        })
    }

    pub fn find_representation(&self, id: &str) -> Option<&Representation> {
        self.representations.iter().find(|r| r.id == id)
    }
}

/// A chunk of the presentation timeline (DASH Period). HLS and MSS content
/// always has exactly one synthetic period.
#[derive(Debug, Clone)]
pub struct Period {
    pub id: Option<String>,
    pub start: Duration,
    pub duration: Option<Duration>,
    pub adaptations: Vec<AdaptationSet>,
}

/// The uniform playlist model shared by all three manifest flavors.
///
/// A `Playlist` is created by [`parse`] and mutated only by live refresh
/// (see [`hls::update_media_playlist`] and [`Playlist::update_from`]).
/// Scheduler tasks never hold segment references across a refresh; they keep
/// `(representation id, sequence number)` pairs and re-resolve them on use.
#[derive(Debug, Clone)]
pub struct Playlist {
    pub flavor: ManifestFlavor,
    /// URI the manifest was requested from.
    pub manifest_uri: Url,
    /// Effective base for relative resolution; may differ from
    /// `manifest_uri` after a permanent HTTP redirect.
    pub base_uri: Url,
    pub is_live: bool,
    pub version: Option<u32>,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub minimum_update_period: Option<Duration>,
    pub suggested_presentation_delay: Option<Duration>,
    /// DASH `maxSegmentDuration`.
    pub max_segment_duration: Option<Duration>,
    pub utc_timing: Vec<UtcTimingSource>,
    pub periods: Vec<Period>,
    /// MSS `LookAheadFragmentCount`.
    pub look_ahead_count: u32,
    /// Raw text of the last manifest applied (DASH/MSS refresh no-op check).
    pub cached_manifest: Option<String>,
}

impl Playlist {
    /// Total presentation duration for on-demand content; None when live.
    pub fn duration(&self) -> Option<Duration> {
        if self.is_live {
            return None;
        }
        let mut total = Duration::ZERO;
        for period in &self.periods {
            if let Some(d) = period.duration {
                total += d;
                continue;
            }
            // Fall back to the longest track in the period.
            let longest = period
                .adaptations
                .iter()
                .flat_map(|a| a.representations.iter())
                .filter_map(|r| r.total_duration())
                .max()?;
            total += longest;
        }
        Some(total)
    }

    /// The largest announced segment duration, used to pace live refresh.
    pub fn target_duration(&self) -> Option<Duration> {
        if let Some(d) = self.max_segment_duration {
            return Some(d);
        }
        self.periods
            .iter()
            .flat_map(|p| p.adaptations.iter())
            .flat_map(|a| a.representations.iter())
            .filter_map(|r| r.max_segment_duration())
            .max()
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    /// Locate a representation by id anywhere in the playlist, returning
    /// `(period index, adaptation index, representation index)`.
    pub fn find_representation(&self, id: &str) -> Option<(usize, usize, usize)> {
        for (pi, period) in self.periods.iter().enumerate() {
            for (ai, adaptation) in period.adaptations.iter().enumerate() {
                for (ri, repr) in adaptation.representations.iter().enumerate() {
                    if repr.id == id {
                        return Some((pi, ai, ri));
                    }
                }
            }
        }
        None
    }

    pub fn representation(&self, pi: usize, ai: usize, ri: usize) -> Option<&Representation> {
        self.periods.get(pi)?.adaptations.get(ai)?.representations.get(ri)
    }

    /// Resolve a possibly-relative URI against the playlist's effective base.
    pub fn resolve(&self, s: &str) -> Result<Url, StreamError> {
        self.base_uri
            .join(s)
            .map_err(|e| StreamError::Parsing(format!("resolving URI {s}: {e}")))
    }

    /// The currently seekable presentation range of a live representation:
    /// starts `time_shift_buffer_depth` before the live edge, and stops one
    /// `max_segment_duration` short of it because the newest segment only
    /// becomes available once fully written.
    pub fn live_seek_range(&self, repr: &Representation) -> Option<(Duration, Duration)> {
        if !self.is_live {
            return None;
        }
        let end = repr.last_segment_end(&self.base_uri)?;
        let max_seg = repr
            .max_segment_duration()
            .or(self.max_segment_duration)
            .unwrap_or(Duration::ZERO);
        let stop = end.saturating_sub(max_seg);
        let start = match self.time_shift_buffer_depth {
            Some(depth) => end.saturating_sub(depth),
            None => repr.first_segment_start(&self.base_uri).unwrap_or(Duration::ZERO),
        };
        Some((start.min(stop), stop))
    }

    /// Apply a refreshed manifest (DASH/MSS whole-document refresh; HLS media
    /// playlists go through [`hls::update_media_playlist`]). Returns false
    /// when the new content is byte-identical and nothing changed.
    pub fn update_from(&mut self, bytes: &[u8]) -> Result<bool, StreamError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| StreamError::InvalidEncoding(e.to_string()))?;
        if self.cached_manifest.as_deref() == Some(text) {
            return Ok(false);
        }
        let fresh = parse(bytes, self.flavor, &self.manifest_uri, &self.base_uri)?;
        // The active period's window must never move backwards.
        for (old_p, new_p) in self.periods.iter().zip(fresh.periods.iter()) {
            for (old_a, new_a) in old_p.adaptations.iter().zip(new_p.adaptations.iter()) {
                for (old_r, new_r) in
                    old_a.representations.iter().zip(new_a.representations.iter())
                {
                    let old_start = old_r.first_segment_start(&self.base_uri);
                    let new_start = new_r.first_segment_start(&self.base_uri);
                    if let (Some(o), Some(n)) = (old_start, new_start) {
                        if n < o {
                            return Err(StreamError::Inconsistent(format!(
                                "representation {}: window start moved backwards \
                                 ({:?} -> {:?})",
                                old_r.id, o, n
                            )));
                        }
                    }
                }
            }
        }
        let cached: String = text.to_string();
        *self = fresh;
        self.cached_manifest = Some(cached);
        Ok(true)
    }
}

/// A playback cursor over one representation: the weak segment reference
/// (`representation id` + `sequence`) resolved against the playlist before
/// each request.
#[derive(Debug, Clone)]
pub struct TrackCursor {
    pub period: usize,
    pub adaptation: usize,
    pub representation_id: String,
    pub sequence: i64,
    pub direction: Direction,
}

/// Outcome of advancing a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Ok,
    /// No further segment in this direction. For live playlists the caller
    /// waits for a refresh rather than ending the stream.
    Eos,
}

impl TrackCursor {
    pub fn new(period: usize, adaptation: usize, representation_id: &str) -> TrackCursor {
        TrackCursor {
            period,
            adaptation,
            representation_id: representation_id.to_string(),
            sequence: 0,
            direction: Direction::Forward,
        }
    }

    fn representation<'a>(&self, playlist: &'a Playlist) -> Option<&'a Representation> {
        playlist
            .periods
            .get(self.period)?
            .adaptations
            .get(self.adaptation)?
            .find_representation(&self.representation_id)
    }

    /// Snapshot of the segment the cursor points at, or None at EOS (or when
    /// a live refresh dropped the sequence from the window).
    pub fn current_fragment(&self, playlist: &Playlist) -> Option<Segment> {
        let repr = self.representation(playlist)?;
        repr.segment_by_sequence(&playlist.base_uri, self.sequence)
    }

    /// Step the cursor one segment in its playback direction.
    pub fn advance(&mut self, playlist: &Playlist) -> Advance {
        let Some(repr) = self.representation(playlist) else {
            return Advance::Eos;
        };
        let (first, last) = match (repr.first_sequence(), repr.last_sequence()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Advance::Eos,
        };
        match self.direction {
            Direction::Forward => {
                if self.sequence >= last {
                    return Advance::Eos;
                }
                self.sequence += 1;
            }
            Direction::Reverse => {
                if self.sequence <= first {
                    return Advance::Eos;
                }
                self.sequence -= 1;
            }
        }
        Advance::Ok
    }

    /// Position the cursor for a seek, snapping the timestamp to a segment
    /// boundary. Live positions are clamped so the cursor never comes closer
    /// than [`MIN_LIVE_DISTANCE`] segments to the live edge. Returns the
    /// `(sequence, snapped timestamp)` actually selected.
    pub fn seek(
        &mut self,
        playlist: &Playlist,
        direction: Direction,
        flags: SeekFlags,
        ts: Duration,
    ) -> Result<(i64, Duration), StreamError> {
        self.direction = direction;
        let Some(repr) = self.representation(playlist) else {
            return Err(StreamError::InternalBug(format!(
                "seek on unknown representation {}",
                self.representation_id
            )));
        };
        let seg = repr
            .segment_for_time(&playlist.base_uri, ts, flags.snap, direction)
            .ok_or(StreamError::EmptyMediaPlaylist)?;
        let mut sequence = seg.sequence;
        if playlist.is_live {
            let first = repr.first_sequence().unwrap_or(0);
            let last = repr.last_sequence().unwrap_or(0);
            let max = last - MIN_LIVE_DISTANCE as i64;
            sequence = sequence.clamp(first, max.max(first));
        }
        self.sequence = sequence;
        let snapped = repr
            .segment_by_sequence(&playlist.base_uri, sequence)
            .map(|s| s.pts)
            .unwrap_or(ts);
        Ok((sequence, snapped))
    }
}

/// Convert a timestamp in `timescale` units to a [`Duration`].
pub fn scaled_duration(value: u64, timescale: u64) -> Duration {
    if timescale == 0 {
        return Duration::ZERO;
    }
    let ns = (value as u128) * 1_000_000_000u128 / (timescale as u128);
    Duration::from_nanos(ns as u64)
}

/// Convert a [`Duration`] to `timescale` units, rounding down.
pub fn duration_to_scaled(d: Duration, timescale: u64) -> u64 {
    (d.as_nanos() * timescale as u128 / 1_000_000_000u128) as u64
}

/// Parse a manifest into the uniform playlist model.
///
/// `uri` is the URI the manifest was requested from and `base_uri` the
/// effective base after any HTTP redirect (pass `uri` again when there was
/// none). Input that is not valid UTF-8 fails with
/// [`StreamError::InvalidEncoding`].
pub fn parse(
    bytes: &[u8],
    flavor: ManifestFlavor,
    uri: &Url,
    base_uri: &Url,
) -> Result<Playlist, StreamError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| StreamError::InvalidEncoding(e.to_string()))?;
    match flavor {
        ManifestFlavor::Hls => hls::parse_playlist(text, uri, base_uri),
        ManifestFlavor::Dash => dash::parse_mpd(text, uri, base_uri),
        ManifestFlavor::Mss => mss::parse_manifest(text, uri, base_uri),
    }
}

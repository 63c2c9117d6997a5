//! Parsing, rendering and live updating of HLS (`#EXTM3U`) playlists.
//!
//! A master playlist maps to one synthetic [`Period`] holding a video
//! adaptation set (one representation per `EXT-X-STREAM-INF` variant, plus
//! I-frame-only variants) and one adaptation set per alternate-rendition
//! group announced with `EXT-X-MEDIA`. Media playlists populate the segment
//! list of their representation; for live content they are re-applied through
//! [`update_media_playlist`], which enforces the URI-consistency rules that
//! keep sequence numbers stable across refreshes.

use std::collections::HashMap;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    AdaptationSet, ByteRange, ManifestFlavor, MediaKind, Period, Playlist, Representation,
    Segment, SegmentIndex, SegmentKey, StreamError,
};

/// Parse an HLS playlist, master or media, into the uniform model.
pub fn parse_playlist(text: &str, uri: &Url, base_uri: &Url) -> Result<Playlist, StreamError> {
    let trimmed = text.trim_start_matches('\u{feff}');
    if !trimmed.starts_with("#EXTM3U") {
        return Err(StreamError::NotAPlaylist(String::from(
            "input does not begin with #EXTM3U",
        )));
    }
    if trimmed.lines().any(|l| l.starts_with("#EXT-X-STREAM-INF")) {
        parse_master(trimmed, uri, base_uri)
    } else {
        parse_media_standalone(trimmed, uri, base_uri)
    }
}

fn empty_playlist(uri: &Url, base_uri: &Url) -> Playlist {
    Playlist {
        flavor: ManifestFlavor::Hls,
        manifest_uri: uri.clone(),
        base_uri: base_uri.clone(),
        is_live: true,
        version: None,
        availability_start_time: None,
        time_shift_buffer_depth: None,
        minimum_update_period: None,
        suggested_presentation_delay: None,
        max_segment_duration: None,
        utc_timing: Vec::new(),
        periods: Vec::new(),
        look_ahead_count: 0,
        cached_manifest: None,
    }
}

/// A variant entry accumulated while walking a master playlist.
struct VariantInf {
    uri: String,
    bandwidth: u64,
    codecs: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    framerate: Option<f64>,
    iframe: bool,
}

struct MediaRendition {
    kind: MediaKind,
    group_id: String,
    name: Option<String>,
    uri: Option<String>,
    language: Option<String>,
    default: bool,
    autoselect: bool,
    forced: bool,
}

fn parse_master(text: &str, uri: &Url, base_uri: &Url) -> Result<Playlist, StreamError> {
    let mut playlist = empty_playlist(uri, base_uri);
    let mut variants: Vec<VariantInf> = Vec::new();
    let mut renditions: Vec<MediaRendition> = Vec::new();
    let mut pending: Option<VariantInf> = None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
            playlist.version = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending = Some(parse_stream_inf(rest, false)?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-I-FRAME-STREAM-INF:") {
            let v = parse_stream_inf(rest, true)?;
            if v.uri.is_empty() {
                warn!("ignoring EXT-X-I-FRAME-STREAM-INF without URI attribute");
            } else {
                variants.push(v);
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
            if let Some(r) = parse_media_tag(rest) {
                renditions.push(r);
            }
        } else if line.starts_with('#') {
            trace!("ignoring master playlist tag {line}");
        } else {
            // A non-tag line closes the preceding EXT-X-STREAM-INF.
            if let Some(mut v) = pending.take() {
                v.uri = line.to_string();
                variants.push(v);
            } else {
                warn!("stray URI line in master playlist: {line}");
            }
        }
    }
    if variants.is_empty() {
        return Err(StreamError::NotAVariant(String::from(
            "master playlist contains no usable variant",
        )));
    }

    // Primary video ladder, ascending bandwidth, I-frame variants included
    // but flagged so that ordinary bitrate selection skips them.
    let mut video = AdaptationSet {
        kind: MediaKind::Video,
        language: None,
        role: None,
        name: None,
        default: true,
        autoselect: true,
        forced: false,
        content_protection: Vec::new(),
        representations: Vec::new(),
    };
    variants.sort_by_key(|v| v.bandwidth);
    for v in &variants {
        let child = base_uri
            .join(&v.uri)
            .map_err(|e| StreamError::Parsing(format!("variant URI {}: {e}", v.uri)))?;
        video.representations.push(Representation {
            id: v.uri.clone(),
            name: None,
            bandwidth: v.bandwidth,
            codecs: v.codecs.clone(),
            width: v.width,
            height: v.height,
            framerate: v.framerate.map(framerate_fraction),
            iframe_only: v.iframe,
            timescale: 1_000_000_000,
            header: None,
            index: SegmentIndex::List(Vec::new()),
            playlist_uri: Some(child),
            target_duration: None,
            discontinuity_sequence: 0,
            allow_cache: true,
            endlist: false,
            cached_manifest: None,
        });
    }
    let mut adaptations = vec![video];

    // One adaptation set per alternate rendition group.
    let mut groups: HashMap<(MediaKind, String), Vec<&MediaRendition>> = HashMap::new();
    for r in &renditions {
        groups.entry((r.kind, r.group_id.clone())).or_default().push(r);
    }
    let mut group_keys: Vec<_> = groups.keys().cloned().collect();
    group_keys.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));
    for key in group_keys {
        let members = &groups[&key];
        let mut set = AdaptationSet {
            kind: key.0,
            language: members.iter().find_map(|m| m.language.clone()),
            role: None,
            name: Some(key.1.clone()),
            default: members.iter().any(|m| m.default),
            autoselect: members.iter().any(|m| m.autoselect),
            forced: members.iter().any(|m| m.forced),
            content_protection: Vec::new(),
            representations: Vec::new(),
        };
        for m in members {
            let Some(u) = &m.uri else {
                // Rendition multiplexed into the variant stream (or a
                // closed-caption channel): nothing separate to fetch.
                continue;
            };
            let child = base_uri
                .join(u)
                .map_err(|e| StreamError::Parsing(format!("rendition URI {u}: {e}")))?;
            set.representations.push(Representation {
                id: u.clone(),
                name: m.name.clone(),
                bandwidth: 0,
                codecs: None,
                width: None,
                height: None,
                framerate: None,
                iframe_only: false,
                timescale: 1_000_000_000,
                header: None,
                index: SegmentIndex::List(Vec::new()),
                playlist_uri: Some(child),
                target_duration: None,
                discontinuity_sequence: 0,
                allow_cache: true,
                endlist: false,
                cached_manifest: None,
            });
        }
        adaptations.push(set);
    }

    playlist.periods.push(Period {
        id: None,
        start: Duration::ZERO,
        duration: None,
        adaptations,
    });
    debug!(
        variants = variants.len(),
        renditions = renditions.len(),
        "parsed HLS master playlist"
    );
    Ok(playlist)
}

fn parse_media_standalone(
    text: &str,
    uri: &Url,
    base_uri: &Url,
) -> Result<Playlist, StreamError> {
    let media = parse_media_playlist(text, base_uri)?;
    let mut playlist = empty_playlist(uri, base_uri);
    playlist.version = media.version;
    playlist.is_live = !media.endlist;
    let repr = Representation {
        id: uri.to_string(),
        name: None,
        bandwidth: 0,
        codecs: None,
        width: None,
        height: None,
        framerate: None,
        iframe_only: false,
        timescale: 1_000_000_000,
        header: None,
        index: SegmentIndex::List(media.segments),
        playlist_uri: Some(uri.clone()),
        target_duration: media.target_duration,
        discontinuity_sequence: media.discontinuity_sequence,
        allow_cache: media.allow_cache,
        endlist: media.endlist,
        cached_manifest: Some(text.to_string()),
    };
    playlist.periods.push(Period {
        id: None,
        start: Duration::ZERO,
        duration: None,
        adaptations: vec![AdaptationSet {
            kind: MediaKind::Video,
            language: None,
            role: None,
            name: None,
            default: true,
            autoselect: true,
            forced: false,
            content_protection: Vec::new(),
            representations: vec![repr],
        }],
    });
    Ok(playlist)
}

/// The parse result of one media playlist document.
pub struct MediaPlaylist {
    pub version: Option<u32>,
    pub target_duration: Option<Duration>,
    /// Value of `EXT-X-MEDIA-SEQUENCE`; None when the tag was absent, in
    /// which case continuity across refreshes is deduced from URIs.
    pub media_sequence: Option<i64>,
    pub discontinuity_sequence: i64,
    pub endlist: bool,
    pub allow_cache: bool,
    pub segments: Vec<Segment>,
}

/// Parse one media playlist document. Segment sequence numbers start at the
/// declared `EXT-X-MEDIA-SEQUENCE` (0 when absent) and presentation times
/// accumulate from zero.
pub fn parse_media_playlist(text: &str, base_uri: &Url) -> Result<MediaPlaylist, StreamError> {
    let trimmed = text.trim_start_matches('\u{feff}');
    if !trimmed.starts_with("#EXTM3U") {
        return Err(StreamError::NotAPlaylist(String::from(
            "input does not begin with #EXTM3U",
        )));
    }
    let mut media = MediaPlaylist {
        version: None,
        target_duration: None,
        media_sequence: None,
        discontinuity_sequence: 0,
        endlist: false,
        allow_cache: true,
        segments: Vec::new(),
    };
    let mut key: Option<SegmentKey> = None;
    let mut pending_duration: Option<Duration> = None;
    let mut pending_title: Option<String> = None;
    let mut pending_range: Option<ByteRange> = None;
    let mut pending_discont = false;
    let mut pending_date_time: Option<DateTime<Utc>> = None;
    let mut last_range_end: u64 = 0;
    let mut pts = Duration::ZERO;
    let mut sequence: i64 = 0;

    for line in trimmed.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
            media.version = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            let secs: f64 = rest.trim().parse().map_err(|_| {
                StreamError::Parsing(format!("invalid EXT-X-TARGETDURATION: {rest}"))
            })?;
            media.target_duration = Some(Duration::from_secs_f64(secs));
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            let n: i64 = rest.trim().parse().map_err(|_| {
                StreamError::Parsing(format!("invalid EXT-X-MEDIA-SEQUENCE: {rest}"))
            })?;
            media.media_sequence = Some(n);
            sequence = n;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-DISCONTINUITY-SEQUENCE:") {
            media.discontinuity_sequence = rest.trim().parse().unwrap_or(0);
        } else if line == "#EXT-X-DISCONTINUITY" {
            pending_discont = true;
        } else if line == "#EXT-X-ENDLIST" {
            media.endlist = true;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-ALLOW-CACHE:") {
            media.allow_cache = !rest.trim().eq_ignore_ascii_case("NO");
        } else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            key = parse_key_tag(rest, base_uri)?;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            pending_range = Some(parse_byterange(rest, last_range_end)?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-PROGRAM-DATE-TIME:") {
            match DateTime::parse_from_rfc3339(rest.trim()) {
                Ok(dt) => pending_date_time = Some(dt.with_timezone(&Utc)),
                Err(e) => warn!("unparseable EXT-X-PROGRAM-DATE-TIME {rest}: {e}"),
            }
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let (duration, title) = parse_extinf(rest)?;
            pending_duration = Some(duration);
            pending_title = title;
        } else if line.starts_with('#') {
            trace!("ignoring media playlist tag {line}");
        } else {
            let Some(duration) = pending_duration.take() else {
                warn!("URI line without preceding EXTINF: {line}");
                continue;
            };
            let seg_uri = base_uri
                .join(line)
                .map_err(|e| StreamError::Parsing(format!("segment URI {line}: {e}")))?;
            let range = pending_range.take();
            if let Some(r) = range {
                last_range_end = r.end();
            }
            media.segments.push(Segment {
                sequence,
                uri: seg_uri,
                range,
                pts,
                duration,
                discont: pending_discont,
                key: key.clone(),
                date_time: pending_date_time.take(),
                title: pending_title.take(),
            });
            pending_discont = false;
            pts += duration;
            sequence += 1;
        }
    }
    if media.segments.is_empty() {
        return Err(StreamError::EmptyMediaPlaylist);
    }
    Ok(media)
}

/// Apply a (possibly refreshed) media playlist to the representation with the
/// given id. Returns false when the text is byte-identical to the previous
/// application and nothing was changed.
///
/// For a refresh the consistency rules are:
/// - when the new playlist carries `EXT-X-MEDIA-SEQUENCE`, every sequence
///   number present in both old and new lists must name the same URI;
/// - when it does not, continuity is deduced by matching URIs: a matched URI
///   keeps its old sequence number, unmatched tail segments continue from the
///   last known number.
pub fn update_media_playlist(
    playlist: &mut Playlist,
    repr_id: &str,
    text: &str,
) -> Result<bool, StreamError> {
    let (pi, ai, ri) = playlist
        .find_representation(repr_id)
        .ok_or_else(|| StreamError::NotAVariant(format!("unknown representation {repr_id}")))?;
    let base_uri = playlist.base_uri.clone();
    let repr = &mut playlist.periods[pi].adaptations[ai].representations[ri];
    if repr.cached_manifest.as_deref() == Some(text) {
        trace!("media playlist for {repr_id} unchanged");
        return Ok(false);
    }
    let mut media = parse_media_playlist(text, &base_uri)?;

    if let SegmentIndex::List(old) = &repr.index {
        if !old.is_empty() {
            merge_segments(old, &mut media)?;
        }
    }
    verify_monotonic(&media.segments)?;

    repr.target_duration = media.target_duration.or(repr.target_duration);
    repr.discontinuity_sequence = media.discontinuity_sequence;
    repr.allow_cache = media.allow_cache;
    repr.endlist = media.endlist;
    repr.cached_manifest = Some(text.to_string());
    let count = media.segments.len();
    let last_end = media.segments.last().map(|s| s.end_pts());
    repr.index = SegmentIndex::List(media.segments);
    playlist.is_live = !playlist.periods[pi].adaptations[ai].representations[ri].endlist;
    debug!(
        repr = repr_id,
        segments = count,
        last_end = ?last_end,
        live = playlist.is_live,
        "applied media playlist"
    );
    Ok(true)
}

/// Reconcile a fresh media playlist against the previously applied segments,
/// rewriting its sequence numbers and presentation times so that they
/// continue the established timeline.
fn merge_segments(old: &[Segment], media: &mut MediaPlaylist) -> Result<(), StreamError> {
    let old_first = old.first().map(|s| s.sequence).unwrap_or(0);
    let old_last = old.last().map(|s| s.sequence).unwrap_or(0);

    if media.media_sequence.is_some() {
        // Sequence numbers are authoritative; check overlapping entries.
        for seg in &media.segments {
            if seg.sequence >= old_first && seg.sequence <= old_last {
                let prev = &old[(seg.sequence - old_first) as usize];
                if prev.uri != seg.uri {
                    return Err(StreamError::Inconsistent(format!(
                        "sequence {} changed URI across refresh ({} -> {})",
                        seg.sequence, prev.uri, seg.uri
                    )));
                }
            }
        }
    } else {
        // No EXT-X-MEDIA-SEQUENCE: deduce continuity by matching URIs.
        let by_uri: HashMap<&Url, &Segment> = old.iter().map(|s| (&s.uri, s)).collect();
        let mut next = old_last + 1;
        let mut matched_any = false;
        for seg in media.segments.iter_mut() {
            if let Some(prev) = by_uri.get(&seg.uri) {
                seg.sequence = prev.sequence;
                next = prev.sequence + 1;
                matched_any = true;
            } else {
                seg.sequence = next;
                next += 1;
            }
        }
        if !matched_any {
            debug!("no URI overlap with previous playlist, continuing from {}", old_last + 1);
        }
    }

    // Re-anchor presentation times on the old timeline. Segments whose
    // sequence existed before keep their established timestamps; fresh
    // segments continue from the end of the previous window.
    let mut pts = match media.segments.first() {
        Some(first) if first.sequence >= old_first && first.sequence <= old_last => {
            old[(first.sequence - old_first) as usize].pts
        }
        _ => old.last().map(|s| s.end_pts()).unwrap_or(Duration::ZERO),
    };
    for seg in media.segments.iter_mut() {
        seg.pts = pts;
        pts += seg.duration;
    }
    Ok(())
}

fn verify_monotonic(segments: &[Segment]) -> Result<(), StreamError> {
    for pair in segments.windows(2) {
        if pair[1].sequence <= pair[0].sequence {
            return Err(StreamError::Inconsistent(format!(
                "sequence numbers not strictly increasing ({} then {})",
                pair[0].sequence, pair[1].sequence
            )));
        }
    }
    if segments.iter().any(|s| s.duration.is_zero()) {
        return Err(StreamError::Inconsistent(String::from(
            "segment with zero duration",
        )));
    }
    Ok(())
}

/// Render a representation's segment list back to a canonical media playlist.
/// The target duration is `ceil((max segment duration + 500ms) / 1s)`.
pub fn render_media_playlist(repr: &Representation, endlist: bool) -> String {
    let SegmentIndex::List(segments) = &repr.index else {
        return String::from("#EXTM3U\n#EXT-X-ENDLIST\n");
    };
    let max_dur = segments.iter().map(|s| s.duration).max().unwrap_or(Duration::ZERO);
    let target = (max_dur + Duration::from_millis(500)).as_secs_f64().ceil() as u64;
    let mut out = String::from("#EXTM3U\n");
    out.push_str(&format!("#EXT-X-VERSION:{}\n", repr_version(segments)));
    if !repr.allow_cache {
        out.push_str("#EXT-X-ALLOW-CACHE:NO\n");
    }
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", segments[0].sequence));
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target}\n"));
    let mut current_key: Option<&SegmentKey> = None;
    for seg in segments {
        if seg.discont {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        if seg.key.as_ref() != current_key {
            match &seg.key {
                Some(k) => {
                    out.push_str(&format!("#EXT-X-KEY:METHOD=AES-128,URI=\"{}\"", k.uri));
                    if let Some(iv) = k.iv {
                        out.push_str(&format!(",IV=0x{}", hex::encode(iv)));
                    }
                    out.push('\n');
                }
                None => out.push_str("#EXT-X-KEY:METHOD=NONE\n"),
            }
            current_key = seg.key.as_ref();
        }
        match &seg.title {
            Some(title) => out.push_str(&format!(
                "#EXTINF:{:.3},{title}\n",
                seg.duration.as_secs_f64()
            )),
            None => out.push_str(&format!("#EXTINF:{:.3},\n", seg.duration.as_secs_f64())),
        }
        if let Some(r) = seg.range {
            out.push_str(&format!("#EXT-X-BYTERANGE:{}@{}\n", r.size, r.offset));
        }
        out.push_str(seg.uri.as_str());
        out.push('\n');
    }
    if endlist {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

fn repr_version(segments: &[Segment]) -> u32 {
    // Byte ranges and fractional EXTINF both require protocol version >= 4.
    if segments.iter().any(|s| s.range.is_some()) {
        4
    } else {
        3
    }
}

fn parse_extinf(rest: &str) -> Result<(Duration, Option<String>), StreamError> {
    let (dur_str, title) = match rest.split_once(',') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    let secs: f64 = dur_str
        .trim()
        .parse()
        .map_err(|_| StreamError::Parsing(format!("invalid EXTINF duration: {dur_str}")))?;
    if !(secs.is_finite() && secs >= 0.0) {
        return Err(StreamError::Parsing(format!("invalid EXTINF duration: {dur_str}")));
    }
    let title = title.map(str::trim).filter(|t| !t.is_empty()).map(String::from);
    Ok((Duration::from_secs_f64(secs), title))
}

/// `size[@offset]`; a missing offset continues at the end of the previous
/// range.
fn parse_byterange(rest: &str, last_end: u64) -> Result<ByteRange, StreamError> {
    let rest = rest.trim();
    let (size_str, offset) = match rest.split_once('@') {
        Some((s, o)) => {
            let off: u64 = o.trim().parse().map_err(|_| {
                StreamError::Parsing(format!("invalid EXT-X-BYTERANGE offset: {rest}"))
            })?;
            (s, off)
        }
        None => (rest, last_end),
    };
    let size: u64 = size_str
        .trim()
        .parse()
        .map_err(|_| StreamError::Parsing(format!("invalid EXT-X-BYTERANGE size: {rest}")))?;
    if size == 0 {
        return Err(StreamError::Parsing(String::from("EXT-X-BYTERANGE with zero size")));
    }
    Ok(ByteRange::new(offset, size))
}

fn parse_key_tag(rest: &str, base_uri: &Url) -> Result<Option<SegmentKey>, StreamError> {
    let attrs = parse_attributes(rest);
    let method = attrs.get("METHOD").map(String::as_str).unwrap_or("NONE");
    match method {
        "NONE" => Ok(None),
        "AES-128" => {
            let uri_attr = attrs.get("URI").ok_or_else(|| {
                StreamError::Parsing(String::from("EXT-X-KEY:METHOD=AES-128 without URI"))
            })?;
            let uri = base_uri
                .join(uri_attr)
                .map_err(|e| StreamError::Parsing(format!("key URI {uri_attr}: {e}")))?;
            let iv = match attrs.get("IV") {
                Some(ivs) => Some(parse_iv(ivs)?),
                None => None,
            };
            Ok(Some(SegmentKey { uri, iv }))
        }
        other => Err(StreamError::UnsupportedEncryption(other.to_string())),
    }
}

/// `0x`-prefixed, exactly 32 hex nibbles.
fn parse_iv(s: &str) -> Result<[u8; 16], StreamError> {
    let hexpart = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| StreamError::Parsing(format!("IV missing 0x prefix: {s}")))?;
    if hexpart.len() != 32 {
        return Err(StreamError::Parsing(format!(
            "IV must be 32 hex digits, got {}",
            hexpart.len()
        )));
    }
    let bytes = hex::decode(hexpart)
        .map_err(|e| StreamError::Parsing(format!("invalid IV {s}: {e}")))?;
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&bytes);
    Ok(iv)
}

fn parse_stream_inf(rest: &str, iframe: bool) -> Result<VariantInf, StreamError> {
    let attrs = parse_attributes(rest);
    let bandwidth = attrs
        .get("BANDWIDTH")
        .and_then(|b| b.parse().ok())
        .ok_or_else(|| {
            StreamError::Parsing(String::from("EXT-X-STREAM-INF without BANDWIDTH"))
        })?;
    let (width, height) = match attrs.get("RESOLUTION") {
        Some(res) => parse_resolution(res),
        None => (None, None),
    };
    Ok(VariantInf {
        uri: attrs.get("URI").cloned().unwrap_or_default(),
        bandwidth,
        codecs: attrs.get("CODECS").cloned(),
        width,
        height,
        framerate: attrs.get("FRAME-RATE").and_then(|f| f.parse().ok()),
        iframe,
    })
}

fn parse_media_tag(rest: &str) -> Option<MediaRendition> {
    let attrs = parse_attributes(rest);
    let kind = match attrs.get("TYPE").map(String::as_str) {
        Some("AUDIO") => MediaKind::Audio,
        Some("VIDEO") => MediaKind::Video,
        Some("SUBTITLES") => MediaKind::Subtitle,
        Some("CLOSED-CAPTIONS") => MediaKind::ClosedCaption,
        other => {
            warn!("EXT-X-MEDIA with unknown TYPE {other:?}");
            return None;
        }
    };
    Some(MediaRendition {
        kind,
        group_id: attrs.get("GROUP-ID").cloned().unwrap_or_default(),
        name: attrs.get("NAME").cloned(),
        uri: attrs.get("URI").cloned(),
        language: attrs.get("LANGUAGE").cloned(),
        default: attrs.get("DEFAULT").map(String::as_str) == Some("YES"),
        autoselect: attrs.get("AUTOSELECT").map(String::as_str) == Some("YES"),
        forced: attrs.get("FORCED").map(String::as_str) == Some("YES"),
    })
}

fn parse_resolution(s: &str) -> (Option<u32>, Option<u32>) {
    match s.split_once(['x', 'X']) {
        Some((w, h)) => (w.trim().parse().ok(), h.trim().parse().ok()),
        None => (None, None),
    }
}

fn framerate_fraction(fps: f64) -> (u32, u32) {
    // Common NTSC rates are n/1.001; everything else is close enough to a
    // rational with denominator 1000.
    let scaled = (fps * 1000.0).round() as u32;
    if scaled % 1000 == 0 {
        (scaled / 1000, 1)
    } else {
        (scaled, 1000)
    }
}

/// Split an attribute list into key/value pairs, honoring quoted values that
/// may themselves contain commas (`CODECS="avc1.77.30, mp4a.40.2"`).
pub(crate) fn parse_attributes(s: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(close) = stripped.find('"') else {
                // Unterminated quote: take everything.
                attrs.insert(key, stripped.to_string());
                break;
            };
            value = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start_matches(',').trim_start();
        } else {
            match rest.find(',') {
                Some(comma) => {
                    value = rest[..comma].trim().to_string();
                    rest = rest[comma + 1..].trim_start();
                }
                None => {
                    value = rest.trim().to_string();
                    rest = "";
                }
            }
        }
        attrs.insert(key, value);
    }
    attrs
}

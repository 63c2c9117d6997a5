//! Parsing of Microsoft Smooth Streaming (`<SmoothStreamingMedia>`)
//! manifests.
//!
//! Smooth Streaming addresses fragments by timestamp rather than by number:
//! the `Url` template of each `StreamIndex` carries `{bitrate}` and
//! `{start time}` placeholders which we normalise to the `$Bandwidth$` /
//! `$Time$` identifiers shared with DASH templates, so that one resolver
//! serves both flavors. Live manifests announce only a window of fragments;
//! the list grows at runtime from the `tfrf` look-ahead boxes found in
//! fragment headers (see [`extend_live_timeline`]).

#![allow(non_snake_case)]

use std::time::Duration;
use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{
    AdaptationSet as ModelAdaptation, ManifestFlavor, MediaKind, Period as ModelPeriod, Playlist,
    ProtectionDescriptor, Representation as ModelRepresentation, SegmentIndex, StreamError,
    TemplateIndex, TimelinePiece, scaled_duration,
};

/// Default Smooth Streaming timescale: 100 ns units.
const DEFAULT_TIMESCALE: u64 = 10_000_000;

#[derive(Debug, Deserialize, Clone)]
pub struct QualityLevel {
    #[serde(rename = "@Index")]
    pub Index: Option<u32>,
    #[serde(rename = "@Bitrate")]
    pub Bitrate: u64,
    #[serde(rename = "@FourCC")]
    pub FourCC: Option<String>,
    #[serde(rename = "@CodecPrivateData")]
    pub CodecPrivateData: Option<String>,
    #[serde(rename = "@MaxWidth")]
    pub MaxWidth: Option<u32>,
    #[serde(rename = "@MaxHeight")]
    pub MaxHeight: Option<u32>,
    #[serde(rename = "@SamplingRate")]
    pub SamplingRate: Option<u32>,
    #[serde(rename = "@Channels")]
    pub Channels: Option<u32>,
}

/// One `<c>` chunk entry: start time, duration and repeat count in the
/// stream's timescale.
#[derive(Debug, Deserialize, Clone)]
pub struct Chunk {
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    #[serde(rename = "@d")]
    pub d: Option<u64>,
    #[serde(rename = "@n")]
    pub n: Option<u64>,
    #[serde(rename = "@r")]
    pub r: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamIndex {
    #[serde(rename = "@Type")]
    pub Type: String,
    #[serde(rename = "@Name")]
    pub Name: Option<String>,
    #[serde(rename = "@Url")]
    pub Url: Option<String>,
    #[serde(rename = "@Language")]
    pub Language: Option<String>,
    #[serde(rename = "@TimeScale")]
    pub TimeScale: Option<u64>,
    #[serde(rename = "QualityLevel", default)]
    pub quality_levels: Vec<QualityLevel>,
    #[serde(rename = "c", default)]
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProtectionHeader {
    #[serde(rename = "@SystemID")]
    pub SystemID: Option<String>,
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Protection {
    #[serde(rename = "ProtectionHeader", default)]
    pub headers: Vec<ProtectionHeader>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmoothStreamingMedia {
    #[serde(rename = "@MajorVersion")]
    pub MajorVersion: Option<u32>,
    #[serde(rename = "@TimeScale")]
    pub TimeScale: Option<u64>,
    /// Total duration in timescale units; 0 or absent for live.
    #[serde(rename = "@Duration")]
    pub Duration: Option<u64>,
    #[serde(rename = "@IsLive")]
    pub IsLive: Option<String>,
    /// Rolling window length in timescale units for live content.
    #[serde(rename = "@DVRWindowLength")]
    pub DVRWindowLength: Option<u64>,
    #[serde(rename = "@LookAheadFragmentCount")]
    pub LookAheadFragmentCount: Option<u32>,
    #[serde(rename = "Protection")]
    pub Protection: Option<Protection>,
    #[serde(rename = "StreamIndex", default)]
    pub stream_indices: Vec<StreamIndex>,
}

pub fn parse_manifest_tree(xml: &str) -> Result<SmoothStreamingMedia, StreamError> {
    let deserializer = &mut quick_xml::de::Deserializer::from_str(xml);
    serde_path_to_error::deserialize(deserializer).map_err(|e| {
        StreamError::Parsing(format!("deserializing Smooth manifest at {}: {e}", e.path()))
    })
}

/// Parse a Smooth Streaming manifest into the uniform playlist model.
pub fn parse_manifest(xml: &str, uri: &Url, base_uri: &Url) -> Result<Playlist, StreamError> {
    let trimmed = xml.trim_start();
    if !trimmed.starts_with("<?xml") && !trimmed.starts_with("<SmoothStreamingMedia") {
        return Err(StreamError::NotAPlaylist(String::from(
            "input does not look like a SmoothStreamingMedia document",
        )));
    }
    let manifest = parse_manifest_tree(xml)?;
    let timescale = manifest.TimeScale.unwrap_or(DEFAULT_TIMESCALE);
    let is_live = manifest
        .IsLive
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("TRUE"));
    let duration = manifest
        .Duration
        .filter(|d| *d > 0)
        .map(|d| scaled_duration(d, timescale));

    let protection: Vec<ProtectionDescriptor> = manifest
        .Protection
        .iter()
        .flat_map(|p| p.headers.iter())
        .filter_map(|h| {
            let system = h.SystemID.as_deref()?;
            let data = h
                .content
                .as_deref()
                .and_then(|c| BASE64_STANDARD.decode(c.trim()).ok())
                .map(Bytes::from)
                .unwrap_or_default();
            // SystemID is conventionally written between braces.
            let scheme_id = system.trim_matches(['{', '}']).to_ascii_lowercase();
            Some(ProtectionDescriptor { scheme_id: format!("urn:uuid:{scheme_id}"), data })
        })
        .collect();

    let mut adaptations = Vec::new();
    for (si, stream) in manifest.stream_indices.iter().enumerate() {
        match convert_stream_index(stream, si, timescale, &protection) {
            Ok(set) => adaptations.push(set),
            Err(e) => warn!("skipping unusable StreamIndex: {e}"),
        }
    }
    if adaptations.is_empty() {
        return Err(StreamError::NotAVariant(String::from(
            "manifest contains no usable StreamIndex",
        )));
    }

    let playlist = Playlist {
        flavor: ManifestFlavor::Mss,
        manifest_uri: uri.clone(),
        base_uri: base_uri.clone(),
        is_live,
        version: manifest.MajorVersion,
        availability_start_time: None,
        time_shift_buffer_depth: manifest
            .DVRWindowLength
            .filter(|d| *d > 0)
            .map(|d| scaled_duration(d, timescale)),
        minimum_update_period: None,
        suggested_presentation_delay: None,
        max_segment_duration: None,
        utc_timing: Vec::new(),
        periods: vec![ModelPeriod {
            id: None,
            start: Duration::ZERO,
            duration,
            adaptations,
        }],
        look_ahead_count: manifest.LookAheadFragmentCount.unwrap_or(0),
        cached_manifest: None,
    };
    debug!(
        live = is_live,
        streams = playlist.periods[0].adaptations.len(),
        look_ahead = playlist.look_ahead_count,
        "parsed Smooth Streaming manifest"
    );
    Ok(playlist)
}

fn convert_stream_index(
    stream: &StreamIndex,
    index: usize,
    manifest_timescale: u64,
    protection: &[ProtectionDescriptor],
) -> Result<ModelAdaptation, StreamError> {
    let kind = match stream.Type.as_str() {
        "audio" => MediaKind::Audio,
        "video" => MediaKind::Video,
        "text" => MediaKind::Subtitle,
        other => {
            return Err(StreamError::Parsing(format!("unknown StreamIndex Type {other}")));
        }
    };
    let timescale = stream.TimeScale.unwrap_or(manifest_timescale);
    let url_template = stream
        .Url
        .as_ref()
        .ok_or_else(|| StreamError::Parsing(String::from("StreamIndex without Url template")))?;
    let media = normalize_template(url_template);

    let pieces = expand_chunks(&stream.chunks);
    if pieces.is_empty() {
        return Err(StreamError::Parsing(String::from("StreamIndex without chunks")));
    }

    let stream_name = stream.Name.clone().unwrap_or_else(|| stream.Type.clone());
    let mut representations = Vec::new();
    for level in &stream.quality_levels {
        representations.push(ModelRepresentation {
            id: format!("{stream_name}-{}", level.Bitrate),
            name: Some(stream_name.clone()),
            bandwidth: level.Bitrate,
            codecs: level.FourCC.as_deref().map(fourcc_to_codec),
            width: level.MaxWidth,
            height: level.MaxHeight,
            framerate: None,
            iframe_only: false,
            timescale,
            // Smooth fragments are self-initialising: the moov equivalent is
            // synthesised by the host from the manifest codec data.
            header: None,
            index: SegmentIndex::Template(TemplateIndex {
                media: media.clone(),
                start_number: 0,
                timescale,
                presentation_time_offset: 0,
                pieces: pieces.clone(),
                segment_duration: None,
                first_available: None,
                end_number: None,
            }),
            playlist_uri: None,
            target_duration: pieces
                .iter()
                .map(|p| scaled_duration(p.duration, timescale))
                .max(),
            discontinuity_sequence: 0,
            allow_cache: true,
            endlist: false,
            cached_manifest: None,
        });
    }
    representations.sort_by_key(|r| r.bandwidth);

    Ok(ModelAdaptation {
        kind,
        language: stream.Language.clone(),
        role: None,
        name: Some(format!("{stream_name}-{index}")),
        default: true,
        autoselect: true,
        forced: false,
        content_protection: protection.to_vec(),
        representations,
    })
}

fn expand_chunks(chunks: &[Chunk]) -> Vec<TimelinePiece> {
    let mut pieces = Vec::new();
    let mut t = 0u64;
    for c in chunks {
        if let Some(start) = c.t {
            t = start;
        }
        let Some(d) = c.d else {
            // A final chunk may omit its duration on some servers; there is
            // nothing to fetch for it until the next refresh fills it in.
            continue;
        };
        let repeat = c.r.unwrap_or(1).max(1);
        pieces.push(TimelinePiece { start: t, duration: d, repeat });
        t += d * repeat;
    }
    pieces
}

/// Rewrite the Smooth `Url` template placeholders to the `$...$` identifiers
/// shared with DASH. Both spellings seen in the wild are accepted.
fn normalize_template(template: &str) -> String {
    template
        .replace("{bitrate}", "$Bandwidth$")
        .replace("{Bitrate}", "$Bandwidth$")
        .replace("{start time}", "$Time$")
        .replace("{start_time}", "$Time$")
}

// A coarse FourCC → RFC 6381 mapping; enough for the host to pick a decoder.
// The precise profile/level information lives in CodecPrivateData, which is
// surfaced verbatim through the track caps.
fn fourcc_to_codec(fourcc: &str) -> String {
    match fourcc.to_ascii_uppercase().as_str() {
        "H264" | "AVC1" => String::from("avc1"),
        "H265" | "HVC1" | "HEV1" => String::from("hvc1"),
        "AACL" | "AACH" => String::from("mp4a.40.2"),
        "WVC1" | "WMV3" => String::from("vc-1"),
        "EC-3" | "DDPL" => String::from("ec-3"),
        "TTML" | "DFXP" => String::from("stpp"),
        other => other.to_ascii_lowercase(),
    }
}

/// Grow a live representation's timeline from `tfrf` look-ahead entries
/// (`(time, duration)` pairs in timescale units). Entries that would overlap
/// or precede the known timeline are ignored: look-ahead information may
/// extend the fragment list but never shrink or rewrite it.
pub fn extend_live_timeline(repr: &mut ModelRepresentation, entries: &[(u64, u64)]) -> usize {
    let SegmentIndex::Template(template) = &mut repr.index else {
        return 0;
    };
    let mut appended = 0;
    for &(time, duration) in entries {
        if duration == 0 {
            continue;
        }
        let end = template
            .pieces
            .last()
            .map(|p| p.start + p.duration * p.repeat)
            .unwrap_or(0);
        if time < end {
            continue;
        }
        if let Some(last) = template.pieces.last_mut() {
            if last.duration == duration && last.start + last.duration * last.repeat == time {
                last.repeat += 1;
                appended += 1;
                continue;
            }
        }
        template.pieces.push(TimelinePiece { start: time, duration, repeat: 1 });
        appended += 1;
    }
    appended
}

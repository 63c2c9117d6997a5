//! Parsing of DASH MPD manifests into the uniform playlist model.
//!
//! The MPD format is documented by ISO in the 23009-1 specification; when MPD
//! files in practical use diverge from the formal standard, this module
//! prefers to interoperate with existing practice. We use the quick_xml +
//! serde crates to deserialize the XML content to Rust structs; serde ignores
//! unknown fields, so only the subset feeding the playlist model is declared.

#![allow(non_snake_case)]

use std::time::Duration;
use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{
    AdaptationSet as ModelAdaptation, ByteRange, InitHeader, ManifestFlavor, MediaKind,
    Period as ModelPeriod, Playlist, ProtectionDescriptor, Representation as ModelRepresentation,
    SegmentIndex, SidxIndex, StreamError, TemplateIndex, TimelinePiece, UtcTimingMethod,
    UtcTimingSource, scaled_duration,
};

// Parse an XML duration string, as per https://www.w3.org/TR/xmlschema-2/#duration
//
// The lexical representation for duration is the ISO 8601 extended format
// PnYnMnDTnHnMnS. The number of seconds can include decimal digits to
// arbitrary precision. A year/month component is converted using average
// lengths, which is inexact but such durations do not occur in practice in
// MPD manifests.
pub(crate) fn parse_xs_duration(s: &str) -> Result<Duration, StreamError> {
    match iso8601::duration(s) {
        Ok(iso_duration) => match iso_duration {
            iso8601::Duration::Weeks(w) => Ok(Duration::new(w as u64 * 60 * 60 * 24 * 7, 0)),
            iso8601::Duration::YMDHMS { year, month, day, hour, minute, second, millisecond } => {
                let mut secs: u64 = second.into();
                secs += minute as u64 * 60;
                secs += hour as u64 * 60 * 60;
                secs += day as u64 * 60 * 60 * 24;
                secs += month as u64 * 60 * 60 * 24 * 31;
                secs += year as u64 * 60 * 60 * 24 * 31 * 365;
                Ok(Duration::new(secs, millisecond * 1_000_000))
            }
        },
        Err(e) => Err(StreamError::InvalidDuration(format!("{s}: {e:?}"))),
    }
}

fn parse_xs_datetime(s: &str) -> Result<DateTime<Utc>, StreamError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StreamError::Parsing(format!("xs:dateTime {s}: {e}")))
}

/// Describes a sequence of contiguous segments with identical duration.
#[derive(Debug, Deserialize, Clone)]
pub struct S {
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    #[serde(rename = "@d")]
    pub d: u64,
    /// Repeat count (number of contiguous segments with this duration minus
    /// one); -1 means "until the end of the period".
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub sourceURL: Option<String>,
    #[serde(rename = "@range")]
    pub range: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "SegmentTimeline")]
    pub SegmentTimeline: Option<SegmentTimeline>,
    #[serde(rename = "@startNumber")]
    pub startNumber: Option<u64>,
    // note: the spec says this is an unsigned int, not an xs:duration
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentationTimeOffset: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BaseURL {
    #[serde(rename = "$text")]
    pub base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentBase {
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@indexRange")]
    pub indexRange: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentURL {
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@mediaRange")]
    pub mediaRange: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentList {
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,
    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<SegmentURL>,
}

/// Contains information on DRM mechanisms used in the stream. The payload is
/// kept opaque and surfaced to the host as a protection event.
#[derive(Debug, Deserialize, Clone)]
pub struct ContentProtection {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
    #[serde(rename = "pssh")]
    pub pssh: Option<Pssh>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pssh {
    #[serde(rename = "$text")]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Role {
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    /// An RFC6381 string, <https://tools.ietf.org/html/rfc6381>
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u32>,
    #[serde(rename = "@height")]
    pub height: Option<u32>,
    #[serde(rename = "@frameRate")]
    pub frameRate: Option<String>,
    /// There may be several BaseURLs, for redundancy (multiple CDNs); we
    /// use the first.
    #[serde(rename = "BaseURL", default)]
    pub BaseURL: Vec<BaseURL>,
    #[serde(rename = "SegmentTemplate")]
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "SegmentBase")]
    pub SegmentBase: Option<SegmentBase>,
    #[serde(rename = "SegmentList")]
    pub SegmentList: Option<SegmentList>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@contentType")]
    pub contentType: Option<String>,
    #[serde(rename = "@lang")]
    pub lang: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mimeType: Option<String>,
    #[serde(rename = "@maxFrameRate")]
    pub maxFrameRate: Option<String>,
    /// There may be several BaseURLs, for redundancy (multiple CDNs); we
    /// use the first.
    #[serde(rename = "BaseURL", default)]
    pub BaseURL: Vec<BaseURL>,
    #[serde(rename = "Role")]
    pub Role: Option<Role>,
    #[serde(rename = "ContentProtection", default)]
    pub content_protection: Vec<ContentProtection>,
    #[serde(rename = "SegmentTemplate")]
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@start")]
    pub start: Option<String>,
    #[serde(rename = "@duration")]
    pub duration: Option<String>,
    /// There may be several BaseURLs, for redundancy (multiple CDNs); we
    /// use the first.
    #[serde(rename = "BaseURL", default)]
    pub BaseURL: Vec<BaseURL>,
    #[serde(rename = "SegmentTemplate")]
    pub SegmentTemplate: Option<SegmentTemplate>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptations: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UTCTiming {
    // prefixed with urn:mpeg:dash:utc, one of http-xsdate:2014, http-iso:2014,
    // http-ntp:2014, ntp:2014, http-head:2014
    #[serde(rename = "@schemeIdUri")]
    pub schemeIdUri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

/// The root node of a parsed DASH MPD manifest.
#[derive(Debug, Deserialize, Clone)]
pub struct MPD {
    #[serde(rename = "@type")]
    pub mpdtype: Option<String>,
    #[serde(rename = "@profiles")]
    pub profiles: Option<String>,
    #[serde(rename = "@minimumUpdatePeriod")]
    pub minimumUpdatePeriod: Option<String>,
    #[serde(rename = "@timeShiftBufferDepth")]
    pub timeShiftBufferDepth: Option<String>,
    #[serde(rename = "@mediaPresentationDuration")]
    pub mediaPresentationDuration: Option<String>,
    #[serde(rename = "@maxSegmentDuration")]
    pub maxSegmentDuration: Option<String>,
    #[serde(rename = "@suggestedPresentationDelay")]
    pub suggestedPresentationDelay: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    pub availabilityStartTime: Option<String>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
    #[serde(rename = "BaseURL", default)]
    pub base_urls: Vec<BaseURL>,
    #[serde(rename = "UTCTiming", default)]
    pub utc_timings: Vec<UTCTiming>,
}

/// Parse the XML document into the typed MPD tree.
pub fn parse_mpd_tree(xml: &str) -> Result<MPD, StreamError> {
    let deserializer = &mut quick_xml::de::Deserializer::from_str(xml);
    serde_path_to_error::deserialize(deserializer)
        .map_err(|e| StreamError::Parsing(format!("deserializing MPD at {}: {e}", e.path())))
}

/// Parse an MPD manifest into the uniform playlist model.
pub fn parse_mpd(xml: &str, uri: &Url, base_uri: &Url) -> Result<Playlist, StreamError> {
    if !xml.trim_start().starts_with("<?xml") && !xml.trim_start().starts_with("<MPD") {
        return Err(StreamError::NotAPlaylist(String::from(
            "input does not look like an MPD document",
        )));
    }
    let mpd = parse_mpd_tree(xml)?;
    let is_live = mpd.mpdtype.as_deref() == Some("dynamic");
    let on_demand_profile = mpd
        .profiles
        .as_deref()
        .is_some_and(|p| p.contains("urn:mpeg:dash:profile:isoff-on-demand"));

    let mut effective_base = base_uri.clone();
    if let Some(b) = mpd.base_urls.first() {
        effective_base = effective_base
            .join(b.base.trim())
            .map_err(|e| StreamError::Parsing(format!("BaseURL {}: {e}", b.base)))?;
    }

    let presentation_duration = mpd
        .mediaPresentationDuration
        .as_deref()
        .map(parse_xs_duration)
        .transpose()?;

    let mut playlist = Playlist {
        flavor: ManifestFlavor::Dash,
        manifest_uri: uri.clone(),
        base_uri: effective_base.clone(),
        is_live,
        version: None,
        availability_start_time: mpd
            .availabilityStartTime
            .as_deref()
            .map(parse_xs_datetime)
            .transpose()?,
        time_shift_buffer_depth: mpd
            .timeShiftBufferDepth
            .as_deref()
            .map(parse_xs_duration)
            .transpose()?,
        minimum_update_period: mpd
            .minimumUpdatePeriod
            .as_deref()
            .map(parse_xs_duration)
            .transpose()?,
        suggested_presentation_delay: mpd
            .suggestedPresentationDelay
            .as_deref()
            .map(parse_xs_duration)
            .transpose()?,
        max_segment_duration: mpd
            .maxSegmentDuration
            .as_deref()
            .map(parse_xs_duration)
            .transpose()?,
        utc_timing: mpd.utc_timings.iter().filter_map(utc_timing_source).collect(),
        periods: Vec::new(),
        look_ahead_count: 0,
        cached_manifest: None,
    };

    let mut cursor = Duration::ZERO;
    for (pi, period) in mpd.periods.iter().enumerate() {
        let start = match &period.start {
            Some(s) => parse_xs_duration(s)?,
            None => cursor,
        };
        let duration = match &period.duration {
            Some(s) => Some(parse_xs_duration(s)?),
            // The final period of a static presentation extends to the
            // declared end of the media.
            None if pi + 1 == mpd.periods.len() => {
                presentation_duration.map(|total| total.saturating_sub(start))
            }
            None => None,
        };
        cursor = start + duration.unwrap_or(Duration::ZERO);

        let mut period_base = effective_base.clone();
        if let Some(b) = period.BaseURL.first() {
            period_base = period_base
                .join(b.base.trim())
                .map_err(|e| StreamError::Parsing(format!("period BaseURL: {e}")))?;
        }

        let mut adaptations = Vec::new();
        for adaptation in &period.adaptations {
            adaptations.push(convert_adaptation(
                adaptation,
                period,
                &period_base,
                duration,
                is_live,
                on_demand_profile,
            )?);
        }
        playlist.periods.push(ModelPeriod {
            id: period.id.clone(),
            start,
            duration,
            adaptations,
        });
    }
    if playlist.periods.is_empty() {
        return Err(StreamError::NotAVariant(String::from("MPD contains no Period")));
    }
    debug!(
        live = is_live,
        periods = playlist.periods.len(),
        on_demand = on_demand_profile,
        "parsed MPD manifest"
    );
    Ok(playlist)
}

fn convert_adaptation(
    adaptation: &AdaptationSet,
    period: &Period,
    period_base: &Url,
    period_duration: Option<Duration>,
    is_live: bool,
    on_demand_profile: bool,
) -> Result<ModelAdaptation, StreamError> {
    let kind = adaptation_kind(adaptation);
    let mut base = period_base.clone();
    if let Some(b) = adaptation.BaseURL.first() {
        base = base
            .join(b.base.trim())
            .map_err(|e| StreamError::Parsing(format!("adaptation BaseURL: {e}")))?;
    }
    let mut protection = Vec::new();
    for cp in &adaptation.content_protection {
        let Some(scheme) = &cp.schemeIdUri else { continue };
        let data = cp
            .pssh
            .as_ref()
            .and_then(|p| p.content.as_deref())
            .and_then(|content| BASE64_STANDARD.decode(content.trim()).ok())
            .map(Bytes::from)
            .unwrap_or_default();
        protection.push(ProtectionDescriptor { scheme_id: scheme.clone(), data });
    }

    let mut representations = Vec::new();
    for rep in &adaptation.representations {
        match convert_representation(
            rep,
            adaptation,
            period,
            &base,
            period_duration,
            is_live,
            on_demand_profile,
        ) {
            Ok(r) => representations.push(r),
            Err(e) => warn!("skipping unusable Representation: {e}"),
        }
    }
    representations.sort_by_key(|r| r.bandwidth);

    Ok(ModelAdaptation {
        kind,
        language: adaptation.lang.clone(),
        role: adaptation.Role.as_ref().and_then(|r| r.value.clone()),
        name: adaptation.id.clone(),
        default: true,
        autoselect: true,
        forced: false,
        content_protection: protection,
        representations,
    })
}

fn adaptation_kind(a: &AdaptationSet) -> MediaKind {
    let content_type = a
        .contentType
        .as_deref()
        .or_else(|| a.representations.iter().find_map(|r| r.contentType.as_deref()));
    if let Some(ct) = content_type {
        match ct {
            "audio" => return MediaKind::Audio,
            "video" => return MediaKind::Video,
            "text" => return MediaKind::Subtitle,
            _ => {}
        }
    }
    let mime = a
        .mimeType
        .as_deref()
        .or_else(|| a.representations.iter().find_map(|r| r.mimeType.as_deref()));
    match mime {
        Some(m) if m.starts_with("audio/") => MediaKind::Audio,
        Some(m) if m.starts_with("text/") || m.starts_with("application/ttml") => {
            MediaKind::Subtitle
        }
        _ => MediaKind::Video,
    }
}

fn convert_representation(
    rep: &Representation,
    adaptation: &AdaptationSet,
    period: &Period,
    adaptation_base: &Url,
    period_duration: Option<Duration>,
    is_live: bool,
    on_demand_profile: bool,
) -> Result<ModelRepresentation, StreamError> {
    let id = rep
        .id
        .clone()
        .ok_or_else(|| StreamError::Parsing(String::from("Representation without @id")))?;
    let bandwidth = rep.bandwidth.unwrap_or(0);
    let mut base = adaptation_base.clone();
    if let Some(b) = rep.BaseURL.first() {
        base = base
            .join(b.base.trim())
            .map_err(|e| StreamError::Parsing(format!("representation BaseURL: {e}")))?;
    }

    // Template inheritance: representation > adaptation > period.
    let template = rep
        .SegmentTemplate
        .as_ref()
        .or(adaptation.SegmentTemplate.as_ref())
        .or(period.SegmentTemplate.as_ref());

    let mut header = None;
    let index;
    let mut timescale = 1;

    if let Some(st) = template {
        timescale = st.timescale.unwrap_or(1);
        let media = st.media.clone().ok_or_else(|| {
            StreamError::Parsing(String::from("SegmentTemplate without @media"))
        })?;
        if let Some(init) = &st.initialization {
            let path = fill_template(init, &id, bandwidth, 0, 0);
            let init_url = base
                .join(&path)
                .map_err(|e| StreamError::Parsing(format!("initialization URI: {e}")))?;
            header = Some(InitHeader { uri: Some(init_url), range: None });
        }
        let start_number = st.startNumber.unwrap_or(1);
        let mut pieces = Vec::new();
        if let Some(timeline) = &st.SegmentTimeline {
            let mut t = 0u64;
            for s in &timeline.segments {
                if let Some(start) = s.t {
                    t = start;
                }
                let repeat = match s.r {
                    Some(r) if r >= 0 => r as u64 + 1,
                    // r = -1 repeats until the period (or next S@t) ends.
                    Some(_) => {
                        let end_units = period_duration
                            .map(|d| crate::duration_to_scaled(d, timescale))
                            .unwrap_or(t);
                        if end_units > t && s.d > 0 {
                            (end_units - t).div_ceil(s.d)
                        } else {
                            1
                        }
                    }
                    None => 1,
                };
                pieces.push(TimelinePiece { start: t, duration: s.d, repeat });
                t += s.d * repeat;
            }
        }
        let end_number = if pieces.is_empty() {
            match (st.duration, period_duration) {
                (Some(d), Some(total)) if d > 0 && !is_live => {
                    let units = crate::duration_to_scaled(total, timescale);
                    Some(start_number + units.div_ceil(d).saturating_sub(1))
                }
                // The live edge is computed from the wall clock by the live
                // controller.
                _ => None,
            }
        } else {
            None
        };
        index = SegmentIndex::Template(TemplateIndex {
            media,
            start_number,
            timescale,
            presentation_time_offset: st.presentationTimeOffset.unwrap_or(0),
            pieces,
            segment_duration: st.duration,
            first_available: None,
            end_number,
        });
    } else if let Some(sl) = &rep.SegmentList {
        timescale = sl.timescale.unwrap_or(1);
        if let Some(init) = &sl.initialization {
            header = Some(init_header_from(init, &base)?);
        }
        let duration = sl.duration.unwrap_or(0);
        let mut segments = Vec::new();
        for (i, su) in sl.segment_urls.iter().enumerate() {
            let seg_uri = match &su.media {
                Some(m) => base
                    .join(m)
                    .map_err(|e| StreamError::Parsing(format!("SegmentURL media: {e}")))?,
                None => base.clone(),
            };
            let range = su.mediaRange.as_deref().map(parse_range).transpose()?;
            segments.push(crate::Segment {
                sequence: i as i64,
                uri: seg_uri,
                range,
                pts: scaled_duration(duration * i as u64, timescale),
                duration: scaled_duration(duration, timescale),
                discont: false,
                key: None,
                date_time: None,
                title: None,
            });
        }
        index = SegmentIndex::List(segments);
    } else if let Some(sb) = &rep.SegmentBase {
        timescale = sb.timescale.unwrap_or(1);
        if let Some(init) = &sb.initialization {
            header = Some(init_header_from(init, &base)?);
        }
        if !on_demand_profile && sb.indexRange.is_none() {
            return Err(StreamError::Parsing(format!(
                "representation {id} has SegmentBase without indexRange"
            )));
        }
        index = SegmentIndex::Sidx(SidxIndex {
            uri: base.clone(),
            index_range: sb.indexRange.as_deref().map(parse_range).transpose()?,
            duration: period_duration,
        });
    } else {
        // A bare BaseURL with the on-demand profile is a single-file
        // representation indexed by its leading sidx.
        if !on_demand_profile {
            return Err(StreamError::Parsing(format!(
                "representation {id} carries no segment index"
            )));
        }
        index = SegmentIndex::Sidx(SidxIndex {
            uri: base.clone(),
            index_range: None,
            duration: period_duration,
        });
    }

    Ok(ModelRepresentation {
        id,
        name: None,
        bandwidth,
        codecs: rep.codecs.clone(),
        width: rep.width,
        height: rep.height,
        framerate: rep.frameRate.as_deref().and_then(parse_framerate),
        iframe_only: false,
        timescale,
        header,
        index,
        playlist_uri: None,
        target_duration: None,
        discontinuity_sequence: 0,
        allow_cache: true,
        endlist: !is_live,
        cached_manifest: None,
    })
}

fn init_header_from(init: &Initialization, base: &Url) -> Result<InitHeader, StreamError> {
    let uri = match &init.sourceURL {
        Some(s) => Some(
            base.join(s)
                .map_err(|e| StreamError::Parsing(format!("Initialization URI: {e}")))?,
        ),
        None => Some(base.clone()),
    };
    let range = init.range.as_deref().map(parse_range).transpose()?;
    Ok(InitHeader { uri, range })
}

// Parse a range specifier of the form "45-67" (first and last byte offsets,
// inclusive, as in an HTTP Range header).
pub(crate) fn parse_range(range: &str) -> Result<ByteRange, StreamError> {
    let v: Vec<&str> = range.split_terminator('-').collect();
    if v.len() != 2 {
        return Err(StreamError::Parsing(format!("invalid range specifier: {range}")));
    }
    let start: u64 = v[0]
        .parse()
        .map_err(|_| StreamError::Parsing(String::from("invalid start for range specifier")))?;
    let end: u64 = v[1]
        .parse()
        .map_err(|_| StreamError::Parsing(String::from("invalid end for range specifier")))?;
    if end < start {
        return Err(StreamError::Parsing(format!("inverted range specifier: {range}")));
    }
    Ok(ByteRange::new(start, end - start + 1))
}

// Frame rate is either an integer or a ratio such as "30000/1001".
fn parse_framerate(s: &str) -> Option<(u32, u32)> {
    if let Some((num, den)) = s.split_once('/') {
        let n = num.trim().parse().ok()?;
        let d = den.trim().parse().ok()?;
        Some((n, d))
    } else {
        s.trim().parse().ok().map(|n| (n, 1))
    }
}

fn utc_timing_source(t: &UTCTiming) -> Option<UtcTimingSource> {
    let scheme = t.schemeIdUri.as_deref()?;
    let method = match scheme {
        "urn:mpeg:dash:utc:ntp:2014" => UtcTimingMethod::Ntp,
        "urn:mpeg:dash:utc:http-head:2014" => UtcTimingMethod::HttpHead,
        "urn:mpeg:dash:utc:http-xsdate:2014" => UtcTimingMethod::HttpXsdate,
        "urn:mpeg:dash:utc:http-iso:2014" => UtcTimingMethod::HttpIso,
        "urn:mpeg:dash:utc:http-ntp:2014" => UtcTimingMethod::HttpNtp,
        other => {
            warn!("ignoring unsupported UTCTiming scheme {other}");
            return None;
        }
    };
    let urls = t
        .value
        .as_deref()
        .unwrap_or("")
        .split_ascii_whitespace()
        .map(String::from)
        .collect::<Vec<_>>();
    if urls.is_empty() {
        return None;
    }
    Some(UtcTimingSource { method, urls })
}

lazy_static! {
    static ref TEMPLATE_IDENT: Regex =
        Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap();
}

// From https://dashif.org/docs/DASH-IF-IOP-v4.3.pdf: "For the avoidance of
// doubt, only %0[width]d is permitted and no other identifiers. The reason is
// that such a string replacement can be easily implemented without requiring
// a specific library."
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
pub fn fill_template(
    template: &str,
    representation_id: &str,
    bandwidth: u64,
    number: u64,
    time: u64,
) -> String {
    let filled = TEMPLATE_IDENT.replace_all(template, |caps: &regex::Captures| {
        let value = match &caps[1] {
            "RepresentationID" => representation_id.to_string(),
            "Number" => number.to_string(),
            "Time" => time.to_string(),
            "Bandwidth" => bandwidth.to_string(),
            _ => unreachable!(),
        };
        match caps.get(2) {
            Some(w) => {
                let width: usize = w.as_str().parse().unwrap_or(0);
                format!("{value:0>width$}")
            }
            None => value,
        }
    });
    // "$$" is an escaped dollar sign.
    filled.replace("$$", "$")
}

/// For an unbounded live template, the highest segment number whose interval
/// has completely elapsed at server time `now`, or None while the first
/// segment is still being produced.
pub fn live_edge_number(
    template: &TemplateIndex,
    availability_start: DateTime<Utc>,
    period_start: Duration,
    now: DateTime<Utc>,
) -> Option<u64> {
    let seg_units = template.segment_duration?;
    if seg_units == 0 {
        return None;
    }
    let elapsed = (now - availability_start).to_std().ok()?.checked_sub(period_start)?;
    let elapsed_units = crate::duration_to_scaled(elapsed, template.timescale);
    let complete = elapsed_units / seg_units;
    if complete == 0 {
        return None;
    }
    Some(template.start_number + complete - 1)
}

/// The first segment number still inside the time-shift buffer at server time
/// `now`.
pub fn live_window_start_number(
    template: &TemplateIndex,
    availability_start: DateTime<Utc>,
    period_start: Duration,
    time_shift_buffer_depth: Option<Duration>,
    now: DateTime<Utc>,
) -> u64 {
    let Some(depth) = time_shift_buffer_depth else {
        return template.start_number;
    };
    let Some(seg_units) = template.segment_duration.filter(|d| *d > 0) else {
        return template.start_number;
    };
    let Some(elapsed) = (now - availability_start)
        .to_std()
        .ok()
        .and_then(|e| e.checked_sub(period_start))
    else {
        return template.start_number;
    };
    let window_start = elapsed.saturating_sub(depth);
    let units = crate::duration_to_scaled(window_start, template.timescale);
    template.start_number + units / seg_units
}

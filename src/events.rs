//! Typed values emitted from a playback session to the host application.

use std::fmt;
use std::time::Duration;
use bytes::Bytes;
use url::Url;

use crate::{MediaKind, StreamError};

/// Media capabilities established by typefinding a track's first fragment,
/// enriched with what the manifest declared about the representation.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCaps {
    /// Container type, e.g. `video/mp2t`, `video/quicktime`, `audio/aac`.
    pub media_type: String,
    /// RFC 6381 codec string when known.
    pub codecs: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<(u32, u32)>,
}

impl MediaCaps {
    pub fn new(media_type: &str) -> MediaCaps {
        MediaCaps {
            media_type: media_type.to_string(),
            codecs: None,
            width: None,
            height: None,
            framerate: None,
        }
    }
}

impl fmt::Display for MediaCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type)?;
        if let Some(codecs) = &self.codecs {
            write!(f, ", codecs={codecs}")?;
        }
        if let (Some(w), Some(h)) = (self.width, self.height) {
            write!(f, ", {w}x{h}")?;
        }
        Ok(())
    }
}

/// One piece of media data, decrypted and ready for the host's decoder.
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub data: Bytes,
    /// Presentation timestamp of the fragment this buffer belongs to.
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
    /// Byte offset of this buffer within its fragment (or file, for
    /// single-file representations).
    pub offset: u64,
    pub offset_end: u64,
    /// Set on the first buffer after a seek, a representation switch, a
    /// period change or an `EXT-X-DISCONTINUITY`.
    pub discont: bool,
}

/// Stream-level tags for a track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagList {
    /// RFC 5646 language code.
    pub language: Option<String>,
    pub title: Option<String>,
}

/// Application message sent when the adapter moves to a different
/// representation, so host code can surface the change.
#[derive(Debug, Clone)]
pub struct BitrateSwitch {
    pub manifest_uri: Url,
    /// URI of the new representation's playlist or media.
    pub uri: String,
    pub bitrate: u64,
}

/// A fatal session error as surfaced to the host.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Coarse grouping: `"stream"` for malformed or undecryptable media,
    /// `"resource"` for download problems.
    pub domain: &'static str,
    pub code: &'static str,
    pub description: String,
    pub debug_info: Option<String>,
}

impl ErrorEvent {
    pub fn from_error(e: &StreamError) -> ErrorEvent {
        let (domain, code) = match e {
            StreamError::InvalidEncoding(_) => ("stream", "invalid-encoding"),
            StreamError::NotAPlaylist(_) => ("stream", "not-a-playlist"),
            StreamError::NotAVariant(_) => ("stream", "not-a-variant"),
            StreamError::EmptyMediaPlaylist => ("stream", "empty-playlist"),
            StreamError::Inconsistent(_) => ("stream", "inconsistent-playlist"),
            StreamError::UnsupportedEncryption(_) => ("stream", "unsupported-encryption"),
            StreamError::KeyFetchFailed(_) => ("resource", "key-fetch-failed"),
            StreamError::InvalidKey(_) => ("stream", "invalid-key"),
            StreamError::StreamDecrypt(_) => ("stream", "decrypt"),
            StreamError::TypefindFailed => ("stream", "typefind-failed"),
            StreamError::ResourceNotFound(_) => ("resource", "not-found"),
            StreamError::Network(_) => ("resource", "network"),
            StreamError::NotNegotiated(_) => ("stream", "not-negotiated"),
            StreamError::InternalBug(_) => ("core", "internal"),
            _ => ("core", "failed"),
        };
        ErrorEvent {
            domain,
            code,
            description: e.to_string(),
            debug_info: None,
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> ErrorEvent {
        self.debug_info = Some(debug.into());
        self
    }
}

/// Everything a track can tell the host.
#[derive(Debug, Clone)]
pub enum TrackEvent {
    /// Media caps for the track, sent before the first buffer and again
    /// after a representation switch changes them.
    Caps(MediaCaps),
    Buffer(MediaBuffer),
    /// Content protection descriptor (DRM system UUID + initialization
    /// payload).
    Protection { scheme_id: String, data: Bytes },
    Tags(TagList),
    BitrateSwitched(BitrateSwitch),
    EndOfStream,
    Error(ErrorEvent),
}

/// An event paired with the emitting track's stream id.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub stream_id: String,
    pub event: TrackEvent,
}

/// Build the stream id for a track: `"<kind>-<index>"`.
pub fn stream_id(kind: MediaKind, index: usize) -> String {
    format!("{}-{index}", kind.as_str())
}

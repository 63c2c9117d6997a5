// Tests for rendering media playlists and the parse/render round trip.

pub mod common;

use std::time::Duration;
use pretty_assertions::assert_eq;
use adaptive_stream::{hls, SegmentIndex};
use common::{setup_logging, url};

#[test]
fn render_canonical_media_playlist() {
    setup_logging();
    let base = url("http://h/out.m3u8");
    let media = hls::parse_media_playlist(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:7\n\
         #EXTINF:9.500,\nhttp://h/a.ts\n#EXTINF:10.000,\nhttp://h/b.ts\n#EXT-X-ENDLIST\n",
        &base,
    )
    .unwrap();
    let repr = repr_with(media.segments);
    let rendered = hls::render_media_playlist(&repr, true);
    // ceil((10s + 500ms) / 1s) = 11
    assert!(rendered.contains("#EXT-X-TARGETDURATION:11\n"), "{rendered}");
    assert!(rendered.contains("#EXT-X-MEDIA-SEQUENCE:7\n"));
    assert!(rendered.ends_with("#EXT-X-ENDLIST\n"));
}

#[test]
fn target_duration_rounds_up_from_max_segment() {
    // 9.4s max duration: 9.4 + 0.5 = 9.9 -> ceil = 10.
    let base = url("http://h/out.m3u8");
    let media = hls::parse_media_playlist(
        "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\
         #EXTINF:9.400,\nhttp://h/a.ts\n#EXTINF:4.0,\nhttp://h/b.ts\n#EXT-X-ENDLIST\n",
        &base,
    )
    .unwrap();
    let repr = repr_with(media.segments);
    let rendered = hls::render_media_playlist(&repr, true);
    assert!(rendered.contains("#EXT-X-TARGETDURATION:10\n"), "{rendered}");
}

#[test]
fn round_trip_preserves_segments() {
    let base = url("http://h/rt.m3u8");
    let original = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-MEDIA-SEQUENCE:42\n\
                    #EXT-X-TARGETDURATION:11\n\
                    #EXT-X-KEY:METHOD=AES-128,URI=\"http://h/key.bin\",IV=0x00000000000000000000000000000007\n\
                    #EXTINF:10.000,news\n\
                    http://h/a.ts\n\
                    #EXT-X-DISCONTINUITY\n\
                    #EXT-X-KEY:METHOD=NONE\n\
                    #EXTINF:9.500,\n\
                    http://h/b.ts\n\
                    #EXT-X-ENDLIST\n";
    let first = hls::parse_media_playlist(original, &base).unwrap();
    let rendered = hls::render_media_playlist(&repr_with(first.segments.clone()), true);
    let second = hls::parse_media_playlist(&rendered, &base).unwrap();

    assert_eq!(first.segments.len(), second.segments.len());
    for (a, b) in first.segments.iter().zip(second.segments.iter()) {
        assert_eq!(a.sequence, b.sequence);
        assert_eq!(a.uri, b.uri);
        assert_eq!(a.duration, b.duration);
        assert_eq!(a.discont, b.discont);
        assert_eq!(a.key, b.key);
        assert_eq!(a.title, b.title);
    }
    assert_eq!(second.media_sequence, Some(42));
    assert!(second.endlist);
}

#[test]
fn byterange_rendering_survives_round_trip() {
    let base = url("http://h/rt.m3u8");
    let original = "#EXTM3U\n#EXT-X-VERSION:4\n#EXT-X-TARGETDURATION:7\n\
                    #EXTINF:6.0,\n#EXT-X-BYTERANGE:1000@0\nhttp://h/all.ts\n\
                    #EXTINF:6.0,\n#EXT-X-BYTERANGE:800\nhttp://h/all.ts\n\
                    #EXT-X-ENDLIST\n";
    let first = hls::parse_media_playlist(original, &base).unwrap();
    let rendered = hls::render_media_playlist(&repr_with(first.segments.clone()), true);
    assert!(rendered.contains("#EXT-X-VERSION:4\n"), "{rendered}");
    let second = hls::parse_media_playlist(&rendered, &base).unwrap();
    assert_eq!(first.segments[0].range, second.segments[0].range);
    assert_eq!(first.segments[1].range, second.segments[1].range);
}

fn repr_with(segments: Vec<adaptive_stream::Segment>) -> adaptive_stream::Representation {
    adaptive_stream::Representation {
        id: String::from("render-test"),
        name: None,
        bandwidth: 0,
        codecs: None,
        width: None,
        height: None,
        framerate: None,
        iframe_only: false,
        timescale: 1_000_000_000,
        header: None,
        index: SegmentIndex::List(segments),
        playlist_uri: None,
        target_duration: Some(Duration::from_secs(10)),
        discontinuity_sequence: 0,
        allow_cache: true,
        endlist: true,
        cached_manifest: None,
    }
}

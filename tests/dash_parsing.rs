// Tests for DASH MPD parsing and conversion into the playlist model.

pub mod common;

use std::time::Duration;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use adaptive_stream::{
    dash, parse, ByteRange, ManifestFlavor, MediaKind, SegmentIndex, StreamError,
    UtcTimingMethod,
};
use common::{setup_logging, url};

#[test]
fn rejects_non_xml() {
    let base = url("http://d/man.mpd");
    let res = parse(b"#EXTM3U\n", ManifestFlavor::Dash, &base, &base);
    assert!(matches!(res, Err(StreamError::NotAPlaylist(_))));
}

#[test]
fn static_mpd_with_segment_template_and_timeline() {
    setup_logging();
    let mpd = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="static" mediaPresentationDuration="PT12S" maxSegmentDuration="PT4S">
  <Period>
    <AdaptationSet contentType="video" lang="en">
      <SegmentTemplate initialization="$RepresentationID$/init.mp4"
                       media="$RepresentationID$/seg-$Number$.m4s"
                       timescale="1000" startNumber="1">
        <SegmentTimeline>
          <S t="0" d="4000" r="2"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v0" bandwidth="800000" codecs="avc1.64001f"
                      width="640" height="360" frameRate="30000/1001"/>
      <Representation id="v1" bandwidth="2400000" width="1280" height="720"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://d/man.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    assert!(!playlist.is_live);
    assert_eq!(playlist.max_segment_duration, Some(Duration::from_secs(4)));
    let set = &playlist.periods[0].adaptations[0];
    assert_eq!(set.kind, MediaKind::Video);
    assert_eq!(set.language.as_deref(), Some("en"));
    let v0 = &set.representations[0];
    assert_eq!(v0.id, "v0");
    assert_eq!(v0.framerate, Some((30000, 1001)));
    assert_eq!(
        v0.header.as_ref().unwrap().uri.as_ref().unwrap().as_str(),
        "http://d/v0/init.mp4"
    );
    // r="2" means three 4-second segments.
    assert_eq!(v0.first_sequence(), Some(1));
    assert_eq!(v0.last_sequence(), Some(3));
    let seg2 = v0.segment_by_sequence(&playlist.base_uri, 2).unwrap();
    assert_eq!(seg2.uri.as_str(), "http://d/v0/seg-2.m4s");
    assert_eq!(seg2.pts, Duration::from_secs(4));
    assert_eq!(seg2.duration, Duration::from_secs(4));
    assert_eq!(v0.total_duration(), Some(Duration::from_secs(12)));
}

#[test]
fn template_with_duration_derives_count_from_period() {
    let mpd = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT10S">
  <Period>
    <AdaptationSet contentType="video">
      <SegmentTemplate media="seg-$Number%04d$.m4s" timescale="1" duration="4" startNumber="1"/>
      <Representation id="v0" bandwidth="500000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://d/man.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    let v0 = &playlist.periods[0].adaptations[0].representations[0];
    // 10s at 4s per segment: 3 segments (the last one short).
    assert_eq!(v0.last_sequence(), Some(3));
    let seg = v0.segment_by_sequence(&playlist.base_uri, 3).unwrap();
    assert_eq!(seg.uri.as_str(), "http://d/seg-0003.m4s");
    assert_eq!(seg.pts, Duration::from_secs(8));
}

#[test]
fn segment_list_with_ranges() {
    let mpd = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet contentType="audio" lang="fr">
      <Representation id="a0" bandwidth="96000">
        <BaseURL>audio.mp4</BaseURL>
        <SegmentList duration="2" timescale="1">
          <Initialization sourceURL="audio.mp4" range="0-999"/>
          <SegmentURL mediaRange="1000-4999"/>
          <SegmentURL mediaRange="5000-8999"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://d/man.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    let set = &playlist.periods[0].adaptations[0];
    assert_eq!(set.kind, MediaKind::Audio);
    let a0 = &set.representations[0];
    assert_eq!(
        a0.header.as_ref().unwrap().range,
        Some(ByteRange::new(0, 1000))
    );
    let SegmentIndex::List(segs) = &a0.index else { panic!("expected list") };
    assert_eq!(segs.len(), 2);
    assert_eq!(segs[0].range, Some(ByteRange::new(1000, 4000)));
    assert_eq!(segs[1].pts, Duration::from_secs(2));
}

#[test]
fn on_demand_profile_enables_sidx_indexing() {
    let mpd = r#"<?xml version="1.0"?>
<MPD type="static" profiles="urn:mpeg:dash:profile:isoff-on-demand:2011"
     mediaPresentationDuration="PT30S">
  <Period>
    <AdaptationSet contentType="video">
      <Representation id="v0" bandwidth="1000000">
        <BaseURL>video.mp4</BaseURL>
        <SegmentBase indexRange="32-1023">
          <Initialization range="0-31"/>
        </SegmentBase>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://d/man.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    let v0 = &playlist.periods[0].adaptations[0].representations[0];
    assert!(v0.uses_sidx());
    let SegmentIndex::Sidx(sidx) = &v0.index else { panic!("expected sidx index") };
    assert_eq!(sidx.uri.as_str(), "http://d/video.mp4");
    assert_eq!(sidx.index_range, Some(ByteRange::new(32, 992)));
    assert_eq!(sidx.duration, Some(Duration::from_secs(30)));
}

#[test]
fn dynamic_mpd_with_utc_timing() {
    let mpd = r#"<?xml version="1.0"?>
<MPD type="dynamic" availabilityStartTime="2024-05-01T00:00:00Z"
     minimumUpdatePeriod="PT4S" timeShiftBufferDepth="PT60S"
     suggestedPresentationDelay="PT12S">
  <UTCTiming schemeIdUri="urn:mpeg:dash:utc:http-xsdate:2014" value="https://time.example/now"/>
  <UTCTiming schemeIdUri="urn:mpeg:dash:utc:ntp:2014" value="ntp1.example ntp2.example"/>
  <Period start="PT0S">
    <AdaptationSet contentType="video">
      <SegmentTemplate media="$RepresentationID$_$Number$.m4s" timescale="1" duration="4" startNumber="1"/>
      <Representation id="v0" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://d/live.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    assert!(playlist.is_live);
    assert_eq!(playlist.minimum_update_period, Some(Duration::from_secs(4)));
    assert_eq!(playlist.time_shift_buffer_depth, Some(Duration::from_secs(60)));
    assert_eq!(
        playlist.suggested_presentation_delay,
        Some(Duration::from_secs(12))
    );
    assert_eq!(playlist.utc_timing.len(), 2);
    assert_eq!(playlist.utc_timing[0].method, UtcTimingMethod::HttpXsdate);
    assert_eq!(playlist.utc_timing[1].method, UtcTimingMethod::Ntp);
    assert_eq!(playlist.utc_timing[1].urls.len(), 2);
    // Live template without timeline: the edge comes from the wall clock.
    let v0 = &playlist.periods[0].adaptations[0].representations[0];
    assert_eq!(v0.last_sequence(), None);
}

#[test]
fn live_edge_number_from_wall_clock() {
    let template = adaptive_stream::TemplateIndex {
        media: String::from("$RepresentationID$_$Number$.m4s"),
        start_number: 1,
        timescale: 1,
        presentation_time_offset: 0,
        pieces: Vec::new(),
        segment_duration: Some(4),
        first_available: None,
        end_number: None,
    };
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    // 10 seconds in: segments 1 and 2 are complete, 3 still being written.
    let now = start + chrono::Duration::seconds(10);
    assert_eq!(
        dash::live_edge_number(&template, start, Duration::ZERO, now),
        Some(2)
    );
    // Before the first segment completes there is nothing to fetch.
    let now = start + chrono::Duration::seconds(3);
    assert_eq!(dash::live_edge_number(&template, start, Duration::ZERO, now), None);
    // A 60s time-shift buffer 100s in starts the window at segment 11.
    let now = start + chrono::Duration::seconds(100);
    assert_eq!(
        dash::live_window_start_number(
            &template,
            start,
            Duration::ZERO,
            Some(Duration::from_secs(60)),
            now
        ),
        11
    );
}

#[test]
fn content_protection_descriptors_are_surfaced() {
    let mpd = r#"<?xml version="1.0"?>
<MPD xmlns:cenc="urn:mpeg:cenc:2013" type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet contentType="video">
      <ContentProtection schemeIdUri="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed">
        <cenc:pssh>AAAAGXBzc2g=</cenc:pssh>
      </ContentProtection>
      <SegmentTemplate media="seg-$Number$.m4s" timescale="1" duration="4" startNumber="1"/>
      <Representation id="v0" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://d/drm.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    let protection = &playlist.periods[0].adaptations[0].content_protection;
    assert_eq!(protection.len(), 1);
    assert_eq!(
        protection[0].scheme_id,
        "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed"
    );
    assert!(!protection[0].data.is_empty());
}

#[test]
fn multi_period_start_times_accumulate() {
    let mpd = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT20S">
  <Period duration="PT8S">
    <AdaptationSet contentType="video">
      <SegmentTemplate media="p1-$Number$.m4s" timescale="1" duration="4" startNumber="1"/>
      <Representation id="p1v" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
  <Period>
    <AdaptationSet contentType="video">
      <SegmentTemplate media="p2-$Number$.m4s" timescale="1" duration="4" startNumber="1"/>
      <Representation id="p2v" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://d/multi.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    assert_eq!(playlist.periods.len(), 2);
    assert_eq!(playlist.periods[0].duration, Some(Duration::from_secs(8)));
    assert_eq!(playlist.periods[1].start, Duration::from_secs(8));
    // The last period inherits the remaining presentation time.
    assert_eq!(playlist.periods[1].duration, Some(Duration::from_secs(12)));
    assert_eq!(playlist.duration(), Some(Duration::from_secs(20)));
}

#[test]
fn base_url_resolution_chains() {
    let mpd = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT4S">
  <BaseURL>http://cdn.example/content/</BaseURL>
  <Period>
    <AdaptationSet contentType="video">
      <SegmentTemplate media="seg-$Number$.m4s" timescale="1" duration="4" startNumber="1"/>
      <Representation id="v0" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let base = url("http://origin.example/man.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &base, &base).unwrap();
    assert_eq!(playlist.base_uri.as_str(), "http://cdn.example/content/");
    let v0 = &playlist.periods[0].adaptations[0].representations[0];
    let seg = v0.segment_by_sequence(&playlist.base_uri, 1).unwrap();
    assert_eq!(seg.uri.as_str(), "http://cdn.example/content/seg-1.m4s");
}

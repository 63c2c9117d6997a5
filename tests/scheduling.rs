// End-to-end scheduler tests against the in-memory downloader: VOD HLS with
// AES-128 segments, and DASH on-demand with sidx sub-fragment stepping.

pub mod common;

use std::sync::Arc;
use std::time::Duration;
use pretty_assertions::assert_eq;
use adaptive_stream::config::SessionConfig;
use adaptive_stream::events::TrackEvent;
use adaptive_stream::fragment::Aes128CbcCipher;
use adaptive_stream::scheduler::Session;
use adaptive_stream::{parse, ManifestFlavor, SeekFlags, SegmentKey};
use common::{
    encrypt_segment, make_fragment, make_sidx, make_ts_packet, pat_packet, pcr_packet,
    pmt_packet, setup_logging, ts_stream, url, FakeDownloader, FakeTypeFind, SampleSpec,
    SYNC_SAMPLE_FLAGS,
};

fn ts_like_segment(len: usize, seed: u8) -> Vec<u8> {
    // Payload beginning with a TS sync byte so the fake typefinder reports
    // video/mp2t; the rest is arbitrary.
    let mut data = vec![0x47u8];
    data.extend((1..len).map(|i| (i as u8).wrapping_mul(seed)));
    data
}

async fn collect_events(
    handle: &mut adaptive_stream::scheduler::SessionHandle,
) -> Vec<TrackEvent> {
    let mut events = Vec::new();
    loop {
        let Some(event) = handle.events.recv().await else { break };
        let done = matches!(event.event, TrackEvent::EndOfStream | TrackEvent::Error(_));
        events.push(event.event);
        if done {
            break;
        }
    }
    events
}

fn buffers_concatenated(events: &[TrackEvent]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in events {
        if let TrackEvent::Buffer(b) = e {
            out.extend_from_slice(&b.data);
        }
    }
    out
}

// Scenario: a VOD master with two variants; the low variant has three
// 10-second AES-128 segments sharing one key URL with sequence-derived IVs.
// The key must be fetched once, the segments in order, and the emitted
// plaintext must match the original media.
#[tokio::test]
async fn vod_hls_aes128_plays_through() {
    setup_logging();
    let downloader = Arc::new(FakeDownloader::new());
    downloader.insert(
        "http://h/master.m3u8",
        "#EXTM3U\n\
         #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
         low.m3u8\n\
         #EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1280x720\n\
         high.m3u8\n",
    );
    downloader.insert(
        "http://h/low.m3u8",
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
         #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
         #EXTINF:10.0,\nseg0.ts\n#EXTINF:10.0,\nseg1.ts\n#EXTINF:10.0,\nseg2.ts\n\
         #EXT-X-ENDLIST\n",
    );
    let key = *b"0123456789abcdef";
    downloader.insert("http://h/key.bin", key.to_vec());

    let mut plaintexts = Vec::new();
    for seq in 0..3i64 {
        let plaintext = ts_like_segment(4000 + seq as usize * 13, seq as u8 + 3);
        let segment_key = SegmentKey { uri: url("http://h/key.bin"), iv: None };
        let iv = segment_key.effective_iv(seq);
        let ciphertext = encrypt_segment(&key, &iv, &plaintext);
        downloader.insert(&format!("http://h/seg{seq}.ts"), ciphertext);
        plaintexts.push(plaintext);
    }

    let master_uri = url("http://h/master.m3u8");
    let (_, master_body) = adaptive_stream::fetch::fetch_bytes(
        downloader.as_ref(),
        adaptive_stream::fetch::DownloadRequest::new(master_uri.clone()),
    )
    .await
    .unwrap();
    let playlist =
        parse(&master_body, ManifestFlavor::Hls, &master_uri, &master_uri).unwrap();

    // Cap the adapter at the low variant's ladder rung so the in-memory
    // download speed does not trigger an upward switch mid-test.
    let config = SessionConfig { max_bitrate: 1_000_000, ..SessionConfig::default() };
    let session = Session::new(
        playlist,
        downloader.clone(),
        Arc::new(Aes128CbcCipher),
        Arc::new(FakeTypeFind),
        config,
    )
    .unwrap();
    let mut handle = session.start().unwrap();
    let events = collect_events(&mut handle).await;

    assert!(matches!(events.last(), Some(TrackEvent::EndOfStream)));
    let caps = events.iter().find_map(|e| match e {
        TrackEvent::Caps(c) => Some(c.clone()),
        _ => None,
    });
    assert_eq!(caps.unwrap().media_type, "video/mp2t");

    let expected: Vec<u8> = plaintexts.concat();
    assert_eq!(buffers_concatenated(&events), expected);

    // The key was fetched exactly once for the three segments.
    assert_eq!(downloader.requests_for("http://h/key.bin").len(), 1);
    let segment_requests: Vec<String> = downloader
        .requests()
        .into_iter()
        .map(|r| r.uri)
        .filter(|u| u.contains("/seg"))
        .collect();
    assert_eq!(
        segment_requests,
        vec![
            String::from("http://h/seg0.ts"),
            String::from("http://h/seg1.ts"),
            String::from("http://h/seg2.ts"),
        ]
    );
    // Only the lowest variant's child playlist was loaded.
    assert!(downloader.requests_for("http://h/high.m3u8").is_empty());
}

// A seek to 15s lands inside segment 1 (10s..20s) and playback re-enters
// there with the segment's own presentation time.
#[tokio::test]
async fn vod_hls_seek_reenters_mid_playlist() {
    setup_logging();
    let downloader = Arc::new(FakeDownloader::new());
    downloader.insert(
        "http://h/media.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n\
         #EXTINF:10.0,\nseg0.ts\n#EXTINF:10.0,\nseg1.ts\n#EXTINF:10.0,\nseg2.ts\n\
         #EXT-X-ENDLIST\n",
    );
    for seq in 0..3 {
        downloader.insert(
            &format!("http://h/seg{seq}.ts"),
            ts_like_segment(3000, seq as u8 + 1),
        );
    }
    let uri = url("http://h/media.m3u8");
    let (_, body) = adaptive_stream::fetch::fetch_bytes(
        downloader.as_ref(),
        adaptive_stream::fetch::DownloadRequest::new(uri.clone()),
    )
    .await
    .unwrap();
    let playlist = parse(&body, ManifestFlavor::Hls, &uri, &uri).unwrap();
    // A one-buffer queue keeps the track from running ahead of the test, so
    // the seek always lands before playback completes.
    let config = SessionConfig { max_queue_size_buffers: 1, ..SessionConfig::default() };
    let session = Session::new(
        playlist,
        downloader.clone(),
        Arc::new(Aes128CbcCipher),
        Arc::new(FakeTypeFind),
        config,
    )
    .unwrap();
    let mut handle = session.start().unwrap();
    handle
        .seek(
            Duration::from_secs(15),
            adaptive_stream::Direction::Forward,
            SeekFlags::default(),
            1.0,
        )
        .await;
    let events = collect_events(&mut handle).await;
    assert!(matches!(events.last(), Some(TrackEvent::EndOfStream)));

    // Depending on command arrival the first fragment may or may not have
    // started, but seg1 must be served and the buffer that starts it must
    // carry pts = 10s with a discontinuity.
    let first_seg1 = events
        .iter()
        .find_map(|e| match e {
            TrackEvent::Buffer(b) if b.pts == Some(Duration::from_secs(10)) => Some(b.clone()),
            _ => None,
        })
        .expect("a buffer anchored at 10s");
    assert!(first_seg1.discont);
    let requested: Vec<String> = downloader
        .requests()
        .into_iter()
        .map(|r| r.uri)
        .filter(|u| u.contains("/seg"))
        .collect();
    assert!(requested.contains(&String::from("http://h/seg1.ts")));
    assert!(requested.contains(&String::from("http://h/seg2.ts")));
}

// Scenario: DASH on-demand single-file representation. The first fetch reads
// the declared index range and parses a sidx; every subsequent request uses
// the exact byte range of one sub-fragment, and the sidx is never
// re-downloaded.
#[tokio::test]
async fn dash_on_demand_sidx_subfragments() {
    setup_logging();
    let downloader = Arc::new(FakeDownloader::new());

    // Three fragments back to back, indexed by a leading sidx.
    let samples = |n: u8| {
        [
            SampleSpec { duration: 1000, size: 600 + n as u32, flags: SYNC_SAMPLE_FLAGS },
            SampleSpec { duration: 1000, size: 400, flags: SYNC_SAMPLE_FLAGS },
        ]
    };
    let frags: Vec<Vec<u8>> = (0..3).map(|n| make_fragment(1, 0, &samples(n))).collect();
    let sizes: Vec<(u32, u32)> = frags.iter().map(|f| (f.len() as u32, 2000)).collect();
    let sidx = make_sidx(1000, &sizes);
    let mut file = sidx.clone();
    for f in &frags {
        file.extend_from_slice(f);
    }
    downloader.insert("http://d/video.mp4", file.clone());
    let mpd = format!(
        r#"<?xml version="1.0"?>
<MPD type="static" profiles="urn:mpeg:dash:profile:isoff-on-demand:2011"
     mediaPresentationDuration="PT6S">
  <Period>
    <AdaptationSet contentType="video">
      <Representation id="v0" bandwidth="1000000">
        <BaseURL>video.mp4</BaseURL>
        <SegmentBase indexRange="0-{}"/>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#,
        sidx.len() - 1
    );
    let uri = url("http://d/man.mpd");
    let playlist = parse(mpd.as_bytes(), ManifestFlavor::Dash, &uri, &uri).unwrap();
    let session = Session::new(
        playlist,
        downloader.clone(),
        Arc::new(Aes128CbcCipher),
        Arc::new(FakeTypeFind),
        SessionConfig::default(),
    )
    .unwrap();
    let mut handle = session.start().unwrap();
    let events = collect_events(&mut handle).await;
    assert!(matches!(events.last(), Some(TrackEvent::EndOfStream)));

    // The full sub-fragment bytes (moof and mdat) surface, in order.
    assert_eq!(buffers_concatenated(&events), frags.concat());

    let requests = downloader.requests_for("http://d/video.mp4");
    // First the sidx index range, then one exact range per sub-fragment.
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].range, Some((0, Some(sidx.len() as u64 - 1))));
    let mut offset = sidx.len() as u64;
    for (i, frag) in frags.iter().enumerate() {
        let end = offset + frag.len() as u64 - 1;
        assert_eq!(
            requests[i + 1].range,
            Some((offset, Some(end))),
            "sub-fragment {i} must be fetched with its exact range"
        );
        offset = end + 1;
    }
}

// A genuine transport-stream fragment, delivered by the chunking downloader:
// the PAT → PMT → PCR walk must run over the reassembled packets and anchor
// the first emitted buffer on the PCR, not on the playlist fallback time.
#[tokio::test]
async fn ts_fragment_pcr_anchors_first_buffer() {
    setup_logging();
    let downloader = Arc::new(FakeDownloader::new());
    downloader.insert(
        "http://h/media.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n\
         #EXTINF:2.0,\nseg0.ts\n#EXT-X-ENDLIST\n",
    );
    let one_second = 27_000_000u64;
    let mut packets = vec![
        pat_packet(0x30),
        pmt_packet(0x30, 0x31),
        pcr_packet(0x31, 10 * one_second),
    ];
    for _ in 0..20 {
        packets.push(make_ts_packet(0x100, true, None));
    }
    packets.push(pcr_packet(0x31, 12 * one_second));
    let segment = ts_stream(&packets);
    downloader.insert("http://h/seg0.ts", segment.clone());

    let uri = url("http://h/media.m3u8");
    let (_, body) = adaptive_stream::fetch::fetch_bytes(
        downloader.as_ref(),
        adaptive_stream::fetch::DownloadRequest::new(uri.clone()),
    )
    .await
    .unwrap();
    let playlist = parse(&body, ManifestFlavor::Hls, &uri, &uri).unwrap();
    let session = Session::new(
        playlist,
        downloader.clone(),
        Arc::new(Aes128CbcCipher),
        Arc::new(FakeTypeFind),
        SessionConfig::default(),
    )
    .unwrap();
    let mut handle = session.start().unwrap();
    let events = collect_events(&mut handle).await;
    assert!(matches!(events.last(), Some(TrackEvent::EndOfStream)));

    // Every byte passes through unmodified.
    assert_eq!(buffers_concatenated(&events), segment);
    // The fragment's first buffer carries the PCR-derived timestamp; the
    // playlist would have said 0s.
    let first = events
        .iter()
        .find_map(|e| match e {
            TrackEvent::Buffer(b) if b.pts.is_some() => Some(b.clone()),
            _ => None,
        })
        .expect("a timestamped buffer");
    assert_eq!(first.pts, Some(Duration::from_secs(10)));
}

#[tokio::test]
async fn missing_segments_raise_resource_not_found() {
    setup_logging();
    let downloader = Arc::new(FakeDownloader::new());
    downloader.insert(
        "http://h/media.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n\
         #EXTINF:1.0,\nmissing.ts\n#EXT-X-ENDLIST\n",
    );
    let uri = url("http://h/media.m3u8");
    let (_, body) = adaptive_stream::fetch::fetch_bytes(
        downloader.as_ref(),
        adaptive_stream::fetch::DownloadRequest::new(uri.clone()),
    )
    .await
    .unwrap();
    let playlist = parse(&body, ManifestFlavor::Hls, &uri, &uri).unwrap();
    let session = Session::new(
        playlist,
        downloader.clone(),
        Arc::new(Aes128CbcCipher),
        Arc::new(FakeTypeFind),
        SessionConfig::default(),
    )
    .unwrap();
    tokio::time::pause();
    let mut handle = session.start().unwrap();
    let events = collect_events(&mut handle).await;
    let error = events
        .iter()
        .find_map(|e| match e {
            TrackEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .expect("a fatal error event");
    assert_eq!(error.domain, "resource");
    assert_eq!(error.code, "not-found");
    // Three attempts before giving up.
    assert_eq!(downloader.requests_for("http://h/missing.ts").len(), 3);
}

#[tokio::test]
async fn language_tag_is_announced() {
    setup_logging();
    let downloader = Arc::new(FakeDownloader::new());
    downloader.insert(
        "http://h/master.m3u8",
        "#EXTM3U\n\
         #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"Deutsch\",LANGUAGE=\"de\",URI=\"audio.m3u8\"\n\
         #EXT-X-STREAM-INF:BANDWIDTH=800000,AUDIO=\"aud\"\n\
         video.m3u8\n",
    );
    downloader.insert(
        "http://h/video.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nv0.ts\n#EXT-X-ENDLIST\n",
    );
    downloader.insert(
        "http://h/audio.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\na0.ts\n#EXT-X-ENDLIST\n",
    );
    downloader.insert("http://h/v0.ts", ts_like_segment(2500, 1));
    downloader.insert("http://h/a0.ts", ts_like_segment(2500, 2));

    let uri = url("http://h/master.m3u8");
    let (_, body) = adaptive_stream::fetch::fetch_bytes(
        downloader.as_ref(),
        adaptive_stream::fetch::DownloadRequest::new(uri.clone()),
    )
    .await
    .unwrap();
    let playlist = parse(&body, ManifestFlavor::Hls, &uri, &uri).unwrap();
    let session = Session::new(
        playlist,
        downloader.clone(),
        Arc::new(Aes128CbcCipher),
        Arc::new(FakeTypeFind),
        SessionConfig::default(),
    )
    .unwrap();
    let mut handle = session.start().unwrap();

    // Two tracks run; drain until both have ended.
    let mut ended = 0;
    let mut tags = Vec::new();
    while ended < 2 {
        let Some(event) = handle.events.recv().await else { break };
        match &event.event {
            TrackEvent::EndOfStream => ended += 1,
            TrackEvent::Tags(t) => tags.push((event.stream_id.clone(), t.clone())),
            TrackEvent::Error(e) => panic!("unexpected error: {e:?}"),
            _ => {}
        }
    }
    assert_eq!(ended, 2);
    let audio_tag = tags
        .iter()
        .find(|(id, _)| id.starts_with("audio"))
        .expect("audio track tags");
    assert_eq!(audio_tag.1.language.as_deref(), Some("de"));
}

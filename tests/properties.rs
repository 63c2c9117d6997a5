// Property tests for the invariants the playlist and crypto layers promise.

pub mod common;

use std::sync::Arc;
use proptest::prelude::*;
use adaptive_stream::fragment::{Aes128CbcCipher, FragmentPipeline, SegmentCipher};
use adaptive_stream::isobmff::parse_sidx;
use adaptive_stream::{hls, SegmentIndex};
use common::{encrypt_segment, make_sidx, url};

proptest! {
    // Any successful media-playlist update leaves sequence numbers strictly
    // increasing, whatever window slide the server chose.
    #[test]
    fn updated_playlists_stay_monotonic(
        first in 0i64..1000,
        count in 1usize..20,
        advance in 0usize..25,
        new_count in 1usize..20,
    ) {
        let base = url("http://h/live.m3u8");
        let mut text = format!("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{first}\n");
        for i in 0..count {
            text.push_str(&format!("#EXTINF:4.0,\nseg{}.ts\n", first as usize + i));
        }
        let mut playlist = adaptive_stream::parse(
            text.as_bytes(),
            adaptive_stream::ManifestFlavor::Hls,
            &base,
            &base,
        ).unwrap();
        let id = playlist.periods[0].adaptations[0].representations[0].id.clone();

        let new_first = first as usize + advance;
        let mut refreshed = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{new_first}\n"
        );
        for i in 0..new_count {
            refreshed.push_str(&format!("#EXTINF:4.0,\nseg{}.ts\n", new_first + i));
        }
        if hls::update_media_playlist(&mut playlist, &id, &refreshed).is_ok() {
            let repr = &playlist.periods[0].adaptations[0].representations[0];
            let SegmentIndex::List(segs) = &repr.index else { unreachable!() };
            for pair in segs.windows(2) {
                prop_assert!(pair[1].sequence == pair[0].sequence + 1);
            }
        }
    }

    // decrypt(encrypt(p)) == p for the streaming pipeline, regardless of
    // how the ciphertext is chunked on the way in.
    #[test]
    fn decrypt_is_inverse_of_encrypt(
        plaintext in proptest::collection::vec(any::<u8>(), 0..4096),
        key in any::<[u8; 16]>(),
        iv in any::<[u8; 16]>(),
        chunk in 1usize..512,
    ) {
        let ciphertext = encrypt_segment(&key, &iv, &plaintext);
        let mut pipeline = FragmentPipeline::new(Arc::new(Aes128CbcCipher));
        pipeline.start_fragment(Some((key, iv)));
        let mut out = Vec::new();
        for piece in ciphertext.chunks(chunk) {
            out.extend_from_slice(&pipeline.push(piece).unwrap());
        }
        out.extend_from_slice(&pipeline.finish().unwrap());
        prop_assert_eq!(out, plaintext);
    }

    // PKCS#7: the last decrypted byte is in 1..=16 and exactly that many
    // bytes are stripped.
    #[test]
    fn pkcs7_padding_always_valid(
        len in 0usize..4096,
        key in any::<[u8; 16]>(),
        iv in any::<[u8; 16]>(),
    ) {
        let plaintext = vec![0x5au8; len];
        let ciphertext = encrypt_segment(&key, &iv, &plaintext);
        // Decrypt the raw blocks to inspect the padding byte itself.
        let mut decrypted = ciphertext.clone();
        Aes128CbcCipher.decrypt_cbc(&key, &iv, &mut decrypted).unwrap();
        let pad = *decrypted.last().unwrap() as usize;
        prop_assert!((1..=16).contains(&pad));
        prop_assert_eq!(decrypted.len() - pad, plaintext.len());
    }

    // Consecutive sidx entries never overlap: offset + size <= next offset.
    #[test]
    fn sidx_entries_are_disjoint(
        sizes in proptest::collection::vec((1u32..100_000, 1u32..10_000), 1..60),
    ) {
        let sidx_bytes = make_sidx(90_000, &sizes);
        let sidx = parse_sidx(&sidx_bytes[8..]).unwrap();
        prop_assert_eq!(sidx.entries.len(), sizes.len());
        for pair in sidx.entries.windows(2) {
            prop_assert!(pair[0].offset + pair[0].size <= pair[1].offset);
        }
        // And durations accumulate into presentation times.
        let mut pts = 0u64;
        for (entry, (_, d)) in sidx.entries.iter().zip(sizes.iter()) {
            prop_assert_eq!(entry.pts, pts);
            pts += *d as u64;
        }
    }

    // The attribute splitter never loses quoted commas.
    #[test]
    fn quoted_attribute_values_survive(value in "[a-zA-Z0-9 .,/=-]{0,40}") {
        let line = format!("BANDWIDTH=1000,CODECS=\"{value}\",NAME=x");
        let playlist = format!(
            "#EXTM3U\n#EXT-X-STREAM-INF:{line}\nchild.m3u8\n"
        );
        let base = url("http://h/m.m3u8");
        let parsed = adaptive_stream::parse(
            playlist.as_bytes(),
            adaptive_stream::ManifestFlavor::Hls,
            &base,
            &base,
        ).unwrap();
        let repr = &parsed.periods[0].adaptations[0].representations[0];
        prop_assert_eq!(repr.codecs.clone().unwrap_or_default(), value);
    }
}

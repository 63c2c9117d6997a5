//! Shared code for our test harness: an in-memory downloader, a
//! deterministic typefinder, and builders for synthetic media fragments.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Mutex, Once};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use url::Url;

use adaptive_stream::events::MediaCaps;
use adaptive_stream::fetch::{
    DownloadMeta, DownloadRequest, DownloadResponse, UriDownloader,
};
use adaptive_stream::fragment::TypeFind;
use adaptive_stream::StreamError;

static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    TRACING_INIT.call_once(|| {
        let fmt_layer = fmt::layer().compact().with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}

/// One recorded request: URI plus the `(start, end)` range, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub uri: String,
    pub range: Option<(u64, Option<u64>)>,
}

struct Resource {
    body: Bytes,
    headers: HashMap<String, String>,
}

/// In-memory [`UriDownloader`] serving pre-registered resources, recording
/// every request it sees. Bodies are streamed in small chunks so that the
/// chunked paths of the decryptor and parsers are exercised.
pub struct FakeDownloader {
    resources: Mutex<HashMap<String, Resource>>,
    requests: Mutex<Vec<RecordedRequest>>,
    chunk_size: usize,
}

impl FakeDownloader {
    pub fn new() -> FakeDownloader {
        FakeDownloader {
            resources: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            chunk_size: 499,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> FakeDownloader {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn insert(&self, uri: &str, body: impl Into<Bytes>) {
        self.resources.lock().unwrap().insert(
            uri.to_string(),
            Resource { body: body.into(), headers: HashMap::new() },
        );
    }

    pub fn insert_with_headers(
        &self,
        uri: &str,
        body: impl Into<Bytes>,
        headers: &[(&str, &str)],
    ) {
        self.resources.lock().unwrap().insert(
            uri.to_string(),
            Resource {
                body: body.into(),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
    }

    pub fn remove(&self, uri: &str) {
        self.resources.lock().unwrap().remove(uri);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, uri: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.uri == uri)
            .collect()
    }
}

#[async_trait]
impl UriDownloader for FakeDownloader {
    async fn fetch(&self, request: DownloadRequest) -> Result<DownloadResponse, StreamError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            uri: request.uri.to_string(),
            range: request.range.map(|r| (r.start, r.end)),
        });
        let (body, headers) = {
            let resources = self.resources.lock().unwrap();
            let resource = resources
                .get(request.uri.as_str())
                .ok_or_else(|| StreamError::ResourceNotFound(request.uri.to_string()))?;
            (resource.body.clone(), resource.headers.clone())
        };
        let sliced = match request.range {
            Some(range) => {
                let start = (range.start as usize).min(body.len());
                let end = match range.end {
                    Some(end) => ((end + 1) as usize).min(body.len()),
                    None => body.len(),
                };
                body.slice(start..end)
            }
            None => body,
        };
        let chunk_size = self.chunk_size;
        let chunks: Vec<Result<Bytes, StreamError>> = sliced
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(DownloadResponse {
            meta: DownloadMeta {
                final_uri: request.uri,
                is_permanent_redirect: false,
                headers,
            },
            body: stream::iter(chunks).boxed(),
        })
    }
}

/// Deterministic typefinder keyed on leading magic bytes.
pub struct FakeTypeFind;

impl TypeFind for FakeTypeFind {
    fn probe(&self, data: &[u8]) -> Option<(MediaCaps, f32)> {
        if data.len() >= 12 && (&data[4..8] == b"ftyp" || &data[4..8] == b"styp") {
            return Some((MediaCaps::new("video/quicktime"), 1.0));
        }
        if data.len() >= 8 && (&data[4..8] == b"sidx" || &data[4..8] == b"moof") {
            return Some((MediaCaps::new("video/quicktime"), 0.9));
        }
        if data.first() == Some(&0x47) {
            return Some((MediaCaps::new("video/mp2t"), 0.8));
        }
        if data.starts_with(b"ID3") {
            return Some((MediaCaps::new("audio/aac"), 0.8));
        }
        None
    }
}

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

// ---- synthetic ISOBMFF builders -------------------------------------------

pub fn make_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((payload.len() as u32 + 8).to_be_bytes()));
    out.extend_from_slice(fourcc);
    out.extend_from_slice(payload);
    out
}

fn full_box_payload(version: u8, flags: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(((version as u32) << 24 | (flags & 0x00ff_ffff)).to_be_bytes()));
    out.extend_from_slice(body);
    out
}

/// Description of one trun sample for [`make_moof`].
#[derive(Debug, Clone, Copy)]
pub struct SampleSpec {
    pub duration: u32,
    pub size: u32,
    /// Full sample_flags word; bit 16 set marks a non-sync sample.
    pub flags: u32,
}

pub const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000; // depends_on = 2
pub const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000; // non-sync bit set

/// Build a `moof` box with one traf: tfhd (default-base-is-moof), tfdt with
/// the given decode time, and one trun carrying per-sample duration, size
/// and flags with an explicit data offset pointing just past the moof.
pub fn make_moof(track_id: u32, decode_time: u64, samples: &[SampleSpec]) -> Vec<u8> {
    // tfhd: flags = default-base-is-moof only.
    let tfhd = make_box(b"tfhd", &full_box_payload(0, 0x020000, &track_id.to_be_bytes()));
    let tfdt = make_box(b"tfdt", &full_box_payload(1, 0, &decode_time.to_be_bytes()));

    // trun: data-offset + duration + size + flags per sample.
    let mut trun_body = Vec::new();
    trun_body.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    let data_offset_pos = trun_body.len();
    trun_body.extend_from_slice(&0u32.to_be_bytes()); // patched below
    for s in samples {
        trun_body.extend_from_slice(&s.duration.to_be_bytes());
        trun_body.extend_from_slice(&s.size.to_be_bytes());
        trun_body.extend_from_slice(&s.flags.to_be_bytes());
    }
    let mut trun = make_box(b"trun", &full_box_payload(0, 0x000701, &trun_body));

    let traf_len = 8 + tfhd.len() + tfdt.len() + trun.len();
    let moof_len = 8 + traf_len;
    // Samples start right after the moof plus the 8-byte mdat header.
    let data_offset = (moof_len + 8) as u32;
    // trun layout: size(4) fourcc(4) verflags(4) then the body.
    let patch_at = 8 + 4 + data_offset_pos;
    trun[patch_at..patch_at + 4].copy_from_slice(&data_offset.to_be_bytes());

    let traf = make_box(b"traf", &[tfhd, tfdt, trun].concat());
    make_box(b"moof", &traf)
}

/// A complete fragment: moof followed by an mdat holding `total` payload
/// bytes (the sum of the sample sizes).
pub fn make_fragment(track_id: u32, decode_time: u64, samples: &[SampleSpec]) -> Vec<u8> {
    let moof = make_moof(track_id, decode_time, samples);
    let total: usize = samples.iter().map(|s| s.size as usize).sum();
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let mdat = make_box(b"mdat", &payload);
    [moof, mdat].concat()
}

/// Build a version-0 `sidx` box for subfragments of the given
/// `(size, duration)` pairs.
pub fn make_sidx(timescale: u32, entries: &[(u32, u32)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_be_bytes()); // reference_ID
    body.extend_from_slice(&timescale.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // earliest_presentation_time
    body.extend_from_slice(&0u32.to_be_bytes()); // first_offset
    body.extend_from_slice(&0u16.to_be_bytes()); // reserved
    body.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for (size, duration) in entries {
        body.extend_from_slice(&size.to_be_bytes());
        body.extend_from_slice(&duration.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // SAP
    }
    make_box(b"sidx", &full_box_payload(0, 0, &body))
}

// ---- synthetic MPEG-TS builders -------------------------------------------

/// A TS packet with the given PID, payload flag and adaptation bytes.
pub fn make_ts_packet(pid: u16, payload: bool, adaptation: Option<&[u8]>) -> [u8; 188] {
    let mut packet = [0xffu8; 188];
    packet[0] = 0x47;
    packet[1] = ((pid >> 8) & 0x1f) as u8;
    packet[2] = (pid & 0xff) as u8;
    let afc = match (adaptation.is_some(), payload) {
        (true, true) => 0x30,
        (true, false) => 0x20,
        (false, true) => 0x10,
        (false, false) => 0x10,
    };
    packet[3] = afc;
    if let Some(af) = adaptation {
        packet[4] = af.len() as u8;
        packet[5..5 + af.len()].copy_from_slice(af);
    }
    packet
}

/// Adaptation field carrying a PCR with the given 27 MHz value.
pub fn pcr_adaptation(pcr: u64) -> Vec<u8> {
    let base = pcr / 300;
    let ext = pcr % 300;
    let mut af = vec![0x10u8]; // PCR flag
    // 33 bits base, 6 reserved bits, 9 bits extension.
    let word: u64 = (base << 15) | (0x3f << 9) | ext;
    af.extend_from_slice(&word.to_be_bytes()[2..8]);
    af
}

/// A minimal PAT section mapping program 1 to the given PMT PID.
pub fn pat_packet(pmt_pid: u16) -> [u8; 188] {
    let mut packet = make_ts_packet(0, true, None);
    let mut section = Vec::new();
    section.push(0); // pointer_field
    section.push(0x00); // table_id PAT
    // section_length: 5 header + 4 entry + 4 crc = 13
    section.extend_from_slice(&(0xb000u16 | 13).to_be_bytes());
    section.extend_from_slice(&1u16.to_be_bytes()); // transport_stream_id
    section.push(0xc1); // version/current_next
    section.push(0); // section_number
    section.push(0); // last_section_number
    section.extend_from_slice(&1u16.to_be_bytes()); // program_number
    section.extend_from_slice(&(0xe000 | pmt_pid).to_be_bytes());
    section.extend_from_slice(&[0; 4]); // crc (unchecked)
    packet[4..4 + section.len()].copy_from_slice(&section);
    packet
}

/// A minimal PMT section declaring the given PCR PID.
pub fn pmt_packet(pmt_pid: u16, pcr_pid: u16) -> [u8; 188] {
    let mut packet = make_ts_packet(pmt_pid, true, None);
    let mut section = Vec::new();
    section.push(0); // pointer_field
    section.push(0x02); // table_id PMT
    section.extend_from_slice(&(0xb000u16 | 13).to_be_bytes());
    section.extend_from_slice(&1u16.to_be_bytes()); // program_number
    section.push(0xc1);
    section.push(0);
    section.push(0);
    section.extend_from_slice(&(0xe000 | pcr_pid).to_be_bytes());
    section.extend_from_slice(&0xf000u16.to_be_bytes()); // program_info_length 0
    section.extend_from_slice(&[0; 4]); // crc
    packet[4..4 + section.len()].copy_from_slice(&section);
    packet
}

/// A packet on the PCR PID whose adaptation field carries the given 27 MHz
/// clock reference.
pub fn pcr_packet(pcr_pid: u16, pcr_27mhz: u64) -> [u8; 188] {
    make_ts_packet(pcr_pid, false, Some(&pcr_adaptation(pcr_27mhz)))
}

/// Concatenate packets into one stream buffer.
pub fn ts_stream(packets: &[[u8; 188]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packets.len() * 188);
    for p in packets {
        out.extend_from_slice(p);
    }
    out
}

// ---- AES test helper -------------------------------------------------------

/// PKCS#7 pad and AES-128-CBC encrypt, as an HLS packager would.
pub fn encrypt_segment(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    use aes::cipher::{BlockEncryptMut, KeyIvInit};

    let padding = 16 - plaintext.len() % 16;
    let mut data = plaintext.to_vec();
    data.extend(std::iter::repeat_n(padding as u8, padding));
    let mut enc = cbc::Encryptor::<aes::Aes128>::new(key.into(), iv.into());
    for chunk in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(aes::Block::from_mut_slice(chunk));
    }
    data
}

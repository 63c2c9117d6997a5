//! Incremental parsing of ISOBMFF movie fragments.
//!
//! The walker recognises the handful of top-level boxes an adaptive client
//! needs — `sidx`, `moof` (with its `traf`/`tfhd`/`tfdt`/`trun` children),
//! `mdat`, and the Smooth Streaming `uuid` extensions `tfxd`/`tfrf` — and
//! skips everything else. Metadata boxes are buffered whole (they are small);
//! `mdat` payload is forwarded as it arrives, so the parser never holds more
//! than one incomplete non-payload box.
//!
//! From each `moof` a sync-sample table is derived for keyframe-only trick
//! mode, with the byte range and timestamp of every sample flagged
//! independently decodable.

use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::{scaled_duration, StreamError};

const FOURCC_MOOF: [u8; 4] = *b"moof";
const FOURCC_TRAF: [u8; 4] = *b"traf";
const FOURCC_TFHD: [u8; 4] = *b"tfhd";
const FOURCC_TFDT: [u8; 4] = *b"tfdt";
const FOURCC_TRUN: [u8; 4] = *b"trun";
const FOURCC_SIDX: [u8; 4] = *b"sidx";
const FOURCC_MDAT: [u8; 4] = *b"mdat";
const FOURCC_UUID: [u8; 4] = *b"uuid";

/// Extended type of the Smooth Streaming `TfxdBox` (absolute time and
/// duration of the current fragment).
const UUID_TFXD: [u8; 16] = [
    0x6d, 0x1d, 0x9b, 0x05, 0x42, 0xd5, 0x44, 0xe6,
    0x80, 0xe2, 0x14, 0x1d, 0xaf, 0xf7, 0x57, 0xb2,
];
/// Extended type of the Smooth Streaming `TfrfBox` (look-ahead fragment
/// times).
const UUID_TFRF: [u8; 16] = [
    0xd4, 0x80, 0x7e, 0xf2, 0xca, 0x39, 0x46, 0x95,
    0x8e, 0x54, 0x26, 0xcb, 0x9e, 0x46, 0xa7, 0x9f,
];

// tfhd flags
const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SAMPLE_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_SAMPLE_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

// trun flags
const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_COMPOSITION_OFFSET: u32 = 0x000800;

/// `sample_is_non_sync_sample` bit of an ISOBMFF sample_flags word.
const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

fn sample_depends_on(flags: u32) -> u32 {
    (flags >> 24) & 0x3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub fourcc: [u8; 4],
    /// Total box size including the header; None for a box extending to the
    /// end of the file (size 0).
    pub size: Option<u64>,
    pub header_len: u64,
}

/// Read a box header from the front of `data` without consuming it. Returns
/// None when fewer bytes than a complete header are available.
pub fn peek_box_header(data: &[u8]) -> Result<Option<BoxHeader>, StreamError> {
    if data.len() < 8 {
        return Ok(None);
    }
    let mut buf = data;
    let size32 = buf.get_u32();
    let mut fourcc = [0u8; 4];
    buf.copy_to_slice(&mut fourcc);
    match size32 {
        0 => Ok(Some(BoxHeader { fourcc, size: None, header_len: 8 })),
        1 => {
            if data.len() < 16 {
                return Ok(None);
            }
            let size64 = buf.get_u64();
            if size64 < 16 {
                return Err(StreamError::Parsing(format!(
                    "invalid large box size {size64}"
                )));
            }
            Ok(Some(BoxHeader { fourcc, size: Some(size64), header_len: 16 }))
        }
        n if (n as u64) < 8 => {
            Err(StreamError::Parsing(format!("invalid box size {n}")))
        }
        n => Ok(Some(BoxHeader { fourcc, size: Some(n as u64), header_len: 8 })),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tfhd {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub default_base_is_moof: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Trun {
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub samples: Vec<TrunSample>,
}

/// Smooth Streaming absolute time of the enclosing fragment.
#[derive(Debug, Clone, Copy)]
pub struct Tfxd {
    pub time: u64,
    pub duration: u64,
}

/// Smooth Streaming look-ahead entries: times and durations of fragments the
/// server will publish next.
#[derive(Debug, Clone, Default)]
pub struct Tfrf {
    pub entries: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Default)]
pub struct Traf {
    pub tfhd: Tfhd,
    /// baseMediaDecodeTime from tfdt, in track timescale units.
    pub decode_time: Option<u64>,
    pub truns: Vec<Trun>,
    pub tfxd: Option<Tfxd>,
    pub tfrf: Option<Tfrf>,
}

#[derive(Debug, Clone, Default)]
pub struct Moof {
    pub trafs: Vec<Traf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidxEntry {
    /// Byte offset of the sub-fragment, relative to the sidx anchor point
    /// (the first byte after the sidx box).
    pub offset: u64,
    pub size: u64,
    /// Earliest presentation time, in sidx timescale units.
    pub pts: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Sidx {
    pub timescale: u64,
    pub earliest_presentation_time: u64,
    /// Distance from the first byte after the sidx box to the first indexed
    /// byte.
    pub first_offset: u64,
    pub entries: Vec<SidxEntry>,
}

/// One independently decodable sample from a fragment's sync-sample table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    /// Absolute file offset of the first byte of the sample.
    pub start_offset: u64,
    /// Absolute file offset one past the last byte.
    pub end_offset: u64,
    /// Decode timestamp in track timescale units, when a tfdt was present.
    pub ts: Option<u64>,
    pub duration: u32,
}

/// Events produced while feeding bytes to the [`FragmentParser`].
#[derive(Debug)]
pub enum ParserEvent {
    /// A complete `sidx` box was parsed. The anchor for entry offsets is the
    /// file position immediately following the box.
    SidxReady { sidx: Sidx, anchor: u64 },
    /// A complete `moof` was parsed at `offset` with total byte length
    /// `size`. `sync_samples` is None when the fragment disqualifies
    /// keyframe-only trick mode.
    MoofReady {
        moof: Moof,
        offset: u64,
        size: u64,
        sync_samples: Option<Vec<SyncSample>>,
    },
    /// Payload bytes of the current `mdat`, forwarded as they arrive.
    MdatData(Bytes),
    /// The current `mdat` ended.
    MdatEnd,
}

enum WalkState {
    /// Scanning box headers; metadata boxes accumulate until complete.
    Boxes,
    /// Forwarding mdat payload. None means the mdat extends to EOF.
    Mdat { remaining: Option<u64> },
    /// Discarding the remainder of an uninteresting box.
    Skip { remaining: u64 },
}

/// Incremental, byte-range-friendly ISOBMFF walker.
pub struct FragmentParser {
    state: WalkState,
    pending: BytesMut,
    /// Absolute file offset of the first byte of `pending`.
    offset: u64,
}

impl Default for FragmentParser {
    fn default() -> Self {
        FragmentParser::new()
    }
}

impl FragmentParser {
    pub fn new() -> FragmentParser {
        FragmentParser { state: WalkState::Boxes, pending: BytesMut::new(), offset: 0 }
    }

    /// Forget all buffered state, e.g. after a flush-seek.
    pub fn reset(&mut self) {
        self.state = WalkState::Boxes;
        self.pending.clear();
        self.offset = 0;
    }

    /// Position the parser at an absolute file offset before feeding bytes
    /// fetched with a range request.
    pub fn reset_at(&mut self, offset: u64) {
        self.reset();
        self.offset = offset;
    }

    /// Feed a chunk of bytes, returning the parse events it completes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ParserEvent>, StreamError> {
        let mut events = Vec::new();
        let mut input = Bytes::copy_from_slice(data);
        loop {
            match &mut self.state {
                WalkState::Mdat { remaining } => {
                    if input.is_empty() {
                        break;
                    }
                    let take = match remaining {
                        Some(r) => (*r).min(input.len() as u64) as usize,
                        None => input.len(),
                    };
                    let chunk = input.split_to(take);
                    self.offset += take as u64;
                    if let Some(r) = remaining {
                        *r -= take as u64;
                        if *r == 0 {
                            self.state = WalkState::Boxes;
                            events.push(ParserEvent::MdatData(chunk));
                            events.push(ParserEvent::MdatEnd);
                            continue;
                        }
                    }
                    events.push(ParserEvent::MdatData(chunk));
                }
                WalkState::Skip { remaining } => {
                    if input.is_empty() {
                        break;
                    }
                    let take = (*remaining).min(input.len() as u64) as usize;
                    input.advance(take);
                    self.offset += take as u64;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = WalkState::Boxes;
                    }
                }
                WalkState::Boxes => {
                    if !input.is_empty() {
                        self.pending.extend_from_slice(&input);
                        input.clear();
                    }
                    let Some(header) = peek_box_header(&self.pending)? else {
                        break;
                    };
                    if header.fourcc == FOURCC_MDAT {
                        self.pending.advance(header.header_len as usize);
                        self.offset += header.header_len;
                        let remaining = header.size.map(|s| s - header.header_len);
                        trace!(size = ?remaining, "entering mdat payload");
                        self.state = WalkState::Mdat { remaining };
                        // Any bytes already buffered belong to the payload.
                        let buffered = self.pending.split().freeze();
                        input = buffered;
                        continue;
                    }
                    let Some(total) = header.size else {
                        return Err(StreamError::Parsing(format!(
                            "box {} with indefinite size outside mdat",
                            fourcc_display(header.fourcc)
                        )));
                    };
                    let interesting = matches!(
                        header.fourcc,
                        FOURCC_MOOF | FOURCC_SIDX
                    );
                    if !interesting {
                        trace!(
                            fourcc = %fourcc_display(header.fourcc),
                            size = total,
                            "skipping box"
                        );
                        let have = self.pending.len() as u64;
                        if have >= total {
                            self.pending.advance(total as usize);
                            self.offset += total;
                        } else {
                            self.pending.clear();
                            self.offset += have;
                            self.state = WalkState::Skip { remaining: total - have };
                        }
                        continue;
                    }
                    if (self.pending.len() as u64) < total {
                        // Wait for the complete metadata box.
                        break;
                    }
                    let box_offset = self.offset;
                    let full = self.pending.split_to(total as usize).freeze();
                    self.offset += total;
                    let payload = &full[header.header_len as usize..];
                    match header.fourcc {
                        FOURCC_SIDX => {
                            let sidx = parse_sidx(payload)?;
                            debug!(
                                entries = sidx.entries.len(),
                                timescale = sidx.timescale,
                                "parsed sidx"
                            );
                            events.push(ParserEvent::SidxReady {
                                sidx,
                                anchor: box_offset + total,
                            });
                        }
                        FOURCC_MOOF => {
                            let moof = parse_moof(payload)?;
                            let sync_samples =
                                moof_sync_samples(&moof, box_offset, total);
                            events.push(ParserEvent::MoofReady {
                                moof,
                                offset: box_offset,
                                size: total,
                                sync_samples,
                            });
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
        Ok(events)
    }
}

fn fourcc_display(fourcc: [u8; 4]) -> String {
    fourcc.iter().map(|b| (*b as char)).collect()
}

fn need(data: &[u8], n: usize, what: &str) -> Result<(), StreamError> {
    if data.len() < n {
        return Err(StreamError::Parsing(format!("truncated {what} box")));
    }
    Ok(())
}

/// Parse the children of a `moof` box.
pub fn parse_moof(mut payload: &[u8]) -> Result<Moof, StreamError> {
    let mut moof = Moof::default();
    while !payload.is_empty() {
        let header = peek_box_header(payload)?
            .ok_or_else(|| StreamError::Parsing(String::from("truncated box in moof")))?;
        let total = header
            .size
            .ok_or_else(|| StreamError::Parsing(String::from("indefinite box in moof")))?;
        need(payload, total as usize, "moof child")?;
        let body = &payload[header.header_len as usize..total as usize];
        if header.fourcc == FOURCC_TRAF {
            moof.trafs.push(parse_traf(body)?);
        }
        payload = &payload[total as usize..];
    }
    if moof.trafs.is_empty() {
        return Err(StreamError::Parsing(String::from("moof without traf")));
    }
    Ok(moof)
}

fn parse_traf(mut payload: &[u8]) -> Result<Traf, StreamError> {
    let mut traf = Traf::default();
    let mut have_tfhd = false;
    while !payload.is_empty() {
        let header = peek_box_header(payload)?
            .ok_or_else(|| StreamError::Parsing(String::from("truncated box in traf")))?;
        let total = header
            .size
            .ok_or_else(|| StreamError::Parsing(String::from("indefinite box in traf")))?;
        need(payload, total as usize, "traf child")?;
        let body = &payload[header.header_len as usize..total as usize];
        match header.fourcc {
            FOURCC_TFHD => {
                traf.tfhd = parse_tfhd(body)?;
                have_tfhd = true;
            }
            FOURCC_TFDT => {
                traf.decode_time = Some(parse_tfdt(body)?);
            }
            FOURCC_TRUN => {
                traf.truns.push(parse_trun(body)?);
            }
            FOURCC_UUID => {
                if body.len() >= 16 {
                    let (ext, rest) = body.split_at(16);
                    if ext == UUID_TFXD {
                        traf.tfxd = Some(parse_tfxd(rest)?);
                    } else if ext == UUID_TFRF {
                        traf.tfrf = Some(parse_tfrf(rest)?);
                    }
                }
            }
            _ => {}
        }
        payload = &payload[total as usize..];
    }
    if !have_tfhd {
        return Err(StreamError::Parsing(String::from("traf without tfhd")));
    }
    Ok(traf)
}

fn parse_tfhd(mut body: &[u8]) -> Result<Tfhd, StreamError> {
    need(body, 8, "tfhd")?;
    let verflags = body.get_u32();
    let flags = verflags & 0x00ff_ffff;
    let track_id = body.get_u32();
    let mut tfhd = Tfhd {
        track_id,
        default_base_is_moof: flags & TFHD_DEFAULT_BASE_IS_MOOF != 0,
        ..Tfhd::default()
    };
    if flags & TFHD_BASE_DATA_OFFSET != 0 {
        need(body, 8, "tfhd")?;
        tfhd.base_data_offset = Some(body.get_u64());
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        need(body, 4, "tfhd")?;
        body.get_u32();
    }
    if flags & TFHD_DEFAULT_SAMPLE_DURATION != 0 {
        need(body, 4, "tfhd")?;
        tfhd.default_sample_duration = Some(body.get_u32());
    }
    if flags & TFHD_DEFAULT_SAMPLE_SIZE != 0 {
        need(body, 4, "tfhd")?;
        tfhd.default_sample_size = Some(body.get_u32());
    }
    if flags & TFHD_DEFAULT_SAMPLE_FLAGS != 0 {
        need(body, 4, "tfhd")?;
        tfhd.default_sample_flags = Some(body.get_u32());
    }
    Ok(tfhd)
}

fn parse_tfdt(mut body: &[u8]) -> Result<u64, StreamError> {
    need(body, 4, "tfdt")?;
    let verflags = body.get_u32();
    let version = verflags >> 24;
    if version == 1 {
        need(body, 8, "tfdt")?;
        Ok(body.get_u64())
    } else {
        need(body, 4, "tfdt")?;
        Ok(body.get_u32() as u64)
    }
}

fn parse_trun(mut body: &[u8]) -> Result<Trun, StreamError> {
    need(body, 8, "trun")?;
    let verflags = body.get_u32();
    let flags = verflags & 0x00ff_ffff;
    let sample_count = body.get_u32();
    let mut trun = Trun::default();
    if flags & TRUN_DATA_OFFSET != 0 {
        need(body, 4, "trun")?;
        trun.data_offset = Some(body.get_u32() as i32);
    }
    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        need(body, 4, "trun")?;
        trun.first_sample_flags = Some(body.get_u32());
    }
    // Guard against a bogus sample count exhausting memory before the length
    // check catches it.
    let per_sample = [
        TRUN_SAMPLE_DURATION,
        TRUN_SAMPLE_SIZE,
        TRUN_SAMPLE_FLAGS,
        TRUN_SAMPLE_COMPOSITION_OFFSET,
    ]
    .iter()
    .filter(|f| flags & **f != 0)
    .count();
    need(body, sample_count as usize * per_sample * 4, "trun")?;
    trun.samples.reserve(sample_count as usize);
    for _ in 0..sample_count {
        let mut sample = TrunSample::default();
        if flags & TRUN_SAMPLE_DURATION != 0 {
            sample.duration = Some(body.get_u32());
        }
        if flags & TRUN_SAMPLE_SIZE != 0 {
            sample.size = Some(body.get_u32());
        }
        if flags & TRUN_SAMPLE_FLAGS != 0 {
            sample.flags = Some(body.get_u32());
        }
        if flags & TRUN_SAMPLE_COMPOSITION_OFFSET != 0 {
            body.get_u32();
        }
        trun.samples.push(sample);
    }
    Ok(trun)
}

fn parse_tfxd(mut body: &[u8]) -> Result<Tfxd, StreamError> {
    need(body, 4, "tfxd")?;
    let verflags = body.get_u32();
    if verflags >> 24 == 1 {
        need(body, 16, "tfxd")?;
        Ok(Tfxd { time: body.get_u64(), duration: body.get_u64() })
    } else {
        need(body, 8, "tfxd")?;
        Ok(Tfxd { time: body.get_u32() as u64, duration: body.get_u32() as u64 })
    }
}

fn parse_tfrf(mut body: &[u8]) -> Result<Tfrf, StreamError> {
    need(body, 5, "tfrf")?;
    let verflags = body.get_u32();
    let version = verflags >> 24;
    let count = body.get_u8() as usize;
    let entry_size = if version == 1 { 16 } else { 8 };
    need(body, count * entry_size, "tfrf")?;
    let mut tfrf = Tfrf::default();
    for _ in 0..count {
        let (time, duration) = if version == 1 {
            (body.get_u64(), body.get_u64())
        } else {
            (body.get_u32() as u64, body.get_u32() as u64)
        };
        tfrf.entries.push((time, duration));
    }
    Ok(tfrf)
}

/// Parse a `sidx` payload into its cumulative entry table.
pub fn parse_sidx(mut body: &[u8]) -> Result<Sidx, StreamError> {
    need(body, 12, "sidx")?;
    let verflags = body.get_u32();
    let version = verflags >> 24;
    body.get_u32(); // reference_ID
    let timescale = body.get_u32() as u64;
    let (earliest, first_offset) = if version == 0 {
        need(body, 8, "sidx")?;
        (body.get_u32() as u64, body.get_u32() as u64)
    } else {
        need(body, 16, "sidx")?;
        (body.get_u64(), body.get_u64())
    };
    need(body, 4, "sidx")?;
    body.get_u16(); // reserved
    let reference_count = body.get_u16() as usize;
    need(body, reference_count * 12, "sidx")?;
    let mut sidx = Sidx {
        timescale,
        earliest_presentation_time: earliest,
        first_offset,
        entries: Vec::with_capacity(reference_count),
    };
    let mut offset = first_offset;
    let mut pts = earliest;
    for _ in 0..reference_count {
        let word = body.get_u32();
        let reference_type = word >> 31;
        let referenced_size = (word & 0x7fff_ffff) as u64;
        let subsegment_duration = body.get_u32() as u64;
        body.get_u32(); // SAP information
        if reference_type == 1 {
            // A hierarchical index referencing other sidx boxes; we only
            // step over media references.
            warn!("sidx references a nested index, skipping entry");
        } else {
            sidx.entries.push(SidxEntry {
                offset,
                size: referenced_size,
                pts,
                duration: subsegment_duration,
            });
        }
        offset += referenced_size;
        pts += subsegment_duration;
    }
    Ok(sidx)
}

impl Sidx {
    /// The entry whose interval contains `ts` (timescale units), or the last
    /// entry when `ts` lies beyond the indexed range.
    pub fn entry_for_time(&self, ts: u64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        for (i, e) in self.entries.iter().enumerate() {
            if ts < e.pts + e.duration {
                return Some(i);
            }
        }
        Some(self.entries.len() - 1)
    }
}

/// Build the sync-sample table for a parsed `moof`, walking every trun and
/// computing absolute file offsets. Returns None — silently disabling trick
/// mode for this fragment — when sample flags, sizes or durations would have
/// to come from the trex box (which a byte-range client never fetches), when
/// samples span multiple track ids, or when the fragment contains no sync
/// sample at all.
pub fn moof_sync_samples(
    moof: &Moof,
    moof_offset: u64,
    moof_size: u64,
) -> Option<Vec<SyncSample>> {
    let track_id = moof.trafs.first()?.tfhd.track_id;
    if moof.trafs.iter().any(|t| t.tfhd.track_id != track_id) {
        debug!("trick mode disabled: fragment spans multiple track ids");
        return None;
    }
    let mut samples = Vec::new();
    for traf in &moof.trafs {
        let base = match traf.tfhd.base_data_offset {
            Some(b) => b,
            None if traf.tfhd.default_base_is_moof => moof_offset,
            // Offsets default to the start of the moof for the first traf of
            // single-track fragments.
            None => moof_offset,
        };
        let mut ts = traf.decode_time;
        let mut run_end: Option<u64> = None;
        for trun in &traf.truns {
            let mut pos = match trun.data_offset {
                Some(off) => base.wrapping_add_signed(off as i64),
                // A trun without an explicit offset continues where the
                // previous run ended, or right after the moof.
                None => run_end.unwrap_or(moof_offset + moof_size),
            };
            for (i, sample) in trun.samples.iter().enumerate() {
                let size = sample.size.or(traf.tfhd.default_sample_size)? as u64;
                let duration = sample.duration.or(traf.tfhd.default_sample_duration)?;
                let flags = sample
                    .flags
                    .or(if i == 0 { trun.first_sample_flags } else { None })
                    .or(traf.tfhd.default_sample_flags)?;
                let is_sync =
                    flags & SAMPLE_IS_NON_SYNC == 0 || sample_depends_on(flags) == 2;
                if is_sync && size > 0 {
                    samples.push(SyncSample {
                        start_offset: pos,
                        end_offset: pos + size,
                        ts,
                        duration,
                    });
                }
                pos += size;
                if let Some(t) = ts {
                    ts = Some(t + duration as u64);
                }
            }
            run_end = Some(pos);
        }
    }
    if samples.is_empty() {
        debug!("trick mode disabled: fragment contains no sync sample");
        return None;
    }
    Some(samples)
}

/// Running byte-size and keyframe-spacing averages across fragments, blended
/// as `(3·old + new) / 4` so that single outliers move the estimate slowly in
/// either direction.
#[derive(Debug, Clone, Default)]
pub struct FragmentStats {
    pub moof_avg_size: u64,
    pub keyframe_avg_size: u64,
    pub keyframe_avg_distance: Duration,
}

impl FragmentStats {
    pub fn record_moof(&mut self, size: u64) {
        self.moof_avg_size = blend_u64(self.moof_avg_size, size);
    }

    /// Record a fragment's sync-sample table against the track timescale.
    pub fn record_sync_samples(&mut self, samples: &[SyncSample], timescale: u64) {
        if samples.is_empty() {
            return;
        }
        let total: u64 = samples.iter().map(|s| s.end_offset - s.start_offset).sum();
        self.keyframe_avg_size = blend_u64(self.keyframe_avg_size, total / samples.len() as u64);
        let span: u64 = samples.iter().map(|s| s.duration as u64).sum();
        let distance = scaled_duration(span / samples.len() as u64, timescale);
        if !distance.is_zero() {
            self.keyframe_avg_distance = if self.keyframe_avg_distance.is_zero() {
                distance
            } else {
                (3 * self.keyframe_avg_distance + distance) / 4
            };
        }
    }
}

fn blend_u64(old: u64, new: u64) -> u64 {
    if old == 0 {
        new
    } else {
        (3 * old + new) / 4
    }
}

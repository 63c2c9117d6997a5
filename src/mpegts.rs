//! Lightweight MPEG-TS probing: locate packet sync, walk PAT → PMT → PCR and
//! extract the first and last program clock references of a fragment.
//!
//! This is not a demuxer. The scheduler only needs enough timing information
//! to anchor a fragment on the presentation timeline; everything else in the
//! transport stream is passed through untouched. Fragment bytes arrive in
//! network-sized chunks, so the reader accumulates input and carries a
//! partial trailing packet over to the next call.
//!
//! For audio-only HLS streams the media is raw AAC prefixed with an ID3v2
//! tag whose Apple-defined `PRIV` frame carries the equivalent MPEG-TS
//! timestamp; [`TsReader::find_pcrs`] handles that mode too, withholding
//! output until the tag is complete and stripping it from the outgoing
//! buffer.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, trace};

const TS_PACKET_SIZE: usize = 188;

/// PRIV owner identifier carrying a 33-bit MPEG-TS PTS in a 64-bit
/// big-endian payload, per the HTTP Live Streaming timed-metadata spec.
const APPLE_TS_TIMESTAMP_OWNER: &[u8] = b"com.apple.streaming.transportStreamTimestamp";

/// 27 MHz PCR ticks to nanoseconds.
fn pcr_to_ns(pcr: u64) -> Duration {
    Duration::from_nanos(pcr * 1000 / 27)
}

/// 90 kHz MPEG timestamp to nanoseconds.
fn mpegtime_to_ns(pts: u64) -> Duration {
    Duration::from_nanos(pts * 100_000 / 9)
}

// Check for sync byte, error_indicator == 0 and a sane adaptation field
// control. AFC may only be zero for null packets (PID 0x1fff), which some
// streams do emit.
fn is_ts_header(data: &[u8]) -> bool {
    data[0] == 0x47
        && (data[1] & 0x80) == 0x00
        && ((data[3] & 0x30) != 0x00
            || ((data[1] & 0x1f) == 0x1f && data[2] == 0xff))
}

fn have_ts_sync(data: &[u8], packet_size: usize, num: usize) -> bool {
    let mut data = data;
    for _ in 0..num {
        if data.len() < packet_size || !is_ts_header(data) {
            return false;
        }
        data = &data[packet_size..];
    }
    true
}

/// Find the offset of the first TS packet by verifying a run of consecutive
/// packet headers: `min(25, size / 188)` of them, so a buffer shorter than
/// 25 packets is still recognised from the packets it does hold. Returns
/// None when the buffer does not look like a transport stream.
pub fn find_sync_offset(data: &[u8]) -> Option<usize> {
    let sync_points = (data.len() / TS_PACKET_SIZE).min(25).max(1);
    (0..TS_PACKET_SIZE.min(data.len()))
        .find(|&off| have_ts_sync(&data[off..], TS_PACKET_SIZE, sync_points))
}

/// How the timing of a fragment is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TsReaderMode {
    /// Full transport stream: timing from PCRs on the PCR PID.
    #[default]
    MpegTs,
    /// Raw AAC with a leading ID3 tag carrying the timestamp.
    Id3,
}

/// Stateful PCR extractor, fed the bytes of each fragment as they arrive.
#[derive(Debug, Default)]
pub struct TsReader {
    mode: TsReaderMode,
    pmt_pid: Option<u16>,
    pcr_pid: Option<u16>,
    first_pcr: Option<Duration>,
    last_pcr: Option<Duration>,
    have_id3: bool,
    /// Unconsumed input: a partial trailing packet (TS mode) or an
    /// incomplete leading tag (ID3 mode).
    pending: BytesMut,
    /// Packet alignment has been established for this fragment.
    synced: bool,
}

impl TsReader {
    pub fn new() -> TsReader {
        TsReader::default()
    }

    /// Reset for a new representation, keeping nothing across the switch.
    pub fn set_mode(&mut self, mode: TsReaderMode) {
        *self = TsReader { mode, ..TsReader::default() };
    }

    /// Start a new fragment: sync and PCR state are per fragment, while the
    /// ID3 search latch persists for the representation (only the first
    /// fragment carries the tag). A partial packet left over from the
    /// previous fragment is dropped; the final PCR is assumed to sit wholly
    /// inside the data handed to us.
    pub fn start_fragment(&mut self) {
        *self = TsReader { mode: self.mode, have_id3: self.have_id3, ..TsReader::default() };
    }

    pub fn first_pcr(&self) -> Option<Duration> {
        self.first_pcr
    }

    pub fn last_pcr(&self) -> Option<Duration> {
        self.last_pcr
    }

    /// Scan a piece of fragment data for timing information. Returns the
    /// buffer to forward downstream and whether a timestamp has been
    /// established. TS input passes through unchanged; in ID3 mode output is
    /// withheld until the leading tag is complete, then resumes with the tag
    /// stripped.
    pub fn find_pcrs(&mut self, buffer: Bytes) -> (Bytes, bool) {
        match self.mode {
            TsReaderMode::MpegTs => {
                let found = self.scan_mpegts(&buffer);
                (buffer, found)
            }
            TsReaderMode::Id3 => self.scan_id3(buffer),
        }
    }

    fn scan_mpegts(&mut self, data: &[u8]) -> bool {
        self.pending.extend_from_slice(data);
        if !self.synced {
            // Sync can only sit within the first packet length; what we
            // verify is bounded by how many packets have arrived so far.
            let Some(offset) = find_sync_offset(&self.pending) else {
                return self.first_pcr.is_some();
            };
            trace!(offset, "TS packet start offset");
            self.pending.advance(offset);
            self.synced = true;
        }
        while self.pending.len() >= TS_PACKET_SIZE {
            let mut packet = [0u8; TS_PACKET_SIZE];
            packet.copy_from_slice(&self.pending[..TS_PACKET_SIZE]);
            self.pending.advance(TS_PACKET_SIZE);
            self.handle_packet(&packet);
        }
        // A partial packet at the tail waits for the next chunk.
        self.first_pcr.is_some()
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        let hdr = BigEndian::read_u32(packet);
        // sync byte (0x47), error indicator (TEI) not set, PID 0, has_payload
        if hdr & 0xff9f_ff10 == 0x4700_0010 {
            self.handle_pat(packet);
        } else if hdr & 0xff80_0010 == 0x4700_0010
            && Some(((hdr >> 8) & 0x1fff) as u16) == self.pmt_pid
        {
            self.handle_pmt(packet);
        } else if hdr & 0xff80_0020 == 0x4700_0020
            && Some(((hdr >> 8) & 0x1fff) as u16) == self.pcr_pid
        {
            self.handle_pcr(packet);
        }
    }

    // Skip the adaptation field (if any) and the pointer field, returning
    // the start of the PSI section.
    fn section_start<'a>(packet: &'a [u8]) -> Option<&'a [u8]> {
        let mut pos = 4;
        if packet[3] & 0x20 != 0 {
            pos += 1 + packet.get(4).copied()? as usize;
        }
        let pointer = *packet.get(pos)? as usize;
        pos += 1 + pointer;
        packet.get(pos..)
    }

    fn handle_pat(&mut self, packet: &[u8]) {
        let Some(section) = Self::section_start(packet) else { return };
        if section.len() < 8 || section[0] != 0x00 {
            return;
        }
        // we assume the entire PAT fits into a single packet
        if section[6] != 0 || section[6] != section[7] {
            return;
        }
        let slen = (BigEndian::read_u16(&section[1..]) & 0x0fff) as usize;
        if slen + 3 > section.len() || slen < 5 + 4 + 4 {
            return;
        }
        let mut entries = &section[8..];
        let mut remaining = slen - 5 - 4;
        while remaining >= 4 && entries.len() >= 4 {
            let program = BigEndian::read_u16(entries);
            let pid = BigEndian::read_u16(&entries[2..]) & 0x1fff;
            if program != 0 {
                debug!(pmt_pid = pid, "PAT announced PMT");
                self.pmt_pid = Some(pid);
                return;
            }
            entries = &entries[4..];
            remaining -= 4;
        }
    }

    fn handle_pmt(&mut self, packet: &[u8]) {
        let Some(section) = Self::section_start(packet) else { return };
        if section.len() < 10 || section[0] != 0x02 {
            return;
        }
        if section[6] != 0 || section[6] != section[7] {
            return;
        }
        let slen = (BigEndian::read_u16(&section[1..]) & 0x0fff) as usize;
        if slen + 3 > section.len() || slen < 5 + 2 + 4 {
            return;
        }
        let pcr_pid = BigEndian::read_u16(&section[8..]) & 0x1fff;
        if pcr_pid != 0x1fff {
            debug!(pcr_pid, "PMT announced PCR PID");
            self.pcr_pid = Some(pcr_pid);
        }
    }

    fn handle_pcr(&mut self, packet: &[u8]) {
        if packet[3] & 0x20 == 0 {
            return;
        }
        let af_len = packet[4] as usize;
        if !(1 + 6..=TS_PACKET_SIZE - 5).contains(&af_len) {
            return;
        }
        let flags = packet[5];
        if flags & 0x10 == 0 {
            return;
        }
        // 33-bit base followed by 6 reserved bits and a 9-bit extension.
        let word = BigEndian::read_u64(&packet[6..14]);
        let pcr_base = (word >> 16) >> (6 + 9);
        let pcr_ext = (word >> 16) & 0x1ff;
        let pcr = pcr_base * 300 + pcr_ext;
        let ts = pcr_to_ns(pcr);
        trace!(pcr, ?ts, "have PCR");
        if self.first_pcr.is_none() {
            self.first_pcr = Some(ts);
        }
        self.last_pcr = Some(ts);
    }

    /// ID3 mode: collect, parse and strip the leading tag of the first
    /// fragment, extracting the Apple `PRIV` timestamp. Output is withheld
    /// until the whole tag has arrived. Subsequent fragments inherit the
    /// anchor, so their buffers pass through untouched.
    fn scan_id3(&mut self, buffer: Bytes) -> (Bytes, bool) {
        if self.have_id3 {
            return (buffer, self.first_pcr.is_some());
        }
        self.pending.extend_from_slice(&buffer);
        // We need at least the 10-byte header starting with "ID3".
        if self.pending.len() < 10 {
            return (Bytes::new(), false);
        }
        if &self.pending[..3] != b"ID3" {
            // Not tagged at all; stop trying and release what we held.
            self.have_id3 = true;
            return (self.pending.split().freeze(), false);
        }
        let version_major = self.pending[3];
        let header_flags = self.pending[5];
        let tag_size = syncsafe_u32(&self.pending[6..10]) as usize;
        let mut total = 10 + tag_size;
        if header_flags & 0x10 != 0 {
            total += 10; // footer
        }
        // Wait until the whole tag has been collected.
        if self.pending.len() < total {
            return (Bytes::new(), false);
        }
        self.have_id3 = true;
        let tag = self.pending.split_to(total).freeze();
        self.parse_id3_frames(&tag[10..10 + tag_size], version_major);
        (self.pending.split().freeze(), self.first_pcr.is_some())
    }

    fn parse_id3_frames(&mut self, mut frames: &[u8], version_major: u8) {
        while frames.len() >= 10 {
            let id = &frames[..4];
            if id == [0, 0, 0, 0] {
                break; // padding
            }
            let size = if version_major >= 4 {
                syncsafe_u32(&frames[4..8]) as usize
            } else {
                BigEndian::read_u32(&frames[4..8]) as usize
            };
            let Some(body) = frames.get(10..10 + size) else {
                break;
            };
            if id == b"PRIV" {
                if let Some(nul) = body.iter().position(|b| *b == 0) {
                    let (owner, data) = body.split_at(nul);
                    let data = &data[1..];
                    if owner == APPLE_TS_TIMESTAMP_OWNER && data.len() >= 8 {
                        // A 33-bit PCR inside a 64-bit BE word.
                        let pts = BigEndian::read_u64(data) & 0x1_ffff_ffff;
                        let ts = mpegtime_to_ns(pts);
                        debug!(pts, ?ts, "AAC fragment ID3 timestamp");
                        self.first_pcr = Some(ts);
                        self.last_pcr = Some(ts);
                    }
                }
            }
            frames = &frames[10 + size..];
        }
    }
}

fn syncsafe_u32(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32 & 0x7f) << 21)
        | ((bytes[1] as u32 & 0x7f) << 14)
        | ((bytes[2] as u32 & 0x7f) << 7)
        | (bytes[3] as u32 & 0x7f)
}

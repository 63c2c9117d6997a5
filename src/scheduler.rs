//! The stream scheduler: session wiring and the per-track download loop.
//!
//! A [`Session`] runs one cooperatively-scheduled task per selected track,
//! plus a manifest-refresh task for live DASH/MSS documents and a
//! clock-drift task when the manifest declares UTCTiming sources. All tasks
//! share the playlist model behind a read/write lock that is only ever held
//! across non-suspending code; segment references are re-resolved by
//! `(representation id, sequence)` before each request, so a live refresh
//! can replace the segment lists at any quiescent point.
//!
//! The track loop follows a fixed shape: ensure the representation's header
//! and playlist are loaded, resolve the next fragment, bind the decryption
//! key, pick the byte range (whole fragment, sidx sub-fragment, or a single
//! sync sample in keyframe trick mode), stream the bytes through the
//! decryptor and the container parser, emit buffers to the host, then let
//! the bitrate adapter reconsider the representation.

use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::adapter::BitrateAdapter;
use crate::clock::{ClockDrift, FAST_CLOCK_UPDATE_INTERVAL, SLOW_CLOCK_UPDATE_INTERVAL};
use crate::config::SessionConfig;
use crate::events::{
    stream_id, BitrateSwitch, ErrorEvent, MediaBuffer, MediaCaps, SessionEvent, TagList,
    TrackEvent,
};
use crate::fetch::{fetch_bytes, DownloadRequest, RequestRange, UriDownloader};
use crate::fragment::{
    FragmentPipeline, KeyCache, SegmentCipher, TypeFind, TypefindProgress, TypefindState,
};
use crate::isobmff::{FragmentParser, FragmentStats, ParserEvent, Sidx, SyncSample};
use crate::live::{self, RefreshPacer};
use crate::mpegts::{TsReader, TsReaderMode};
use crate::{
    hls, scaled_duration, Advance, Direction, InitHeader, ManifestFlavor, MediaKind, Playlist,
    Representation, SeekFlags, Segment, SnapMode, StreamError, TrackCursor,
};

/// Playlist shared between the track tasks and the refresh task.
pub type SharedPlaylist = Arc<RwLock<Playlist>>;

/// Maximum consecutive fragment failures before the track raises a fatal
/// error.
const MAX_FRAGMENT_FAILURES: u32 = 3;

/// Seed for the keyframe download-time estimate before any measurement.
const INITIAL_AVG_DOWNLOAD_TIME: Duration = Duration::from_millis(250);

/// First-chunk size when a sidx has to be located without an indexRange.
const SIDX_PROBE_BYTES: u64 = 8192;

/// Commands a host can send to a running track.
#[derive(Debug, Clone)]
pub enum TrackCommand {
    /// Flush-seek: cancel the in-flight download, clear the decryptor and
    /// parser, and re-enter the loop at the target position.
    Seek {
        position: Duration,
        direction: Direction,
        flags: SeekFlags,
        /// Playback rate, used by keyframe trick mode to pace skips.
        rate: f64,
    },
    Stop,
}

/// A configured but not yet started playback session.
pub struct Session {
    playlist: SharedPlaylist,
    downloader: Arc<dyn UriDownloader>,
    cipher: Arc<dyn SegmentCipher>,
    typefind: Arc<dyn TypeFind>,
    key_cache: Arc<KeyCache>,
    config: SessionConfig,
}

/// Control surface of a running session.
pub struct SessionHandle {
    /// Stream of track events; closing (dropping) it stops the tasks on
    /// their next send.
    pub events: mpsc::Receiver<SessionEvent>,
    playlist: SharedPlaylist,
    commands: Vec<mpsc::Sender<TrackCommand>>,
    shutdown: watch::Sender<bool>,
    qos_earliest_ns: Arc<AtomicU64>,
}

impl Session {
    pub fn new(
        playlist: Playlist,
        downloader: Arc<dyn UriDownloader>,
        cipher: Arc<dyn SegmentCipher>,
        typefind: Arc<dyn TypeFind>,
        mut config: SessionConfig,
    ) -> Result<Session, StreamError> {
        config.validate()?;
        Ok(Session {
            playlist: Arc::new(RwLock::new(playlist)),
            downloader,
            cipher,
            typefind,
            key_cache: Arc::new(KeyCache::new(2048)),
            config,
        })
    }

    pub fn playlist(&self) -> SharedPlaylist {
        Arc::clone(&self.playlist)
    }

    /// Spawn the per-track tasks plus the refresh and clock-drift tasks.
    pub fn start(self) -> Result<SessionHandle, StreamError> {
        let capacity = if self.config.max_queue_size_buffers > 0 {
            self.config.max_queue_size_buffers
        } else {
            // No explicit back-pressure limit: bound the queue by the
            // fragment cache depth instead (several buffers per fragment).
            self.config.fragments_cache as usize * 64
        };
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let qos_earliest_ns = Arc::new(AtomicU64::new(0));

        let clock = {
            let playlist = self.playlist.read().unwrap();
            ClockDrift::new(playlist.utc_timing.clone()).map(Arc::new)
        };

        // Live templates without a timeline have no availability window
        // until computed from the wall clock; seed it so the tracks can
        // position themselves before the first refresh tick.
        {
            let mut p = self.playlist.write().unwrap();
            let now = clock
                .as_ref()
                .map(|c| c.server_now())
                .unwrap_or_else(chrono::Utc::now);
            live::update_template_windows(&mut p, now);
        }

        // One track per adaptation set that has something fetchable.
        let mut commands = Vec::new();
        let mut kind_counters: std::collections::HashMap<MediaKind, usize> =
            std::collections::HashMap::new();
        let track_plans: Vec<(usize, String, MediaKind)> = {
            let playlist = self.playlist.read().unwrap();
            let mut plans = Vec::new();
            for (ai, adaptation) in playlist.periods[0].adaptations.iter().enumerate() {
                if adaptation.representations.iter().all(|r| r.iframe_only) {
                    continue;
                }
                let idx = kind_counters.entry(adaptation.kind).or_insert(0);
                let id = stream_id(adaptation.kind, *idx);
                *idx += 1;
                plans.push((ai, id, adaptation.kind));
            }
            plans
        };
        if track_plans.is_empty() {
            return Err(StreamError::NotAVariant(String::from(
                "no playable track in playlist",
            )));
        }

        for (adaptation, id, kind) in track_plans {
            let (cmd_tx, cmd_rx) = mpsc::channel(8);
            commands.push(cmd_tx);
            let task = StreamTask::new(
                &self,
                adaptation,
                id,
                kind,
                events_tx.clone(),
                cmd_rx,
                shutdown_rx.clone(),
                clock.clone(),
                Arc::clone(&qos_earliest_ns),
            );
            tokio::spawn(task.run());
        }

        // Whole-document refresh for live DASH/MSS. HLS media playlists are
        // refreshed by their own track, and a Smooth manifest announcing
        // look-ahead fragments grows from the tfrf boxes instead (which a
        // wholesale replacement would throw away).
        {
            let (is_live, flavor, look_ahead) = {
                let p = self.playlist.read().unwrap();
                (p.is_live, p.flavor, p.look_ahead_count)
            };
            if is_live
                && flavor != ManifestFlavor::Hls
                && !(flavor == ManifestFlavor::Mss && look_ahead > 0)
            {
                let playlist = Arc::clone(&self.playlist);
                let downloader = Arc::clone(&self.downloader);
                let clock = clock.clone();
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    refresh_task(playlist, downloader, clock, &mut shutdown).await;
                });
            }
        }

        if let Some(clock) = clock {
            let downloader = Arc::clone(&self.downloader);
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                clock_task(clock, downloader, &mut shutdown).await;
            });
        }

        Ok(SessionHandle {
            events: events_rx,
            playlist: self.playlist,
            commands,
            shutdown: shutdown_tx,
            qos_earliest_ns,
        })
    }
}

impl SessionHandle {
    pub fn playlist(&self) -> SharedPlaylist {
        Arc::clone(&self.playlist)
    }

    /// Flush-seek every track to the given position.
    pub async fn seek(
        &self,
        position: Duration,
        direction: Direction,
        flags: SeekFlags,
        rate: f64,
    ) {
        for tx in &self.commands {
            let _ = tx
                .send(TrackCommand::Seek { position, direction, flags, rate })
                .await;
        }
    }

    /// Downstream QoS feedback: the earliest running time the sink still
    /// needs. Trick mode uses it to stay just ahead of playback.
    pub fn report_qos_earliest(&self, running_time: Duration) {
        self.qos_earliest_ns
            .store(running_time.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Stop all tasks.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for tx in &self.commands {
            let _ = tx.send(TrackCommand::Stop).await;
        }
    }
}

async fn clock_task(
    clock: Arc<ClockDrift>,
    downloader: Arc<dyn UriDownloader>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        let interval = match clock.poll(downloader.as_ref()).await {
            Ok(()) => SLOW_CLOCK_UPDATE_INTERVAL,
            Err(e) => {
                warn!(error = %e, "clock drift sample failed");
                FAST_CLOCK_UPDATE_INTERVAL
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn refresh_task(
    playlist: SharedPlaylist,
    downloader: Arc<dyn UriDownloader>,
    clock: Option<Arc<ClockDrift>>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut pacer = RefreshPacer::new();
    loop {
        let (interval, uri) = {
            let p = playlist.read().unwrap();
            (pacer.next_interval(&p), p.manifest_uri.clone())
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        let request = DownloadRequest::new(uri.clone()).with_refresh(true);
        match fetch_bytes(downloader.as_ref(), request).await {
            Ok((meta, body)) => {
                let mut p = playlist.write().unwrap();
                if meta.is_permanent_redirect && meta.final_uri != p.base_uri {
                    debug!(new_base = %meta.final_uri, "manifest moved permanently");
                    p.base_uri = meta.final_uri.clone();
                }
                match p.update_from(&body) {
                    Ok(_) => {
                        pacer.succeeded();
                        // The availability window follows the clock even
                        // when the manifest bytes did not change.
                        let now = clock
                            .as_ref()
                            .map(|c| c.server_now())
                            .unwrap_or_else(chrono::Utc::now);
                        live::update_template_windows(&mut p, now);
                    }
                    Err(StreamError::Inconsistent(reason)) => {
                        // Keep the old playlist and retry quickly.
                        warn!(%reason, "rejected inconsistent manifest refresh");
                        pacer.failed();
                    }
                    Err(e) => {
                        warn!(error = %e, "manifest refresh failed to parse");
                        pacer.failed();
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "manifest refresh download failed");
                pacer.failed();
            }
        }
    }
}

/// What the typefound container turned out to be, deciding which parser the
/// payload is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Isobmff,
    MpegTs,
    /// Raw AAC with Apple ID3 timestamp tags.
    Id3Aac,
    Other,
}

fn container_from_caps(caps: &MediaCaps) -> Container {
    match caps.media_type.as_str() {
        "video/quicktime" | "video/mp4" | "audio/mp4" | "application/mp4" => Container::Isobmff,
        "video/mp2t" | "video/mpegts" => Container::MpegTs,
        "audio/aac" | "audio/x-aac" | "application/x-id3" => Container::Id3Aac,
        _ => Container::Other,
    }
}

/// Keyframe-only playback state, latched per representation.
#[derive(Debug, Default)]
struct TrickmodeState {
    /// Requested by the current seek.
    active: bool,
    /// Set when a fragment disqualified keyframe-only mode; cleared on the
    /// next representation switch.
    disabled: bool,
    play_rate: f64,
    average_skip: Duration,
    /// Whether the first sync sample of recent fragments directly followed
    /// the moof, which lets the initial chunked request double as the
    /// keyframe request.
    first_sync_after_moof: bool,
}

impl TrickmodeState {
    fn engaged(&self) -> bool {
        self.active && !self.disabled
    }
}

/// Runtime sidx state for a single-file representation.
struct SidxState {
    /// File offset that sidx entry offsets are relative to.
    anchor: u64,
    sidx: Sidx,
    entry: usize,
}

enum Flow {
    Continue,
    Stop,
}

struct StreamTask {
    stream_id: String,
    kind: MediaKind,
    playlist: SharedPlaylist,
    downloader: Arc<dyn UriDownloader>,
    typefind: TypefindState,
    pipeline: FragmentPipeline,
    key_cache: Arc<KeyCache>,
    clock: Option<Arc<ClockDrift>>,
    config: SessionConfig,
    adapter: BitrateAdapter,
    cursor: TrackCursor,
    events: mpsc::Sender<SessionEvent>,
    commands: mpsc::Receiver<TrackCommand>,
    shutdown: watch::Receiver<bool>,
    qos_earliest_ns: Arc<AtomicU64>,

    boxparser: FragmentParser,
    ts_reader: TsReader,
    stats: FragmentStats,
    avg_download_time: Duration,
    trick: TrickmodeState,
    sidx: Option<SidxState>,
    container: Option<Container>,
    /// Copy of the representation served last, for rematching after a
    /// master-playlist refetch drops ids.
    last_repr: Option<Representation>,
    need_header: bool,
    pending_discont: bool,
    failed_count: u32,
    pacer: RefreshPacer,
    /// Task wall clock, the basis of running time.
    started: Instant,
    /// Running time of the last emitted keyframe (trick mode).
    last_emitted_rt: Duration,
    /// Presentation position of the last emitted fragment.
    position: Duration,
}

impl StreamTask {
    #[allow(clippy::too_many_arguments)]
    fn new(
        session: &Session,
        adaptation: usize,
        stream_id: String,
        kind: MediaKind,
        events: mpsc::Sender<SessionEvent>,
        commands: mpsc::Receiver<TrackCommand>,
        shutdown: watch::Receiver<bool>,
        clock: Option<Arc<ClockDrift>>,
        qos_earliest_ns: Arc<AtomicU64>,
    ) -> StreamTask {
        let cursor = {
            let playlist = session.playlist.read().unwrap();
            let set = &playlist.periods[0].adaptations[adaptation];
            let index = set
                .representation_for_bitrate(
                    session.config.connection_speed,
                    session.config.max_video_width,
                    session.config.max_video_height,
                    session.config.max_video_framerate,
                )
                .unwrap_or(0);
            let repr = &set.representations[index];
            let mut cursor = TrackCursor::new(0, adaptation, &repr.id);
            cursor.sequence = repr.first_sequence().unwrap_or(0);
            debug!(stream = %stream_id, repr = %repr.id, "created track");
            cursor
        };
        StreamTask {
            stream_id,
            kind,
            playlist: session.playlist.clone(),
            downloader: Arc::clone(&session.downloader),
            typefind: TypefindState::new(Arc::clone(&session.typefind)),
            pipeline: FragmentPipeline::new(Arc::clone(&session.cipher)),
            key_cache: Arc::clone(&session.key_cache),
            clock,
            config: session.config.clone(),
            adapter: BitrateAdapter::new(&session.config),
            cursor,
            events,
            commands,
            shutdown,
            qos_earliest_ns,
            boxparser: FragmentParser::new(),
            ts_reader: TsReader::new(),
            stats: FragmentStats::default(),
            avg_download_time: INITIAL_AVG_DOWNLOAD_TIME,
            trick: TrickmodeState::default(),
            sidx: None,
            container: None,
            last_repr: None,
            need_header: true,
            pending_discont: true,
            failed_count: 0,
            pacer: RefreshPacer::new(),
            started: Instant::now(),
            last_emitted_rt: Duration::ZERO,
            position: Duration::ZERO,
        }
    }

    async fn emit(&mut self, event: TrackEvent) -> Flow {
        let wrapped = SessionEvent { stream_id: self.stream_id.clone(), event };
        if self.events.send(wrapped).await.is_err() {
            // The host dropped the receiver; nothing left to do.
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    async fn fatal(&mut self, e: StreamError) {
        error!(stream = %self.stream_id, error = %e, "fatal track error");
        let event = ErrorEvent::from_error(&e).with_debug(format!("track {}", self.stream_id));
        let _ = self.emit(TrackEvent::Error(event)).await;
    }

    fn current_representation(&self) -> Option<Representation> {
        let playlist = self.playlist.read().unwrap();
        playlist
            .periods
            .get(self.cursor.period)?
            .adaptations
            .get(self.cursor.adaptation)?
            .find_representation(&self.cursor.representation_id)
            .cloned()
    }

    fn running_now(&self) -> Duration {
        let wall = self.started.elapsed();
        let qos = Duration::from_nanos(self.qos_earliest_ns.load(Ordering::Relaxed));
        cmp::max(wall, qos)
    }

    /// Drain pending commands without blocking. Returns false on stop.
    fn poll_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(TrackCommand::Stop) => return false,
                Ok(TrackCommand::Seek { position, direction, flags, rate }) => {
                    self.apply_seek(position, direction, flags, rate);
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn apply_seek(
        &mut self,
        position: Duration,
        direction: Direction,
        flags: SeekFlags,
        rate: f64,
    ) {
        let seek_result = {
            let playlist = self.playlist.read().unwrap();
            self.cursor.seek(&playlist, direction, flags, position)
        };
        match seek_result {
            Ok((sequence, snapped)) => {
                info!(
                    stream = %self.stream_id,
                    ?position,
                    sequence,
                    ?snapped,
                    key_unit = flags.key_unit,
                    "seek"
                );
                self.position = snapped;
            }
            Err(e) => {
                warn!(stream = %self.stream_id, error = %e, "seek failed");
                return;
            }
        }
        // Flush: abandon the fragment in flight and every parser state.
        self.pipeline.reset();
        self.boxparser.reset();
        self.pending_discont = true;
        self.trick.active = flags.key_unit;
        self.trick.play_rate = if rate == 0.0 { 1.0 } else { rate };
        if let Some(sidx_state) = &mut self.sidx {
            let ts = crate::duration_to_scaled(position, sidx_state.sidx.timescale);
            sidx_state.entry = sidx_state.sidx.entry_for_time(ts).unwrap_or(0);
        }
    }

    async fn run(mut self) {
        // Announce the track: tags and protection first, caps once known.
        let (language, protections) = {
            let playlist = self.playlist.read().unwrap();
            let set = &playlist.periods[self.cursor.period].adaptations[self.cursor.adaptation];
            (set.language.clone(), set.content_protection.clone())
        };
        for p in protections {
            if matches!(
                self.emit(TrackEvent::Protection { scheme_id: p.scheme_id, data: p.data })
                    .await,
                Flow::Stop
            ) {
                return;
            }
        }
        if language.is_some() {
            let tags = TagList { language, title: None };
            if matches!(self.emit(TrackEvent::Tags(tags)).await, Flow::Stop) {
                return;
            }
        }

        if let Err(e) = self.prepare_initial_position().await {
            self.fatal(e).await;
            return;
        }

        loop {
            if !self.poll_commands() {
                return;
            }
            if *self.shutdown.borrow() {
                return;
            }
            match self.iteration().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return,
                Err(e) => {
                    if self.recoverable(&e) {
                        self.failed_count += 1;
                        if self.failed_count >= MAX_FRAGMENT_FAILURES {
                            self.fatal(StreamError::ResourceNotFound(format!(
                                "giving up after {} fragment failures: {e}",
                                self.failed_count
                            )))
                            .await;
                            return;
                        }
                        let wait = {
                            let playlist = self.playlist.read().unwrap();
                            self.pacer.next_interval(&playlist)
                        };
                        warn!(
                            stream = %self.stream_id,
                            error = %e,
                            failures = self.failed_count,
                            retry_in = ?wait,
                            "fragment failed, will retry"
                        );
                        if !self.sleep_interruptible(wait).await {
                            return;
                        }
                    } else {
                        self.fatal(e).await;
                        return;
                    }
                }
            }
        }
    }

    fn recoverable(&self, e: &StreamError) -> bool {
        matches!(
            e,
            StreamError::Network(_)
                | StreamError::ResourceNotFound(_)
                | StreamError::KeyFetchFailed(_)
        )
    }

    /// Sleep, returning early (false) on stop.
    async fn sleep_interruptible(&mut self, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = self.shutdown.changed() => false,
            cmd = self.commands.recv() => match cmd {
                Some(TrackCommand::Stop) | None => false,
                Some(TrackCommand::Seek { position, direction, flags, rate }) => {
                    self.apply_seek(position, direction, flags, rate);
                    true
                }
            },
        }
    }

    /// Load the media playlist of an HLS representation when missing, and
    /// position live playback behind the live edge.
    async fn prepare_initial_position(&mut self) -> Result<(), StreamError> {
        self.ensure_media_playlist().await?;
        let (is_live, initial) = {
            let playlist = self.playlist.read().unwrap();
            let Some((pi, ai, ri)) =
                playlist.find_representation(&self.cursor.representation_id)
            else {
                return Err(StreamError::InternalBug(format!(
                    "initial representation {} missing",
                    self.cursor.representation_id
                )));
            };
            let repr = &playlist.periods[pi].adaptations[ai].representations[ri];
            let compensation = self.clock.as_ref().map(|c| c.compensation_us()).unwrap_or(0);
            (
                playlist.is_live,
                live::initial_live_position(
                    &playlist,
                    repr,
                    self.config.presentation_delay,
                    compensation,
                ),
            )
        };
        if is_live {
            if let Some(position) = initial {
                let (sequence, snapped) = {
                    let playlist = self.playlist.read().unwrap();
                    self.cursor.seek(
                        &playlist,
                        Direction::Forward,
                        SeekFlags::default(),
                        position,
                    )?
                };
                debug!(
                    stream = %self.stream_id,
                    ?position,
                    sequence,
                    ?snapped,
                    "positioned behind live edge"
                );
                self.position = snapped;
            }
        } else {
            let playlist = self.playlist.read().unwrap();
            if let Some(seg) = self.cursor.current_fragment(&playlist) {
                self.position = seg.pts;
            }
        }
        Ok(())
    }

    /// Fetch and apply the child media playlist when the active (HLS)
    /// representation has none loaded yet.
    async fn ensure_media_playlist(&mut self) -> Result<(), StreamError> {
        let needed = {
            let playlist = self.playlist.read().unwrap();
            playlist
                .find_representation(&self.cursor.representation_id)
                .and_then(|(pi, ai, ri)| {
                    let r = &playlist.periods[pi].adaptations[ai].representations[ri];
                    match (&r.playlist_uri, &r.index) {
                        (Some(uri), crate::SegmentIndex::List(segs)) if segs.is_empty() => {
                            Some(uri.clone())
                        }
                        _ => None,
                    }
                })
        };
        let Some(uri) = needed else { return Ok(()) };
        self.refresh_media_playlist(&uri).await
    }

    async fn refresh_media_playlist(&mut self, uri: &Url) -> Result<(), StreamError> {
        let request = DownloadRequest::new(uri.clone()).with_refresh(true);
        let (meta, body) = fetch_bytes(self.downloader.as_ref(), request).await?;
        let text = std::str::from_utf8(&body)
            .map_err(|e| StreamError::InvalidEncoding(e.to_string()))?;
        let mut playlist = self.playlist.write().unwrap();
        if meta.is_permanent_redirect {
            // Only a permanent redirect re-anchors relative segment URIs.
            if let Ok(stripped) = meta.final_uri.join(".") {
                playlist.base_uri = stripped;
            }
        }
        hls::update_media_playlist(&mut playlist, &self.cursor.representation_id, text)?;
        Ok(())
    }

    /// One pass of the scheduler loop: at most one fragment downloaded.
    async fn iteration(&mut self) -> Result<Flow, StreamError> {
        let Some(repr) = self.current_representation() else {
            return self.handle_missing_representation().await;
        };
        self.last_repr = Some(repr.clone());

        if self.need_header {
            if let Some(header) = repr.header.clone() {
                if let Flow::Stop = self.fetch_header(&repr, header).await? {
                    return Ok(Flow::Stop);
                }
            }
            self.need_header = false;
        }

        // Establish the sidx table before the first sub-fragment request.
        if repr.uses_sidx() && self.sidx.is_none() {
            self.fetch_sidx(&repr).await?;
            return Ok(Flow::Continue);
        }

        let fragment = {
            let playlist = self.playlist.read().unwrap();
            self.cursor.current_fragment(&playlist)
        };
        let Some(fragment) = fragment else {
            return self.handle_eos().await;
        };

        if self.trick.engaged()
            && self.container == Some(Container::Isobmff)
            && fragment.key.is_none()
        {
            self.fetch_fragment_trickmode(&repr, &fragment).await
        } else {
            self.fetch_fragment(&repr, &fragment).await
        }
    }

    /// The representation vanished (master playlist refresh): refetch the
    /// master once and rematch by id, then by properties.
    async fn handle_missing_representation(&mut self) -> Result<Flow, StreamError> {
        let (manifest_uri, flavor) = {
            let playlist = self.playlist.read().unwrap();
            (playlist.manifest_uri.clone(), playlist.flavor)
        };
        let Some(old) = self.last_repr.clone() else {
            return Err(StreamError::InternalBug(format!(
                "representation {} never resolved",
                self.cursor.representation_id
            )));
        };
        if flavor != ManifestFlavor::Hls {
            return Err(StreamError::NotAVariant(format!(
                "representation {} no longer in manifest",
                self.cursor.representation_id
            )));
        }
        warn!(
            stream = %self.stream_id,
            repr = %self.cursor.representation_id,
            "representation missing, refetching master playlist"
        );
        let request = DownloadRequest::new(manifest_uri).with_refresh(true);
        let (_, body) = fetch_bytes(self.downloader.as_ref(), request).await?;
        {
            let mut playlist = self.playlist.write().unwrap();
            let base = playlist.base_uri.clone();
            let uri = playlist.manifest_uri.clone();
            *playlist = crate::parse(&body, ManifestFlavor::Hls, &uri, &base)?;
        }
        let rematched = {
            let playlist = self.playlist.read().unwrap();
            live::rematch_representation(&playlist, &old).map(|(pi, ai, ri)| {
                (pi, ai, playlist.periods[pi].adaptations[ai].representations[ri].id.clone())
            })
        };
        match rematched {
            Some((pi, ai, id)) => {
                self.cursor.period = pi;
                self.cursor.adaptation = ai;
                self.cursor.representation_id = id;
                // All per-list caches are stale now.
                self.reset_representation_state();
                self.ensure_media_playlist().await?;
                Ok(Flow::Continue)
            }
            None => Err(StreamError::NotAVariant(String::from(
                "no representation matches after master refresh",
            ))),
        }
    }

    /// EOS from the cursor: live waits for the window to move, VOD tries the
    /// next period, then ends the stream.
    async fn handle_eos(&mut self) -> Result<Flow, StreamError> {
        let (is_live, has_next_period) = {
            let playlist = self.playlist.read().unwrap();
            (playlist.is_live, self.cursor.period + 1 < playlist.periods.len())
        };
        if is_live {
            let wait = {
                let playlist = self.playlist.read().unwrap();
                let target = playlist
                    .target_duration()
                    .unwrap_or(Duration::from_secs(5));
                cmp::min(target, self.pacer.next_interval(&playlist))
            };
            trace!(stream = %self.stream_id, ?wait, "at live edge, waiting");
            if !self.sleep_interruptible(wait).await {
                return Ok(Flow::Stop);
            }
            // HLS tracks refresh their own media playlist; DASH/MSS windows
            // move via the session refresh task.
            let uri = {
                let playlist = self.playlist.read().unwrap();
                playlist
                    .find_representation(&self.cursor.representation_id)
                    .and_then(|(pi, ai, ri)| {
                        playlist.periods[pi].adaptations[ai].representations[ri]
                            .playlist_uri
                            .clone()
                    })
            };
            if let Some(uri) = uri {
                match self.refresh_media_playlist(&uri).await {
                    Ok(()) => self.pacer.succeeded(),
                    Err(StreamError::Inconsistent(reason)) => {
                        warn!(
                            stream = %self.stream_id,
                            %reason,
                            "inconsistent refresh, keeping previous playlist"
                        );
                        self.pacer.failed();
                    }
                    Err(e) => {
                        warn!(stream = %self.stream_id, error = %e, "media playlist refresh");
                        self.pacer.failed();
                    }
                }
            }
            {
                let playlist = self.playlist.read().unwrap();
                let _ = live::realign_cursor(&playlist, &mut self.cursor, self.position);
            }
            return Ok(Flow::Continue);
        }
        if has_next_period {
            return self.enter_next_period().await;
        }
        info!(stream = %self.stream_id, "end of stream");
        let _ = self.emit(TrackEvent::EndOfStream).await;
        Ok(Flow::Stop)
    }

    async fn enter_next_period(&mut self) -> Result<Flow, StreamError> {
        let next = self.cursor.period + 1;
        let found = {
            let playlist = self.playlist.read().unwrap();
            playlist.periods.get(next).and_then(|period| {
                period
                    .adaptations
                    .iter()
                    .enumerate()
                    .find(|(_, a)| a.kind == self.kind)
                    .map(|(ai, a)| {
                        let index = a
                            .representation_for_bitrate(
                                self.adapter.measured_bitrate(),
                                self.config.max_video_width,
                                self.config.max_video_height,
                                self.config.max_video_framerate,
                            )
                            .unwrap_or(0);
                        let repr = &a.representations[index];
                        (ai, repr.id.clone(), repr.first_sequence().unwrap_or(0))
                    })
            })
        };
        let Some((ai, repr_id, first_seq)) = found else {
            info!(stream = %self.stream_id, "no matching track in next period, ending");
            let _ = self.emit(TrackEvent::EndOfStream).await;
            return Ok(Flow::Stop);
        };
        info!(
            stream = %self.stream_id,
            period = next,
            repr = %repr_id,
            "entering next period"
        );
        self.cursor.period = next;
        self.cursor.adaptation = ai;
        self.cursor.representation_id = repr_id;
        self.cursor.sequence = first_seq;
        self.reset_representation_state();
        self.ensure_media_playlist().await?;
        Ok(Flow::Continue)
    }

    /// Forget everything tied to the previous representation: caps, parser
    /// state, sidx table, trick-mode latch.
    fn reset_representation_state(&mut self) {
        self.typefind.reset();
        self.container = None;
        self.boxparser.reset();
        self.pipeline.reset();
        self.sidx = None;
        self.trick.disabled = false;
        self.need_header = true;
        self.pending_discont = true;
        self.ts_reader.set_mode(TsReaderMode::MpegTs);
    }

    async fn fetch_header(
        &mut self,
        repr: &Representation,
        header: InitHeader,
    ) -> Result<Flow, StreamError> {
        let Some(uri) = header.uri else {
            return Ok(Flow::Continue);
        };
        debug!(stream = %self.stream_id, %uri, range = ?header.range, "fetching header");
        let request = DownloadRequest::new(uri)
            .with_range(header.range.map(RequestRange::from))
            .with_allow_cache(repr.allow_cache);
        let (_, body) = fetch_bytes(self.downloader.as_ref(), request).await?;
        match self.push_typefind(body).await? {
            None => Ok(Flow::Continue),
            Some((Flow::Stop, _)) => Ok(Flow::Stop),
            Some((Flow::Continue, payload)) => {
                let buffer = MediaBuffer {
                    data: payload.clone(),
                    pts: None,
                    duration: None,
                    offset: 0,
                    offset_end: payload.len() as u64,
                    discont: std::mem::take(&mut self.pending_discont),
                };
                Ok(self.emit(TrackEvent::Buffer(buffer)).await)
            }
        }
    }

    /// Feed typefind. Returns None while detection is still buffering (the
    /// data is retained inside the typefinder); otherwise the payload to
    /// forward, which on the detection transition includes everything
    /// buffered so far.
    async fn push_typefind(
        &mut self,
        data: Bytes,
    ) -> Result<Option<(Flow, Bytes)>, StreamError> {
        if self.container.is_some() {
            return Ok(Some((Flow::Continue, data)));
        }
        match self.typefind.push(data)? {
            TypefindProgress::NeedMore => Ok(None),
            TypefindProgress::Ready(mut caps, buffered) => {
                let container = container_from_caps(&caps);
                self.container = Some(container);
                self.ts_reader.set_mode(match container {
                    Container::Id3Aac => TsReaderMode::Id3,
                    _ => TsReaderMode::MpegTs,
                });
                // Enrich caps with what the manifest knows.
                if let Some(repr) = self.current_representation() {
                    caps.codecs = repr.codecs.clone();
                    caps.width = repr.width;
                    caps.height = repr.height;
                    caps.framerate = repr.framerate;
                }
                info!(stream = %self.stream_id, caps = %caps, "stream type established");
                let flow = self.emit(TrackEvent::Caps(caps)).await;
                Ok(Some((flow, buffered)))
            }
        }
    }

    /// Initial sidx fetch for a single-file representation: download the
    /// index range (or a leading probe window), parse the sidx, and record
    /// the sub-fragment table.
    async fn fetch_sidx(&mut self, repr: &Representation) -> Result<(), StreamError> {
        let crate::SegmentIndex::Sidx(sidx_index) = &repr.index else {
            return Err(StreamError::InternalBug(String::from(
                "fetch_sidx on non-sidx representation",
            )));
        };
        let range = match sidx_index.index_range {
            Some(r) => RequestRange::from(r),
            None => RequestRange::new(0, Some(SIDX_PROBE_BYTES - 1)),
        };
        debug!(stream = %self.stream_id, uri = %sidx_index.uri, ?range, "fetching sidx");
        let request = DownloadRequest::new(sidx_index.uri.clone())
            .with_range(Some(range))
            .with_allow_cache(repr.allow_cache);
        let (_, body) = fetch_bytes(self.downloader.as_ref(), request).await?;
        self.boxparser.reset_at(range.start);
        let events = self.boxparser.push(&body)?;
        self.boxparser.reset();
        for event in events {
            if let ParserEvent::SidxReady { sidx, anchor } = event {
                let entry = {
                    let ts = crate::duration_to_scaled(self.position, sidx.timescale);
                    sidx.entry_for_time(ts).unwrap_or(0)
                };
                debug!(
                    stream = %self.stream_id,
                    entries = sidx.entries.len(),
                    entry,
                    "sidx table established"
                );
                self.sidx = Some(SidxState { anchor, sidx, entry });
                return Ok(());
            }
        }
        Err(StreamError::Parsing(String::from(
            "no sidx found in representation index range",
        )))
    }

    /// The byte range to request for a fragment in normal playback.
    fn fragment_range(&self, fragment: &Segment) -> Option<RequestRange> {
        if let Some(state) = &self.sidx {
            let entry = state.sidx.entries.get(state.entry).filter(|e| e.size > 0)?;
            let start = state.anchor + entry.offset;
            return Some(RequestRange::new(start, Some(start + entry.size - 1)));
        }
        fragment.range.map(RequestRange::from)
    }

    async fn fetch_fragment(
        &mut self,
        repr: &Representation,
        fragment: &Segment,
    ) -> Result<Flow, StreamError> {
        let cipher_params = match &fragment.key {
            Some(key) => {
                let raw = self
                    .key_cache
                    .get(
                        self.downloader.as_ref(),
                        &key.uri,
                        Some(&fragment.uri),
                        repr.allow_cache,
                    )
                    .await?;
                Some((raw, key.effective_iv(fragment.sequence)))
            }
            None => None,
        };
        self.pipeline.start_fragment(cipher_params);
        self.ts_reader.start_fragment();
        self.boxparser.reset();
        // Sub-fragment stepping: anchor the parser and narrow the emitted
        // timing to the current sidx entry.
        let mut fragment = fragment.clone();
        if let Some(state) = &self.sidx {
            if let Some(entry) = state.sidx.entries.get(state.entry) {
                self.boxparser.reset_at(state.anchor + entry.offset);
                fragment.pts = scaled_duration(entry.pts, state.sidx.timescale);
                fragment.duration = scaled_duration(entry.duration, state.sidx.timescale);
            }
        }
        let fragment = &fragment;

        let range = self.fragment_range(fragment);
        let request = DownloadRequest::new(fragment.uri.clone())
            .with_range(range)
            .with_allow_cache(repr.allow_cache);
        trace!(
            stream = %self.stream_id,
            uri = %fragment.uri,
            sequence = fragment.sequence,
            ?range,
            "fetching fragment"
        );
        let started = Instant::now();
        let response = self.downloader.fetch(request).await?;
        let mut body = response.body;
        let mut total_bytes: u64 = 0;
        let mut emitted_offset: u64 = 0;
        let mut first_buffer = true;
        // Plaintext bytes of this fragment held inside the typefinder, used
        // to split any earlier header bytes back out on the detection
        // transition (the box parser is anchored on the fragment).
        let mut fragment_fed: usize = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(TrackCommand::Stop) | None => return Ok(Flow::Stop),
                        Some(TrackCommand::Seek { position, direction, flags, rate }) => {
                            // Cancel the transfer by dropping the stream.
                            drop(body);
                            self.apply_seek(position, direction, flags, rate);
                            return Ok(Flow::Continue);
                        }
                    }
                }
                _ = self.shutdown.changed() => return Ok(Flow::Stop),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            total_bytes += chunk.len() as u64;
            let plaintext = self.pipeline.push(&chunk)?;
            if plaintext.is_empty() {
                continue;
            }
            let fed_with_chunk = fragment_fed + plaintext.len();
            let outgoing = match self.push_typefind(plaintext).await? {
                None => {
                    fragment_fed = fed_with_chunk;
                    continue;
                }
                Some((Flow::Stop, _)) => return Ok(Flow::Stop),
                Some((Flow::Continue, payload)) => payload,
            };
            let outgoing = match self
                .split_off_header_prefix(outgoing, fed_with_chunk)
                .await?
            {
                Some(rest) => rest,
                None => return Ok(Flow::Stop),
            };
            if let Flow::Stop = self
                .route_payload(fragment, outgoing, &mut emitted_offset, &mut first_buffer)
                .await?
            {
                return Ok(Flow::Stop);
            }
            fragment_fed = 0;
        }

        // Fragment complete: flush the withheld cipher block (stripping the
        // PKCS#7 padding), then anything the typefinder still holds.
        let tail = self.pipeline.finish()?;
        if !tail.is_empty() {
            let fed_with_chunk = fragment_fed + tail.len();
            match self.push_typefind(tail).await? {
                None => fragment_fed = fed_with_chunk,
                Some((Flow::Stop, _)) => return Ok(Flow::Stop),
                Some((Flow::Continue, payload)) => {
                    let payload = match self
                        .split_off_header_prefix(payload, fed_with_chunk)
                        .await?
                    {
                        Some(rest) => rest,
                        None => return Ok(Flow::Stop),
                    };
                    if let Flow::Stop = self
                        .route_payload(fragment, payload, &mut emitted_offset, &mut first_buffer)
                        .await?
                    {
                        return Ok(Flow::Stop);
                    }
                    fragment_fed = 0;
                }
            }
        }
        if self.container.is_none() {
            match self.typefind.finish()? {
                TypefindProgress::Ready(caps, buffered) => {
                    let container = container_from_caps(&caps);
                    self.container = Some(container);
                    if let Flow::Stop = self.emit(TrackEvent::Caps(caps)).await {
                        return Ok(Flow::Stop);
                    }
                    if !buffered.is_empty() {
                        let buffered = match self
                            .split_off_header_prefix(buffered, fragment_fed)
                            .await?
                        {
                            Some(rest) => rest,
                            None => return Ok(Flow::Stop),
                        };
                        if let Flow::Stop = self
                            .route_payload(
                                fragment,
                                buffered,
                                &mut emitted_offset,
                                &mut first_buffer,
                            )
                            .await?
                        {
                            return Ok(Flow::Stop);
                        }
                    }
                }
                TypefindProgress::NeedMore => {}
            }
        }

        let elapsed = started.elapsed();
        self.adapter.record_download(total_bytes, elapsed);
        self.record_download_time(elapsed);
        self.failed_count = 0;
        self.position = fragment.end_pts();
        self.last_emitted_rt = self.started.elapsed();

        self.after_fragment(repr).await
    }

    /// On the typefind detection transition the returned payload holds
    /// everything buffered, which may include bytes of the representation
    /// header fetched before this fragment. Those are forwarded as-is (the
    /// box parser is anchored on the fragment) and the fragment's own bytes
    /// are returned for parsing. None means the host is gone.
    async fn split_off_header_prefix(
        &mut self,
        payload: Bytes,
        fragment_bytes: usize,
    ) -> Result<Option<Bytes>, StreamError> {
        if payload.len() <= fragment_bytes {
            return Ok(Some(payload));
        }
        let split = payload.len() - fragment_bytes;
        let prefix = payload.slice(..split);
        let buffer = MediaBuffer {
            data: prefix.clone(),
            pts: None,
            duration: None,
            offset: 0,
            offset_end: prefix.len() as u64,
            discont: std::mem::take(&mut self.pending_discont),
        };
        if matches!(self.emit(TrackEvent::Buffer(buffer)).await, Flow::Stop) {
            return Ok(None);
        }
        Ok(Some(payload.slice(split..)))
    }

    /// Dispatch plaintext fragment payload: observe it with the
    /// container-specific parser (which drives sidx tables, sync-sample
    /// tables and live look-ahead), then emit it to the host. Only the ID3
    /// mode rewrites the payload (stripping the leading tag).
    async fn route_payload(
        &mut self,
        fragment: &Segment,
        data: Bytes,
        emitted_offset: &mut u64,
        first_buffer: &mut bool,
    ) -> Result<Flow, StreamError> {
        let container = self.container.unwrap_or(Container::Other);
        match container {
            Container::Isobmff => {
                let events = self.boxparser.push(&data)?;
                for event in events {
                    match event {
                        ParserEvent::SidxReady { sidx, anchor } => {
                            // Discovered mid-stream (no indexRange declared):
                            // adopt the table for subsequent requests.
                            if self.sidx.is_none() {
                                self.sidx = Some(SidxState { anchor, sidx, entry: 0 });
                            }
                        }
                        ParserEvent::MoofReady { moof, offset, size, sync_samples } => {
                            self.stats.record_moof(size);
                            match &sync_samples {
                                Some(samples) => {
                                    self.stats
                                        .record_sync_samples(samples, self.repr_timescale());
                                    self.trick.first_sync_after_moof = samples
                                        .first()
                                        .is_some_and(|s| s.start_offset == offset + size);
                                }
                                None => {
                                    if self.trick.engaged() {
                                        debug!(
                                            stream = %self.stream_id,
                                            "fragment disqualifies keyframe trick mode"
                                        );
                                    }
                                    self.trick.disabled = true;
                                }
                            }
                            // Live Smooth fragments carry their own timing.
                            let look_ahead: Vec<(u64, u64)> = moof
                                .trafs
                                .iter()
                                .filter_map(|t| t.tfrf.as_ref())
                                .flat_map(|t| t.entries.iter().copied())
                                .collect();
                            if !look_ahead.is_empty() {
                                let mut playlist = self.playlist.write().unwrap();
                                live::apply_look_ahead(
                                    &mut playlist,
                                    &self.cursor.representation_id,
                                    &look_ahead,
                                );
                            }
                        }
                        ParserEvent::MdatData(_) | ParserEvent::MdatEnd => {}
                    }
                }
                Ok(self
                    .emit_media(fragment, data, emitted_offset, first_buffer)
                    .await)
            }
            Container::MpegTs | Container::Id3Aac => {
                let (payload, _) = self.ts_reader.find_pcrs(data);
                if payload.is_empty() {
                    return Ok(Flow::Continue);
                }
                Ok(self
                    .emit_media(fragment, payload, emitted_offset, first_buffer)
                    .await)
            }
            Container::Other => Ok(self
                .emit_media(fragment, data, emitted_offset, first_buffer)
                .await),
        }
    }

    async fn emit_media(
        &mut self,
        fragment: &Segment,
        data: Bytes,
        emitted_offset: &mut u64,
        first_buffer: &mut bool,
    ) -> Flow {
        let offset = *emitted_offset;
        *emitted_offset += data.len() as u64;
        let pts = if *first_buffer {
            // An MPEG-TS or ID3 timestamp, when present, anchors the
            // fragment more precisely than the playlist does.
            Some(self.ts_reader.first_pcr().unwrap_or(fragment.pts))
        } else {
            None
        };
        let buffer = MediaBuffer {
            data,
            pts,
            duration: if *first_buffer { Some(fragment.duration) } else { None },
            offset,
            offset_end: *emitted_offset,
            discont: *first_buffer && std::mem::take(&mut self.pending_discont),
        };
        *first_buffer = false;
        self.emit(TrackEvent::Buffer(buffer)).await
    }

    fn repr_timescale(&self) -> u64 {
        self.last_repr.as_ref().map(|r| r.timescale).unwrap_or(1)
    }

    fn record_download_time(&mut self, elapsed: Duration) {
        self.avg_download_time = if self.avg_download_time.is_zero() {
            elapsed
        } else {
            (3 * self.avg_download_time + elapsed) / 4
        };
    }

    /// Post-fragment bookkeeping shared by normal and trick mode: bitrate
    /// adaptation, then cursor advance.
    async fn after_fragment(&mut self, repr: &Representation) -> Result<Flow, StreamError> {
        // Bitrate adaptation. Declined switches fall one rung instead.
        let switch_target = {
            let playlist = self.playlist.read().unwrap();
            let set = &playlist.periods[self.cursor.period].adaptations[self.cursor.adaptation];
            let current_index = set
                .representations
                .iter()
                .position(|r| r.id == repr.id)
                .unwrap_or(0);
            self.adapter
                .select(set, current_index, self.trick.engaged())
                .map(|next| (current_index, next, set.representations[next].id.clone()))
        };
        if let Some((current_index, mut next_index, mut next_id)) = switch_target {
            loop {
                match self.switch_representation(&next_id).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            stream = %self.stream_id,
                            to = %next_id,
                            error = %e,
                            "representation switch declined"
                        );
                        let lower = {
                            let playlist = self.playlist.read().unwrap();
                            let set = &playlist.periods[self.cursor.period].adaptations
                                [self.cursor.adaptation];
                            self.adapter
                                .next_lower(set, next_index)
                                .map(|i| (i, set.representations[i].id.clone()))
                        };
                        match lower {
                            Some((i, id)) if i != current_index => {
                                next_index = i;
                                next_id = id;
                            }
                            _ => break,
                        }
                    }
                }
            }
            return Ok(Flow::Continue);
        }

        // Advance within the sidx table when sub-fragment stepping, else by
        // sequence.
        if let Some(state) = &mut self.sidx {
            match self.cursor.direction {
                Direction::Forward => {
                    if state.entry + 1 < state.sidx.entries.len() {
                        state.entry += 1;
                        return Ok(Flow::Continue);
                    }
                }
                Direction::Reverse => {
                    if state.entry > 0 {
                        state.entry -= 1;
                        return Ok(Flow::Continue);
                    }
                }
            }
        }
        let advance = {
            let playlist = self.playlist.read().unwrap();
            self.cursor.advance(&playlist)
        };
        if advance == Advance::Eos {
            return self.handle_eos().await;
        }
        Ok(Flow::Continue)
    }

    /// Move this track to another representation of its adaptation set.
    async fn switch_representation(&mut self, new_id: &str) -> Result<(), StreamError> {
        let (manifest_uri, bandwidth, uri_label) = {
            let playlist = self.playlist.read().unwrap();
            let set = &playlist.periods[self.cursor.period].adaptations[self.cursor.adaptation];
            let target = set.find_representation(new_id).ok_or_else(|| {
                StreamError::NotAVariant(format!("switch target {new_id} not found"))
            })?;
            (
                playlist.manifest_uri.clone(),
                target.bandwidth,
                target
                    .playlist_uri
                    .as_ref()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| target.id.clone()),
            )
        };
        let position = self.position;
        let old_id = std::mem::replace(&mut self.cursor.representation_id, new_id.to_string());
        self.reset_representation_state();
        if let Err(e) = self.ensure_media_playlist().await {
            // Roll back so the stream keeps playing the old representation.
            self.cursor.representation_id = old_id;
            self.reset_representation_state();
            self.ensure_media_playlist().await.ok();
            return Err(e);
        }
        {
            let playlist = self.playlist.read().unwrap();
            self.cursor.seek(
                &playlist,
                self.cursor.direction,
                SeekFlags::default(),
                position,
            )?;
        }
        info!(
            stream = %self.stream_id,
            from = %old_id,
            to = %new_id,
            bandwidth,
            "switched representation"
        );
        let switched = BitrateSwitch { manifest_uri, uri: uri_label, bitrate: bandwidth };
        let _ = self.emit(TrackEvent::BitrateSwitched(switched)).await;
        Ok(())
    }

    /// Keyframe-only fetch: grab the moof (chunked), pick the sync sample
    /// nearest the trick-mode target time, request exactly its byte range,
    /// then skip the cursor to the fragment containing the next target.
    async fn fetch_fragment_trickmode(
        &mut self,
        repr: &Representation,
        fragment: &Segment,
    ) -> Result<Flow, StreamError> {
        let fragment_base = fragment.range.map(|r| r.offset).unwrap_or(0);
        // Initial chunk: header plus average moof, plus the average keyframe
        // when experience says the first sync sample directly follows the
        // moof (saving a round trip on keep-alive connections).
        let mut probe_len = 1024 + self.stats.moof_avg_size.max(1024);
        if self.trick.first_sync_after_moof {
            probe_len += self.stats.keyframe_avg_size;
        }
        self.boxparser.reset_at(fragment_base);
        let request = DownloadRequest::new(fragment.uri.clone())
            .with_range(Some(RequestRange::new(
                fragment_base,
                Some(fragment_base + probe_len - 1),
            )))
            .with_allow_cache(repr.allow_cache);
        let started = Instant::now();
        let (_, probe) = fetch_bytes(self.downloader.as_ref(), request).await?;
        let mut saw_moof = false;
        let mut sync_samples: Option<Vec<SyncSample>> = None;
        let mut moof_end = fragment_base;
        for event in self.boxparser.push(&probe)? {
            match event {
                ParserEvent::MoofReady { offset, size, sync_samples: samples, .. } => {
                    saw_moof = true;
                    self.stats.record_moof(size);
                    moof_end = offset + size;
                    sync_samples = samples;
                }
                ParserEvent::SidxReady { sidx, anchor } => {
                    if self.sidx.is_none() {
                        self.sidx = Some(SidxState { anchor, sidx, entry: 0 });
                    }
                }
                _ => {}
            }
        }
        let Some(samples) = sync_samples else {
            // A parsed moof with no usable table latches trick mode off for
            // this representation; a probe too short to contain the moof
            // only falls back for this fragment.
            if saw_moof {
                debug!(stream = %self.stream_id, "no sync samples, disabling trick mode");
                self.trick.disabled = true;
            }
            self.boxparser.reset();
            return self.fetch_fragment(repr, fragment).await;
        };
        self.stats.record_sync_samples(&samples, repr.timescale);
        self.trick.first_sync_after_moof =
            samples.first().is_some_and(|s| s.start_offset == moof_end);

        // Choose the sample closest to the target time.
        let target = self.trick_target_time(fragment);
        let chosen = select_sync_sample(
            &samples,
            repr.timescale,
            fragment,
            target,
            self.cursor.direction,
        )
        .ok_or_else(|| StreamError::InternalBug(String::from("empty sync sample table")))?;

        // Reuse the probe when it already covers the sample, otherwise
        // fetch the exact byte range (the probe bytes are discarded).
        let probe_end = fragment_base + probe.len() as u64;
        let data = if chosen.start_offset == moof_end && chosen.end_offset <= probe_end {
            let from = (chosen.start_offset - fragment_base) as usize;
            let to = (chosen.end_offset - fragment_base) as usize;
            Bytes::copy_from_slice(&probe[from..to])
        } else {
            let request = DownloadRequest::new(fragment.uri.clone())
                .with_range(Some(RequestRange::new(
                    chosen.start_offset,
                    Some(chosen.end_offset - 1),
                )))
                .with_allow_cache(repr.allow_cache);
            let (_, body) = fetch_bytes(self.downloader.as_ref(), request).await?;
            body
        };
        let elapsed = started.elapsed();
        self.record_download_time(elapsed);
        self.adapter.record_download(data.len() as u64, elapsed);

        let sample_pts = sync_sample_pts(&chosen, repr.timescale, fragment, &samples);
        // The fragment metadata travels with the keyframe: downstream cannot
        // decode a bare sample without its moof.
        let moof_len = (moof_end - fragment_base) as usize;
        if moof_len > 0 && probe.len() >= moof_len {
            let moof_buffer = MediaBuffer {
                data: probe.slice(..moof_len),
                pts: None,
                duration: None,
                offset: fragment_base,
                offset_end: moof_end,
                discont: std::mem::take(&mut self.pending_discont),
            };
            if let Flow::Stop = self.emit(TrackEvent::Buffer(moof_buffer)).await {
                return Ok(Flow::Stop);
            }
        }
        let buffer = MediaBuffer {
            data,
            pts: Some(sample_pts),
            duration: Some(scaled_duration(chosen.duration as u64, repr.timescale)),
            offset: chosen.start_offset,
            offset_end: chosen.end_offset,
            discont: std::mem::take(&mut self.pending_discont),
        };
        if let Flow::Stop = self.emit(TrackEvent::Buffer(buffer)).await {
            return Ok(Flow::Stop);
        }
        self.failed_count = 0;
        self.position = sample_pts;
        self.last_emitted_rt = self.started.elapsed();

        // Skip ahead (or back) to the fragment containing the next target.
        let next_target = self.trick_target_time(fragment);
        self.advance_to_position(next_target).await
    }

    /// The next trick-mode target timestamp (spec decision table plus
    /// framerate/bitrate caps and the skip-size EMA).
    fn trick_target_time(&mut self, fragment: &Segment) -> Duration {
        let now_rt = self.running_now();
        let cur_rt = self.last_emitted_rt;
        let min_skip = self.stats.keyframe_avg_distance.max(Duration::from_millis(40));
        compute_trickmode_target(
            now_rt,
            cur_rt,
            self.position.max(fragment.pts),
            min_skip,
            self.avg_download_time,
            self.trick.play_rate,
            self.config.max_video_framerate,
            self.config.max_bitrate,
            self.stats.keyframe_avg_size,
            self.stats.keyframe_avg_distance,
            &mut self.trick.average_skip,
        )
    }

    /// Move the cursor to the fragment containing `position`, in the
    /// current direction, handling EOS.
    async fn advance_to_position(&mut self, position: Duration) -> Result<Flow, StreamError> {
        let landed = {
            let playlist = self.playlist.read().unwrap();
            self.cursor
                .seek(
                    &playlist,
                    self.cursor.direction,
                    SeekFlags { snap: SnapMode::Before, key_unit: true },
                    position,
                )
                .ok()
                .and_then(|_| self.cursor.current_fragment(&playlist))
        };
        match (landed, self.cursor.direction) {
            (None, _) => self.handle_eos().await,
            // Reverse playback has run out of content when the target lies
            // before the first segment we can land on.
            (Some(seg), Direction::Reverse) if seg.pts > position => self.handle_eos().await,
            _ => Ok(Flow::Continue),
        }
    }
}

/// Decision table for the next keyframe target:
///
/// | buffer level                    | target (running time)           |
/// |---------------------------------|---------------------------------|
/// | `< max(500ms, 3·avg_dl)`        | `max(cur, now + 3·avg_dl)`      |
/// | `< 4·avg_dl`                    | `cur + min(1s, 2·avg_dl)`       |
/// | otherwise                       | `cur + avg_dl`                  |
///
/// The running-time step scales by the playback rate into a presentation
/// step, never drops below `min_skip`, widens so the emitted keyframe rate
/// stays below the framerate and bitrate caps, and is stabilised by a
/// `(3·old + new)/4` running average of recent skips.
#[allow(clippy::too_many_arguments)]
pub fn compute_trickmode_target(
    now_rt: Duration,
    cur_rt: Duration,
    cur_position: Duration,
    min_skip: Duration,
    avg_dl: Duration,
    play_rate: f64,
    max_framerate: f64,
    max_bitrate: u64,
    kf_avg_size: u64,
    kf_avg_distance: Duration,
    average_skip: &mut Duration,
) -> Duration {
    let rate = play_rate.abs().max(0.001);
    let buffer_level = cur_rt.saturating_sub(now_rt);
    let deadline = cmp::max(Duration::from_millis(500), 3 * avg_dl);

    let target_rt = if buffer_level < deadline {
        // Downstream is about to starve: skip aggressively.
        cmp::max(cur_rt, now_rt + 3 * avg_dl)
    } else if buffer_level < 4 * avg_dl {
        cur_rt + cmp::min(Duration::from_secs(1), 2 * avg_dl)
    } else {
        cur_rt + avg_dl
    };
    let step_rt = target_rt.saturating_sub(cur_rt);
    let mut step = step_rt.mul_f64(rate).max(min_skip);

    // Never pick keyframes closer together than the emitted frame rate
    // allows. Skipping faster than 10 fps is not useful even unconfigured.
    let fps = if max_framerate > 0.0 { max_framerate } else { 10.0 };
    let min_frame_step = Duration::from_secs_f64(rate / fps);
    step = cmp::max(step, min_frame_step);

    // Keep the implied network bitrate under the cap by skipping further.
    if max_bitrate > 0 && !kf_avg_distance.is_zero() && kf_avg_size > 0 {
        let implied =
            (kf_avg_size as f64 * 8.0 * rate / kf_avg_distance.as_secs_f64()) as u64;
        if implied > max_bitrate {
            let widened =
                Duration::from_secs_f64(kf_avg_size as f64 * 8.0 * rate / max_bitrate as f64);
            step = cmp::max(step, widened);
        }
    }

    // Stabilise across fragments.
    *average_skip = if average_skip.is_zero() {
        step
    } else {
        (3 * *average_skip + step) / 4
    };
    if *average_skip > step + kf_avg_distance && *average_skip > min_skip {
        step = *average_skip;
    }

    cur_position + step
}

/// Pick the sync sample closest to `target` in the playback direction.
pub fn select_sync_sample(
    samples: &[SyncSample],
    timescale: u64,
    fragment: &Segment,
    target: Duration,
    direction: Direction,
) -> Option<SyncSample> {
    if samples.is_empty() {
        return None;
    }
    let pts_of = |i: usize| sync_sample_pts(&samples[i], timescale, fragment, samples);
    match direction {
        Direction::Forward => {
            for i in 0..samples.len() {
                if pts_of(i) >= target {
                    return Some(samples[i]);
                }
            }
            samples.last().copied()
        }
        Direction::Reverse => {
            for i in (0..samples.len()).rev() {
                if pts_of(i) <= target {
                    return Some(samples[i]);
                }
            }
            samples.first().copied()
        }
    }
}

/// Presentation timestamp of a sync sample: its tfdt-derived decode time
/// when available, otherwise an even spread across the fragment.
fn sync_sample_pts(
    sample: &SyncSample,
    timescale: u64,
    fragment: &Segment,
    samples: &[SyncSample],
) -> Duration {
    if let Some(ts) = sample.ts {
        return scaled_duration(ts, timescale);
    }
    let index = samples
        .iter()
        .position(|s| s.start_offset == sample.start_offset)
        .unwrap_or(0);
    fragment.pts + fragment.duration * index as u32 / samples.len().max(1) as u32
}

//! Playback loops
//!
//! One driver runs every kind of output. What differs between kinds is
//! composed in at construction: a renderer that turns the active tracks
//! into one buffer (software mixing, or single-track passthrough for
//! direct outputs) and a sink that buffer goes to (the hardware stream,
//! or the duplication tracks feeding other outputs).
//!
//! ```text
//!  client rings ──► prepare (locked) ──► render ──► sink
//!                     │                              ├─ hardware stream
//!                     └─ eviction, pause, reset      └─ OutputTrack × N
//! ```

use bytes::BytesMut;
use crossbeam::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::{flags, Direction, RingBuffer};
use crate::audio::device::{encode_samples, StreamOut};
use crate::audio::mixer::{AudioMixer, MixSource};
use crate::config::ServerConfig;
use crate::constants::MAX_GAIN;
use crate::error::{Error, HardwareError, Result};
use crate::params::{AudioParameters, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::protocol::{
    AudioFormat, IoConfigEvent, IoDescriptor, IoHandle, StreamType, NUM_STREAM_TYPES,
};
use crate::server::client::Client;
use crate::server::dump::try_lock_retrying;
use crate::server::listeners::ListenerRegistry;
use crate::threads::backoff::UnderrunBackoff;
use crate::threads::{priority, StatsSnapshot, ThreadBase, ThreadQueues, ThreadState, ThreadStats};
use crate::tracks::manager::{TrackArena, TrackId, TrackNames};
use crate::tracks::output::OutputTrack;
use crate::tracks::track::{FillStatus, PlaybackTrack, TrackInfo, TrackState};

/// Capability set of a playback loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Software-mixes any number of tracks into the hardware stream
    Mixer,
    /// Copies one track straight to the hardware stream
    Direct,
    /// Mixes, then fans the result out to other outputs
    Duplicating,
}

impl OutputKind {
    fn mixes(self) -> bool {
        self != OutputKind::Direct
    }

    fn label(self) -> &'static str {
        match self {
            OutputKind::Mixer => "mixer",
            OutputKind::Direct => "direct",
            OutputKind::Duplicating => "dup",
        }
    }
}

/// Gain settings a new output starts from
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSettings {
    pub master_volume: f32,
    pub master_mute: bool,
    /// `(volume, muted)` per stream type, indexed by [`StreamType::index`]
    pub streams: Vec<(f32, bool)>,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            master_volume: 1.0,
            master_mute: false,
            streams: vec![(1.0, false); NUM_STREAM_TYPES + 1],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IoParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: AudioFormat,
    pub frame_count: usize,
    pub latency_ms: u32,
}

impl IoParams {
    fn from_stream(stream: &dyn StreamOut) -> Self {
        Self {
            sample_rate: stream.sample_rate(),
            channels: stream.channels(),
            format: stream.format(),
            frame_count: stream.buffer_size() / stream.frame_size().max(1),
            latency_ms: stream.latency_ms(),
        }
    }

    fn descriptor(&self) -> IoDescriptor {
        IoDescriptor {
            sample_rate: self.sample_rate,
            format: self.format,
            channels: self.channels,
            frame_count: self.frame_count,
            latency_ms: self.latency_ms,
        }
    }

    fn frame_size(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    /// Duration of one hardware buffer
    fn period(&self) -> Duration {
        Duration::from_micros(self.frame_count as u64 * 1_000_000 / self.sample_rate.max(1) as u64)
    }

    /// Bytes a static track must see written before it may underrun out
    fn min_bytes_to_write(&self) -> u64 {
        self.latency_ms as u64 * self.sample_rate as u64 * self.frame_size() as u64 / 1000
    }
}

pub(crate) struct PlaybackState {
    queues: ThreadQueues,
    tracks: TrackArena<PlaybackTrack>,
    active: Vec<TrackId>,
    names: TrackNames,
    /// Mixer slots freed outside the loop, released by the next cycle
    released_names: Vec<usize>,
    io: IoParams,
    sinks: Vec<Arc<OutputTrack>>,
}

impl ThreadState for PlaybackState {
    fn queues(&mut self) -> &mut ThreadQueues {
        &mut self.queues
    }

    fn descriptor(&self) -> IoDescriptor {
        self.io.descriptor()
    }
}

impl PlaybackState {
    fn track_mut(&mut self, id: TrackId) -> Result<&mut PlaybackTrack> {
        self.tracks
            .get_mut(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown track {id}")))
    }

    fn is_active(&self, id: TrackId) -> bool {
        self.active.contains(&id)
    }
}

/// Loop-owned rendering strategy
enum Renderer {
    Mixing(AudioMixer),
    Passthrough { volume: Option<(f32, f32)> },
}

/// Loop-owned destination of rendered buffers
enum Sink {
    Hardware {
        stream: Arc<dyn StreamOut>,
        staging: BytesMut,
    },
    FanOut,
}

struct Engine {
    io: IoParams,
    renderer: Renderer,
    sink: Sink,
    buffer: Vec<i16>,
}

struct DirectSource {
    ring: Arc<RingBuffer>,
    volume: (f32, f32),
}

/// Outcome of one locked prepare pass
#[derive(Default)]
struct Cycle {
    sources: Vec<MixSource>,
    direct: Option<DirectSource>,
    enabled: usize,
    released: Vec<usize>,
    /// Destroyed tracks, dropped once the lock is released
    removed: Vec<PlaybackTrack>,
    sinks: Vec<Arc<OutputTrack>>,
    suspended: bool,
}

/// Output loop: mixer, direct or duplicating
pub struct PlaybackThread {
    base: ThreadBase,
    kind: OutputKind,
    /// Hardware stream; `None` for duplicating outputs
    output: Option<Arc<dyn StreamOut>>,
    config: ServerConfig,
    backoff: UnderrunBackoff,
    state: Mutex<PlaybackState>,
    work: Condvar,
    master_volume: AtomicCell<f32>,
    master_mute: AtomicBool,
    stream_volumes: Vec<AtomicCell<f32>>,
    stream_mutes: Vec<AtomicBool>,
    suspended: AtomicU32,
    bytes_since_standby: AtomicU64,
    mix_frames: AtomicUsize,
    stats: ThreadStats,
}

impl PlaybackThread {
    /// Output over a hardware stream
    pub(crate) fn new(
        handle: IoHandle,
        kind: OutputKind,
        output: Arc<dyn StreamOut>,
        config: ServerConfig,
        volumes: &VolumeSettings,
        listeners: Arc<ListenerRegistry>,
    ) -> Arc<Self> {
        let io = IoParams::from_stream(output.as_ref());
        Arc::new(Self::build(handle, kind, Some(output), io, config, volumes, listeners))
    }

    /// Duplicating output mixing at `main`'s rate and buffer size
    pub(crate) fn new_duplicating(
        handle: IoHandle,
        main: &PlaybackThread,
        config: ServerConfig,
        volumes: &VolumeSettings,
        listeners: Arc<ListenerRegistry>,
    ) -> Arc<Self> {
        let io = main.state.lock().io;
        Arc::new(Self::build(
            handle,
            OutputKind::Duplicating,
            None,
            io,
            config,
            volumes,
            listeners,
        ))
    }

    fn build(
        handle: IoHandle,
        kind: OutputKind,
        output: Option<Arc<dyn StreamOut>>,
        io: IoParams,
        config: ServerConfig,
        volumes: &VolumeSettings,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        let name = format!("audiomux-{}-{}", kind.label(), handle.0);
        let stream_at = |i: usize| volumes.streams.get(i).copied().unwrap_or((1.0, false));
        Self {
            base: ThreadBase::new(handle, name, listeners),
            kind,
            output,
            backoff: config.underrun_backoff(),
            config,
            state: Mutex::new(PlaybackState {
                queues: ThreadQueues::default(),
                tracks: TrackArena::new(),
                active: Vec::new(),
                names: TrackNames::new(),
                released_names: Vec::new(),
                io,
                sinks: Vec::new(),
            }),
            work: Condvar::new(),
            master_volume: AtomicCell::new(volumes.master_volume),
            master_mute: AtomicBool::new(volumes.master_mute),
            stream_volumes: (0..=NUM_STREAM_TYPES)
                .map(|i| AtomicCell::new(stream_at(i).0))
                .collect(),
            stream_mutes: (0..=NUM_STREAM_TYPES)
                .map(|i| AtomicBool::new(stream_at(i).1))
                .collect(),
            suspended: AtomicU32::new(0),
            bytes_since_standby: AtomicU64::new(0),
            mix_frames: AtomicUsize::new(io.frame_count),
            stats: ThreadStats::new(),
        }
    }

    /// Announce the output and start its loop
    pub(crate) fn run(self: &Arc<Self>) -> Result<()> {
        self.base
            .send_config_event(&self.state, &self.work, IoConfigEvent::OutputOpened, None);
        let thread = Arc::clone(self);
        self.base.spawn(move || thread.thread_loop())?;
        tracing::info!("{} started ({:?})", self.base.name(), self.descriptor());
        Ok(())
    }

    pub fn handle(&self) -> IoHandle {
        self.base.handle()
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn descriptor(&self) -> IoDescriptor {
        self.state.lock().io.descriptor()
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.lock().io.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.state.lock().io.channels
    }

    pub fn format(&self) -> AudioFormat {
        self.state.lock().io.format
    }

    pub fn frame_count(&self) -> usize {
        self.state.lock().io.frame_count
    }

    pub fn latency_ms(&self) -> u32 {
        self.state.lock().io.latency_ms
    }

    /// Frames in the loop's current mix buffer
    pub fn mix_buffer_frames(&self) -> usize {
        self.mix_frames.load(Ordering::Relaxed)
    }

    pub fn is_standby(&self) -> bool {
        self.stats.is_standby()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    pub fn active_track_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_track_active(&self, id: TrackId) -> bool {
        self.state.lock().is_active(id)
    }

    pub fn track_state(&self, id: TrackId) -> Option<TrackState> {
        self.state.lock().tracks.get(id).map(|t| t.state())
    }

    /// Whether a music stream is playing here
    pub fn is_music_active(&self) -> bool {
        let state = self.state.lock();
        state
            .active
            .iter()
            .filter_map(|id| state.tracks.get(*id))
            .any(|t| t.stream == StreamType::Music && !t.is_paused())
    }

    // ---- tracks ----

    /// Allocate a track. Direct outputs take only their exact
    /// configuration; mixing outputs take PCM16 mono or stereo up to twice
    /// the output rate.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_track(
        &self,
        client: Option<Arc<Client>>,
        stream: StreamType,
        sample_rate: u32,
        format: AudioFormat,
        channels: u16,
        frame_count: u32,
        static_data: Option<&[i16]>,
    ) -> Result<(TrackId, Arc<RingBuffer>)> {
        let mut state = self.state.lock();
        if self.base.exit_pending() {
            return Err(Error::NotInitialized(format!("{} is closing", self.base.name())));
        }
        let io = state.io;
        if sample_rate == 0 {
            return Err(Error::InvalidArgument("sample rate 0".into()));
        }
        if self.kind == OutputKind::Direct {
            if sample_rate != io.sample_rate || format != io.format || channels != io.channels {
                return Err(Error::InvalidArgument(format!(
                    "direct output {} needs {} Hz {:?} x{}, got {} Hz {:?} x{}",
                    self.handle(),
                    io.sample_rate,
                    io.format,
                    io.channels,
                    sample_rate,
                    format,
                    channels
                )));
            }
        } else {
            if sample_rate > io.sample_rate.saturating_mul(2) {
                return Err(Error::InvalidArgument(format!(
                    "sample rate {} above twice the output rate {}",
                    sample_rate, io.sample_rate
                )));
            }
            if format != AudioFormat::Pcm16 {
                return Err(Error::InvalidArgument(format!("mixer takes PCM16, got {format:?}")));
            }
            if !(1..=2).contains(&channels) {
                return Err(Error::InvalidArgument(format!("{channels} channels")));
            }
        }

        let heap = client.as_ref().map(|c| c.heap());
        let ring = match static_data {
            Some(samples) => RingBuffer::with_static_data(samples, sample_rate, channels, heap)?,
            None => {
                let frames = if frame_count == 0 {
                    io.frame_count as u32 * 2
                } else {
                    frame_count
                };
                RingBuffer::new(Direction::Playback, frames, sample_rate, channels, heap)?
            }
        };
        let ring = Arc::new(ring);
        let name = if self.kind.mixes() {
            Some(state.names.allocate()?)
        } else {
            None
        };

        let id = state.tracks.insert_with(|id| {
            PlaybackTrack::new(id, client, stream, format, Arc::clone(&ring), name)
        });
        tracing::debug!(
            "{}: created track {} ({} Hz x{}, {} frames)",
            self.base.name(),
            id,
            sample_rate,
            channels,
            ring.frame_count()
        );
        Ok((id, ring))
    }

    pub(crate) fn start_track(&self, id: TrackId) -> Result<()> {
        let mut state = self.state.lock();
        let in_active = state.is_active(id);
        let startup_retries = self.config.max_track_startup_retries;
        let track = state.track_mut(id)?;
        if track.is_terminated() {
            return Err(Error::InvalidOperation(format!("track {id} was destroyed")));
        }
        track.state = if track.is_paused() {
            TrackState::Resuming
        } else {
            TrackState::Active
        };
        track.ring.control().clear_flag(flags::DISABLED);
        if !in_active {
            track.fill = FillStatus::Filling;
            track.reset_done = false;
        }
        track.retry = startup_retries;
        if !in_active {
            state.active.push(id);
        }
        self.work.notify_all();
        Ok(())
    }

    pub(crate) fn stop_track(&self, id: TrackId) -> Result<()> {
        let mut state = self.state.lock();
        let in_active = state.is_active(id);
        if state.track_mut(id)?.stop(in_active) {
            self.work.notify_all();
        }
        Ok(())
    }

    pub(crate) fn pause_track(&self, id: TrackId) -> Result<()> {
        let mut state = self.state.lock();
        state.track_mut(id)?.pause();
        Ok(())
    }

    pub(crate) fn flush_track(&self, id: TrackId) -> Result<()> {
        let mut state = self.state.lock();
        state.track_mut(id)?.flush();
        Ok(())
    }

    pub(crate) fn mute_track(&self, id: TrackId, muted: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.track_mut(id)?.muted = muted;
        Ok(())
    }

    /// Terminate a track. It leaves the table now if idle, otherwise once
    /// the loop sees it inactive.
    pub(crate) fn destroy_track(&self, id: TrackId) {
        let removed = {
            let mut state = self.state.lock();
            let in_active = state.is_active(id);
            let Some(track) = state.tracks.get_mut(id) else {
                return;
            };
            track.state = TrackState::Terminated;
            if in_active {
                self.work.notify_all();
                None
            } else {
                let removed = state.tracks.remove(id);
                if let Some(name) = removed.as_ref().and_then(|t| t.name) {
                    state.names.free(name);
                    state.released_names.push(name);
                }
                removed
            }
        };
        drop(removed);
    }

    // ---- volume ----

    pub fn set_master_volume(&self, volume: f32) {
        self.master_volume.store(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume.load()
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.master_mute.store(muted, Ordering::Relaxed);
    }

    pub fn master_mute(&self) -> bool {
        self.master_mute.load(Ordering::Relaxed)
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) {
        self.stream_volumes[stream.index()].store(volume);
    }

    pub fn stream_volume(&self, stream: StreamType) -> f32 {
        self.stream_volumes[stream.index()].load()
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) {
        self.stream_mutes[stream.index()].store(muted, Ordering::Relaxed);
    }

    pub fn stream_mute(&self, stream: StreamType) -> bool {
        self.stream_mutes[stream.index()].load(Ordering::Relaxed)
    }

    // ---- suspend ----

    pub fn suspend(&self) {
        self.suspended.fetch_add(1, Ordering::AcqRel);
    }

    pub fn restore(&self) {
        let _ = self
            .suspended
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.work.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire) > 0
    }

    // ---- duplication ----

    /// Attach `target` as an extra destination of this duplicating output
    pub(crate) fn add_output_track(&self, target: &Arc<PlaybackThread>) -> Result<()> {
        if self.kind != OutputKind::Duplicating {
            return Err(Error::InvalidOperation(format!(
                "{} is not a duplicating output",
                self.base.name()
            )));
        }
        let io = self.state.lock().io;
        let sink = OutputTrack::new(
            Arc::clone(target),
            io.sample_rate,
            io.frame_count,
            self.config.max_overflow_buffers,
        )?;
        self.state.lock().sinks.push(Arc::new(sink));
        tracing::info!("{}: duplicating to {}", self.base.name(), target.name());
        Ok(())
    }

    /// Detach the sink feeding `target`; unknown targets are ignored
    pub(crate) fn remove_output_track(&self, target: IoHandle) {
        let removed: Vec<Arc<OutputTrack>> = {
            let mut state = self.state.lock();
            let (gone, kept) = std::mem::take(&mut state.sinks)
                .into_iter()
                .partition(|sink| sink.target_handle() == target);
            state.sinks = kept;
            gone
        };
        for sink in removed {
            sink.destroy();
        }
    }

    /// Outputs this duplicating output feeds
    pub fn output_targets(&self) -> Vec<IoHandle> {
        self.state
            .lock()
            .sinks
            .iter()
            .map(|s| s.target_handle())
            .collect()
    }

    // ---- parameters & events ----

    /// Apply `kv` at the loop's next checkpoint and wait for the outcome
    pub fn set_parameters(&self, kv: &str) -> Result<()> {
        self.base.request_parameters(&self.state, &self.work, kv)
    }

    pub fn get_parameters(&self, keys: &str) -> String {
        if let Some(output) = &self.output {
            return output.get_parameters(keys);
        }
        let io = self.state.lock().io;
        let mut reply = AudioParameters::new();
        for key in AudioParameters::parse(keys).keys() {
            match key {
                KEY_SAMPLING_RATE => reply.set(key, io.sample_rate),
                KEY_CHANNELS => reply.set(key, io.channels),
                KEY_FORMAT => reply.set(key, io.format.code()),
                KEY_FRAME_COUNT => reply.set(key, io.frame_count),
                _ => {}
            }
        }
        reply.to_string()
    }

    pub fn send_config_event(&self, event: IoConfigEvent, stream: Option<StreamType>) {
        self.base
            .send_config_event(&self.state, &self.work, event, stream);
    }

    /// Stop the loop and wait for it
    pub fn exit(&self) {
        tracing::info!("{} exiting", self.base.name());
        self.base.request_exit(&self.state, &[&self.work]);
        self.base.join();
    }

    // ---- loop ----

    fn thread_loop(self: Arc<Self>) {
        priority::promote_current_thread(self.base.name());
        let mut engine = self.build_engine(self.state.lock().io);
        let mut standby_deadline = Instant::now();
        let mut misses = 0u32;

        while !self.base.exit_pending() {
            self.base.process_config_events(&self.state);

            let cycle = {
                let mut state = self.state.lock();
                if self.check_for_new_parameters(&mut state) {
                    engine = self.build_engine(state.io);
                }

                let suspended = self.is_suspended();
                if (state.active.is_empty() && Instant::now() > standby_deadline) || suspended {
                    if !self.stats.is_standby() {
                        self.enter_standby(&state);
                    }
                    if state.active.is_empty() && state.queues.events.is_empty() {
                        if self.base.exit_pending() {
                            break;
                        }
                        self.work.wait(&mut state);
                        if self.config.silent_mode {
                            self.master_mute.store(true, Ordering::Relaxed);
                        }
                        standby_deadline = Instant::now() + self.config.standby_delay();
                        misses = 0;
                        continue;
                    }
                }
                let mut cycle = self.prepare_tracks(&mut state);
                cycle.suspended = suspended;
                cycle
            };

            if let Renderer::Mixing(mixer) = &mut engine.renderer {
                for name in &cycle.released {
                    mixer.release(*name);
                }
            }

            if cycle.enabled > 0 {
                self.render(&mut engine, &cycle);
                if cycle.suspended {
                    std::thread::sleep(engine.io.period());
                } else {
                    self.write(&mut engine, &cycle.sinks);
                }
                standby_deadline = Instant::now() + self.config.standby_delay();
                misses = 0;
            } else if self.flush_sinks(&cycle.sinks) {
                misses = 0;
            } else {
                std::thread::sleep(self.backoff.delay(misses));
                misses = misses.saturating_add(1);
            }

            drop(cycle);
        }

        self.on_exit();
    }

    fn build_engine(&self, io: IoParams) -> Engine {
        let (renderer, channels) = if self.kind.mixes() {
            (Renderer::Mixing(AudioMixer::new(io.frame_count, io.sample_rate)), 2)
        } else {
            (Renderer::Passthrough { volume: None }, io.channels as usize)
        };
        let sink = match (&self.output, self.kind) {
            (Some(stream), OutputKind::Mixer | OutputKind::Direct) => Sink::Hardware {
                stream: Arc::clone(stream),
                staging: BytesMut::with_capacity(io.frame_count * io.frame_size()),
            },
            _ => Sink::FanOut,
        };
        self.mix_frames.store(io.frame_count, Ordering::Relaxed);
        Engine {
            io,
            renderer,
            sink,
            buffer: vec![0; io.frame_count * channels],
        }
    }

    fn check_for_new_parameters(&self, state: &mut PlaybackState) -> bool {
        let mut reconfigured = false;
        while let Some(request) = state.queues.params.pop_front() {
            let status = self.apply_parameters(state, &request.kv);
            if let Err(e) = &status {
                tracing::debug!("{}: set_parameters({}) failed: {}", self.base.name(), request.kv, e);
            }
            reconfigured |= matches!(status, Ok(true));
            let _ = request.reply.send(status.map(|_| ()));
        }
        reconfigured
    }

    /// Returns whether the io was reconfigured
    fn apply_parameters(&self, state: &mut PlaybackState, kv: &str) -> Result<bool> {
        let output = match (&self.output, self.kind) {
            (Some(output), OutputKind::Mixer | OutputKind::Direct) => Arc::clone(output),
            _ => {
                return Err(Error::InvalidOperation(
                    "duplicating outputs take no parameters".into(),
                ))
            }
        };
        let params = AudioParameters::parse(kv);
        let has_tracks = !state.tracks.is_empty();
        let mut reconfig = false;

        if params.get_int(KEY_SAMPLING_RATE)?.is_some() {
            if has_tracks {
                return Err(Error::InvalidOperation(
                    "cannot change the sample rate while tracks exist".into(),
                ));
            }
            reconfig = true;
        }
        if let Some(code) = params.get_int(KEY_FORMAT)? {
            if self.kind == OutputKind::Mixer && AudioFormat::from_code(code) != Some(AudioFormat::Pcm16) {
                return Err(Error::InvalidArgument(format!("mixer output format {code}")));
            }
            if self.kind == OutputKind::Direct && has_tracks {
                return Err(Error::InvalidOperation(
                    "cannot change the format while tracks exist".into(),
                ));
            }
            reconfig = true;
        }
        if let Some(channels) = params.get_int(KEY_CHANNELS)? {
            if self.kind == OutputKind::Mixer && channels != 2 {
                return Err(Error::InvalidArgument(format!("mixer output channels {channels}")));
            }
            if self.kind == OutputKind::Direct && has_tracks {
                return Err(Error::InvalidOperation(
                    "cannot change the channel count while tracks exist".into(),
                ));
            }
            reconfig = true;
        }
        if params.get_int(KEY_FRAME_COUNT)?.is_some() {
            if has_tracks {
                return Err(Error::InvalidOperation(
                    "cannot change the frame count while tracks exist".into(),
                ));
            }
            reconfig = true;
        }

        match output.set_parameters(kv) {
            Err(HardwareError::StandbyRequired) => {
                self.enter_standby(state);
                output.set_parameters(kv)?;
            }
            other => other?,
        }

        if reconfig {
            state.io = IoParams::from_stream(output.as_ref());
            self.reassign_names(state);
            state.queues.push_event(IoConfigEvent::OutputConfigChanged);
            tracing::info!("{} reconfigured: {:?}", self.base.name(), state.io.descriptor());
        }
        Ok(reconfig)
    }

    /// Hand every track a fresh slot in the rebuilt mixer
    fn reassign_names(&self, state: &mut PlaybackState) {
        state.released_names.clear();
        if !self.kind.mixes() {
            return;
        }
        state.names.clear();
        let PlaybackState { tracks, names, .. } = state;
        for (_, track) in tracks.iter_mut() {
            track.name = names.allocate().ok();
        }
    }

    fn enter_standby(&self, state: &PlaybackState) {
        match (&self.output, self.kind) {
            (Some(output), OutputKind::Mixer | OutputKind::Direct) => {
                if let Err(e) = output.standby() {
                    tracing::warn!("{}: standby failed: {}", self.base.name(), e);
                }
            }
            _ => {
                for sink in &state.sinks {
                    sink.stop();
                }
            }
        }
        self.stats.set_standby(true);
        self.bytes_since_standby.store(0, Ordering::Relaxed);
        tracing::debug!("{} in standby", self.base.name());
    }

    /// Decide which active tracks take part in this cycle and retire the
    /// ones that are done
    fn prepare_tracks(&self, state: &mut PlaybackState) -> Cycle {
        let mut cycle = Cycle::default();
        let mut retire = Vec::new();
        let master_muted = self.master_mute.load(Ordering::Relaxed);
        let master = self.master_volume.load();
        let min_bytes = state.io.min_bytes_to_write();
        let written = self.bytes_since_standby.load(Ordering::Relaxed);

        let candidates: Vec<TrackId> = if self.kind.mixes() {
            state.active.clone()
        } else {
            state.active.first().copied().into_iter().collect()
        };

        for id in candidates {
            let Some(track) = state.tracks.get_mut(id) else {
                retire.push(id);
                continue;
            };
            let ring = Arc::clone(&track.ring);
            let cblk = ring.control();

            let mixable = ring.frames_deliverable() > 0
                && (track.is_ready() || track.is_stopped())
                && !track.is_paused()
                && !track.is_terminated();

            if mixable {
                let stream = track.stream.index();
                let silenced = track.muted
                    || master_muted
                    || self.stream_mutes[stream].load(Ordering::Relaxed);
                let (left, right) = if silenced || track.is_pausing() {
                    if track.is_pausing() {
                        track.state = TrackState::Paused;
                    }
                    (0.0, 0.0)
                } else {
                    let v = master * self.stream_volumes[stream].load();
                    let [l, r] = cblk.volume();
                    ((v * l as f32).min(MAX_GAIN), (v * r as f32).min(MAX_GAIN))
                };

                // No ramp on the very first buffer of a track
                let mut ramp = false;
                if track.fill == FillStatus::Filled {
                    track.fill = FillStatus::Active;
                    if track.state == TrackState::Resuming {
                        track.state = TrackState::Active;
                        ramp = true;
                    }
                } else if cblk.server() != 0 {
                    ramp = true;
                }

                if self.kind.mixes() {
                    if let Some(name) = track.name {
                        cycle.sources.push(MixSource {
                            name,
                            ring,
                            volume: [left as u16, right as u16],
                            ramp,
                        });
                    }
                } else {
                    cycle.direct = Some(DirectSource {
                        ring,
                        volume: (left / MAX_GAIN, right / MAX_GAIN),
                    });
                }
                track.retry = self.config.max_track_retries;
                cycle.enabled += 1;
                continue;
            }

            if track.is_stopped() {
                track.reset();
            }
            if track.is_terminated() || track.is_stopped() || track.is_paused() {
                retire.push(id);
                continue;
            }

            cblk.set_flag(flags::FLOW_CONTROL);
            // A static track keeps the output running until its content
            // has reached the hardware
            if ring.is_static() && written < min_bytes {
                cycle.enabled += 1;
                continue;
            }
            track.retry = track.retry.saturating_sub(1);
            if track.retry == 0 {
                tracing::debug!("{}: track {} underrun, leaving active set", self.base.name(), id);
                cblk.set_flag(flags::DISABLED);
                retire.push(id);
            }
        }

        for id in retire {
            state.active.retain(|a| *a != id);
            let terminated = state.tracks.get(id).is_some_and(|t| t.is_terminated());
            if terminated {
                if let Some(track) = state.tracks.remove(id) {
                    if let Some(name) = track.name {
                        state.names.free(name);
                        cycle.released.push(name);
                    }
                    cycle.removed.push(track);
                }
            }
        }
        cycle.released.append(&mut state.released_names);
        cycle.sinks = state.sinks.clone();
        cycle
    }

    fn render(&self, engine: &mut Engine, cycle: &Cycle) {
        match &mut engine.renderer {
            Renderer::Mixing(mixer) => mixer.mix(&cycle.sources, &mut engine.buffer),
            Renderer::Passthrough { volume } => {
                engine.buffer.fill(0);
                let Some(source) = &cycle.direct else {
                    return;
                };
                if *volume != Some(source.volume) {
                    if let Sink::Hardware { stream, .. } = &engine.sink {
                        if let Err(e) = stream.set_volume(source.volume.0, source.volume.1) {
                            tracing::debug!("{}: set_volume failed: {}", self.base.name(), e);
                        }
                    }
                    *volume = Some(source.volume);
                }
                let ring = &source.ring;
                let channels = ring.channels() as usize;
                let frames = engine.io.frame_count;
                let mut done = 0usize;
                while done < frames {
                    let Some(region) = ring.get_next_buffer((frames - done) as u32) else {
                        break;
                    };
                    ring.read_region(&region, &mut engine.buffer[done * channels..]);
                    done += region.frames as usize;
                    ring.release_buffer(&region);
                }
            }
        }
    }

    fn write(&self, engine: &mut Engine, sinks: &[Arc<OutputTrack>]) {
        let started = self.stats.begin_io();
        let bytes = match &mut engine.sink {
            Sink::Hardware { stream, staging } => {
                encode_samples(&engine.buffer, engine.io.format, staging);
                match stream.write(staging) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!("{}: write failed: {}", self.base.name(), e);
                        0
                    }
                }
            }
            Sink::FanOut => {
                for sink in sinks {
                    sink.write(&engine.buffer, engine.io.frame_count as u32);
                }
                engine.buffer.len() * std::mem::size_of::<i16>()
            }
        };
        self.bytes_since_standby
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if self.stats.end_io(started, bytes, engine.io.period() * 2) {
            tracing::debug!("{}: write took {:?}", self.base.name(), started.elapsed());
        }
    }

    /// Push queued overflow downstream when nothing was mixed. Returns
    /// whether any sink was still running.
    fn flush_sinks(&self, sinks: &[Arc<OutputTrack>]) -> bool {
        if self.bytes_since_standby.load(Ordering::Relaxed) == 0
            || !sinks.iter().any(|s| s.is_active())
        {
            return false;
        }
        for sink in sinks {
            sink.write(&[], 0);
        }
        true
    }

    fn on_exit(&self) {
        let sinks = {
            let mut state = self.state.lock();
            if !self.stats.is_standby() {
                self.enter_standby(&state);
            }
            state.queues.fail_pending("output closed");
            state.queues.push_event(IoConfigEvent::OutputClosed);
            std::mem::take(&mut state.sinks)
        };
        for sink in sinks {
            sink.destroy();
        }
        self.base.process_config_events(&self.state);
        tracing::info!("{} stopped", self.base.name());
    }

    /// Snapshot for diagnostics; never blocks on a wedged loop
    pub fn dump(&self, retries: u32, sleep: Duration) -> OutputDump {
        let stats = self.stats.snapshot();
        let mut dump = OutputDump {
            handle: self.handle(),
            name: self.base.name().to_string(),
            kind: self.kind,
            locked: false,
            descriptor: None,
            suspended: self.suspended.load(Ordering::Relaxed),
            master_volume: self.master_volume(),
            master_mute: self.master_mute(),
            stream_volumes: self.stream_volumes.iter().map(|v| v.load()).collect(),
            stats,
            tracks: Vec::new(),
            sinks: Vec::new(),
        };
        match try_lock_retrying(&self.state, retries, sleep) {
            Some(state) => {
                dump.descriptor = Some(state.io.descriptor());
                dump.tracks = state
                    .tracks
                    .iter()
                    .map(|(id, t)| t.info(state.active.contains(&id)))
                    .collect();
                dump.sinks = state.sinks.iter().map(|s| s.target_handle()).collect();
            }
            None => dump.locked = true,
        }
        dump
    }
}

/// Diagnostic view of one output
#[derive(Debug, Clone, Serialize)]
pub struct OutputDump {
    pub handle: IoHandle,
    pub name: String,
    pub kind: OutputKind,
    /// The thread lock could not be taken
    pub locked: bool,
    pub descriptor: Option<IoDescriptor>,
    pub suspended: u32,
    pub master_volume: f32,
    pub master_mute: bool,
    pub stream_volumes: Vec<f32>,
    pub stats: StatsSnapshot,
    pub tracks: Vec<TrackInfo>,
    pub sinks: Vec<IoHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::AudioHardware;
    use crate::audio::memory::{waveform, MemoryHardware};
    use crate::protocol::StreamConfig;

    fn fast_config() -> ServerConfig {
        ServerConfig {
            underrun_backoff_base_us: 100,
            underrun_backoff_max_us: 500,
            max_track_retries: 5,
            max_track_startup_retries: 5,
            ..ServerConfig::default()
        }
    }

    fn mixer(frames: usize) -> (Arc<PlaybackThread>, MemoryHardware) {
        let mut hw = MemoryHardware::new(frames);
        let stream = hw.open_output_stream(StreamConfig::default()).unwrap();
        let thread = PlaybackThread::new(
            IoHandle(1),
            OutputKind::Mixer,
            stream,
            fast_config(),
            &VolumeSettings::default(),
            Arc::new(ListenerRegistry::new()),
        );
        (thread, hw)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_create_track_validation() {
        let (thread, _hw) = mixer(256);
        let create = |rate, format, channels| {
            thread.create_track(None, StreamType::Music, rate, format, channels, 512, None)
        };
        assert!(create(88200, AudioFormat::Pcm16, 2).is_ok());
        assert!(matches!(create(88201, AudioFormat::Pcm16, 2), Err(Error::InvalidArgument(_))));
        assert!(matches!(create(44100, AudioFormat::Pcm8, 2), Err(Error::InvalidArgument(_))));
        assert!(matches!(create(44100, AudioFormat::Pcm16, 3), Err(Error::InvalidArgument(_))));
        assert!(matches!(create(0, AudioFormat::Pcm16, 2), Err(Error::InvalidArgument(_))));

        let (_, ring) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 0, None)
            .unwrap();
        assert_eq!(ring.frame_count(), 512);
    }

    #[test]
    fn test_mixer_slots_exhaust() {
        let (thread, _hw) = mixer(64);
        for _ in 0..crate::constants::MAX_TRACK_NAMES {
            thread
                .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 64, None)
                .unwrap();
        }
        let err = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 64, None)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
    }

    #[test]
    fn test_destroy_idle_track_frees_slot() {
        let (thread, _hw) = mixer(64);
        let (id, _) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 64, None)
            .unwrap();
        thread.destroy_track(id);
        assert_eq!(thread.track_count(), 0);
        assert!(thread.state.lock().released_names.contains(&0));
        assert!(matches!(thread.start_track(id), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_prepare_evicts_starved_track() {
        let (thread, _hw) = mixer(64);
        let (id, _) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 64, None)
            .unwrap();
        thread.start_track(id).unwrap();
        let mut state = thread.state.lock();
        for _ in 0..4 {
            let cycle = thread.prepare_tracks(&mut state);
            assert_eq!(cycle.enabled, 0);
            assert!(state.is_active(id));
        }
        thread.prepare_tracks(&mut state);
        assert!(!state.is_active(id));
        let track = state.tracks.get(id).unwrap();
        assert!(track.ring.control().has_flag(flags::DISABLED));
    }

    #[test]
    fn test_undeliverable_track_is_evicted() {
        let (thread, _hw) = mixer(64);
        let (id, ring) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 64, None)
            .unwrap();
        ring.write(&[7; 128], Duration::ZERO).unwrap();
        thread.start_track(id).unwrap();
        // cursors claim more than the buffer holds
        ring.force_user(200);
        assert!(ring.frames_ready() > 0);

        let mut state = thread.state.lock();
        for _ in 0..4 {
            let cycle = thread.prepare_tracks(&mut state);
            assert_eq!(cycle.enabled, 0);
            assert!(state.is_active(id));
        }
        thread.prepare_tracks(&mut state);
        assert!(!state.is_active(id));
        assert!(ring.control().has_flag(flags::DISABLED));
    }

    #[test]
    fn test_pausing_track_mixed_silent_then_paused() {
        let (thread, _hw) = mixer(64);
        let (id, ring) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 64, None)
            .unwrap();
        ring.write(&[100; 128], Duration::ZERO).unwrap();
        thread.start_track(id).unwrap();
        thread.pause_track(id).unwrap();
        let mut state = thread.state.lock();
        let cycle = thread.prepare_tracks(&mut state);
        assert_eq!(cycle.enabled, 1);
        assert_eq!(cycle.sources[0].volume, [0, 0]);
        assert_eq!(state.tracks.get(id).unwrap().state(), TrackState::Paused);
        let cycle = thread.prepare_tracks(&mut state);
        assert_eq!(cycle.enabled, 0);
        assert!(!state.is_active(id));
    }

    #[test]
    fn test_stream_volume_scales_gain() {
        let (thread, _hw) = mixer(64);
        thread.set_stream_volume(StreamType::Music, 0.5);
        let (id, ring) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 64, None)
            .unwrap();
        ring.write(&[1; 128], Duration::ZERO).unwrap();
        ring.control().set_volume(1.0, 0.5);
        thread.start_track(id).unwrap();
        let mut state = thread.state.lock();
        let cycle = thread.prepare_tracks(&mut state);
        assert_eq!(cycle.sources[0].volume, [2048, 1024]);
    }

    #[test]
    fn test_static_track_drains_before_eviction() {
        let (thread, _hw) = mixer(64);
        let data: Vec<i16> = (0..128).map(|i| waveform(i, 0)).collect();
        let (id, ring) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 0, Some(&data))
            .unwrap();
        thread.start_track(id).unwrap();
        // consume everything without writing to the hardware
        let region = ring.get_next_buffer(64).unwrap();
        ring.release_buffer(&region);
        let mut state = thread.state.lock();
        for _ in 0..20 {
            let cycle = thread.prepare_tracks(&mut state);
            assert_eq!(cycle.enabled, 1);
        }
        assert!(state.is_active(id));
        thread
            .bytes_since_standby
            .store(state.io.min_bytes_to_write(), Ordering::Relaxed);
        for _ in 0..5 {
            thread.prepare_tracks(&mut state);
        }
        assert!(!state.is_active(id));
    }

    #[test]
    fn test_loop_plays_and_goes_idle() {
        let (thread, hw) = mixer(256);
        thread.run().unwrap();
        let (id, ring) = thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 512, None)
            .unwrap();
        let samples: Vec<i16> = (0..512u64)
            .flat_map(|f| [waveform(f, 0), waveform(f, 1)])
            .collect();
        ring.write(&samples, Duration::ZERO).unwrap();
        thread.start_track(id).unwrap();

        let out = hw.probe().outputs()[0].clone();
        assert!(wait_until(|| out.written_len() >= 512 * 4));
        assert_eq!(&out.written_samples()[..1024], &samples[..]);
        assert!(wait_until(|| !thread.is_track_active(id)));
        thread.exit();
        assert!(thread.is_standby());
    }

    #[test]
    fn test_frame_count_change_rejected_with_tracks() {
        let (thread, _hw) = mixer(256);
        thread.run().unwrap();
        thread.set_parameters("frame_count=128").unwrap();
        assert_eq!(thread.frame_count(), 128);
        assert!(wait_until(|| thread.mix_buffer_frames() == 128));

        thread
            .create_track(None, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 0, None)
            .unwrap();
        assert!(matches!(
            thread.set_parameters("frame_count=512"),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            thread.set_parameters("channels=1"),
            Err(Error::InvalidArgument(_))
        ));
        thread.exit();
    }
}

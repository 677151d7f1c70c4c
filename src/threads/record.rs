//! Capture loop
//!
//! One input, at most one active capture track. Hardware frames land in a
//! staging buffer sized to the native buffer; from there they are either
//! resampled (when the requested rate differs from the native one) or
//! copied, with mono/stereo folding, into the client's ring buffer.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::{flags, Direction, Region, RingBuffer};
use crate::audio::device::{decode_samples, StreamIn};
use crate::audio::resampler::LinearResampler;
use crate::config::ServerConfig;
use crate::constants::START_STOP_TIMEOUT;
use crate::error::{Error, HardwareError, Result};
use crate::params::{AudioParameters, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::protocol::{AudioFormat, IoConfigEvent, IoDescriptor, IoHandle, StreamConfig};
use crate::server::client::Client;
use crate::server::dump::try_lock_retrying;
use crate::server::listeners::ListenerRegistry;
use crate::threads::{priority, StatsSnapshot, ThreadBase, ThreadQueues, ThreadState, ThreadStats};
use crate::tracks::manager::{TrackArena, TrackId};
use crate::tracks::track::{RecordTrack, TrackInfo, TrackState};

/// Native configuration of the input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputParams {
    config: StreamConfig,
    frame_count: usize,
}

impl InputParams {
    fn from_stream(stream: &dyn StreamIn) -> Self {
        Self {
            config: stream.config(),
            frame_count: stream.buffer_size() / stream.frame_size().max(1),
        }
    }

    fn period(&self) -> Duration {
        Duration::from_micros(
            self.frame_count as u64 * 1_000_000 / self.config.sample_rate.max(1) as u64,
        )
    }
}

pub(crate) struct RecordState {
    queues: ThreadQueues,
    tracks: TrackArena<RecordTrack>,
    active: Option<TrackId>,
    /// What clients of this input get
    requested: StreamConfig,
    io: InputParams,
}

impl ThreadState for RecordState {
    fn queues(&mut self) -> &mut ThreadQueues {
        &mut self.queues
    }

    fn descriptor(&self) -> IoDescriptor {
        IoDescriptor {
            sample_rate: self.requested.sample_rate,
            format: self.requested.format,
            channels: self.requested.channels,
            frame_count: self.io.frame_count,
            latency_ms: 0,
        }
    }
}

/// Native frames read from the hardware, consumed frame by frame
struct Staging {
    samples: Vec<i16>,
    bytes: Vec<u8>,
    channels: usize,
    format: AudioFormat,
    index: usize,
    frames: usize,
}

impl Staging {
    fn new(io: &InputParams) -> Self {
        let frame_size = io.config.frame_size();
        Self {
            samples: Vec::with_capacity(io.frame_count * io.config.channels as usize),
            bytes: vec![0; io.frame_count * frame_size],
            channels: io.config.channels as usize,
            format: io.config.format,
            index: 0,
            frames: 0,
        }
    }

    fn invalidate(&mut self) {
        self.index = self.frames;
    }

    fn refill(&mut self, input: &dyn StreamIn) -> bool {
        match input.read(&mut self.bytes) {
            Ok(n) => {
                decode_samples(&self.bytes[..n.min(self.bytes.len())], self.format, &mut self.samples);
                self.frames = self.samples.len() / self.channels.max(1);
                self.index = 0;
                self.frames > 0
            }
            Err(e) => {
                tracing::warn!("Input read failed: {}", e);
                self.invalidate();
                false
            }
        }
    }

    /// Next native frame widened to stereo
    fn next_frame(&mut self, input: &dyn StreamIn) -> Option<[i32; 2]> {
        if self.index >= self.frames && !self.refill(input) {
            return None;
        }
        let at = self.index * self.channels;
        self.index += 1;
        let l = self.samples[at] as i32;
        let r = if self.channels > 1 {
            self.samples[at + 1] as i32
        } else {
            l
        };
        Some([l, r])
    }
}

/// Loop-owned conversion state, rebuilt on reconfiguration
struct Capture {
    staging: Staging,
    resampler: Option<LinearResampler>,
    resampled: Vec<i32>,
    out: Vec<i16>,
    requested: StreamConfig,
    io: InputParams,
}

impl Capture {
    fn new(io: InputParams, requested: StreamConfig) -> Self {
        let resampler = (io.config.sample_rate != requested.sample_rate)
            .then(|| LinearResampler::new(io.config.sample_rate, requested.sample_rate));
        Self {
            staging: Staging::new(&io),
            resampler,
            resampled: Vec::new(),
            out: Vec::new(),
            requested,
            io,
        }
    }

    /// Fill up to `frames` requested frames into `self.out`. Returns the
    /// number produced.
    fn produce(&mut self, input: &dyn StreamIn, frames: usize) -> usize {
        let req_ch = self.requested.channels as usize;
        self.out.clear();
        self.out.resize(frames * req_ch, 0);

        if let Some(resampler) = &mut self.resampler {
            self.resampled.clear();
            self.resampled.resize(frames * 2, 0);
            let staging = &mut self.staging;
            let produced = resampler.process(&mut self.resampled, || staging.next_frame(input));
            let clamp = |v: i32| v.clamp(i16::MIN as i32, i16::MAX as i32);
            for i in 0..produced {
                let (l, r) = (clamp(self.resampled[i * 2]), clamp(self.resampled[i * 2 + 1]));
                if req_ch == 1 {
                    self.out[i] = ((l + r) >> 1) as i16;
                } else {
                    self.out[i * 2] = l as i16;
                    self.out[i * 2 + 1] = r as i16;
                }
            }
            return produced;
        }

        let hw_ch = self.staging.channels;
        let mut done = 0usize;
        while done < frames {
            if self.staging.index >= self.staging.frames && !self.staging.refill(input) {
                break;
            }
            let n = (self.staging.frames - self.staging.index).min(frames - done);
            let src = &self.staging.samples[self.staging.index * hw_ch..(self.staging.index + n) * hw_ch];
            let dst = &mut self.out[done * req_ch..(done + n) * req_ch];
            match (hw_ch, req_ch) {
                (a, b) if a == b => dst.copy_from_slice(src),
                (1, 2) => {
                    for (pair, s) in dst.chunks_exact_mut(2).zip(src) {
                        pair[0] = *s;
                        pair[1] = *s;
                    }
                }
                _ => {
                    for (d, pair) in dst.iter_mut().zip(src.chunks_exact(2)) {
                        *d = ((pair[0] as i32 + pair[1] as i32) >> 1) as i16;
                    }
                }
            }
            self.staging.index += n;
            done += n;
        }
        done
    }
}

/// Capture loop over one input stream
pub struct RecordThread {
    base: ThreadBase,
    input: Arc<dyn StreamIn>,
    config: ServerConfig,
    state: Mutex<RecordState>,
    work: Condvar,
    start_stop: Condvar,
    stats: ThreadStats,
}

impl RecordThread {
    /// `requested` is what the caller asked for; the stream may run at a
    /// different native rate or channel count
    pub(crate) fn new(
        handle: IoHandle,
        input: Arc<dyn StreamIn>,
        requested: StreamConfig,
        config: ServerConfig,
        listeners: Arc<ListenerRegistry>,
    ) -> Arc<Self> {
        let io = InputParams::from_stream(input.as_ref());
        Arc::new(Self {
            base: ThreadBase::new(handle, format!("audiomux-record-{}", handle.0), listeners),
            input,
            config,
            state: Mutex::new(RecordState {
                queues: ThreadQueues::default(),
                tracks: TrackArena::new(),
                active: None,
                requested,
                io,
            }),
            work: Condvar::new(),
            start_stop: Condvar::new(),
            stats: ThreadStats::new(),
        })
    }

    pub(crate) fn run(self: &Arc<Self>) -> Result<()> {
        self.base
            .send_config_event(&self.state, &self.work, IoConfigEvent::InputOpened, None);
        let thread = Arc::clone(self);
        self.base.spawn(move || thread.thread_loop())?;
        tracing::info!("{} started", self.base.name());
        Ok(())
    }

    pub fn handle(&self) -> IoHandle {
        self.base.handle()
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Configuration delivered to clients
    pub fn requested_config(&self) -> StreamConfig {
        self.state.lock().requested
    }

    /// Native configuration of the hardware stream
    pub fn native_config(&self) -> StreamConfig {
        self.state.lock().io.config
    }

    pub fn frame_count(&self) -> usize {
        self.state.lock().io.frame_count
    }

    pub fn descriptor(&self) -> IoDescriptor {
        self.state.lock().descriptor()
    }

    pub fn active_track(&self) -> Option<TrackId> {
        self.state.lock().active
    }

    pub fn track_state(&self, id: TrackId) -> Option<TrackState> {
        self.state.lock().tracks.get(id).map(|t| t.state())
    }

    pub fn is_standby(&self) -> bool {
        self.stats.is_standby()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Allocate a capture track at this input's requested rate
    pub(crate) fn create_track(
        &self,
        client: Option<Arc<Client>>,
        sample_rate: u32,
        format: AudioFormat,
        channels: u16,
        frame_count: u32,
    ) -> Result<(TrackId, Arc<RingBuffer>)> {
        let mut state = self.state.lock();
        if self.base.exit_pending() {
            return Err(Error::NotInitialized(format!("{} is closing", self.base.name())));
        }
        if format != AudioFormat::Pcm16 {
            return Err(Error::InvalidArgument(format!("capture is PCM16 only, got {format:?}")));
        }
        if sample_rate != state.requested.sample_rate {
            return Err(Error::InvalidArgument(format!(
                "input {} records at {} Hz, not {}",
                self.handle(),
                state.requested.sample_rate,
                sample_rate
            )));
        }
        if !(1..=2).contains(&channels) {
            return Err(Error::InvalidArgument(format!("{channels} channels")));
        }
        let frames = if frame_count == 0 {
            state.io.frame_count as u32 * 2
        } else {
            frame_count
        };
        let heap = client.as_ref().map(|c| c.heap());
        let ring = Arc::new(RingBuffer::new(Direction::Record, frames, sample_rate, channels, heap)?);
        let id = state
            .tracks
            .insert_with(|id| RecordTrack::new(id, client, format, Arc::clone(&ring)));
        Ok((id, ring))
    }

    /// Make `id` the active track and wait for the loop to pick it up.
    /// Fails with `WouldBlock` while another track is recording.
    pub(crate) fn start_track(&self, id: TrackId) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.track(id)?.state;
        match state.active {
            Some(active) if active != id => return Err(Error::WouldBlock),
            Some(_) => {
                if current == TrackState::Pausing {
                    state.track_mut(id)?.state = TrackState::Resuming;
                }
                return Ok(());
            }
            None => {}
        }
        if current == TrackState::Terminated {
            return Err(Error::InvalidOperation(format!("track {id} was destroyed")));
        }
        state.track_mut(id)?.state = TrackState::Resuming;
        state.active = Some(id);
        self.work.notify_all();

        let deadline = Instant::now() + START_STOP_TIMEOUT;
        while state.active == Some(id)
            && state.tracks.get(id).map(|t| t.state) == Some(TrackState::Resuming)
        {
            if self.base.exit_pending() {
                return Err(Error::NotInitialized(format!("{} is closing", self.base.name())));
            }
            if self.start_stop.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.active != Some(id) {
            state.track_mut(id)?.state = TrackState::Stopped;
            return Err(Error::InvalidArgument(format!(
                "track {id} does not match input {}",
                self.handle()
            )));
        }
        if state.tracks.get(id).map(|t| t.state) == Some(TrackState::Resuming) {
            state.active = None;
            state.track_mut(id)?.state = TrackState::Stopped;
            return Err(Error::Timeout(format!("{} did not start track {id}", self.base.name())));
        }
        Ok(())
    }

    /// Stop `id`, waiting for the loop to let go of it
    pub(crate) fn stop_track(&self, id: TrackId) -> Result<()> {
        let mut state = self.state.lock();
        state.track(id)?;
        if state.active == Some(id) {
            state.track_mut(id)?.state = TrackState::Pausing;
            self.work.notify_all();
            let deadline = Instant::now() + START_STOP_TIMEOUT;
            while state.active == Some(id) && !self.base.exit_pending() {
                if self.start_stop.wait_until(&mut state, deadline).timed_out() {
                    tracing::warn!("{}: stop of track {} timed out", self.base.name(), id);
                    state.active = None;
                    break;
                }
            }
        }
        let track = state.track_mut(id)?;
        if track.state > TrackState::Stopped {
            track.state = TrackState::Stopped;
        }
        track.ring.reset();
        Ok(())
    }

    pub(crate) fn destroy_track(&self, id: TrackId) {
        let removed = {
            let mut state = self.state.lock();
            if state.active == Some(id) {
                state.active = None;
                self.start_stop.notify_all();
            }
            state.tracks.remove(id)
        };
        drop(removed);
    }

    pub fn set_parameters(&self, kv: &str) -> Result<()> {
        self.base.request_parameters(&self.state, &self.work, kv)
    }

    pub fn get_parameters(&self, keys: &str) -> String {
        self.input.get_parameters(keys)
    }

    pub fn send_config_event(&self, event: IoConfigEvent) {
        self.base
            .send_config_event(&self.state, &self.work, event, None);
    }

    pub fn exit(&self) {
        tracing::info!("{} exiting", self.base.name());
        self.base
            .request_exit(&self.state, &[&self.work, &self.start_stop]);
        self.base.join();
    }

    fn thread_loop(self: Arc<Self>) {
        priority::promote_current_thread(self.base.name());
        let mut capture = {
            let state = self.state.lock();
            Capture::new(state.io, state.requested)
        };

        while !self.base.exit_pending() {
            self.base.process_config_events(&self.state);

            let ring = {
                let mut state = self.state.lock();
                if self.check_for_new_parameters(&mut state) {
                    capture = Capture::new(state.io, state.requested);
                }

                if state.active.is_none() && state.queues.events.is_empty() {
                    if !self.stats.is_standby() {
                        self.enter_standby();
                    }
                    if self.base.exit_pending() {
                        break;
                    }
                    self.work.wait(&mut state);
                    continue;
                }

                let mut ring = None;
                if let Some(id) = state.active {
                    let requested = state.requested;
                    let current = state
                        .tracks
                        .get(id)
                        .map(|t| (t.state, Arc::clone(&t.ring)));
                    match current {
                        Some((TrackState::Pausing, _)) => {
                            state.active = None;
                            self.start_stop.notify_all();
                        }
                        Some((TrackState::Resuming, track_ring)) => {
                            capture.staging.invalidate();
                            if let Some(r) = &mut capture.resampler {
                                r.reset();
                            }
                            if track_ring.channels() != requested.channels {
                                tracing::warn!(
                                    "{}: track {} has {} channels, input delivers {}",
                                    self.base.name(),
                                    id,
                                    track_ring.channels(),
                                    requested.channels
                                );
                                state.active = None;
                            } else {
                                if let Some(track) = state.tracks.get_mut(id) {
                                    track.state = TrackState::Active;
                                }
                                ring = Some(track_ring);
                            }
                            self.start_stop.notify_all();
                        }
                        Some((TrackState::Active, track_ring)) => ring = Some(track_ring),
                        _ => {
                            state.active = None;
                            self.start_stop.notify_all();
                        }
                    }
                }
                if ring.is_some() {
                    self.stats.set_standby(false);
                }
                ring
            };

            if let Some(ring) = ring {
                self.capture_cycle(&mut capture, &ring);
            }
        }

        self.on_exit();
    }

    fn capture_cycle(&self, capture: &mut Capture, ring: &RingBuffer) {
        let Some(region) = ring.get_next_buffer(capture.io.frame_count as u32) else {
            if ring.step_pending() {
                // Client holds the control block lock; not an overflow
                std::thread::yield_now();
                return;
            }
            if !ring.control().has_flag(flags::OVERFLOW) {
                tracing::warn!("{}: capture buffer overflow", self.base.name());
            }
            ring.control().set_flag(flags::OVERFLOW);
            std::thread::sleep(self.config.record_overflow_sleep());
            return;
        };

        let started = self.stats.begin_io();
        let produced = capture.produce(self.input.as_ref(), region.frames as usize);
        let bytes = produced * capture.requested.frame_size();
        self.stats.end_io(started, bytes, capture.io.period() * 2);

        if produced == 0 {
            std::thread::sleep(capture.io.period());
            return;
        }
        ring.write_region(&region, &capture.out[..produced * capture.requested.channels as usize]);
        ring.release_buffer(&Region {
            frames: produced as u32,
            ..region
        });
    }

    fn enter_standby(&self) {
        if let Err(e) = self.input.standby() {
            tracing::warn!("{}: standby failed: {}", self.base.name(), e);
        }
        self.stats.set_standby(true);
    }

    fn check_for_new_parameters(&self, state: &mut RecordState) -> bool {
        let mut reconfigured = false;
        while let Some(request) = state.queues.params.pop_front() {
            let status = self.apply_parameters(state, &request.kv);
            reconfigured |= matches!(status, Ok(true));
            let _ = request.reply.send(status.map(|_| ()));
        }
        reconfigured
    }

    fn apply_parameters(&self, state: &mut RecordState, kv: &str) -> Result<bool> {
        let params = AudioParameters::parse(kv);
        let mut requested = state.requested;
        let mut reconfig = false;

        if let Some(rate) = params.get_int(KEY_SAMPLING_RATE)? {
            if rate <= 0 {
                return Err(Error::InvalidArgument(format!("sampling_rate={rate}")));
            }
            requested.sample_rate = rate as u32;
            reconfig = true;
        }
        if let Some(code) = params.get_int(KEY_FORMAT)? {
            if AudioFormat::from_code(code) != Some(AudioFormat::Pcm16) {
                return Err(Error::InvalidArgument(format!("capture format {code}")));
            }
            reconfig = true;
        }
        if let Some(channels) = params.get_int(KEY_CHANNELS)? {
            if !(1..=2).contains(&channels) {
                return Err(Error::InvalidArgument(format!("capture channels {channels}")));
            }
            requested.channels = channels as u16;
            reconfig = true;
        }
        if params.get_int(KEY_FRAME_COUNT)?.is_some() {
            if state.active.is_some() {
                return Err(Error::InvalidOperation(
                    "cannot change the frame count while recording".into(),
                ));
            }
            reconfig = true;
        }
        if reconfig && state.active.is_some() {
            return Err(Error::InvalidOperation(
                "cannot reconfigure an input while recording".into(),
            ));
        }

        let mut status = match self.input.set_parameters(kv) {
            Err(HardwareError::StandbyRequired) => {
                self.enter_standby();
                self.input.set_parameters(kv)
            }
            other => other,
        };
        if reconfig {
            // The hardware may keep its native setup if we can convert
            if let Err(HardwareError::BadValue(_)) = &status {
                let native = InputParams::from_stream(self.input.as_ref()).config;
                if native.format == AudioFormat::Pcm16
                    && native.sample_rate <= requested.sample_rate.saturating_mul(2)
                    && native.channels <= 2
                {
                    status = Ok(());
                }
            }
        }
        status?;

        if reconfig {
            state.requested = requested;
            state.io = InputParams::from_stream(self.input.as_ref());
            state.queues.push_event(IoConfigEvent::InputConfigChanged);
            tracing::info!("{} reconfigured: {:?}", self.base.name(), state.descriptor());
        }
        Ok(reconfig)
    }

    fn on_exit(&self) {
        {
            let mut state = self.state.lock();
            if !self.stats.is_standby() {
                self.enter_standby();
            }
            state.active = None;
            self.start_stop.notify_all();
            state.queues.fail_pending("input closed");
            state.queues.push_event(IoConfigEvent::InputClosed);
        }
        self.base.process_config_events(&self.state);
        tracing::info!("{} stopped", self.base.name());
    }

    pub fn dump(&self, retries: u32, sleep: Duration) -> InputDump {
        let mut dump = InputDump {
            handle: self.handle(),
            name: self.base.name().to_string(),
            locked: false,
            requested: None,
            native: None,
            stats: self.stats.snapshot(),
            tracks: Vec::new(),
        };
        match try_lock_retrying(&self.state, retries, sleep) {
            Some(state) => {
                dump.requested = Some(state.requested);
                dump.native = Some(state.io.config);
                dump.tracks = state
                    .tracks
                    .iter()
                    .map(|(id, t)| t.info(state.active == Some(id)))
                    .collect();
            }
            None => dump.locked = true,
        }
        dump
    }
}

impl RecordState {
    fn track(&self, id: TrackId) -> Result<&RecordTrack> {
        self.tracks
            .get(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown track {id}")))
    }

    fn track_mut(&mut self, id: TrackId) -> Result<&mut RecordTrack> {
        self.tracks
            .get_mut(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown track {id}")))
    }
}

/// Diagnostic view of one input
#[derive(Debug, Clone, Serialize)]
pub struct InputDump {
    pub handle: IoHandle,
    pub name: String,
    pub locked: bool,
    pub requested: Option<StreamConfig>,
    pub native: Option<StreamConfig>,
    pub stats: StatsSnapshot,
    pub tracks: Vec<TrackInfo>,
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::AudioHardware;
    use crate::audio::memory::{waveform, MemoryHardware};

    fn record_thread(native: StreamConfig, requested: StreamConfig, frames: usize) -> Arc<RecordThread> {
        let mut hw = MemoryHardware::new(frames).with_input_frame_count(frames);
        let input = hw.open_input_stream(native).unwrap();
        let thread = RecordThread::new(
            IoHandle(5),
            input,
            requested,
            ServerConfig::default(),
            Arc::new(ListenerRegistry::new()),
        );
        thread.run().unwrap();
        thread
    }

    fn read_exact(ring: &RingBuffer, samples: usize) -> Vec<i16> {
        let mut out = vec![0i16; samples];
        let channels = ring.channels() as usize;
        let mut got = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while got < samples && Instant::now() < deadline {
            if let Ok(n) = ring.read(&mut out[got..], Duration::from_millis(50)) {
                got += n * channels;
            }
        }
        assert_eq!(got, samples);
        out
    }

    #[test]
    fn test_stereo_to_mono_copy_averages() {
        let stereo = StreamConfig::new(8000, AudioFormat::Pcm16, 2);
        let mono = StreamConfig::new(8000, AudioFormat::Pcm16, 1);
        let thread = record_thread(stereo, mono, 64);
        let (id, ring) = thread
            .create_track(None, 8000, AudioFormat::Pcm16, 1, 256)
            .unwrap();
        thread.start_track(id).unwrap();
        let got = read_exact(&ring, 128);
        thread.stop_track(id).unwrap();
        for (k, s) in got.iter().enumerate() {
            let expected = (waveform(k as u64, 0) as i32 + waveform(k as u64, 1) as i32) >> 1;
            assert_eq!(*s as i32, expected, "frame {k}");
        }
        thread.exit();
    }

    #[test]
    fn test_mono_to_stereo_copy_duplicates() {
        let mono = StreamConfig::new(8000, AudioFormat::Pcm16, 1);
        let stereo = StreamConfig::new(8000, AudioFormat::Pcm16, 2);
        let thread = record_thread(mono, stereo, 64);
        let (id, ring) = thread
            .create_track(None, 8000, AudioFormat::Pcm16, 2, 256)
            .unwrap();
        thread.start_track(id).unwrap();
        let got = read_exact(&ring, 64 * 2);
        for k in 0..64 {
            assert_eq!(got[k * 2], waveform(k as u64, 0));
            assert_eq!(got[k * 2 + 1], waveform(k as u64, 0));
        }
        thread.exit();
    }

    #[test]
    fn test_second_start_would_block() {
        let config = StreamConfig::new(8000, AudioFormat::Pcm16, 1);
        let thread = record_thread(config, config, 64);
        let (a, _ring_a) = thread.create_track(None, 8000, AudioFormat::Pcm16, 1, 256).unwrap();
        let (b, _ring_b) = thread.create_track(None, 8000, AudioFormat::Pcm16, 1, 256).unwrap();
        thread.start_track(a).unwrap();
        assert!(matches!(thread.start_track(b), Err(Error::WouldBlock)));
        thread.stop_track(a).unwrap();
        assert_eq!(thread.active_track(), None);
        assert_eq!(thread.track_state(a), Some(TrackState::Stopped));
        thread.start_track(b).unwrap();
        thread.exit();
    }

    #[test]
    fn test_channel_mismatch_fails_start() {
        let config = StreamConfig::new(8000, AudioFormat::Pcm16, 1);
        let thread = record_thread(config, config, 64);
        let (id, _ring) = thread.create_track(None, 8000, AudioFormat::Pcm16, 2, 256).unwrap();
        assert!(matches!(thread.start_track(id), Err(Error::InvalidArgument(_))));
        assert_eq!(thread.active_track(), None);
        thread.exit();
    }

    #[test]
    fn test_rejects_other_rates() {
        let config = StreamConfig::new(8000, AudioFormat::Pcm16, 1);
        let thread = record_thread(config, config, 64);
        assert!(thread.create_track(None, 16000, AudioFormat::Pcm16, 1, 0).is_err());
        assert!(thread.create_track(None, 8000, AudioFormat::Pcm8, 1, 0).is_err());
        thread.exit();
    }

    #[test]
    fn test_overflow_flag_when_client_stalls() {
        let config = StreamConfig::new(8000, AudioFormat::Pcm16, 1);
        let thread = record_thread(config, config, 64);
        let (id, ring) = thread.create_track(None, 8000, AudioFormat::Pcm16, 1, 64).unwrap();
        thread.start_track(id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ring.control().has_flag(flags::OVERFLOW) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ring.take_overflow());
        assert_eq!(thread.active_track(), Some(id));
        thread.exit();
    }

    #[test]
    fn test_contended_step_is_not_an_overflow() {
        let config = StreamConfig::new(8000, AudioFormat::Pcm16, 1);
        let mut hw = MemoryHardware::new(64).with_input_frame_count(64);
        let input = hw.open_input_stream(config).unwrap();
        let io = InputParams::from_stream(input.as_ref());
        let thread = RecordThread::new(
            IoHandle(5),
            input,
            config,
            ServerConfig::default(),
            Arc::new(ListenerRegistry::new()),
        );
        let mut capture = Capture::new(io, config);
        let ring = RingBuffer::new(Direction::Record, 64, 8000, 1, None).unwrap();

        let region = ring.get_next_buffer(64).unwrap();
        {
            let _held = ring.hold_lock();
            assert!(!ring.step_server(region.frames));
            thread.capture_cycle(&mut capture, &ring);
            assert!(ring.step_pending());
        }
        assert!(!ring.control().has_flag(flags::OVERFLOW));

        // the retried step fills the buffer; now the client really is behind
        thread.capture_cycle(&mut capture, &ring);
        assert!(!ring.step_pending());
        assert!(ring.take_overflow());
    }
}

//! In-memory sound hardware
//!
//! Outputs keep everything written to them, inputs synthesize a
//! deterministic waveform. With pacing enabled both block for the real
//! duration of each buffer, which makes the daemon behave like it would on
//! a sound card.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::device::{decode_samples, AudioHardware, HwResult, StreamIn, StreamOut};
use crate::error::HardwareError;
use crate::params::{AudioParameters, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::protocol::{AudioFormat, AudioMode, StreamConfig};

/// Deterministic test signal: never zero, distinct per channel
pub fn waveform(frame: u64, channel: u16) -> i16 {
    let v = ((frame * 37 + channel as u64 * 1001) % 4001) as i32 - 2000;
    if v == 0 {
        1
    } else {
        v as i16
    }
}

fn frames_duration(frames: usize, rate: u32) -> Duration {
    Duration::from_micros(frames as u64 * 1_000_000 / rate.max(1) as u64)
}

/// Apply the stream keys of a parameter string to `config`
fn apply_stream_params(
    params: &AudioParameters,
    config: &mut StreamConfig,
    frame_count: &mut usize,
) -> HwResult<bool> {
    let int = |key: &str| -> HwResult<Option<i64>> {
        params
            .get_int(key)
            .map_err(|e| HardwareError::BadValue(e.to_string()))
    };
    let mut next = *config;
    let mut next_frames = *frame_count;
    if let Some(rate) = int(KEY_SAMPLING_RATE)? {
        if rate <= 0 {
            return Err(HardwareError::BadValue(format!("sampling_rate={rate}")));
        }
        next.sample_rate = rate as u32;
    }
    if let Some(code) = int(KEY_FORMAT)? {
        next.format = AudioFormat::from_code(code)
            .ok_or_else(|| HardwareError::BadValue(format!("format={code}")))?;
    }
    if let Some(channels) = int(KEY_CHANNELS)? {
        if !(1..=8).contains(&channels) {
            return Err(HardwareError::BadValue(format!("channels={channels}")));
        }
        next.channels = channels as u16;
    }
    if let Some(frames) = int(KEY_FRAME_COUNT)? {
        if frames <= 0 {
            return Err(HardwareError::BadValue(format!("frame_count={frames}")));
        }
        next_frames = frames as usize;
    }
    let changed = next != *config || next_frames != *frame_count;
    *config = next;
    *frame_count = next_frames;
    Ok(changed)
}

struct StreamShape {
    config: StreamConfig,
    frame_count: usize,
    extra: AudioParameters,
}

/// Playback stream capturing its output
pub struct MemoryOutput {
    shape: Mutex<StreamShape>,
    written: Mutex<BytesMut>,
    record: bool,
    paced: bool,
    writes: AtomicU64,
    standby_calls: AtomicU64,
    in_standby: AtomicBool,
    volume: Mutex<(f32, f32)>,
}

impl MemoryOutput {
    fn new(config: StreamConfig, frame_count: usize, record: bool, paced: bool) -> Self {
        Self {
            shape: Mutex::new(StreamShape {
                config,
                frame_count,
                extra: AudioParameters::new(),
            }),
            written: Mutex::new(BytesMut::new()),
            record,
            paced,
            writes: AtomicU64::new(0),
            standby_calls: AtomicU64::new(0),
            in_standby: AtomicBool::new(true),
            volume: Mutex::new((1.0, 1.0)),
        }
    }

    /// Copy of everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().to_vec()
    }

    pub fn written_len(&self) -> usize {
        self.written.lock().len()
    }

    /// Written bytes decoded as interleaved PCM16
    pub fn written_samples(&self) -> Vec<i16> {
        let mut out = Vec::new();
        decode_samples(&self.written.lock(), AudioFormat::Pcm16, &mut out);
        out
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn standby_count(&self) -> u64 {
        self.standby_calls.load(Ordering::Relaxed)
    }

    pub fn is_standby(&self) -> bool {
        self.in_standby.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> (f32, f32) {
        *self.volume.lock()
    }

    pub fn frame_count(&self) -> usize {
        self.shape.lock().frame_count
    }
}

impl StreamOut for MemoryOutput {
    fn sample_rate(&self) -> u32 {
        self.shape.lock().config.sample_rate
    }

    fn channels(&self) -> u16 {
        self.shape.lock().config.channels
    }

    fn format(&self) -> AudioFormat {
        self.shape.lock().config.format
    }

    fn buffer_size(&self) -> usize {
        let shape = self.shape.lock();
        shape.frame_count * shape.config.frame_size()
    }

    fn latency_ms(&self) -> u32 {
        let shape = self.shape.lock();
        (shape.frame_count as u64 * 1000 / shape.config.sample_rate.max(1) as u64) as u32
    }

    fn write(&self, bytes: &[u8]) -> HwResult<usize> {
        self.in_standby.store(false, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.record {
            self.written.lock().extend_from_slice(bytes);
        }
        if self.paced {
            let (frame_size, rate) = {
                let shape = self.shape.lock();
                (shape.config.frame_size().max(1), shape.config.sample_rate)
            };
            std::thread::sleep(frames_duration(bytes.len() / frame_size, rate));
        }
        Ok(bytes.len())
    }

    fn standby(&self) -> HwResult<()> {
        self.in_standby.store(true, Ordering::Relaxed);
        self.standby_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_volume(&self, left: f32, right: f32) -> HwResult<()> {
        *self.volume.lock() = (left, right);
        Ok(())
    }

    fn set_parameters(&self, kv: &str) -> HwResult<()> {
        let params = AudioParameters::parse(kv);
        let mut shape = self.shape.lock();
        let mut config = shape.config;
        let mut frames = shape.frame_count;
        let changed = apply_stream_params(&params, &mut config, &mut frames)?;
        if changed && !self.in_standby.load(Ordering::Relaxed) {
            return Err(HardwareError::StandbyRequired);
        }
        shape.config = config;
        shape.frame_count = frames;
        for key in params.keys() {
            if ![KEY_SAMPLING_RATE, KEY_FORMAT, KEY_CHANNELS, KEY_FRAME_COUNT].contains(&key) {
                if let Some(v) = params.get(key) {
                    shape.extra.set(key, v);
                }
            }
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        let shape = self.shape.lock();
        let mut reply = AudioParameters::new();
        for key in AudioParameters::parse(keys).keys() {
            match key {
                KEY_SAMPLING_RATE => reply.set(key, shape.config.sample_rate),
                KEY_CHANNELS => reply.set(key, shape.config.channels),
                KEY_FORMAT => reply.set(key, shape.config.format.code()),
                KEY_FRAME_COUNT => reply.set(key, shape.frame_count),
                other => {
                    if let Some(v) = shape.extra.get(other) {
                        reply.set(other, v);
                    }
                }
            }
        }
        reply.to_string()
    }
}

/// Capture stream producing [`waveform`]
pub struct MemoryInput {
    shape: Mutex<StreamShape>,
    paced: bool,
    next_frame: AtomicU64,
    in_standby: AtomicBool,
    standby_calls: AtomicU64,
}

impl MemoryInput {
    fn new(config: StreamConfig, frame_count: usize, paced: bool) -> Self {
        Self {
            shape: Mutex::new(StreamShape {
                config,
                frame_count,
                extra: AudioParameters::new(),
            }),
            paced,
            next_frame: AtomicU64::new(0),
            in_standby: AtomicBool::new(true),
            standby_calls: AtomicU64::new(0),
        }
    }

    /// Frames produced so far
    pub fn frames_read(&self) -> u64 {
        self.next_frame.load(Ordering::Relaxed)
    }

    pub fn standby_count(&self) -> u64 {
        self.standby_calls.load(Ordering::Relaxed)
    }
}

impl StreamIn for MemoryInput {
    fn sample_rate(&self) -> u32 {
        self.shape.lock().config.sample_rate
    }

    fn channels(&self) -> u16 {
        self.shape.lock().config.channels
    }

    fn format(&self) -> AudioFormat {
        self.shape.lock().config.format
    }

    fn buffer_size(&self) -> usize {
        let shape = self.shape.lock();
        shape.frame_count * shape.config.frame_size()
    }

    fn read(&self, bytes: &mut [u8]) -> HwResult<usize> {
        self.in_standby.store(false, Ordering::Relaxed);
        let config = self.shape.lock().config;
        if config.format != AudioFormat::Pcm16 {
            return Err(HardwareError::Unsupported("memory input only produces PCM16".into()));
        }
        let frame_size = config.frame_size();
        let frames = bytes.len() / frame_size;
        let start = self.next_frame.fetch_add(frames as u64, Ordering::Relaxed);
        for f in 0..frames {
            for c in 0..config.channels {
                let s = waveform(start + f as u64, c);
                let at = f * frame_size + c as usize * 2;
                bytes[at..at + 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        if self.paced {
            std::thread::sleep(frames_duration(frames, config.sample_rate));
        }
        Ok(frames * frame_size)
    }

    fn standby(&self) -> HwResult<()> {
        self.in_standby.store(true, Ordering::Relaxed);
        self.standby_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_parameters(&self, kv: &str) -> HwResult<()> {
        let params = AudioParameters::parse(kv);
        let mut shape = self.shape.lock();
        let mut config = shape.config;
        let mut frames = shape.frame_count;
        let changed = apply_stream_params(&params, &mut config, &mut frames)?;
        if changed && !self.in_standby.load(Ordering::Relaxed) {
            return Err(HardwareError::StandbyRequired);
        }
        shape.config = config;
        shape.frame_count = frames;
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        let shape = self.shape.lock();
        let mut reply = AudioParameters::new();
        for key in AudioParameters::parse(keys).keys() {
            match key {
                KEY_SAMPLING_RATE => reply.set(key, shape.config.sample_rate),
                KEY_CHANNELS => reply.set(key, shape.config.channels),
                KEY_FORMAT => reply.set(key, shape.config.format.code()),
                KEY_FRAME_COUNT => reply.set(key, shape.frame_count),
                _ => {}
            }
        }
        reply.to_string()
    }
}

/// Streams opened so far, shared with whoever built the hardware
#[derive(Clone, Default)]
pub struct MemoryProbe {
    outputs: Arc<Mutex<Vec<Arc<MemoryOutput>>>>,
    inputs: Arc<Mutex<Vec<Arc<MemoryInput>>>>,
}

impl MemoryProbe {
    /// Output streams in opening order
    pub fn outputs(&self) -> Vec<Arc<MemoryOutput>> {
        self.outputs.lock().clone()
    }

    pub fn inputs(&self) -> Vec<Arc<MemoryInput>> {
        self.inputs.lock().clone()
    }
}

/// Hardware backed by memory
pub struct MemoryHardware {
    output_frame_count: usize,
    input_frame_count: usize,
    /// Only configuration accepted for inputs, if any
    fixed_input: Option<StreamConfig>,
    /// Only configuration accepted for outputs, if any
    fixed_output: Option<StreamConfig>,
    paced: bool,
    record_output: bool,
    hw_master_volume: bool,
    master_volume: Option<f32>,
    voice_volume: f32,
    mode: AudioMode,
    mic_muted: bool,
    params: AudioParameters,
    probe: MemoryProbe,
}

impl MemoryHardware {
    /// Unpaced hardware recording all output; for tests
    pub fn new(output_frame_count: usize) -> Self {
        Self {
            output_frame_count,
            input_frame_count: output_frame_count,
            fixed_input: None,
            fixed_output: None,
            paced: false,
            record_output: true,
            hw_master_volume: false,
            master_volume: None,
            voice_volume: 1.0,
            mode: AudioMode::Normal,
            mic_muted: false,
            params: AudioParameters::new(),
            probe: MemoryProbe::default(),
        }
    }

    /// Real-time paced hardware that discards output; for the daemon
    pub fn realtime(output_frame_count: usize, input_frame_count: usize) -> Self {
        Self {
            input_frame_count,
            paced: true,
            record_output: false,
            ..Self::new(output_frame_count)
        }
    }

    /// Sleep one buffer period per write while still recording output
    pub fn with_pacing(mut self) -> Self {
        self.paced = true;
        self
    }

    pub fn with_input_frame_count(mut self, frames: usize) -> Self {
        self.input_frame_count = frames;
        self
    }

    /// Accept only `config` for inputs, proposing it otherwise
    pub fn with_fixed_input(mut self, config: StreamConfig) -> Self {
        self.fixed_input = Some(config);
        self
    }

    pub fn with_fixed_output(mut self, config: StreamConfig) -> Self {
        self.fixed_output = Some(config);
        self
    }

    /// Pretend to support hardware master volume
    pub fn with_master_volume(mut self) -> Self {
        self.hw_master_volume = true;
        self
    }

    pub fn probe(&self) -> MemoryProbe {
        self.probe.clone()
    }

    pub fn hardware_master_volume(&self) -> Option<f32> {
        self.master_volume
    }

    pub fn voice_volume(&self) -> f32 {
        self.voice_volume
    }

    pub fn mode(&self) -> AudioMode {
        self.mode
    }
}

impl AudioHardware for MemoryHardware {
    fn init_check(&self) -> HwResult<()> {
        Ok(())
    }

    fn set_voice_volume(&mut self, volume: f32) -> HwResult<()> {
        self.voice_volume = volume;
        Ok(())
    }

    fn set_master_volume(&mut self, volume: f32) -> HwResult<()> {
        if !self.hw_master_volume {
            return Err(HardwareError::Unsupported("master volume".into()));
        }
        self.master_volume = Some(volume);
        Ok(())
    }

    fn set_mode(&mut self, mode: AudioMode) -> HwResult<()> {
        self.mode = mode;
        Ok(())
    }

    fn set_mic_mute(&mut self, muted: bool) -> HwResult<()> {
        self.mic_muted = muted;
        Ok(())
    }

    fn mic_mute(&self) -> bool {
        self.mic_muted
    }

    fn set_parameters(&mut self, kv: &str) -> HwResult<()> {
        let parsed = AudioParameters::parse(kv);
        for key in parsed.keys() {
            if let Some(v) = parsed.get(key) {
                self.params.set(key, v);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        let mut reply = AudioParameters::new();
        for key in AudioParameters::parse(keys).keys() {
            if let Some(v) = self.params.get(key) {
                reply.set(key, v);
            }
        }
        reply.to_string()
    }

    fn input_buffer_size(&self, sample_rate: u32, format: AudioFormat, channels: u16) -> usize {
        if sample_rate == 0 || !(1..=2).contains(&channels) {
            return 0;
        }
        self.input_frame_count * format.bytes_per_sample() * channels as usize
    }

    fn open_output_stream(&mut self, requested: StreamConfig) -> HwResult<Arc<dyn StreamOut>> {
        if let Some(fixed) = self.fixed_output {
            if fixed != requested {
                return Err(HardwareError::ConfigRejected { proposed: fixed });
            }
        }
        let stream = Arc::new(MemoryOutput::new(
            requested,
            self.output_frame_count,
            self.record_output,
            self.paced,
        ));
        self.probe.outputs.lock().push(Arc::clone(&stream));
        Ok(stream)
    }

    fn open_input_stream(&mut self, requested: StreamConfig) -> HwResult<Arc<dyn StreamIn>> {
        if let Some(fixed) = self.fixed_input {
            if fixed != requested {
                return Err(HardwareError::ConfigRejected { proposed: fixed });
            }
        }
        let stream = Arc::new(MemoryInput::new(requested, self.input_frame_count, self.paced));
        self.probe.inputs.lock().push(Arc::clone(&stream));
        Ok(stream)
    }
}

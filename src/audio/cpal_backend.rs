//! Sound card backend over cpal
//!
//! cpal is callback driven while the server's loops block on `write` and
//! `read`; each stream bridges the two with a bounded sample queue. The
//! cpal stream lives on its own thread, created on first use and torn down
//! on standby.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::atomic::AtomicCell;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{decode_samples, AudioHardware, HwResult, StreamIn, StreamOut};
use crate::error::HardwareError;
use crate::params::{AudioParameters, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::protocol::{AudioFormat, AudioMode, StreamConfig};

/// Poll interval while a queue is full or empty
const QUEUE_POLL: Duration = Duration::from_millis(1);

/// Hardware buffers worth of samples held between loop and callback
const QUEUE_BUFFERS: usize = 4;

struct StreamWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn cpal_config(config: &StreamConfig) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn hw_error(e: impl std::fmt::Display) -> HardwareError {
    HardwareError::Device(e.to_string())
}

/// Playback stream on the default output device
pub struct CpalOutput {
    config: StreamConfig,
    frame_count: usize,
    queue: Arc<ArrayQueue<i16>>,
    volume: Arc<AtomicCell<(f32, f32)>>,
    worker: Mutex<Option<StreamWorker>>,
    decoded: Mutex<Vec<i16>>,
}

impl CpalOutput {
    fn ensure_started(&self) -> HwResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let queue = self.queue.clone();
        let volume = self.volume.clone();
        let config = cpal_config(&self.config);

        let handle = thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    tracing::error!("No default output device");
                    return;
                };
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let (left, right) = volume.load();
                        for (i, out) in data.iter_mut().enumerate() {
                            let gain = if i % 2 == 0 { left } else { right };
                            *out = queue
                                .pop()
                                .map(|s| s as f32 / 32768.0 * gain)
                                .unwrap_or(0.0);
                        }
                    },
                    |err| tracing::warn!("Output stream error: {}", err),
                    None,
                );
                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start output stream: {}", e);
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => tracing::error!("Failed to build output stream: {}", e),
                }
            })
            .map_err(hw_error)?;

        *worker = Some(StreamWorker {
            running,
            handle: Some(handle),
        });
        Ok(())
    }
}

impl StreamOut for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn format(&self) -> AudioFormat {
        self.config.format
    }

    fn buffer_size(&self) -> usize {
        self.frame_count * self.config.frame_size()
    }

    fn latency_ms(&self) -> u32 {
        (self.frame_count * QUEUE_BUFFERS * 1000 / self.config.sample_rate.max(1) as usize) as u32
    }

    fn write(&self, bytes: &[u8]) -> HwResult<usize> {
        self.ensure_started()?;
        let mut decoded = self.decoded.lock();
        decode_samples(bytes, self.config.format, &mut decoded);
        for s in decoded.iter() {
            while self.queue.push(*s).is_err() {
                thread::sleep(QUEUE_POLL);
            }
        }
        Ok(bytes.len())
    }

    fn standby(&self) -> HwResult<()> {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
        while self.queue.pop().is_some() {}
        Ok(())
    }

    fn set_volume(&self, left: f32, right: f32) -> HwResult<()> {
        self.volume.store((left, right));
        Ok(())
    }

    fn set_parameters(&self, kv: &str) -> HwResult<()> {
        reject_stream_keys(kv)
    }

    fn get_parameters(&self, keys: &str) -> String {
        stream_parameters(keys, &self.config, self.frame_count)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

/// Capture stream on the default input device
pub struct CpalInput {
    config: StreamConfig,
    frame_count: usize,
    queue: Arc<ArrayQueue<i16>>,
    worker: Mutex<Option<StreamWorker>>,
}

impl CpalInput {
    fn ensure_started(&self) -> HwResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let queue = self.queue.clone();
        let config = cpal_config(&self.config);

        let handle = thread::Builder::new()
            .name("cpal-input".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_input_device() else {
                    tracing::error!("No default input device");
                    return;
                };
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for s in data {
                            let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                            // Drop on overflow; the loop is not keeping up
                            let _ = queue.push(v);
                        }
                    },
                    |err| tracing::warn!("Input stream error: {}", err),
                    None,
                );
                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start input stream: {}", e);
                            return;
                        }
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => tracing::error!("Failed to build input stream: {}", e),
                }
            })
            .map_err(hw_error)?;

        *worker = Some(StreamWorker {
            running,
            handle: Some(handle),
        });
        Ok(())
    }
}

impl StreamIn for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn format(&self) -> AudioFormat {
        self.config.format
    }

    fn buffer_size(&self) -> usize {
        self.frame_count * self.config.frame_size()
    }

    fn read(&self, bytes: &mut [u8]) -> HwResult<usize> {
        self.ensure_started()?;
        for chunk in bytes.chunks_exact_mut(2) {
            let sample = loop {
                match self.queue.pop() {
                    Some(s) => break s,
                    None => thread::sleep(QUEUE_POLL),
                }
            };
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(bytes.len() - bytes.len() % 2)
    }

    fn standby(&self) -> HwResult<()> {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
        while self.queue.pop().is_some() {}
        Ok(())
    }

    fn set_parameters(&self, kv: &str) -> HwResult<()> {
        reject_stream_keys(kv)
    }

    fn get_parameters(&self, keys: &str) -> String {
        stream_parameters(keys, &self.config, self.frame_count)
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

/// cpal streams are fixed once opened
fn reject_stream_keys(kv: &str) -> HwResult<()> {
    let params = AudioParameters::parse(kv);
    for key in [KEY_SAMPLING_RATE, KEY_FORMAT, KEY_CHANNELS, KEY_FRAME_COUNT] {
        if params.get(key).is_some() {
            return Err(HardwareError::BadValue(format!("{key} cannot change on this device")));
        }
    }
    Ok(())
}

fn stream_parameters(keys: &str, config: &StreamConfig, frame_count: usize) -> String {
    let mut reply = AudioParameters::new();
    for key in AudioParameters::parse(keys).keys() {
        match key {
            KEY_SAMPLING_RATE => reply.set(key, config.sample_rate),
            KEY_CHANNELS => reply.set(key, config.channels),
            KEY_FORMAT => reply.set(key, config.format.code()),
            KEY_FRAME_COUNT => reply.set(key, frame_count),
            _ => {}
        }
    }
    reply.to_string()
}

/// Default cpal host
pub struct CpalHardware {
    frame_count: usize,
    mode: AudioMode,
    mic_muted: bool,
    params: AudioParameters,
}

impl CpalHardware {
    pub fn new(frame_count: usize) -> Self {
        Self {
            frame_count,
            mode: AudioMode::Normal,
            mic_muted: false,
            params: AudioParameters::new(),
        }
    }

    fn negotiate(
        requested: StreamConfig,
        default: Result<cpal::SupportedStreamConfig, cpal::DefaultStreamConfigError>,
    ) -> HwResult<()> {
        let default = default.map_err(hw_error)?;
        let proposed = StreamConfig::new(default.sample_rate().0, AudioFormat::Pcm16, default.channels());
        if requested.format != AudioFormat::Pcm16
            || requested.sample_rate != proposed.sample_rate
            || requested.channels != proposed.channels
        {
            return Err(HardwareError::ConfigRejected { proposed });
        }
        Ok(())
    }
}

impl AudioHardware for CpalHardware {
    fn init_check(&self) -> HwResult<()> {
        let host = cpal::default_host();
        if host.default_output_device().is_none() {
            return Err(HardwareError::InitFailed("no default output device".into()));
        }
        Ok(())
    }

    fn set_voice_volume(&mut self, _volume: f32) -> HwResult<()> {
        Err(HardwareError::Unsupported("voice volume".into()))
    }

    fn set_master_volume(&mut self, _volume: f32) -> HwResult<()> {
        Err(HardwareError::Unsupported("master volume".into()))
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
        self.frame_count * format.bytes_per_sample() * channels as usize
    }

    fn open_output_stream(&mut self, requested: StreamConfig) -> HwResult<Arc<dyn StreamOut>> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| HardwareError::Device("no default output device".into()))?;
        Self::negotiate(requested, device.default_output_config())?;
        let capacity = self.frame_count * requested.channels as usize * QUEUE_BUFFERS;
        Ok(Arc::new(CpalOutput {
            config: requested,
            frame_count: self.frame_count,
            queue: Arc::new(ArrayQueue::new(capacity)),
            volume: Arc::new(AtomicCell::new((1.0, 1.0))),
            worker: Mutex::new(None),
            decoded: Mutex::new(Vec::new()),
        }))
    }

    fn open_input_stream(&mut self, requested: StreamConfig) -> HwResult<Arc<dyn StreamIn>> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| HardwareError::Device("no default input device".into()))?;
        Self::negotiate(requested, device.default_input_config())?;
        let capacity = self.frame_count * requested.channels as usize * QUEUE_BUFFERS;
        Ok(Arc::new(CpalInput {
            config: requested,
            frame_count: self.frame_count,
            queue: Arc::new(ArrayQueue::new(capacity)),
            worker: Mutex::new(None),
        }))
    }
}

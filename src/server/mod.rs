//! Control plane
//!
//! [`AudioServer`] owns the hardware, the global volume/mode state, the
//! client registry and the io handle → thread tables, and routes every
//! control request to the thread that owns the target.
//!
//! Locking: the server lock is always taken before any thread lock, and
//! the hardware lock is only ever taken innermost. Threads never call back
//! into the server, so a thread holding its own lock cannot deadlock
//! against a control call.

pub mod client;
pub mod dump;
pub mod listeners;
pub mod permissions;

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::audio::device::AudioHardware;
use crate::config::ServerConfig;
use crate::error::{Error, HardwareError, Result};
use crate::protocol::{
    AudioFormat, AudioMode, IoConfigEvent, IoDescriptor, IoHandle, OutputFlags, Pid, StreamConfig,
    StreamType,
};
use crate::threads::playback::{OutputKind, PlaybackThread, VolumeSettings};
use crate::threads::record::RecordThread;
use crate::tracks::handle::{RecordHandle, TrackHandle};

use self::client::{Client, ClientRegistry};
use self::dump::{try_lock_retrying, DumpReport};
use self::listeners::{ConfigListener, ListenerRegistry};
use self::permissions::{AllowAll, Permission, PermissionPolicy};

/// Hardware stays at a small floor for in-call volume so the far end is
/// never cut off completely
const VOICE_CALL_FLOOR: f32 = 0.01;

struct ServerState {
    outputs: BTreeMap<IoHandle, Arc<PlaybackThread>>,
    inputs: BTreeMap<IoHandle, Arc<RecordThread>>,
    /// What new outputs start with
    volumes: VolumeSettings,
}

/// The audio server
pub struct AudioServer {
    config: ServerConfig,
    hardware: Mutex<Box<dyn AudioHardware>>,
    permissions: Box<dyn PermissionPolicy>,
    clients: ClientRegistry,
    listeners: Arc<ListenerRegistry>,
    state: Mutex<ServerState>,
    next_handle: AtomicU32,
    /// Master volume as requested, even when applied in hardware
    master_volume: AtomicCell<f32>,
    master_mute: AtomicBool,
    mode: AtomicCell<AudioMode>,
}

impl AudioServer {
    /// Take over `hardware`. Fails when it reports itself unusable.
    pub fn new(hardware: Box<dyn AudioHardware>, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        hardware
            .init_check()
            .map_err(|e| Error::NotInitialized(format!("no usable audio hardware: {e}")))?;
        let volumes = VolumeSettings {
            master_mute: config.silent_mode,
            ..VolumeSettings::default()
        };
        tracing::info!("Audio server up");
        Ok(Self {
            master_mute: AtomicBool::new(volumes.master_mute),
            hardware: Mutex::new(hardware),
            permissions: Box::new(AllowAll),
            clients: Arc::new(DashMap::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            state: Mutex::new(ServerState {
                outputs: BTreeMap::new(),
                inputs: BTreeMap::new(),
                volumes,
            }),
            next_handle: AtomicU32::new(1),
            master_volume: AtomicCell::new(1.0),
            mode: AtomicCell::new(AudioMode::Normal),
            config,
        })
    }

    /// Replace the default allow-all permission policy
    pub fn with_permissions(mut self, policy: impl PermissionPolicy + 'static) -> Self {
        self.permissions = Box::new(policy);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn check(&self, pid: Pid, permission: Permission) -> Result<()> {
        if self.permissions.check(pid, permission) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!("pid {pid} lacks {permission:?}")))
        }
    }

    fn allocate_handle(&self) -> IoHandle {
        IoHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn output_locked(state: &ServerState, handle: IoHandle) -> Result<Arc<PlaybackThread>> {
        state
            .outputs
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown output {handle}")))
    }

    fn input_locked(state: &ServerState, handle: IoHandle) -> Result<Arc<RecordThread>> {
        state
            .inputs
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown input {handle}")))
    }

    pub fn output(&self, handle: IoHandle) -> Option<Arc<PlaybackThread>> {
        self.state.lock().outputs.get(&handle).cloned()
    }

    pub fn input(&self, handle: IoHandle) -> Option<Arc<RecordThread>> {
        self.state.lock().inputs.get(&handle).cloned()
    }

    pub fn output_handles(&self) -> Vec<IoHandle> {
        self.state.lock().outputs.keys().copied().collect()
    }

    pub fn input_handles(&self) -> Vec<IoHandle> {
        self.state.lock().inputs.keys().copied().collect()
    }

    /// Pids with at least one live track
    pub fn clients(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self
            .clients
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| *entry.key())
            .collect();
        pids.sort_unstable();
        pids
    }

    // ---- io management ----

    /// Open a hardware output and start its loop. A configuration the
    /// hardware rejects is retried once with the one it proposes.
    pub fn open_output(&self, requested: StreamConfig, flags: OutputFlags) -> Result<IoHandle> {
        let mut state = self.state.lock();
        let stream = {
            let mut hw = self.hardware.lock();
            match hw.open_output_stream(requested) {
                Err(HardwareError::ConfigRejected { proposed }) => {
                    tracing::info!("Output {:?} rejected, reopening with {:?}", requested, proposed);
                    hw.open_output_stream(proposed)?
                }
                other => other?,
            }
        };
        let negotiated = stream.config();
        let kind = if flags.contains(OutputFlags::DIRECT)
            || negotiated.format != AudioFormat::Pcm16
            || negotiated.channels != 2
        {
            OutputKind::Direct
        } else {
            OutputKind::Mixer
        };

        let handle = self.allocate_handle();
        let thread = PlaybackThread::new(
            handle,
            kind,
            stream,
            self.config.clone(),
            &state.volumes,
            Arc::clone(&self.listeners),
        );
        thread.run()?;
        state.outputs.insert(handle, thread);
        tracing::info!("Opened {:?} output {} at {:?}", kind, handle, negotiated);
        Ok(handle)
    }

    /// Output mixing at `a`'s configuration and feeding both `a` and `b`
    pub fn open_duplicate_output(&self, a: IoHandle, b: IoHandle) -> Result<IoHandle> {
        let mut state = self.state.lock();
        if a == b {
            return Err(Error::InvalidArgument(format!("cannot duplicate {a} onto itself")));
        }
        let first = Self::output_locked(&state, a)?;
        let second = Self::output_locked(&state, b)?;
        if first.kind() != OutputKind::Mixer || second.kind() != OutputKind::Mixer {
            return Err(Error::InvalidArgument(format!(
                "duplication needs two mixer outputs, got {:?} and {:?}",
                first.kind(),
                second.kind()
            )));
        }

        let handle = self.allocate_handle();
        let thread = PlaybackThread::new_duplicating(
            handle,
            &first,
            self.config.clone(),
            &state.volumes,
            Arc::clone(&self.listeners),
        );
        thread.add_output_track(&first)?;
        thread.add_output_track(&second)?;
        thread.run()?;
        state.outputs.insert(handle, thread);
        tracing::info!("Opened duplicating output {} over {} and {}", handle, a, b);
        Ok(handle)
    }

    /// Unregister an output and stop its loop. Duplicating outputs stop
    /// feeding it first.
    pub fn close_output(&self, handle: IoHandle) -> Result<()> {
        let thread = {
            let mut state = self.state.lock();
            let thread = state
                .outputs
                .remove(&handle)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown output {handle}")))?;
            if thread.kind() == OutputKind::Mixer {
                for dup in state
                    .outputs
                    .values()
                    .filter(|t| t.kind() == OutputKind::Duplicating)
                {
                    dup.remove_output_track(handle);
                }
            }
            thread
        };
        thread.exit();
        tracing::info!("Closed output {}", handle);
        Ok(())
    }

    /// Open a capture stream. When the hardware proposes another setup
    /// that can be converted (PCM16, at most stereo, at most twice the
    /// requested rate) it is accepted and converted on the fly.
    pub fn open_input(&self, requested: StreamConfig) -> Result<IoHandle> {
        if requested.sample_rate == 0 || !(1..=2).contains(&requested.channels) {
            return Err(Error::InvalidArgument(format!("input config {requested:?}")));
        }
        let mut state = self.state.lock();
        let stream = {
            let mut hw = self.hardware.lock();
            match hw.open_input_stream(requested) {
                Err(HardwareError::ConfigRejected { proposed })
                    if requested.format == AudioFormat::Pcm16
                        && proposed.format == requested.format
                        && proposed.sample_rate <= requested.sample_rate.saturating_mul(2)
                        && proposed.channels < 3 =>
                {
                    tracing::info!("Input {:?} rejected, reopening with {:?}", requested, proposed);
                    hw.open_input_stream(proposed)?
                }
                other => other?,
            }
        };
        if let Err(e) = stream.standby() {
            tracing::warn!("Fresh input refused standby: {}", e);
        }

        let handle = self.allocate_handle();
        let native = stream.config();
        let thread = RecordThread::new(
            handle,
            stream,
            requested,
            self.config.clone(),
            Arc::clone(&self.listeners),
        );
        thread.run()?;
        state.inputs.insert(handle, thread);
        tracing::info!("Opened input {} at {:?} (hardware {:?})", handle, requested, native);
        Ok(handle)
    }

    pub fn close_input(&self, handle: IoHandle) -> Result<()> {
        let thread = {
            let mut state = self.state.lock();
            state
                .inputs
                .remove(&handle)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown input {handle}")))?
        };
        thread.exit();
        tracing::info!("Closed input {}", handle);
        Ok(())
    }

    pub fn suspend_output(&self, handle: IoHandle) -> Result<()> {
        let state = self.state.lock();
        Self::output_locked(&state, handle)?.suspend();
        Ok(())
    }

    pub fn restore_output(&self, handle: IoHandle) -> Result<()> {
        let state = self.state.lock();
        Self::output_locked(&state, handle)?.restore();
        Ok(())
    }

    // ---- tracks ----

    /// Create a playback track for `pid` on `output`. A `static_data`
    /// track plays the given samples instead of a streaming buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn create_track(
        &self,
        pid: Pid,
        stream: StreamType,
        sample_rate: u32,
        format: AudioFormat,
        channels: u16,
        frame_count: u32,
        static_data: Option<&[i16]>,
        output: IoHandle,
    ) -> Result<TrackHandle> {
        if stream == StreamType::Internal {
            return Err(Error::InvalidArgument("stream type reserved for duplication".into()));
        }
        let state = self.state.lock();
        let thread = Self::output_locked(&state, output)?;
        let client = Client::get_or_create(&self.clients, pid, self.config.client_heap_size);
        let (id, ring) = thread.create_track(
            Some(client),
            stream,
            sample_rate,
            format,
            channels,
            frame_count,
            static_data,
        )?;
        Ok(TrackHandle::new(thread, id, ring))
    }

    /// Create a capture track for `pid` on `input`
    pub fn open_record(
        &self,
        pid: Pid,
        input: IoHandle,
        sample_rate: u32,
        format: AudioFormat,
        channels: u16,
        frame_count: u32,
    ) -> Result<RecordHandle> {
        self.check(pid, Permission::RecordAudio)?;
        let state = self.state.lock();
        let thread = Self::input_locked(&state, input)?;
        let client = Client::get_or_create(&self.clients, pid, self.config.client_heap_size);
        let (id, ring) =
            thread.create_track(Some(client), sample_rate, format, channels, frame_count)?;
        Ok(RecordHandle::new(thread, id, ring))
    }

    // ---- output queries ----

    pub fn output_descriptor(&self, output: IoHandle) -> Result<IoDescriptor> {
        let state = self.state.lock();
        Ok(Self::output_locked(&state, output)?.descriptor())
    }

    pub fn sample_rate(&self, output: IoHandle) -> Result<u32> {
        Ok(self.output_descriptor(output)?.sample_rate)
    }

    pub fn channel_count(&self, output: IoHandle) -> Result<u16> {
        Ok(self.output_descriptor(output)?.channels)
    }

    pub fn format(&self, output: IoHandle) -> Result<AudioFormat> {
        Ok(self.output_descriptor(output)?.format)
    }

    pub fn frame_count(&self, output: IoHandle) -> Result<usize> {
        Ok(self.output_descriptor(output)?.frame_count)
    }

    /// Hardware latency in milliseconds
    pub fn latency(&self, output: IoHandle) -> Result<u32> {
        Ok(self.output_descriptor(output)?.latency_ms)
    }

    pub fn is_music_active(&self) -> bool {
        self.state
            .lock()
            .outputs
            .values()
            .any(|t| t.is_music_active())
    }

    // ---- volume, mode, mutes ----

    /// Applied in hardware when supported, in the mixers otherwise
    pub fn set_master_volume(&self, pid: Pid, volume: f32) -> Result<()> {
        self.check(pid, Permission::ModifyAudioSettings)?;
        if !volume.is_finite() || volume < 0.0 {
            return Err(Error::InvalidArgument(format!("master volume {volume}")));
        }
        let mut state = self.state.lock();
        let software = match self.hardware.lock().set_master_volume(volume) {
            Ok(()) => 1.0,
            Err(_) => volume,
        };
        self.master_volume.store(volume);
        state.volumes.master_volume = software;
        for thread in state.outputs.values() {
            thread.set_master_volume(software);
        }
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume.load()
    }

    pub fn set_master_mute(&self, pid: Pid, muted: bool) -> Result<()> {
        self.check(pid, Permission::ModifyAudioSettings)?;
        let mut state = self.state.lock();
        self.master_mute.store(muted, Ordering::Relaxed);
        state.volumes.master_mute = muted;
        for thread in state.outputs.values() {
            thread.set_master_mute(muted);
        }
        Ok(())
    }

    pub fn master_mute(&self) -> bool {
        self.master_mute.load(Ordering::Relaxed)
    }

    /// Set a stream type's volume on every output, or on `output` only.
    /// In-call and SCO volumes are also forwarded to the hardware.
    pub fn set_stream_volume(
        &self,
        pid: Pid,
        stream: StreamType,
        volume: f32,
        output: Option<IoHandle>,
    ) -> Result<()> {
        self.check(pid, Permission::ModifyAudioSettings)?;
        if stream == StreamType::Internal {
            return Err(Error::InvalidArgument("stream type reserved for duplication".into()));
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(Error::InvalidArgument(format!("stream volume {volume}")));
        }
        let mut state = self.state.lock();
        let target = output
            .map(|h| Self::output_locked(&state, h))
            .transpose()?;

        let mut value = volume;
        let mut status = Ok(());
        if matches!(stream, StreamType::VoiceCall | StreamType::BluetoothSco) {
            let hw_value = if stream == StreamType::VoiceCall {
                value = VOICE_CALL_FLOOR + (1.0 - VOICE_CALL_FLOOR) * volume;
                volume
            } else {
                1.0
            };
            status = self
                .hardware
                .lock()
                .set_voice_volume(hw_value)
                .map_err(Error::from);
        }

        state.volumes.streams[stream.index()].0 = value;
        match target {
            Some(thread) => thread.set_stream_volume(stream, value),
            None => {
                for thread in state.outputs.values() {
                    thread.set_stream_volume(stream, value);
                }
            }
        }
        status
    }

    /// Volume as set by the caller, from `output` or the global table
    pub fn stream_volume(&self, stream: StreamType, output: Option<IoHandle>) -> Result<f32> {
        let state = self.state.lock();
        let volume = match output {
            Some(h) => Self::output_locked(&state, h)?.stream_volume(stream),
            None => state.volumes.streams[stream.index()].0,
        };
        Ok(if stream == StreamType::VoiceCall {
            (volume - VOICE_CALL_FLOOR) / (1.0 - VOICE_CALL_FLOOR)
        } else {
            volume
        })
    }

    /// Enforced-audible streams cannot be muted
    pub fn set_stream_mute(&self, pid: Pid, stream: StreamType, muted: bool) -> Result<()> {
        self.check(pid, Permission::ModifyAudioSettings)?;
        if matches!(stream, StreamType::EnforcedAudible | StreamType::Internal) {
            return Err(Error::InvalidArgument(format!("{stream:?} cannot be muted")));
        }
        let mut state = self.state.lock();
        state.volumes.streams[stream.index()].1 = muted;
        for thread in state.outputs.values() {
            thread.set_stream_mute(stream, muted);
        }
        Ok(())
    }

    pub fn stream_mute(&self, stream: StreamType) -> bool {
        self.state.lock().volumes.streams[stream.index()].1
    }

    pub fn set_mode(&self, pid: Pid, mode: AudioMode) -> Result<()> {
        self.check(pid, Permission::ModifyAudioSettings)?;
        self.hardware.lock().set_mode(mode)?;
        self.mode.store(mode);
        Ok(())
    }

    pub fn mode(&self) -> AudioMode {
        self.mode.load()
    }

    pub fn set_mic_mute(&self, pid: Pid, muted: bool) -> Result<()> {
        self.check(pid, Permission::ModifyAudioSettings)?;
        self.hardware.lock().set_mic_mute(muted)?;
        Ok(())
    }

    pub fn mic_mute(&self) -> bool {
        self.hardware.lock().mic_mute()
    }

    /// Capture buffer size a client should use, in bytes
    pub fn input_buffer_size(&self, sample_rate: u32, format: AudioFormat, channels: u16) -> usize {
        self.hardware
            .lock()
            .input_buffer_size(sample_rate, format, channels)
    }

    // ---- parameters ----

    /// `None` targets the hardware itself. Thread targets block until
    /// their loop has applied the change.
    pub fn set_parameters(&self, pid: Pid, io: Option<IoHandle>, kv: &str) -> Result<()> {
        self.check(pid, Permission::ModifyAudioSettings)?;
        let Some(handle) = io else {
            return Ok(self.hardware.lock().set_parameters(kv)?);
        };
        let (output, input) = {
            let state = self.state.lock();
            (
                state.outputs.get(&handle).cloned(),
                state.inputs.get(&handle).cloned(),
            )
        };
        match (output, input) {
            (Some(thread), _) => thread.set_parameters(kv),
            (None, Some(thread)) => thread.set_parameters(kv),
            (None, None) => Err(Error::InvalidArgument(format!("unknown io {handle}"))),
        }
    }

    /// Empty for unknown handles
    pub fn get_parameters(&self, io: Option<IoHandle>, keys: &str) -> String {
        let Some(handle) = io else {
            return self.hardware.lock().get_parameters(keys);
        };
        let state = self.state.lock();
        if let Some(thread) = state.outputs.get(&handle) {
            return thread.get_parameters(keys);
        }
        if let Some(thread) = state.inputs.get(&handle) {
            return thread.get_parameters(keys);
        }
        String::new()
    }

    // ---- listeners ----

    /// Register a listener and re-announce every open io to listeners.
    /// The announcements come from the threads themselves.
    pub fn register_client(&self, listener: Box<dyn ConfigListener>) -> Uuid {
        let state = self.state.lock();
        let id = self.listeners.register(listener);
        for thread in state.outputs.values() {
            thread.send_config_event(IoConfigEvent::OutputOpened, None);
        }
        for thread in state.inputs.values() {
            thread.send_config_event(IoConfigEvent::InputOpened);
        }
        id
    }

    pub fn unregister_client(&self, id: Uuid) -> bool {
        self.listeners.unregister(id)
    }

    // ---- diagnostics ----

    /// Snapshot of everything; never blocks on a stuck lock for longer
    /// than the configured retries
    pub fn dump(&self, pid: Pid) -> Result<DumpReport> {
        self.check(pid, Permission::Dump)?;
        let retries = self.config.dump_lock_retries;
        let sleep = self.config.dump_lock_sleep();

        let hardware_busy = try_lock_retrying(&self.hardware, retries, sleep).is_none();
        let (server_locked, outputs, inputs) = match try_lock_retrying(&self.state, retries, sleep) {
            Some(state) => (
                false,
                state.outputs.values().cloned().collect::<Vec<_>>(),
                state.inputs.values().cloned().collect::<Vec<_>>(),
            ),
            None => (true, Vec::new(), Vec::new()),
        };

        Ok(DumpReport {
            generated_at: chrono::Utc::now(),
            hardware_busy,
            server_locked,
            mode: self.mode(),
            clients: self.clients(),
            listeners: self.listeners.len(),
            master_volume: self.master_volume(),
            master_mute: self.master_mute(),
            outputs: outputs.iter().map(|t| t.dump(retries, sleep)).collect(),
            inputs: inputs.iter().map(|t| t.dump(retries, sleep)).collect(),
        })
    }

    /// Stop every loop. Duplicating outputs go first so their sinks detach
    /// from live outputs.
    pub fn shutdown(&self) {
        let (outputs, inputs) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.outputs),
                std::mem::take(&mut state.inputs),
            )
        };
        if outputs.is_empty() && inputs.is_empty() {
            return;
        }
        let (dups, rest): (Vec<_>, Vec<_>) = outputs
            .into_values()
            .partition(|t| t.kind() == OutputKind::Duplicating);
        for thread in dups.into_iter().chain(rest) {
            thread.exit();
        }
        for thread in inputs.into_values() {
            thread.exit();
        }
        tracing::info!("Audio server stopped");
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryHardware;

    fn server() -> AudioServer {
        AudioServer::new(Box::new(MemoryHardware::new(256)), ServerConfig::default()).unwrap()
    }

    #[test]
    fn test_handles_increase() {
        let server = server();
        let a = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        let b = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        assert!(b > a);
        assert_eq!(server.output(a).unwrap().kind(), OutputKind::Mixer);
        server.close_output(a).unwrap();
        assert!(server.close_output(a).is_err());
        assert_eq!(server.output_handles(), vec![b]);
    }

    #[test]
    fn test_direct_selection() {
        let server = server();
        let mono = server
            .open_output(StreamConfig::new(44100, AudioFormat::Pcm16, 1), OutputFlags::NONE)
            .unwrap();
        let flagged = server
            .open_output(StreamConfig::default(), OutputFlags::DIRECT)
            .unwrap();
        assert_eq!(server.output(mono).unwrap().kind(), OutputKind::Direct);
        assert_eq!(server.output(flagged).unwrap().kind(), OutputKind::Direct);
    }

    #[test]
    fn test_duplicate_needs_mixers() {
        let server = server();
        let a = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        let d = server.open_output(StreamConfig::default(), OutputFlags::DIRECT).unwrap();
        assert!(matches!(
            server.open_duplicate_output(a, d),
            Err(Error::InvalidArgument(_))
        ));
        let b = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        let dup = server.open_duplicate_output(a, b).unwrap();
        assert_eq!(server.output(dup).unwrap().output_targets(), vec![a, b]);

        server.close_output(b).unwrap();
        assert_eq!(server.output(dup).unwrap().output_targets(), vec![a]);
    }

    #[test]
    fn test_voice_call_volume_round_trip() {
        let server = server();
        server
            .set_stream_volume(0, StreamType::VoiceCall, 0.5, None)
            .unwrap();
        let got = server.stream_volume(StreamType::VoiceCall, None).unwrap();
        assert!((got - 0.5).abs() < 1e-6);
        let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        let raw = server.output(out).unwrap().stream_volume(StreamType::VoiceCall);
        assert!((raw - 0.505).abs() < 1e-6);
    }

    #[test]
    fn test_enforced_audible_cannot_be_muted() {
        let server = server();
        assert!(server
            .set_stream_mute(0, StreamType::EnforcedAudible, true)
            .is_err());
        server.set_stream_mute(0, StreamType::Music, true).unwrap();
        assert!(server.stream_mute(StreamType::Music));
    }

    #[test]
    fn test_master_volume_in_hardware_keeps_mixer_at_unity() {
        let hw = MemoryHardware::new(256).with_master_volume();
        let server = AudioServer::new(Box::new(hw), ServerConfig::default()).unwrap();
        let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        server.set_master_volume(0, 0.3).unwrap();
        assert_eq!(server.master_volume(), 0.3);
        assert_eq!(server.output(out).unwrap().master_volume(), 1.0);

        let soft = AudioServer::new(Box::new(MemoryHardware::new(256)), ServerConfig::default())
            .unwrap();
        let out = soft.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        soft.set_master_volume(0, 0.3).unwrap();
        assert_eq!(soft.output(out).unwrap().master_volume(), 0.3);
    }

    #[test]
    fn test_permissions() {
        let server = server().with_permissions(|pid: Pid, _: Permission| pid == 0);
        assert!(matches!(
            server.set_master_mute(7, true),
            Err(Error::PermissionDenied(_))
        ));
        assert!(server.dump(7).is_err());
        server.set_master_mute(0, true).unwrap();
        assert!(server.master_mute());
    }

    #[test]
    fn test_internal_stream_rejected() {
        let server = server();
        let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        assert!(server
            .create_track(1, StreamType::Internal, 44100, AudioFormat::Pcm16, 2, 0, None, out)
            .is_err());
        assert!(server
            .create_track(1, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 0, None, IoHandle(99))
            .is_err());
    }

    #[test]
    fn test_clients_follow_tracks() {
        let server = server();
        let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        let track = server
            .create_track(42, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 512, None, out)
            .unwrap();
        assert_eq!(server.clients(), vec![42]);
        drop(track);
        assert!(server.clients().is_empty());
    }

    #[test]
    fn test_dump_lists_ios() {
        let server = server();
        let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
        let report = server.dump(0).unwrap();
        assert!(!report.server_locked);
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.outputs[0].handle, out);
        assert!(report.to_text().contains("Output"));
    }
}

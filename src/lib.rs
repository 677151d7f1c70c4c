//! # audiomux
//!
//! Real-time audio server multiplexing many client PCM streams onto a few
//! hardware endpoints.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          CLIENT PROCESSES                                 │
//! │   TrackHandle ──write──▶ ┌──────────────┐      ┌──────────────┐ ◀─read──  │
//! │   (pid 100)              │ RingBuffer   │      │ RingBuffer   │  Record   │
//! │                          │ ControlBlock │      │ ControlBlock │  Handle   │
//! └──────────────────────────┼──────────────┼──────┼──────────────┼───────────┘
//!                            │ user│server  │      │ server│user  │
//! ┌──────────────────────────┼─────▼────────┼──────┼──────▲───────┼───────────┐
//! │                     AudioServer (server::AudioServer)                     │
//! │   clients: pid → Client (shared heap)     listeners: config events        │
//! │   playback: IoHandle → PlaybackThread     record: IoHandle → RecordThread │
//! │                                                                           │
//! │  ┌────────────────────────┐  ┌─────────────────┐  ┌────────────────────┐  │
//! │  │ PlaybackThread (Mixer) │  │ (Duplicating)   │  │ RecordThread       │  │
//! │  │  prepare_tracks        │  │  mixes, then    │  │  read hardware     │  │
//! │  │  AudioMixer::mix       │  │  fans out via   │  │  resample / fold   │  │
//! │  │  HardwareSink::write   │  │  OutputTracks   │  │  into ring buffer  │  │
//! │  └───────────┬────────────┘  └─────────────────┘  └─────────▲──────────┘  │
//! └──────────────┼──────────────────────────────────────────────┼─────────────┘
//!                ▼                                              │
//!        StreamOut (audio::device)                      StreamIn (audio::device)
//! ```
//!
//! Each thread runs one loop on a dedicated OS thread. Control calls land
//! on the server, which routes them to the owning thread under that
//! thread's lock; the loop picks changes up at its per-cycle checkpoint.

pub mod audio;
pub mod config;
pub mod error;
pub mod params;
pub mod protocol;
pub mod server;
pub mod threads;
pub mod tracks;

pub use error::{Error, Result};
pub use server::AudioServer;

/// Server-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate for opened streams
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default hardware buffer size in frames
    pub const DEFAULT_FRAME_COUNT: usize = 1024;

    /// Unity gain in 4.12 fixed point
    pub const UNITY_GAIN: u16 = 0x1000;

    /// Upper bound for a computed track gain (4.12 fixed point)
    pub const MAX_GAIN: f32 = 4096.0;

    /// Underrun cycles before an active track is evicted
    pub const MAX_TRACK_RETRIES: u32 = 50;

    /// Underrun cycles granted to a track that just started
    pub const MAX_TRACK_STARTUP_RETRIES: u32 = 50;

    /// First sleep after a cycle with nothing ready
    pub const BUFFER_RECOVERY: Duration = Duration::from_micros(2000);

    /// Cap on the underrun sleep
    pub const MAX_BUFFER_RECOVERY: Duration = Duration::from_micros(20000);

    /// Idle time before entering standby
    pub const STANDBY_DELAY: Duration = Duration::from_secs(3);

    /// Lock attempts made by the diagnostic dump
    pub const DUMP_LOCK_RETRIES: u32 = 50;

    pub const DUMP_LOCK_SLEEP: Duration = Duration::from_millis(20);

    /// Shared memory per client process
    pub const CLIENT_HEAP_SIZE: usize = 1024 * 1024;

    /// Overflow chunks queued by a duplication sink
    pub const MAX_OVERFLOW_BUFFERS: usize = 10;

    /// Mixer slots per output
    pub const MAX_TRACK_NAMES: usize = 32;

    /// Sleep after a capture client failed to drain
    pub const RECORD_OVERFLOW_SLEEP: Duration = Duration::from_millis(5);

    /// How long `set_parameters` waits for the loop to answer
    pub const PARAMETER_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

    /// Bound on the record start/stop handshake
    pub const START_STOP_TIMEOUT: Duration = Duration::from_secs(2);

    /// Client-side wait for ring buffer space or data
    pub const CLIENT_BUFFER_TIMEOUT: Duration = Duration::from_secs(1);
}

//! Track state machines
//!
//! A track is a ring buffer plus the state the owning loop keeps about it.
//! All transitions here run under the owning thread's lock.

use serde::Serialize;
use std::sync::Arc;

use crate::audio::buffer::{flags, RingBuffer};
use crate::protocol::{AudioFormat, Pid, StreamType};
use crate::server::client::Client;
use crate::tracks::manager::TrackId;

/// Lifecycle of a track; the order matters (`stop` acts above `Stopped`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Idle,
    Terminated,
    Stopped,
    Resuming,
    Active,
    Pausing,
    Paused,
}

/// Prefill progress of a freshly started playback track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    /// Waiting for a full buffer before the first mix
    Filling,
    /// Full, not mixed yet
    Filled,
    Active,
}

/// Client or loop-internal playback stream
pub struct PlaybackTrack {
    pub(crate) id: TrackId,
    /// Keeps the client (and its heap) alive; `None` for duplication sinks
    pub(crate) client: Option<Arc<Client>>,
    pub(crate) stream: StreamType,
    pub(crate) format: AudioFormat,
    pub(crate) ring: Arc<RingBuffer>,
    pub(crate) state: TrackState,
    pub(crate) fill: FillStatus,
    pub(crate) retry: u32,
    pub(crate) muted: bool,
    /// Mixer slot, for tracks on mixing outputs
    pub(crate) name: Option<usize>,
    pub(crate) reset_done: bool,
}

impl PlaybackTrack {
    pub fn new(
        id: TrackId,
        client: Option<Arc<Client>>,
        stream: StreamType,
        format: AudioFormat,
        ring: Arc<RingBuffer>,
        name: Option<usize>,
    ) -> Self {
        Self {
            id,
            client,
            stream,
            format,
            ring,
            state: TrackState::Idle,
            fill: FillStatus::Filling,
            retry: 0,
            muted: false,
            name,
            reset_done: false,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn is_stopped(&self) -> bool {
        self.state == TrackState::Stopped
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TrackState::Terminated
    }

    pub fn is_pausing(&self) -> bool {
        self.state == TrackState::Pausing
    }

    pub fn is_paused(&self) -> bool {
        self.state == TrackState::Paused
    }

    /// Ready to be mixed: prefilled, or told to go early
    pub fn is_ready(&mut self) -> bool {
        if self.fill != FillStatus::Filling {
            return true;
        }
        let cblk = self.ring.control();
        if self.ring.frames_ready() >= self.ring.frame_count() || cblk.has_flag(flags::FORCE_READY)
        {
            self.fill = FillStatus::Filled;
            cblk.clear_flag(flags::FORCE_READY);
            return true;
        }
        false
    }

    /// Drop buffered data once per start/stop cycle
    pub fn reset(&mut self) {
        if !self.reset_done {
            self.ring.reset();
            self.fill = FillStatus::Filling;
            self.reset_done = true;
        }
    }

    /// `false` when already at or below `Stopped`
    pub fn stop(&mut self, in_active_set: bool) -> bool {
        if self.state <= TrackState::Stopped {
            return false;
        }
        self.state = TrackState::Stopped;
        if !in_active_set {
            self.reset();
        }
        true
    }

    /// Only from `Active`/`Resuming`; the loop completes it to `Paused`
    pub fn pause(&mut self) -> bool {
        if matches!(self.state, TrackState::Active | TrackState::Resuming) {
            self.state = TrackState::Pausing;
            return true;
        }
        false
    }

    /// Only from `Stopped`/`Paused`/`Pausing`; discards buffered data
    pub fn flush(&mut self) -> bool {
        if !matches!(
            self.state,
            TrackState::Stopped | TrackState::Paused | TrackState::Pausing
        ) {
            return false;
        }
        self.state = TrackState::Stopped;
        self.ring.reset();
        self.fill = FillStatus::Filling;
        self.reset_done = true;
        true
    }

    pub fn info(&self, active: bool) -> TrackInfo {
        TrackInfo {
            id: self.id,
            name: self.name,
            client: self.client.as_ref().map(|c| c.pid()),
            stream: self.stream,
            state: self.state,
            fill: Some(self.fill),
            active,
            muted: self.muted,
            frame_count: self.ring.frame_count(),
            format: self.format,
            channels: self.ring.channels(),
            sample_rate: self.ring.control().sample_rate(),
            user: self.ring.control().user(),
            server: self.ring.control().server(),
            volume: self.ring.control().volume(),
            retry: self.retry,
        }
    }
}

/// Capture stream
pub struct RecordTrack {
    pub(crate) id: TrackId,
    pub(crate) client: Option<Arc<Client>>,
    pub(crate) format: AudioFormat,
    pub(crate) ring: Arc<RingBuffer>,
    pub(crate) state: TrackState,
}

impl RecordTrack {
    pub fn new(id: TrackId, client: Option<Arc<Client>>, format: AudioFormat, ring: Arc<RingBuffer>) -> Self {
        Self {
            id,
            client,
            format,
            ring,
            state: TrackState::Idle,
        }
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn info(&self, active: bool) -> TrackInfo {
        TrackInfo {
            id: self.id,
            name: None,
            client: self.client.as_ref().map(|c| c.pid()),
            stream: StreamType::Internal,
            state: self.state,
            fill: None,
            active,
            muted: false,
            frame_count: self.ring.frame_count(),
            format: self.format,
            channels: self.ring.channels(),
            sample_rate: self.ring.control().sample_rate(),
            user: self.ring.control().user(),
            server: self.ring.control().server(),
            volume: self.ring.control().volume(),
            retry: 0,
        }
    }
}

/// Track row in the diagnostic dump
#[derive(Debug, Clone, Serialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub name: Option<usize>,
    pub client: Option<Pid>,
    pub stream: StreamType,
    pub state: TrackState,
    pub fill: Option<FillStatus>,
    pub active: bool,
    pub muted: bool,
    pub frame_count: u32,
    pub format: AudioFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub user: u32,
    pub server: u32,
    pub volume: [u16; 2],
    pub retry: u32,
}

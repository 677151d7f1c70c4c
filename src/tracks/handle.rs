//! Client-side track handles
//!
//! What `create_track`/`open_record` hand back: the ring buffer to move
//! samples through plus the control calls routed to the owning loop.
//! Dropping a handle destroys its track.

use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::{flags, RingBuffer};
use crate::error::Result;
use crate::protocol::IoHandle;
use crate::threads::playback::PlaybackThread;
use crate::threads::record::RecordThread;
use crate::tracks::manager::TrackId;
use crate::tracks::track::TrackState;

/// Playback track owned by a client
pub struct TrackHandle {
    thread: Arc<PlaybackThread>,
    id: TrackId,
    ring: Arc<RingBuffer>,
}

impl TrackHandle {
    pub(crate) fn new(thread: Arc<PlaybackThread>, id: TrackId, ring: Arc<RingBuffer>) -> Self {
        Self { thread, id, ring }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn output(&self) -> IoHandle {
        self.thread.handle()
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn state(&self) -> Option<TrackState> {
        self.thread.track_state(self.id)
    }

    pub fn start(&self) -> Result<()> {
        self.thread.start_track(self.id)
    }

    pub fn stop(&self) -> Result<()> {
        self.thread.stop_track(self.id)
    }

    pub fn pause(&self) -> Result<()> {
        self.thread.pause_track(self.id)
    }

    /// Discard buffered audio; only while stopped or paused
    pub fn flush(&self) -> Result<()> {
        self.thread.flush_track(self.id)
    }

    pub fn mute(&self, muted: bool) -> Result<()> {
        self.thread.mute_track(self.id, muted)
    }

    /// Per-channel gain, 1.0 is unity
    pub fn set_volume(&self, left: f32, right: f32) {
        self.ring.control().set_volume(left, right);
    }

    /// Loop part of a static buffer; see [`RingBuffer::set_loop`]
    pub fn set_loop(&self, start: u32, end: u32, count: i32) -> Result<()> {
        self.ring.set_loop(start, end, count)
    }

    /// Start mixing before the buffer is full
    pub fn force_ready(&self) {
        self.ring.control().set_flag(flags::FORCE_READY);
    }

    /// Write interleaved samples, waiting up to `wait` for space. A track
    /// the loop disabled after starving is started again.
    pub fn write(&self, samples: &[i16], wait: Duration) -> Result<usize> {
        let written = self.ring.write(samples, wait)?;
        if self.ring.control().has_flag(flags::DISABLED) {
            tracing::debug!("Track {} was disabled, restarting", self.id);
            self.thread.start_track(self.id)?;
        }
        Ok(written)
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        self.thread.destroy_track(self.id);
    }
}

/// Capture track owned by a client
pub struct RecordHandle {
    thread: Arc<RecordThread>,
    id: TrackId,
    ring: Arc<RingBuffer>,
}

impl RecordHandle {
    pub(crate) fn new(thread: Arc<RecordThread>, id: TrackId, ring: Arc<RingBuffer>) -> Self {
        Self { thread, id, ring }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn input(&self) -> IoHandle {
        self.thread.handle()
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn state(&self) -> Option<TrackState> {
        self.thread.track_state(self.id)
    }

    /// Blocks until the loop has picked the track up
    pub fn start(&self) -> Result<()> {
        self.thread.start_track(self.id)
    }

    pub fn stop(&self) -> Result<()> {
        self.thread.stop_track(self.id)
    }

    /// Read interleaved samples, waiting up to `wait` for data. Returns
    /// frames read.
    pub fn read(&self, out: &mut [i16], wait: Duration) -> Result<usize> {
        self.ring.read(out, wait)
    }

    /// Whether captured audio was lost since the last call
    pub fn take_overflow(&self) -> bool {
        self.ring.take_overflow()
    }
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        self.thread.destroy_track(self.id);
    }
}

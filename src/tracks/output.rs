//! Duplication sink
//!
//! An [`OutputTrack`] is what a duplicating output writes its mix into.
//! Towards that output it behaves like a sink; towards the downstream
//! output it is an ordinary client track, started lazily on the first
//! write and stopped once the stream of data ends.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::{flags, RingBuffer};
use crate::error::Result;
use crate::protocol::{AudioFormat, IoHandle, StreamType};
use crate::threads::playback::PlaybackThread;
use crate::tracks::manager::TrackId;

/// Samples that did not fit downstream yet
struct Pending {
    samples: Vec<i16>,
    /// Frames already written
    offset: usize,
}

impl Pending {
    fn zeros(frames: usize, channels: usize) -> Self {
        Self {
            samples: vec![0; frames * channels],
            offset: 0,
        }
    }
}

struct SinkState {
    active: bool,
    overflow: VecDeque<Pending>,
}

/// Track feeding one downstream output from a duplicating output
pub struct OutputTrack {
    target: Arc<PlaybackThread>,
    id: TrackId,
    ring: Arc<RingBuffer>,
    channels: usize,
    wait: Duration,
    max_overflow: usize,
    state: Mutex<SinkState>,
}

impl OutputTrack {
    /// Create the downstream track on `target`, sized for three buffers of
    /// the source
    pub fn new(
        target: Arc<PlaybackThread>,
        source_rate: u32,
        source_frames: usize,
        max_overflow: usize,
    ) -> Result<Self> {
        let target_rate = target.sample_rate().max(1) as u64;
        let frame_count = (3 * source_frames as u64 * source_rate as u64 / target_rate) as u32;
        let (id, ring) = target.create_track(
            None,
            StreamType::Internal,
            source_rate,
            AudioFormat::Pcm16,
            2,
            frame_count,
            None,
        )?;
        target.set_stream_volume(StreamType::Internal, 1.0);
        let wait_ms = source_frames as u64 * 2 * 1000 / source_rate.max(1) as u64;
        Ok(Self {
            target,
            id,
            ring,
            channels: 2,
            wait: Duration::from_millis(wait_ms.max(1)),
            max_overflow,
            state: Mutex::new(SinkState {
                active: false,
                overflow: VecDeque::new(),
            }),
        })
    }

    pub fn target_handle(&self) -> IoHandle {
        self.target.handle()
    }

    pub fn track_id(&self) -> TrackId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn queued_chunks(&self) -> usize {
        self.state.lock().overflow.len()
    }

    /// Push `frames` interleaved stereo frames downstream, queueing what
    /// does not fit. Waits at most two source periods. Returns `true` when
    /// the downstream buffer stayed full.
    ///
    /// An empty write marks the end of data for this cycle: once nothing
    /// is queued the downstream buffer is padded to full once, and the
    /// track stopped on the following empty write.
    pub fn write(&self, samples: &[i16], frames: u32) -> bool {
        let mut state = self.state.lock();
        let ch = self.channels;
        let frames = (frames as usize).min(samples.len() / ch);
        let mut input_left = frames;
        let mut output_full = false;
        let deadline = Instant::now() + self.wait;

        if state.active && self.ring.control().has_flag(flags::DISABLED) {
            tracing::debug!("Output track {} was disabled downstream, restarting", self.id);
            self.start(&mut state);
        }

        if !state.active && frames != 0 {
            self.start(&mut state);
            let capacity = self.ring.frame_count() as usize;
            if capacity > frames {
                if state.overflow.len() < self.max_overflow {
                    state.overflow.push_back(Pending::zeros(capacity - frames, ch));
                } else {
                    tracing::warn!("Output track {} has no room for pre-roll", self.id);
                }
            }
        }

        loop {
            let (chunk, offset, left) = match state.overflow.front() {
                Some(p) => (&p.samples[..], p.offset, p.samples.len() / ch - p.offset),
                None => (&samples[..frames * ch], frames - input_left, input_left),
            };
            if left == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                output_full = true;
                break;
            }
            let region = match self.ring.obtain_buffer(left as u32, remaining) {
                Ok(region) => region,
                Err(_) => {
                    tracing::trace!("Output track {} full", self.id);
                    output_full = true;
                    break;
                }
            };
            let n = region.frames as usize;
            self.ring.write_region(&region, &chunk[offset * ch..(offset + n) * ch]);
            if !self.ring.step_user(&region) {
                output_full = true;
                break;
            }

            match state.overflow.front_mut() {
                Some(p) => {
                    p.offset += n;
                    if p.offset * ch >= p.samples.len() {
                        state.overflow.pop_front();
                    }
                }
                None => {
                    input_left -= n;
                    if input_left == 0 {
                        break;
                    }
                }
            }
        }

        if input_left > 0 && !self.target.is_standby() {
            if state.overflow.len() < self.max_overflow {
                let start = (frames - input_left) * ch;
                state.overflow.push_back(Pending {
                    samples: samples[start..frames * ch].to_vec(),
                    offset: 0,
                });
            } else {
                tracing::warn!("Output track {} dropped {} frames", self.id, input_left);
            }
        }

        if frames == 0 && state.overflow.is_empty() {
            let cblk = self.ring.control();
            if cblk.user() < cblk.frame_count() {
                let pad = (cblk.frame_count() - cblk.user()) as usize;
                state.overflow.push_back(Pending::zeros(pad, ch));
            } else if state.active {
                self.stop_locked(&mut state);
            }
        }

        output_full
    }

    fn start(&self, state: &mut SinkState) {
        match self.target.start_track(self.id) {
            Ok(()) => state.active = true,
            Err(e) => tracing::warn!("Output track {} failed to start: {}", self.id, e),
        }
    }

    fn stop_locked(&self, state: &mut SinkState) {
        if let Err(e) = self.target.stop_track(self.id) {
            tracing::debug!("Output track {} stop: {}", self.id, e);
        }
        state.active = false;
    }

    /// Stop the downstream track, keeping queued data
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.active {
            self.stop_locked(&mut state);
        }
    }

    /// Stop and release the downstream track
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            state.overflow.clear();
            if state.active {
                self.stop_locked(&mut state);
            }
        }
        self.target.destroy_track(self.id);
    }
}

impl Drop for OutputTrack {
    fn drop(&mut self) {
        self.target.destroy_track(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::AudioHardware;
    use crate::audio::memory::MemoryHardware;
    use crate::config::ServerConfig;
    use crate::protocol::StreamConfig;
    use crate::server::listeners::ListenerRegistry;
    use crate::threads::playback::{OutputKind, VolumeSettings};
    use crate::tracks::track::TrackState;

    /// Downstream output whose loop is not running, so nothing drains
    fn idle_target(frames: usize) -> Arc<PlaybackThread> {
        let mut hw = MemoryHardware::new(frames);
        let stream = hw.open_output_stream(StreamConfig::default()).unwrap();
        PlaybackThread::new(
            IoHandle(9),
            OutputKind::Mixer,
            stream,
            ServerConfig::default(),
            &VolumeSettings::default(),
            Arc::new(ListenerRegistry::new()),
        )
    }

    #[test]
    fn test_first_write_prerolls_and_starts() {
        let target = idle_target(64);
        let sink = OutputTrack::new(Arc::clone(&target), 44100, 64, 10).unwrap();
        assert_eq!(sink.ring.frame_count(), 192);

        let data = vec![7i16; 64 * 2];
        assert!(!sink.write(&data, 64));
        assert!(sink.is_active());
        assert_eq!(target.track_state(sink.track_id()), Some(TrackState::Active));
        // 128 frames of silence, then the data
        assert_eq!(sink.ring.frames_ready(), 192);
        let region = sink.ring.get_next_buffer(192).unwrap();
        assert_eq!(sink.ring.sample(&region, 0), 0);
        assert_eq!(sink.ring.sample(&region, 128 * 2), 7);
    }

    #[test]
    fn test_full_downstream_queues_overflow() {
        let target = idle_target(64);
        let sink = OutputTrack::new(Arc::clone(&target), 44100, 64, 2).unwrap();
        let data = vec![1i16; 64 * 2];
        sink.write(&data, 64);
        // no consumer: every further write times out and queues
        assert!(sink.write(&data, 64));
        assert_eq!(sink.queued_chunks(), 1);
        assert!(sink.write(&data, 64));
        assert!(sink.write(&data, 64));
        assert_eq!(sink.queued_chunks(), 2);
    }

    #[test]
    fn test_empty_write_pads_then_stops() {
        let target = idle_target(64);
        let sink = OutputTrack::new(Arc::clone(&target), 44100, 64, 10).unwrap();
        let data = vec![3i16; 64 * 2];
        sink.write(&data, 64);
        assert_eq!(sink.ring.control().user(), 192);
        sink.write(&[], 0);
        assert!(!sink.is_active());
        assert_eq!(target.track_state(sink.track_id()), Some(TrackState::Stopped));
    }

    #[test]
    fn test_destroy_releases_downstream_track() {
        let target = idle_target(64);
        let sink = OutputTrack::new(Arc::clone(&target), 44100, 64, 10).unwrap();
        assert_eq!(target.track_count(), 1);
        assert_eq!(target.stream_volume(StreamType::Internal), 1.0);
        sink.destroy();
        assert_eq!(target.track_count(), 0);
    }
}

//! Software mixing engine
//!
//! Sums any number of track ring buffers into one interleaved stereo PCM16
//! buffer. Each source is addressed by its mixer slot ("name"); the slot
//! keeps the gain applied last cycle so ramps start where the previous
//! buffer ended, and a resampler when the track rate differs from the
//! output rate.

use std::sync::Arc;

use crate::audio::buffer::{Region, RingBuffer};
use crate::audio::resampler::LinearResampler;
use crate::constants::{MAX_TRACK_NAMES, UNITY_GAIN};

/// One track to mix this cycle
#[derive(Debug, Clone)]
pub struct MixSource {
    /// Mixer slot assigned to the track
    pub name: usize,
    pub ring: Arc<RingBuffer>,
    /// Left/right gain in 4.12 fixed point
    pub volume: [u16; 2],
    /// Ramp from last cycle's gain instead of jumping
    pub ramp: bool,
}

#[derive(Debug)]
struct MixerSlot {
    prev_volume: [i32; 2],
    resampler: Option<LinearResampler>,
}

impl MixerSlot {
    fn new() -> Self {
        Self {
            prev_volume: [UNITY_GAIN as i32; 2],
            resampler: None,
        }
    }
}

/// Pulls single frames out of a ring buffer, widening mono to stereo
struct FrameReader<'a> {
    ring: &'a RingBuffer,
    region: Option<Region>,
    pos: u32,
    chunk: u32,
}

impl<'a> FrameReader<'a> {
    fn new(ring: &'a RingBuffer, chunk: u32) -> Self {
        Self {
            ring,
            region: None,
            pos: 0,
            chunk,
        }
    }

    fn next_frame(&mut self) -> Option<[i32; 2]> {
        if let Some(region) = self.region {
            if self.pos == region.frames {
                self.ring.release_buffer(&region);
                self.region = None;
            }
        }
        if self.region.is_none() {
            self.region = Some(self.ring.get_next_buffer(self.chunk)?);
            self.pos = 0;
        }
        let region = self.region?;
        let frame = read_frame(self.ring, &region, self.pos as usize);
        self.pos += 1;
        Some(frame)
    }

    /// Return whatever was consumed from the current span
    fn finish(mut self) {
        if let Some(region) = self.region.take() {
            if self.pos > 0 {
                self.ring.release_buffer(&Region {
                    frames: self.pos,
                    ..region
                });
            }
        }
    }
}

#[inline]
fn read_frame(ring: &RingBuffer, region: &Region, frame: usize) -> [i32; 2] {
    if ring.channels() == 1 {
        let s = ring.sample(region, frame) as i32;
        [s, s]
    } else {
        let base = frame * ring.channels() as usize;
        [
            ring.sample(region, base) as i32,
            ring.sample(region, base + 1) as i32,
        ]
    }
}

/// Mixing engine for one output
pub struct AudioMixer {
    frame_count: usize,
    sample_rate: u32,
    slots: Vec<Option<MixerSlot>>,
    accum: Vec<i32>,
    scratch: Vec<i32>,
}

impl AudioMixer {
    pub fn new(frame_count: usize, sample_rate: u32) -> Self {
        Self {
            frame_count,
            sample_rate,
            slots: (0..MAX_TRACK_NAMES).map(|_| None).collect(),
            accum: vec![0; frame_count * 2],
            scratch: vec![0; frame_count * 2],
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Forget per-slot state, e.g. when the name is freed
    pub fn release(&mut self, name: usize) {
        if let Some(slot) = self.slots.get_mut(name) {
            *slot = None;
        }
    }

    /// Number of slots with state
    pub fn live_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Mix `sources` into `out` (interleaved stereo, `frame_count` frames).
    /// A source that runs dry contributes silence for the rest of the
    /// buffer.
    pub fn mix(&mut self, sources: &[MixSource], out: &mut [i16]) {
        let frames = self.frame_count;
        let samples = frames * 2;
        self.accum[..samples].fill(0);

        for source in sources {
            let Some(slot_ref) = self.slots.get_mut(source.name) else {
                tracing::warn!("Mixer slot {} out of range", source.name);
                continue;
            };
            let slot = slot_ref.get_or_insert_with(MixerSlot::new);
            let scratch = &mut self.scratch[..samples];

            let track_rate = source.ring.control().sample_rate();
            let produced = if track_rate == self.sample_rate || track_rate == 0 {
                slot.resampler = None;
                Self::copy_frames(&source.ring, scratch, frames)
            } else {
                let resampler = slot
                    .resampler
                    .get_or_insert_with(|| LinearResampler::new(track_rate, self.sample_rate));
                resampler.set_input_rate(track_rate);
                let mut reader = FrameReader::new(&source.ring, frames as u32);
                let n = resampler.process(scratch, || reader.next_frame());
                reader.finish();
                n
            };

            let target = [source.volume[0] as i32, source.volume[1] as i32];
            let ramping = source.ramp && target != slot.prev_volume;
            for i in 0..produced {
                for c in 0..2 {
                    let gain = if ramping {
                        let prev = slot.prev_volume[c];
                        prev + (target[c] - prev) * i as i32 / frames as i32
                    } else {
                        target[c]
                    };
                    self.accum[i * 2 + c] += (scratch[i * 2 + c] * gain) >> 12;
                }
            }
            slot.prev_volume = target;
        }

        for (dst, acc) in out[..samples].iter_mut().zip(&self.accum[..samples]) {
            *dst = (*acc).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }

    fn copy_frames(ring: &RingBuffer, scratch: &mut [i32], frames: usize) -> usize {
        let mut produced = 0usize;
        while produced < frames {
            let Some(region) = ring.get_next_buffer((frames - produced) as u32) else {
                break;
            };
            for i in 0..region.frames as usize {
                let [l, r] = read_frame(ring, &region, i);
                scratch[(produced + i) * 2] = l;
                scratch[(produced + i) * 2 + 1] = r;
            }
            produced += region.frames as usize;
            ring.release_buffer(&region);
        }
        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::Direction;
    use std::time::Duration;

    fn ring_with(samples: &[i16], rate: u32, channels: u16, frames: u32) -> Arc<RingBuffer> {
        let ring = RingBuffer::new(Direction::Playback, frames, rate, channels, None).unwrap();
        ring.write(samples, Duration::ZERO).unwrap();
        Arc::new(ring)
    }

    fn source(name: usize, ring: &Arc<RingBuffer>, gain: u16) -> MixSource {
        MixSource {
            name,
            ring: Arc::clone(ring),
            volume: [gain, gain],
            ramp: false,
        }
    }

    #[test]
    fn test_unity_gain_is_exact() {
        let samples: Vec<i16> = (0..16).map(|i| i * 1000 - 8000).collect();
        let ring = ring_with(&samples, 44100, 2, 8);
        let mut mixer = AudioMixer::new(8, 44100);
        let mut out = vec![0i16; 16];
        mixer.mix(&[source(0, &ring, UNITY_GAIN)], &mut out);
        assert_eq!(out, samples);
        assert_eq!(ring.frames_ready(), 0);
    }

    #[test]
    fn test_sum_clamps() {
        let a = ring_with(&[30000, -30000, 10, 10], 8000, 2, 2);
        let b = ring_with(&[30000, -30000, 20, -20], 8000, 2, 2);
        let mut mixer = AudioMixer::new(2, 8000);
        let mut out = vec![0i16; 4];
        mixer.mix(&[source(0, &a, UNITY_GAIN), source(1, &b, UNITY_GAIN)], &mut out);
        assert_eq!(out, vec![i16::MAX, i16::MIN, 30, -10]);
    }

    #[test]
    fn test_mono_widened_and_underrun_silent() {
        let ring = ring_with(&[100, 200], 8000, 1, 4);
        let mut mixer = AudioMixer::new(4, 8000);
        let mut out = vec![7i16; 8];
        mixer.mix(&[source(3, &ring, 0x800)], &mut out);
        assert_eq!(out, vec![50, 50, 100, 100, 0, 0, 0, 0]);
    }

    #[test]
    fn test_ramp_starts_from_previous_gain() {
        let ring = ring_with(&[1000; 16], 8000, 2, 8);
        let mut mixer = AudioMixer::new(4, 8000);
        let mut out = vec![0i16; 8];
        mixer.mix(&[source(0, &ring, UNITY_GAIN)], &mut out);
        assert_eq!(out, vec![1000; 8]);

        let mut ramped = source(0, &ring, 0);
        ramped.ramp = true;
        mixer.mix(&[ramped], &mut out);
        assert_eq!(out[0], 1000);
        assert!(out[2] < out[0] && out[4] < out[2] && out[6] < out[4]);
    }

    #[test]
    fn test_resampled_source() {
        let samples: Vec<i16> = (0..32).map(|i| (i / 2) as i16 * 10).collect();
        let ring = ring_with(&samples, 16000, 2, 16);
        let mut mixer = AudioMixer::new(4, 8000);
        let mut out = vec![0i16; 8];
        mixer.mix(&[source(0, &ring, UNITY_GAIN)], &mut out);
        assert_eq!(out, vec![0, 0, 20, 20, 40, 40, 60, 60]);
        assert_eq!(mixer.live_slots(), 1);
        mixer.release(0);
        assert_eq!(mixer.live_slots(), 0);
    }
}

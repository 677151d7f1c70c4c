//! Shared ring buffer between a client and a server loop
//!
//! The [`ControlBlock`] is the fixed-layout descriptor both ends map: two
//! monotonically increasing frame cursors (`user` for the client, `server`
//! for the loop), their wrap bases, optional loop bounds, per-channel
//! volume and status flags, plus an embedded lock and condition used only
//! for blocking waits and cursor steps on the server side.
//!
//! For playback the client produces (advances `user`) and the loop
//! consumes (advances `server`). For capture the roles swap. Cursor
//! arithmetic is wrapping `u32`, so positions may run past `u32::MAX`.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicI32, AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::audio::heap::{HeapBlock, SharedHeap};
use crate::constants::UNITY_GAIN;
use crate::error::{Error, Result};

/// Status flags kept in [`ControlBlock::flags`]
pub mod flags {
    /// The loop found the buffer empty; cleared when the client writes
    pub const FLOW_CONTROL: u32 = 0x1;
    /// Mix the track before it is fully prefilled
    pub const FORCE_READY: u32 = 0x2;
    /// A capture client did not drain fast enough
    pub const OVERFLOW: u32 = 0x4;
    /// The loop dropped the track from its active set after repeated
    /// underruns; the client restarts it on its next write
    pub const DISABLED: u32 = 0x8;
    /// Flags owned by the server side and cleared on reset
    pub const SYSTEM_MASK: u32 = FLOW_CONTROL | FORCE_READY | OVERFLOW | DISABLED;
}

/// Marker for "no loop" in the loop bounds
const NO_LOOP: u32 = u32::MAX;

/// Which side produces data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Client writes, loop reads
    Playback,
    /// Loop writes, client reads
    Record,
}

/// Shared ring-buffer descriptor
#[repr(C)]
pub struct ControlBlock {
    lock: Mutex<()>,
    cond: Condvar,
    user: AtomicU32,
    server: AtomicU32,
    user_base: AtomicU32,
    server_base: AtomicU32,
    loop_start: AtomicU32,
    loop_end: AtomicU32,
    loop_count: AtomicI32,
    frame_count: u32,
    sample_rate: AtomicU32,
    channels: u16,
    frame_size: u16,
    volume: [AtomicU16; 2],
    flags: AtomicU32,
    direction: Direction,
}

impl ControlBlock {
    fn new(direction: Direction, frame_count: u32, sample_rate: u32, channels: u16) -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            user: AtomicU32::new(0),
            server: AtomicU32::new(0),
            user_base: AtomicU32::new(0),
            server_base: AtomicU32::new(0),
            loop_start: AtomicU32::new(NO_LOOP),
            loop_end: AtomicU32::new(NO_LOOP),
            loop_count: AtomicI32::new(0),
            frame_count,
            sample_rate: AtomicU32::new(sample_rate),
            channels,
            frame_size: channels * std::mem::size_of::<i16>() as u16,
            volume: [AtomicU16::new(UNITY_GAIN), AtomicU16::new(UNITY_GAIN)],
            flags: AtomicU32::new(flags::FLOW_CONTROL),
            direction,
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frame_size(&self) -> u16 {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Client cursor
    pub fn user(&self) -> u32 {
        self.user.load(Ordering::Acquire)
    }

    /// Loop cursor
    pub fn server(&self) -> u32 {
        self.server.load(Ordering::Acquire)
    }

    /// Per-channel gain in 4.12 fixed point
    pub fn volume(&self) -> [u16; 2] {
        [
            self.volume[0].load(Ordering::Relaxed),
            self.volume[1].load(Ordering::Relaxed),
        ]
    }

    pub fn set_volume(&self, left: f32, right: f32) {
        let to_fixed = |v: f32| (v.clamp(0.0, 1.0) * UNITY_GAIN as f32) as u16;
        self.volume[0].store(to_fixed(left), Ordering::Relaxed);
        self.volume[1].store(to_fixed(right), Ordering::Relaxed);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Frames the consumer may take. For playback this counts pending
    /// loop repetitions; an infinite loop reports `u32::MAX`.
    pub fn frames_ready(&self) -> u32 {
        let u = self.user();
        let s = self.server();
        match self.direction {
            Direction::Playback => {
                let loop_end = self.loop_end.load(Ordering::Acquire);
                if loop_end == NO_LOOP || u < loop_end {
                    return u.wrapping_sub(s);
                }
                let count = self.loop_count.load(Ordering::Acquire);
                if count < 0 {
                    return u32::MAX;
                }
                let loop_len = loop_end.wrapping_sub(self.loop_start.load(Ordering::Acquire));
                loop_len
                    .saturating_mul(count as u32)
                    .saturating_add(u.wrapping_sub(s))
            }
            Direction::Record => s.wrapping_sub(u),
        }
    }

    /// Free frames the producer may fill
    pub fn frames_available(&self) -> u32 {
        let u = self.user();
        let s = self.server();
        let filled = match self.direction {
            Direction::Playback => u.wrapping_sub(s),
            Direction::Record => s.wrapping_sub(u),
        };
        self.frame_count.saturating_sub(filled)
    }

    fn loop_active(&self) -> bool {
        self.loop_end.load(Ordering::Acquire) != NO_LOOP
    }
}

/// Contiguous span of a ring buffer handed to one side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Cursor position of the first frame
    pub position: u32,
    /// Index of the first sample in the backing store
    pub index: usize,
    pub frames: u32,
}

/// Control block plus sample storage for one track
pub struct RingBuffer {
    cblk: ControlBlock,
    data: Box<[AtomicI16]>,
    static_buffer: bool,
    /// Frames of a server step that could not take the lock
    pending_step: AtomicU32,
    step_failed: AtomicBool,
    _block: Option<HeapBlock>,
}

impl RingBuffer {
    /// Bytes a buffer of this shape takes from a client heap
    pub fn footprint(frame_count: u32, channels: u16) -> usize {
        std::mem::size_of::<ControlBlock>()
            + frame_count as usize * channels as usize * std::mem::size_of::<i16>()
    }

    /// Streaming buffer, optionally carved from a client heap
    pub fn new(
        direction: Direction,
        frame_count: u32,
        sample_rate: u32,
        channels: u16,
        heap: Option<&SharedHeap>,
    ) -> Result<Self> {
        if frame_count == 0 || channels == 0 {
            return Err(Error::InvalidArgument(format!(
                "ring buffer needs frames and channels, got {frame_count}x{channels}"
            )));
        }
        let block = heap
            .map(|h| h.allocate(Self::footprint(frame_count, channels)))
            .transpose()?;
        let samples = frame_count as usize * channels as usize;
        Ok(Self {
            cblk: ControlBlock::new(direction, frame_count, sample_rate, channels),
            data: (0..samples).map(|_| AtomicI16::new(0)).collect(),
            static_buffer: false,
            pending_step: AtomicU32::new(0),
            step_failed: AtomicBool::new(false),
            _block: block,
        })
    }

    /// Playback buffer whose whole content is supplied up front
    pub fn with_static_data(
        samples: &[i16],
        sample_rate: u32,
        channels: u16,
        heap: Option<&SharedHeap>,
    ) -> Result<Self> {
        if channels == 0 || samples.len() % channels as usize != 0 {
            return Err(Error::InvalidArgument(
                "static buffer length is not a whole number of frames".into(),
            ));
        }
        let frames = (samples.len() / channels as usize) as u32;
        let mut ring = Self::new(Direction::Playback, frames, sample_rate, channels, heap)?;
        ring.static_buffer = true;
        for (slot, s) in ring.data.iter().zip(samples) {
            slot.store(*s, Ordering::Relaxed);
        }
        ring.reload();
        Ok(ring)
    }

    pub fn control(&self) -> &ControlBlock {
        &self.cblk
    }

    pub fn is_static(&self) -> bool {
        self.static_buffer
    }

    pub fn frame_count(&self) -> u32 {
        self.cblk.frame_count
    }

    pub fn channels(&self) -> u16 {
        self.cblk.channels
    }

    pub fn frames_ready(&self) -> u32 {
        self.cblk.frames_ready()
    }

    pub fn frames_available(&self) -> u32 {
        self.cblk.frames_available()
    }

    /// Whether a server step is waiting to be retried
    pub fn step_pending(&self) -> bool {
        self.step_failed.load(Ordering::Acquire)
    }

    fn region(&self, position: u32, base: u32, frames: u32) -> Option<Region> {
        let offset = position.wrapping_sub(base);
        let end = offset.checked_add(frames)?;
        if frames == 0 || end > self.cblk.frame_count {
            tracing::error!(
                "Ring buffer region out of bounds: position {} base {} frames {} capacity {}",
                position,
                base,
                frames,
                self.cblk.frame_count
            );
            return None;
        }
        Some(Region {
            position,
            index: offset as usize * self.cblk.channels as usize,
            frames,
        })
    }

    // ---- server (loop) side ----

    /// Next contiguous span for the loop: ready frames for playback, free
    /// space for capture. `None` when nothing is there, when a previous
    /// step is still pending, or when the descriptor is inconsistent.
    pub fn get_next_buffer(&self, frames: u32) -> Option<Region> {
        if self.step_failed.load(Ordering::Acquire) {
            let pending = self.pending_step.load(Ordering::Acquire);
            if !self.step_server(pending) {
                return None;
            }
        }
        let (s, base, deliverable) = self.span()?;
        let n = frames.min(deliverable);
        if n == 0 {
            return None;
        }
        self.region(s, base, n)
    }

    /// Frames the next [`get_next_buffer`](Self::get_next_buffer) can hand
    /// out in one span. Unlike [`frames_ready`](Self::frames_ready) this is
    /// zero when the cursors cannot be served.
    pub fn frames_deliverable(&self) -> u32 {
        self.span().map_or(0, |(_, _, n)| n)
    }

    /// Server cursor, its base and the longest span that can be served
    fn span(&self) -> Option<(u32, u32, u32)> {
        let cblk = &self.cblk;
        let s = cblk.server();
        let base = cblk.server_base.load(Ordering::Acquire);
        let offset = s.wrapping_sub(base);
        if offset > cblk.frame_count {
            tracing::error!("Server cursor {} escaped its base {}", s, base);
            return None;
        }
        let mut contiguous = cblk.frame_count - offset;

        let available = match cblk.direction {
            Direction::Playback => {
                let ready = cblk.frames_ready();
                if cblk.loop_active() {
                    let loop_end = cblk.loop_end.load(Ordering::Acquire);
                    contiguous = contiguous.min(loop_end.saturating_sub(s));
                } else if ready > cblk.frame_count {
                    tracing::error!(
                        "Control block reports {} frames ready, capacity {}",
                        ready,
                        cblk.frame_count
                    );
                    return None;
                }
                ready
            }
            Direction::Record => cblk.frames_available(),
        };
        Some((s, base, available.min(contiguous)))
    }

    /// Hand a span back to the client side
    pub fn release_buffer(&self, region: &Region) {
        self.step_server(region.frames);
    }

    /// Advance the server cursor. Fails without blocking when the embedded
    /// lock is contended; the step is then retried by the next
    /// [`get_next_buffer`](Self::get_next_buffer).
    pub fn step_server(&self, frames: u32) -> bool {
        let cblk = &self.cblk;
        let Some(_guard) = cblk.lock.try_lock() else {
            self.pending_step.store(frames, Ordering::Release);
            self.step_failed.store(true, Ordering::Release);
            return false;
        };

        let mut s = cblk.server().wrapping_add(frames);
        if cblk.direction == Direction::Playback {
            // A flush may have reset the cursors under us
            let u = cblk.user();
            if (u.wrapping_sub(s) as i32) < 0 {
                s = u;
            }
            let loop_end = cblk.loop_end.load(Ordering::Acquire);
            if loop_end != NO_LOOP && s >= loop_end {
                s = cblk.loop_start.load(Ordering::Acquire);
                let count = cblk.loop_count.load(Ordering::Acquire);
                if count > 0 {
                    cblk.loop_count.store(count - 1, Ordering::Release);
                    if count == 1 {
                        cblk.loop_start.store(NO_LOOP, Ordering::Release);
                        cblk.loop_end.store(NO_LOOP, Ordering::Release);
                    }
                }
            }
        }

        let base = cblk.server_base.load(Ordering::Acquire);
        if s.wrapping_sub(base) >= cblk.frame_count && (s.wrapping_sub(base) as i32) >= 0 {
            cblk.server_base
                .store(base.wrapping_add(cblk.frame_count), Ordering::Release);
        }
        cblk.server.store(s, Ordering::Release);
        self.step_failed.store(false, Ordering::Release);
        cblk.cond.notify_all();
        true
    }

    /// Write samples into a span obtained by the producer
    pub fn write_region(&self, region: &Region, samples: &[i16]) {
        let len = (region.frames as usize * self.cblk.channels as usize).min(samples.len());
        for (slot, s) in self.data[region.index..region.index + len].iter().zip(samples) {
            slot.store(*s, Ordering::Relaxed);
        }
    }

    /// Copy a span out of the buffer
    pub fn read_region(&self, region: &Region, out: &mut [i16]) {
        let len = (region.frames as usize * self.cblk.channels as usize).min(out.len());
        for (dst, slot) in out[..len].iter_mut().zip(&self.data[region.index..]) {
            *dst = slot.load(Ordering::Relaxed);
        }
    }

    /// Sample `i` (interleaved) of a span
    #[inline]
    pub fn sample(&self, region: &Region, i: usize) -> i16 {
        self.data[region.index + i].load(Ordering::Relaxed)
    }

    /// Return to the just-created state. The loop calls this on stopped
    /// tracks; flush calls it on behalf of the client.
    pub fn reset(&self) {
        let cblk = &self.cblk;
        let _guard = cblk.lock.lock();
        cblk.user.store(0, Ordering::Release);
        cblk.server.store(0, Ordering::Release);
        cblk.user_base.store(0, Ordering::Release);
        cblk.server_base.store(0, Ordering::Release);
        cblk.clear_flag(flags::SYSTEM_MASK);
        cblk.set_flag(flags::FLOW_CONTROL);
        self.step_failed.store(false, Ordering::Release);
        cblk.cond.notify_all();
    }

    // ---- client side ----

    /// Span the client may fill (playback) or drain (capture), waiting up
    /// to `wait` for one to appear.
    pub fn obtain_buffer(&self, frames: u32, wait: Duration) -> Result<Region> {
        let cblk = &self.cblk;
        let pending = |cblk: &ControlBlock| match cblk.direction {
            Direction::Playback => cblk.frames_available(),
            Direction::Record => cblk.frames_ready(),
        };

        let mut available = pending(cblk);
        if available == 0 {
            if wait.is_zero() {
                return Err(Error::WouldBlock);
            }
            let deadline = Instant::now() + wait;
            let mut guard = cblk.lock.lock();
            loop {
                available = pending(cblk);
                if available != 0 {
                    break;
                }
                if cblk.cond.wait_until(&mut guard, deadline).timed_out() {
                    available = pending(cblk);
                    if available == 0 {
                        return Err(Error::Timeout(format!(
                            "no {} in {:?}",
                            match cblk.direction {
                                Direction::Playback => "space",
                                Direction::Record => "data",
                            },
                            wait
                        )));
                    }
                    break;
                }
            }
        }

        let u = cblk.user();
        let base = cblk.user_base.load(Ordering::Acquire);
        let offset = u.wrapping_sub(base);
        if offset > cblk.frame_count {
            return Err(Error::InvalidOperation(format!(
                "user cursor {u} escaped its base {base}"
            )));
        }
        let n = frames
            .min(available)
            .min(cblk.frame_count - offset);
        self.region(u, base, n)
            .ok_or_else(|| Error::InvalidOperation("ring buffer region out of bounds".into()))
    }

    /// Advance the client cursor past `region`. Returns false, leaving the
    /// cursors alone, when a reset moved them after the region was obtained.
    pub fn step_user(&self, region: &Region) -> bool {
        let cblk = &self.cblk;
        let _guard = cblk.lock.lock();
        if cblk.user() != region.position {
            tracing::debug!(
                "User cursor moved from {} to {}, dropping step",
                region.position,
                cblk.user()
            );
            return false;
        }
        let u = region.position.wrapping_add(region.frames);
        let base = cblk.user_base.load(Ordering::Acquire);
        if u.wrapping_sub(base) >= cblk.frame_count {
            cblk.user_base
                .store(base.wrapping_add(cblk.frame_count), Ordering::Release);
        }
        cblk.user.store(u, Ordering::Release);
        if cblk.direction == Direction::Playback {
            cblk.clear_flag(flags::FLOW_CONTROL);
        }
        cblk.cond.notify_all();
        true
    }

    /// Write interleaved samples, blocking up to `wait` whenever the buffer
    /// is full. Returns the frames written; fails only if none were.
    pub fn write(&self, samples: &[i16], wait: Duration) -> Result<usize> {
        let channels = self.cblk.channels as usize;
        let total = samples.len() / channels;
        let mut written = 0usize;
        while written < total {
            let want = (total - written).min(u32::MAX as usize) as u32;
            let region = match self.obtain_buffer(want, wait) {
                Ok(r) => r,
                Err(e) if written == 0 => return Err(e),
                Err(_) => break,
            };
            self.write_region(&region, &samples[written * channels..]);
            if !self.step_user(&region) {
                break;
            }
            written += region.frames as usize;
        }
        Ok(written)
    }

    /// Read interleaved samples, blocking up to `wait` whenever the buffer
    /// is empty. Returns the frames read; fails only if none were.
    pub fn read(&self, out: &mut [i16], wait: Duration) -> Result<usize> {
        let channels = self.cblk.channels as usize;
        let total = out.len() / channels;
        let mut read = 0usize;
        while read < total {
            let want = (total - read).min(u32::MAX as usize) as u32;
            let region = match self.obtain_buffer(want, wait) {
                Ok(r) => r,
                Err(e) if read == 0 => return Err(e),
                Err(_) => break,
            };
            self.read_region(&region, &mut out[read * channels..]);
            if !self.step_user(&region) {
                break;
            }
            read += region.frames as usize;
        }
        Ok(read)
    }

    /// Make the whole static content playable again
    pub fn reload(&self) {
        let cblk = &self.cblk;
        let _guard = cblk.lock.lock();
        cblk.server.store(0, Ordering::Release);
        cblk.server_base.store(0, Ordering::Release);
        cblk.user_base.store(cblk.frame_count, Ordering::Release);
        cblk.user.store(cblk.frame_count, Ordering::Release);
        cblk.clear_flag(flags::FLOW_CONTROL);
    }

    /// Loop `[start, end)` `count` more times (-1 forever, 0 clears).
    /// Static buffers only.
    pub fn set_loop(&self, start: u32, end: u32, count: i32) -> Result<()> {
        if !self.static_buffer {
            return Err(Error::InvalidOperation(
                "loops are only supported on static buffers".into(),
            ));
        }
        let cblk = &self.cblk;
        let _guard = cblk.lock.lock();
        if count == 0 {
            cblk.loop_start.store(NO_LOOP, Ordering::Release);
            cblk.loop_end.store(NO_LOOP, Ordering::Release);
            cblk.loop_count.store(0, Ordering::Release);
            return Ok(());
        }
        if start >= end || end > cblk.frame_count {
            return Err(Error::InvalidArgument(format!(
                "loop [{start}, {end}) outside buffer of {} frames",
                cblk.frame_count
            )));
        }
        // Static cursors never leave [0, frame_count], so the loop has to
        // start at or ahead of what was already played
        let played = cblk.server();
        if start < played {
            return Err(Error::InvalidArgument(format!(
                "loop start {start} is behind the play position {played}"
            )));
        }
        cblk.loop_start.store(start, Ordering::Release);
        cblk.loop_end.store(end, Ordering::Release);
        cblk.loop_count.store(count, Ordering::Release);
        Ok(())
    }

    /// Clear and return the capture overflow flag
    pub fn take_overflow(&self) -> bool {
        let was = self.cblk.flags.fetch_and(!flags::OVERFLOW, Ordering::AcqRel);
        was & flags::OVERFLOW != 0
    }

    #[cfg(test)]
    pub(crate) fn force_user(&self, user: u32) {
        self.cblk.user.store(user, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.cblk.lock.lock()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("direction", &self.cblk.direction)
            .field("frame_count", &self.cblk.frame_count)
            .field("channels", &self.cblk.channels)
            .field("user", &self.cblk.user())
            .field("server", &self.cblk.server())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(ring: &RingBuffer, max_chunk: u32) -> Vec<i16> {
        let mut out = Vec::new();
        while let Some(region) = ring.get_next_buffer(max_chunk) {
            let mut chunk = vec![0i16; region.frames as usize * ring.channels() as usize];
            ring.read_region(&region, &mut chunk);
            out.extend_from_slice(&chunk);
            ring.release_buffer(&region);
        }
        out
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let ring = RingBuffer::new(Direction::Playback, 256, 44100, 2, None).unwrap();
        assert_eq!(ring.frames_available(), 256);
        assert_eq!(ring.frames_ready(), 0);
        assert!(ring.get_next_buffer(64).is_none());
    }

    #[test]
    fn test_write_then_drain() {
        let ring = RingBuffer::new(Direction::Playback, 8, 44100, 2, None).unwrap();
        let samples: Vec<i16> = (1..=12).collect();
        assert_eq!(ring.write(&samples, Duration::ZERO).unwrap(), 6);
        assert_eq!(ring.frames_ready(), 6);
        assert_eq!(drain(&ring, 4), samples);
        assert_eq!(ring.control().server(), 6);
    }

    #[test]
    fn test_full_buffer_would_block() {
        let ring = RingBuffer::new(Direction::Playback, 4, 8000, 1, None).unwrap();
        assert_eq!(ring.write(&[1, 2, 3, 4, 5, 6], Duration::ZERO).unwrap(), 4);
        assert!(matches!(
            ring.write(&[7], Duration::ZERO),
            Err(Error::WouldBlock)
        ));
        assert!(matches!(
            ring.write(&[7], Duration::from_millis(5)),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_contended_step_is_retried() {
        let ring = RingBuffer::new(Direction::Playback, 8, 8000, 1, None).unwrap();
        ring.write(&[1, 2, 3, 4], Duration::ZERO).unwrap();
        let region = ring.get_next_buffer(2).unwrap();
        {
            let _held = ring.hold_lock();
            assert!(!ring.step_server(region.frames));
        }
        assert!(ring.step_pending());
        assert_eq!(ring.control().server(), 0);

        let next = ring.get_next_buffer(8).unwrap();
        assert!(!ring.step_pending());
        assert_eq!(next.position, 2);
        assert_eq!(next.frames, 2);
    }

    #[test]
    fn test_flush_during_mix_clamps_server() {
        let ring = RingBuffer::new(Direction::Playback, 8, 8000, 1, None).unwrap();
        ring.write(&[1, 2, 3, 4], Duration::ZERO).unwrap();
        let region = ring.get_next_buffer(4).unwrap();
        ring.reset();
        ring.release_buffer(&region);
        assert_eq!(ring.control().server(), 0);
        assert_eq!(ring.frames_ready(), 0);
    }

    #[test]
    fn test_record_direction() {
        let ring = RingBuffer::new(Direction::Record, 4, 8000, 1, None).unwrap();
        let region = ring.get_next_buffer(10).unwrap();
        assert_eq!(region.frames, 4);
        ring.write_region(&region, &[9, 8, 7, 6]);
        ring.release_buffer(&region);
        assert!(ring.get_next_buffer(1).is_none());

        let mut out = [0i16; 3];
        assert_eq!(ring.read(&mut out, Duration::ZERO).unwrap(), 3);
        assert_eq!(out, [9, 8, 7]);
        assert_eq!(ring.frames_available(), 3);
    }

    #[test]
    fn test_static_loop() {
        let ring = RingBuffer::with_static_data(&[1, 2, 3, 4], 8000, 1, None).unwrap();
        assert_eq!(ring.frames_ready(), 4);
        ring.set_loop(1, 3, 2).unwrap();
        // 1 2 3 | 2 3 | 2 3 4
        assert_eq!(drain(&ring, 16), vec![1, 2, 3, 2, 3, 2, 3, 4]);
    }

    #[test]
    fn test_loop_behind_play_position_rejected() {
        let ring = RingBuffer::with_static_data(&[1, 2, 3, 4], 8000, 1, None).unwrap();
        let region = ring.get_next_buffer(2).unwrap();
        ring.release_buffer(&region);
        assert!(matches!(ring.set_loop(1, 3, 1), Err(Error::InvalidArgument(_))));
        ring.set_loop(2, 4, 1).unwrap();
        assert_eq!(drain(&ring, 16), vec![3, 4, 3, 4]);

        // played out: no loop can start behind the cursor any more
        assert!(matches!(ring.set_loop(0, 2, 1), Err(Error::InvalidArgument(_))));
        assert_eq!(ring.frames_ready(), 0);
        assert_eq!(ring.frames_deliverable(), 0);
    }

    #[test]
    fn test_step_after_reset_is_dropped() {
        let ring = RingBuffer::new(Direction::Playback, 8, 8000, 1, None).unwrap();
        ring.write(&[1, 2, 3], Duration::ZERO).unwrap();
        drain(&ring, 8);
        let region = ring.obtain_buffer(4, Duration::ZERO).unwrap();
        assert_eq!(region.position, 3);
        ring.write_region(&region, &[4, 5, 6, 7]);
        ring.reset();
        assert!(!ring.step_user(&region));
        assert_eq!(ring.control().user(), 0);
        assert_eq!(ring.frames_ready(), 0);
        assert!(ring.frames_ready() <= ring.frame_count());
    }

    #[test]
    fn test_inconsistent_cursors_not_deliverable() {
        let ring = RingBuffer::new(Direction::Playback, 8, 8000, 1, None).unwrap();
        ring.force_user(20);
        assert_eq!(ring.frames_ready(), 20);
        assert_eq!(ring.frames_deliverable(), 0);
        assert!(ring.get_next_buffer(8).is_none());
    }

    #[test]
    fn test_loop_requires_static() {
        let ring = RingBuffer::new(Direction::Playback, 4, 8000, 1, None).unwrap();
        assert!(matches!(
            ring.set_loop(0, 2, 1),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_heap_accounting() {
        let heap = SharedHeap::new("test", RingBuffer::footprint(64, 2));
        let ring = RingBuffer::new(Direction::Playback, 64, 44100, 2, Some(&heap)).unwrap();
        assert!(RingBuffer::new(Direction::Playback, 1, 44100, 2, Some(&heap)).is_err());
        drop(ring);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn test_overflow_flag() {
        let ring = RingBuffer::new(Direction::Record, 4, 8000, 1, None).unwrap();
        assert!(!ring.take_overflow());
        ring.control().set_flag(flags::OVERFLOW);
        assert!(ring.take_overflow());
        assert!(!ring.take_overflow());
    }

    #[test]
    fn test_volume_fixed_point() {
        let ring = RingBuffer::new(Direction::Playback, 4, 8000, 2, None).unwrap();
        assert_eq!(ring.control().volume(), [UNITY_GAIN, UNITY_GAIN]);
        ring.control().set_volume(0.5, 2.0);
        assert_eq!(ring.control().volume(), [0x800, UNITY_GAIN]);
    }

    proptest! {
        #[test]
        fn prop_capacity_matches_request(frames in 1u32..4096, channels in 1u16..=2) {
            let ring = RingBuffer::new(Direction::Playback, frames, 44100, channels, None).unwrap();
            prop_assert_eq!(ring.frame_count(), frames);
            prop_assert_eq!(ring.frames_available(), frames);
            prop_assert_eq!(ring.frames_ready(), 0);
        }

        #[test]
        fn prop_round_trip_across_wrap(
            capacity in 1u32..64,
            skew in 0u32..200,
            chunk in 1u32..17,
            seed in any::<i16>(),
            fill in 0u32..64,
        ) {
            let ring = RingBuffer::new(Direction::Playback, capacity, 8000, 2, None).unwrap();
            // Move the cursors so the payload straddles the wrap point
            let mut moved = 0;
            while moved < skew {
                let n = (skew - moved).min(capacity);
                let filler = vec![0i16; n as usize * 2];
                ring.write(&filler, Duration::ZERO).unwrap();
                drain(&ring, capacity);
                moved += n;
            }
            let k = fill.min(capacity);
            let payload: Vec<i16> = (0..k as i32 * 2)
                .map(|i| seed.wrapping_add(i as i16))
                .collect();
            let before = ring.control().server();
            if k > 0 {
                prop_assert_eq!(ring.write(&payload, Duration::ZERO).unwrap(), k as usize);
            }
            prop_assert_eq!(drain(&ring, chunk), payload);
            prop_assert_eq!(ring.control().server().wrapping_sub(before), k);
            prop_assert_eq!(ring.control().user(), ring.control().server());
        }
    }
}

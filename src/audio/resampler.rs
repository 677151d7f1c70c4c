//! Streaming linear resampler
//!
//! Works on stereo `i32` frames and pulls input one frame at a time from a
//! caller-supplied source, so it can sit directly on a ring buffer. Input
//! that runs dry mid-buffer simply ends the call; state carries over to the
//! next one.

const ONE: u64 = 1 << 32;

/// Linear interpolator with a Q32.32 phase accumulator
#[derive(Debug, Clone)]
pub struct LinearResampler {
    in_rate: u32,
    out_rate: u32,
    step: u64,
    phase: u64,
    x0: [i32; 2],
    x1: [i32; 2],
    loaded: u8,
}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Self {
        let mut r = Self {
            in_rate,
            out_rate,
            step: ONE,
            phase: 0,
            x0: [0; 2],
            x1: [0; 2],
            loaded: 0,
        };
        r.update_step();
        r
    }

    fn update_step(&mut self) {
        self.step = ((self.in_rate as u64) << 32) / self.out_rate.max(1) as u64;
    }

    pub fn input_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.out_rate
    }

    /// Change the source rate without dropping buffered input
    pub fn set_input_rate(&mut self, rate: u32) {
        if rate != self.in_rate {
            self.in_rate = rate;
            self.update_step();
        }
    }

    /// Forget buffered input
    pub fn reset(&mut self) {
        self.phase = 0;
        self.loaded = 0;
        self.x0 = [0; 2];
        self.x1 = [0; 2];
    }

    /// Fill `out` (interleaved stereo) with up to `out.len() / 2` frames.
    /// Returns how many frames were produced before `next` ran dry.
    pub fn process<F>(&mut self, out: &mut [i32], mut next: F) -> usize
    where
        F: FnMut() -> Option<[i32; 2]>,
    {
        let frames = out.len() / 2;
        let mut produced = 0;
        while produced < frames {
            while self.loaded < 2 || self.phase >= ONE {
                let Some(frame) = next() else {
                    return produced;
                };
                match self.loaded {
                    0 => {
                        self.x0 = frame;
                        self.loaded = 1;
                    }
                    1 => {
                        self.x1 = frame;
                        self.loaded = 2;
                    }
                    _ => {
                        self.x0 = self.x1;
                        self.x1 = frame;
                        self.phase -= ONE;
                    }
                }
            }
            let frac = self.phase as i64;
            for c in 0..2 {
                let delta = (self.x1[c] - self.x0[c]) as i64;
                out[produced * 2 + c] = self.x0[c] + ((delta * frac) >> 32) as i32;
            }
            produced += 1;
            self.phase += self.step;
        }
        produced
    }
}

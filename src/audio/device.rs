//! Hardware abstraction
//!
//! The server drives sound hardware only through these traits. Streams are
//! shared between the control plane (parameters, volume) and the audio loop
//! (read/write), so all stream methods take `&self`.

use std::sync::Arc;

use crate::error::HardwareError;
use crate::protocol::{AudioFormat, AudioMode, StreamConfig};

pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// An opened playback stream
pub trait StreamOut: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn format(&self) -> AudioFormat;
    /// Hardware buffer size in bytes
    fn buffer_size(&self) -> usize;
    fn latency_ms(&self) -> u32;
    /// Blocking write of interleaved little-endian PCM
    fn write(&self, bytes: &[u8]) -> HwResult<usize>;
    fn standby(&self) -> HwResult<()>;
    /// Hardware volume, used by direct outputs
    fn set_volume(&self, left: f32, right: f32) -> HwResult<()>;
    /// `key=value;...`; fails with `StandbyRequired` when the change can
    /// only be applied while the stream is idle
    fn set_parameters(&self, kv: &str) -> HwResult<()>;
    fn get_parameters(&self, keys: &str) -> String;

    fn frame_size(&self) -> usize {
        self.format().bytes_per_sample() * self.channels() as usize
    }

    fn config(&self) -> StreamConfig {
        StreamConfig::new(self.sample_rate(), self.format(), self.channels())
    }
}

/// An opened capture stream
pub trait StreamIn: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn format(&self) -> AudioFormat;
    /// Hardware buffer size in bytes
    fn buffer_size(&self) -> usize;
    /// Blocking read of interleaved little-endian PCM
    fn read(&self, bytes: &mut [u8]) -> HwResult<usize>;
    fn standby(&self) -> HwResult<()>;
    fn set_parameters(&self, kv: &str) -> HwResult<()>;
    fn get_parameters(&self, keys: &str) -> String;

    fn frame_size(&self) -> usize {
        self.format().bytes_per_sample() * self.channels() as usize
    }

    fn config(&self) -> StreamConfig {
        StreamConfig::new(self.sample_rate(), self.format(), self.channels())
    }
}

/// Device-level entry point
pub trait AudioHardware: Send {
    fn init_check(&self) -> HwResult<()>;
    fn set_voice_volume(&mut self, volume: f32) -> HwResult<()>;
    /// `Unsupported` when only software master volume is available
    fn set_master_volume(&mut self, volume: f32) -> HwResult<()>;
    fn set_mode(&mut self, mode: AudioMode) -> HwResult<()>;
    fn set_mic_mute(&mut self, muted: bool) -> HwResult<()>;
    fn mic_mute(&self) -> bool;
    fn set_parameters(&mut self, kv: &str) -> HwResult<()>;
    fn get_parameters(&self, keys: &str) -> String;
    /// Bytes a client should size its capture buffer to; 0 if unsupported
    fn input_buffer_size(&self, sample_rate: u32, format: AudioFormat, channels: u16) -> usize;
    /// Open a playback stream. Fails with `ConfigRejected` carrying the
    /// closest supported configuration.
    fn open_output_stream(&mut self, requested: StreamConfig) -> HwResult<Arc<dyn StreamOut>>;
    fn open_input_stream(&mut self, requested: StreamConfig) -> HwResult<Arc<dyn StreamIn>>;
}

/// Encode interleaved samples into the stream's wire format
pub fn encode_samples(samples: &[i16], format: AudioFormat, out: &mut bytes::BytesMut) {
    use bytes::BufMut;
    out.clear();
    match format {
        AudioFormat::Pcm16 => {
            out.reserve(samples.len() * 2);
            for s in samples {
                out.put_i16_le(*s);
            }
        }
        AudioFormat::Pcm8 => {
            out.reserve(samples.len());
            for s in samples {
                out.put_u8(((*s >> 8) + 128) as u8);
            }
        }
    }
}

/// Decode wire-format bytes into interleaved samples
pub fn decode_samples(bytes: &[u8], format: AudioFormat, out: &mut Vec<i16>) {
    out.clear();
    match format {
        AudioFormat::Pcm16 => out.extend(
            bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        ),
        AudioFormat::Pcm8 => out.extend(bytes.iter().map(|b| ((*b as i16) - 128) << 8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_pcm16_codec() {
        let mut buf = BytesMut::new();
        encode_samples(&[1, -2, i16::MAX], AudioFormat::Pcm16, &mut buf);
        assert_eq!(&buf[..], &[1, 0, 0xfe, 0xff, 0xff, 0x7f]);
        let mut back = Vec::new();
        decode_samples(&buf, AudioFormat::Pcm16, &mut back);
        assert_eq!(back, vec![1, -2, i16::MAX]);
    }

    #[test]
    fn test_pcm8_codec() {
        let mut buf = BytesMut::new();
        encode_samples(&[0, i16::MIN, 0x7f00], AudioFormat::Pcm8, &mut buf);
        assert_eq!(&buf[..], &[128, 0, 255]);
        let mut back = Vec::new();
        decode_samples(&buf, AudioFormat::Pcm8, &mut back);
        assert_eq!(back, vec![0, i16::MIN, 0x7f00]);
    }
}

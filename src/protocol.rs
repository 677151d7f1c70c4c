//! Shared vocabulary of the control plane
//!
//! Stream types, sample formats, io handles and the configuration
//! notifications delivered to registered listeners.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Process identity of a client
pub type Pid = u32;

/// Number of client-visible stream types
pub const NUM_STREAM_TYPES: usize = 10;

/// Logical stream category; each has its own volume and mute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    VoiceCall,
    System,
    Ring,
    Music,
    Alarm,
    Notification,
    BluetoothSco,
    EnforcedAudible,
    Dtmf,
    Tts,
    /// Used by duplication sinks; never accepted from clients
    Internal,
}

impl StreamType {
    /// Client-visible stream types, in index order
    pub const ALL: [StreamType; NUM_STREAM_TYPES] = [
        StreamType::VoiceCall,
        StreamType::System,
        StreamType::Ring,
        StreamType::Music,
        StreamType::Alarm,
        StreamType::Notification,
        StreamType::BluetoothSco,
        StreamType::EnforcedAudible,
        StreamType::Dtmf,
        StreamType::Tts,
    ];

    /// Validate a raw stream type coming from a client
    pub fn from_index(index: u32) -> Result<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("invalid stream type {index}")))
    }

    /// Slot in per-thread volume tables (`Internal` is the last one)
    pub fn index(self) -> usize {
        match self {
            StreamType::Internal => NUM_STREAM_TYPES,
            other => Self::ALL.iter().position(|s| *s == other).unwrap_or(NUM_STREAM_TYPES),
        }
    }
}

/// PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Pcm16,
    Pcm8,
}

impl AudioFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::Pcm16 => 2,
            AudioFormat::Pcm8 => 1,
        }
    }

    /// Numeric code used in key/value parameters
    pub fn code(self) -> i64 {
        match self {
            AudioFormat::Pcm16 => 1,
            AudioFormat::Pcm8 => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(AudioFormat::Pcm16),
            2 => Some(AudioFormat::Pcm8),
            _ => None,
        }
    }
}

/// Telephony mode of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    Normal,
    Ringtone,
    InCall,
}

impl TryFrom<i32> for AudioMode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(AudioMode::Normal),
            1 => Ok(AudioMode::Ringtone),
            2 => Ok(AudioMode::InCall),
            other => Err(Error::InvalidArgument(format!("invalid mode {other}"))),
        }
    }
}

/// Rate, encoding and channel count of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channels: u16,
}

impl StreamConfig {
    pub fn new(sample_rate: u32, format: AudioFormat, channels: u16) -> Self {
        Self {
            sample_rate,
            format,
            channels,
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(44100, AudioFormat::Pcm16, 2)
    }
}

/// Flags for `open_output`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputFlags(u32);

impl OutputFlags {
    pub const NONE: OutputFlags = OutputFlags(0);
    /// Bypass the software mixer
    pub const DIRECT: OutputFlags = OutputFlags(1);

    pub fn contains(self, other: OutputFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

/// Identifier of an opened input or output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IoHandle(pub u32);

impl fmt::Display for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io#{}", self.0)
    }
}

/// Kind of configuration change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoConfigEvent {
    OutputOpened,
    OutputClosed,
    OutputConfigChanged,
    InputOpened,
    InputClosed,
    InputConfigChanged,
    StreamConfigChanged,
}

/// Snapshot of an io's negotiated parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoDescriptor {
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channels: u16,
    pub frame_count: usize,
    pub latency_ms: u32,
}

/// Notification delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoConfigNotification {
    pub event: IoConfigEvent,
    pub handle: IoHandle,
    /// Present for opened / config-changed events
    pub descriptor: Option<IoDescriptor>,
    /// Present for stream config changes
    pub stream: Option<StreamType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_validation() {
        assert_eq!(StreamType::from_index(3).unwrap(), StreamType::Music);
        assert!(StreamType::from_index(NUM_STREAM_TYPES as u32).is_err());
        assert_eq!(StreamType::Internal.index(), NUM_STREAM_TYPES);
        assert_eq!(StreamType::Tts.index(), NUM_STREAM_TYPES - 1);
    }

    #[test]
    fn test_mode_range() {
        assert_eq!(AudioMode::try_from(2).unwrap(), AudioMode::InCall);
        assert!(AudioMode::try_from(3).is_err());
        assert!(AudioMode::try_from(-1).is_err());
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(StreamConfig::new(44100, AudioFormat::Pcm16, 2).frame_size(), 4);
        assert_eq!(StreamConfig::new(8000, AudioFormat::Pcm8, 1).frame_size(), 1);
    }

    #[test]
    fn test_output_flags() {
        assert!(OutputFlags::DIRECT.contains(OutputFlags::DIRECT));
        assert!(!OutputFlags::NONE.contains(OutputFlags::DIRECT));
    }
}

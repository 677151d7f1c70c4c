//! Tracks: per-stream state machines over shared ring buffers

pub mod handle;
pub mod manager;
pub mod output;
pub mod track;

pub use handle::{RecordHandle, TrackHandle};
pub use manager::{TrackArena, TrackId};
pub use output::OutputTrack;
pub use track::{FillStatus, TrackInfo, TrackState};

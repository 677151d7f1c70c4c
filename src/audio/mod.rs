//! Audio plumbing: ring buffers, the mixing engine and hardware backends

pub mod buffer;
#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;
pub mod device;
pub mod heap;
pub mod memory;
pub mod mixer;
pub mod resampler;

pub use buffer::{ControlBlock, Direction, Region, RingBuffer};
pub use device::{AudioHardware, StreamIn, StreamOut};
pub use heap::{HeapBlock, SharedHeap};
pub use memory::{MemoryHardware, MemoryProbe};
pub use mixer::{AudioMixer, MixSource};

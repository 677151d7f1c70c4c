//! Track storage
//!
//! Tracks live in a per-thread arena and are addressed by generation-tagged
//! ids, so a stale id held by a client can never reach a newer track that
//! reused the slot. Mixer slot names are handed out from a 32-bit mask.

use serde::Serialize;
use std::fmt;

use crate::constants::MAX_TRACK_NAMES;
use crate::error::{Error, Result};

/// Stable identifier of a track within its thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TrackId {
    index: u32,
    generation: u32,
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab of tracks with generation-checked access
pub struct TrackArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> TrackArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value built from its own id
    pub fn insert_with(&mut self, build: impl FnOnce(TrackId) -> T) -> TrackId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = TrackId {
            index,
            generation: slot.generation,
        };
        slot.value = Some(build(id));
        self.len += 1;
        id
    }

    pub fn get(&self, id: TrackId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: TrackId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrackId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    TrackId {
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TrackId, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.value.as_mut().map(|v| {
                (
                    TrackId {
                        index: i as u32,
                        generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<TrackId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

impl<T> Default for TrackArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator for mixer slot names
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackNames {
    used: u32,
}

impl TrackNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Result<usize> {
        let name = (!self.used).trailing_zeros() as usize;
        if name >= MAX_TRACK_NAMES {
            return Err(Error::OutOfMemory(format!(
                "all {MAX_TRACK_NAMES} mixer slots in use"
            )));
        }
        self.used |= 1 << name;
        Ok(name)
    }

    pub fn free(&mut self, name: usize) {
        if name < MAX_TRACK_NAMES {
            self.used &= !(1 << name);
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.count_ones() as usize
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

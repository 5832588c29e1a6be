// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity pool of frame buffers backed by external native buffers.
//!
//! Each slot of the pool is bound to one external buffer for the whole session and carries two
//! independent ownership flags:
//!
//! * `released` is cleared when the decoder acquires the slot as a decode target, and set again
//!   when the decoder gives it back.
//! * `render_done` is cleared when a frame decoded into the slot is delivered to the consumer,
//!   and set again when the consumer reports it is done reading it.
//!
//! A slot can only be handed to the decoder when both flags are set. This prevents the decoder
//! from overwriting a frame still being displayed, and from recycling a slot it has not given back
//! yet.
//!
//! The decode loop and render-completion notifications are expected to come from the same
//! sequencing context. [`SharedFramePool`] still serializes all accesses behind a mutex, so hosts
//! that call them from different threads remain correct.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use thiserror::Error;

use crate::video_frame::BufferGeometry;
use crate::video_frame::SlotMemory;
use crate::video_frame::SurfaceHandle;
use crate::video_frame::SurfaceImporter;
use crate::BufferKey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("{supplied} buffers supplied but the pool can only hold {capacity}")]
    CapacityExceeded { supplied: usize, capacity: usize },
    #[error("the pool has already been initialized")]
    AlreadyInitialized,
    #[error("buffer {0} is supplied more than once")]
    DuplicateBuffer(BufferKey),
    #[error("failed to import buffer {key} as a surface: {reason}")]
    SurfaceImportFailed { key: BufferKey, reason: String },
    #[error("no frame buffer available in the pool")]
    NoBufferAvailable,
    #[error("requested buffer size {requested} exceeds the slot size {available}")]
    SizeMismatch { requested: usize, available: usize },
    #[error("no frame buffer with key {0} in the pool")]
    UnknownBuffer(BufferKey),
    #[error("frame buffer {0} is not held by the decoder")]
    NotAcquired(BufferKey),
    #[error("failed to map frame buffer {key}: {reason}")]
    MapFailed { key: BufferKey, reason: String },
}

/// A frame buffer handed to the decoder by [`FramePool::acquire`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Index of the slot in the pool.
    pub index: usize,
    pub key: BufferKey,
    /// Size of the buffer in bytes.
    pub size: usize,
    /// Luma stride of the buffer in bytes.
    pub stride: usize,
    /// Height of the luma plane of the buffer, in lines.
    pub height: usize,
}

/// Per-slot state of the pool.
#[derive(Debug)]
pub struct FrameBufferSlot {
    key: BufferKey,
    memory: Box<dyn SlotMemory>,
    surface: Option<SurfaceHandle>,
    render_done: bool,
    released: bool,
}

impl FrameBufferSlot {
    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn memory(&self) -> &dyn SlotMemory {
        self.memory.as_ref()
    }

    pub fn surface(&self) -> Option<SurfaceHandle> {
        self.surface
    }

    pub fn render_done(&self) -> bool {
        self.render_done
    }

    pub fn released(&self) -> bool {
        self.released
    }

    fn is_available(&self) -> bool {
        self.render_done && self.released
    }
}

/// Where the memory of the pool's slots comes from.
pub enum SlotSource<'a> {
    /// The decoder writes into pool-owned scratch memory, copied out to the external buffers.
    Scratch,
    /// The decoder writes into hardware surfaces imported from the external buffers.
    Surface(&'a mut dyn SurfaceImporter),
}

pub struct FramePool {
    capacity: usize,
    geometry: BufferGeometry,
    slots: Vec<FrameBufferSlot>,
}

impl FramePool {
    /// Creates an empty pool able to hold up to `capacity` buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            geometry: Default::default(),
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Binds the external buffers `keys`, all of `geometry`, to the slots of the pool in the
    /// order they are given.
    ///
    /// The slots start released. Their render-done flag starts set for scratch memory, and unset
    /// for imported surfaces since those buffers are initially held by the consumer.
    pub fn initialize(
        &mut self,
        geometry: BufferGeometry,
        keys: &[BufferKey],
        source: SlotSource,
    ) -> Result<(), PoolError> {
        if !self.slots.is_empty() {
            return Err(PoolError::AlreadyInitialized);
        }
        if keys.len() > self.capacity {
            log::error!(
                "{} external buffers supplied, the pool holds at most {}",
                keys.len(),
                self.capacity
            );
            return Err(PoolError::CapacityExceeded {
                supplied: keys.len(),
                capacity: self.capacity,
            });
        }
        // Notifications look slots up by key, so a key bound twice would leave a slot stranded.
        if let Some((i, &key)) = keys
            .iter()
            .enumerate()
            .find(|&(i, key)| keys[..i].contains(key))
        {
            log::error!("buffer {} supplied again at position {}", key, i);
            return Err(PoolError::DuplicateBuffer(key));
        }

        let size = geometry.buffer_size();
        let mut slots = Vec::with_capacity(self.capacity);
        match source {
            SlotSource::Scratch => {
                for &key in keys {
                    slots.push(FrameBufferSlot {
                        key,
                        memory: Box::new(vec![0u8; size]),
                        surface: None,
                        render_done: true,
                        released: true,
                    });
                }
            }
            SlotSource::Surface(importer) => {
                for &key in keys {
                    let imported = importer.import(key, &geometry).map_err(|reason| {
                        log::error!("failed to import buffer {}: {}", key, reason);
                        PoolError::SurfaceImportFailed { key, reason }
                    })?;
                    if imported.memory.size() < size {
                        return Err(PoolError::SurfaceImportFailed {
                            key,
                            reason: format!(
                                "CPU view of {} bytes is smaller than the buffer size {}",
                                imported.memory.size(),
                                size
                            ),
                        });
                    }
                    slots.push(FrameBufferSlot {
                        key,
                        memory: imported.memory,
                        surface: Some(imported.surface),
                        render_done: false,
                        released: true,
                    });
                }
            }
        }

        log::debug!(
            "frame pool initialized with {} buffers of {} bytes ({:?})",
            slots.len(),
            size,
            geometry
        );
        self.geometry = geometry;
        self.slots = slots;

        Ok(())
    }

    /// Hands the first slot in index order that is both released and render-done to the decoder.
    pub fn acquire(&mut self, min_size: usize) -> Result<FrameBuffer, PoolError> {
        let size = self.geometry.buffer_size();
        // Slots are never resized during a session.
        if min_size > size {
            log::error!("requested buffer size {} > slot size {}", min_size, size);
            return Err(PoolError::SizeMismatch {
                requested: min_size,
                available: size,
            });
        }

        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_available())
            .ok_or(PoolError::NoBufferAvailable)?;
        slot.released = false;

        Ok(FrameBuffer {
            index,
            key: slot.key,
            size,
            stride: self.geometry.stride as usize,
            height: self.geometry.height as usize,
        })
    }

    /// Gives the slot of `key` back from the decoder.
    pub fn release(&mut self, key: BufferKey) -> Result<(), PoolError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.key == key)
            .ok_or(PoolError::UnknownBuffer(key))?;
        slot.released = true;

        Ok(())
    }

    /// Records that the consumer is done with the contents of buffer `key`. Returns `false` if
    /// no slot is bound to `key`.
    pub fn mark_render_done(&mut self, key: BufferKey) -> bool {
        match self.slots.iter_mut().find(|slot| slot.key == key) {
            Some(slot) => {
                slot.render_done = true;
                true
            }
            None => {
                log::debug!("render done for unknown buffer {}, ignoring", key);
                false
            }
        }
    }

    /// Records that the frame in slot `index` has been handed to the consumer.
    pub fn mark_delivered(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.render_done = false;
        }
    }

    /// Number of slots that can be handed to the decoder right now.
    pub fn count_available(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_available()).count()
    }

    /// Number of slots currently held by the decoder.
    pub fn num_in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.released).count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots bound to an external buffer.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    pub fn slot(&self, index: usize) -> Option<&FrameBufferSlot> {
        self.slots.get(index)
    }

    /// Gives write access to the memory of `buffer`, which must currently be held by the
    /// decoder.
    pub fn write(
        &mut self,
        buffer: &FrameBuffer,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), PoolError> {
        let slot = self
            .slots
            .get_mut(buffer.index)
            .filter(|slot| slot.key == buffer.key)
            .ok_or(PoolError::UnknownBuffer(buffer.key))?;
        if slot.released {
            return Err(PoolError::NotAcquired(buffer.key));
        }

        let mut mapping = slot.memory.map_mut().map_err(|reason| PoolError::MapFailed {
            key: buffer.key,
            reason,
        })?;
        f(mapping.get());

        Ok(())
    }
}

/// Frame buffers as seen by a codec session: the pool's acquire and release operations adapted to
/// the allocation callbacks of a decoder library.
pub trait BufferProvider: Send {
    /// Returns a free buffer of at least `min_size` bytes.
    fn allocate(&mut self, min_size: usize) -> Result<FrameBuffer, PoolError>;

    /// Gives `buffer` back to the pool.
    fn free(&mut self, buffer: &FrameBuffer) -> Result<(), PoolError>;

    /// Calls `f` with the memory of `buffer`.
    fn write(&mut self, buffer: &FrameBuffer, f: &mut dyn FnMut(&mut [u8]))
        -> Result<(), PoolError>;
}

/// A [`FramePool`] shared between the decode engine and its codec session.
#[derive(Clone)]
pub struct SharedFramePool(Arc<Mutex<FramePool>>);

impl SharedFramePool {
    pub fn new(pool: FramePool) -> Self {
        Self(Arc::new(Mutex::new(pool)))
    }

    /// Locks the pool. The flags are plain booleans that are always left consistent, so a
    /// poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<FramePool> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferProvider for SharedFramePool {
    fn allocate(&mut self, min_size: usize) -> Result<FrameBuffer, PoolError> {
        let result = self.lock().acquire(min_size);
        match &result {
            Ok(buffer) => log::trace!("frame buffer {} ({}) acquired", buffer.index, buffer.key),
            Err(PoolError::NoBufferAvailable) => log::debug!("no frame buffer available in pool"),
            Err(_) => (),
        }

        result
    }

    fn free(&mut self, buffer: &FrameBuffer) -> Result<(), PoolError> {
        let result = self.lock().release(buffer.key);
        if let Err(e) = &result {
            log::warn!("{}, ignoring release", e);
        }

        result
    }

    fn write(
        &mut self,
        buffer: &FrameBuffer,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), PoolError> {
        self.lock().write(buffer, f)
    }
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! External buffers backed by plain heap memory.
//!
//! Useful to run the pipeline where no display or hardware allocator is available, e.g. in tests
//! or when decoding to a file. The allocator, mapper and surface importer returned by
//! [`HeapBufferAllocator`] all share the same set of buffers.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::video_frame::BufferGeometry;
use crate::video_frame::BufferMapper;
use crate::video_frame::ImportedSurface;
use crate::video_frame::NativeBufferAllocator;
use crate::video_frame::ReadMapping;
use crate::video_frame::SlotMemory;
use crate::video_frame::SurfaceHandle;
use crate::video_frame::SurfaceImporter;
use crate::video_frame::WriteMapping;
use crate::BufferKey;
use crate::Resolution;

/// Keys are handed out like page-aligned addresses so they look like the handles a real
/// allocator would return.
const KEY_BASE: u64 = 0x1000_0000;
const KEY_STEP: u64 = 0x1000;

#[derive(Debug, Default)]
struct HeapBuffers {
    allocated: u64,
    buffers: BTreeMap<BufferKey, Vec<u8>>,
    /// Buffers currently locked through a mapper.
    locked: BTreeSet<BufferKey>,
    next_surface: u32,
}

#[derive(Debug, Clone, Default)]
pub struct HeapBufferAllocator {
    inner: Arc<Mutex<HeapBuffers>>,
}

fn lock_buffers(inner: &Mutex<HeapBuffers>) -> MutexGuard<HeapBuffers> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HeapBufferAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocates `count` buffers of `geometry` and returns their keys in allocation order.
    pub fn allocate_many(
        &mut self,
        geometry: &BufferGeometry,
        count: usize,
    ) -> Result<Vec<BufferKey>, String> {
        (0..count).map(|_| self.allocate(geometry)).collect()
    }

    /// Returns a copy of the current contents of buffer `key`.
    pub fn contents(&self, key: BufferKey) -> Option<Vec<u8>> {
        lock_buffers(&self.inner).buffers.get(&key).cloned()
    }

    /// Returns whether buffer `key` is currently locked by a mapper.
    pub fn is_locked(&self, key: BufferKey) -> bool {
        lock_buffers(&self.inner).locked.contains(&key)
    }

    /// Returns a mapper giving CPU access to the buffers of this allocator.
    pub fn mapper(&self) -> HeapBufferMapper {
        HeapBufferMapper {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns an importer creating surfaces that alias the buffers of this allocator.
    pub fn importer(&self) -> HeapSurfaceImporter {
        HeapSurfaceImporter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl NativeBufferAllocator for HeapBufferAllocator {
    fn allocate(&mut self, geometry: &BufferGeometry) -> Result<BufferKey, String> {
        let size = geometry.buffer_size();
        if size == 0 {
            return Err(format!("cannot allocate an empty buffer ({:?})", geometry));
        }

        let mut buffers = lock_buffers(&self.inner);
        let key = BufferKey(KEY_BASE + buffers.allocated * KEY_STEP);
        buffers.allocated += 1;
        buffers.buffers.insert(key, vec![0; size]);

        Ok(key)
    }
}

struct HeapWriteMapping<'a> {
    guard: MutexGuard<'a, HeapBuffers>,
    key: BufferKey,
}

impl<'a> WriteMapping<'a> for HeapWriteMapping<'a> {
    fn get(&mut self) -> &mut [u8] {
        // The buffer's presence is checked before the mapping is created.
        self.guard
            .buffers
            .get_mut(&self.key)
            .map(|b| b.as_mut_slice())
            .unwrap_or_default()
    }
}

impl<'a> Drop for HeapWriteMapping<'a> {
    fn drop(&mut self) {
        self.guard.locked.remove(&self.key);
    }
}

pub struct HeapBufferMapper {
    inner: Arc<Mutex<HeapBuffers>>,
}

impl BufferMapper for HeapBufferMapper {
    fn lock<'a>(
        &'a mut self,
        key: BufferKey,
        bounds: Resolution,
    ) -> Result<Box<dyn WriteMapping<'a> + 'a>, String> {
        let mut guard = lock_buffers(&self.inner);
        let size = match guard.buffers.get(&key) {
            Some(buffer) => buffer.len(),
            None => return Err(format!("no heap buffer with key {}", key)),
        };
        if bounds.get_area() > size {
            return Err(format!(
                "lock bounds {:?} exceed buffer {} of {} bytes",
                bounds, key, size
            ));
        }
        if !guard.locked.insert(key) {
            return Err(format!("buffer {} is already locked", key));
        }

        Ok(Box::new(HeapWriteMapping { guard, key }))
    }
}

struct HeapReadMapping<'a> {
    guard: MutexGuard<'a, HeapBuffers>,
    key: BufferKey,
}

impl<'a> ReadMapping<'a> for HeapReadMapping<'a> {
    fn get(&self) -> &[u8] {
        self.guard
            .buffers
            .get(&self.key)
            .map(|b| b.as_slice())
            .unwrap_or_default()
    }
}

/// CPU view of a surface imported from a heap buffer. Aliases the buffer itself.
#[derive(Debug)]
struct HeapSurfaceMemory {
    inner: Arc<Mutex<HeapBuffers>>,
    key: BufferKey,
    size: usize,
}

impl SlotMemory for HeapSurfaceMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn map<'a>(&'a self) -> Result<Box<dyn ReadMapping<'a> + 'a>, String> {
        let guard = lock_buffers(&self.inner);
        if !guard.buffers.contains_key(&self.key) {
            return Err(format!("heap buffer {} is gone", self.key));
        }

        Ok(Box::new(HeapReadMapping {
            guard,
            key: self.key,
        }))
    }

    fn map_mut<'a>(&'a mut self) -> Result<Box<dyn WriteMapping<'a> + 'a>, String> {
        let mut guard = lock_buffers(&self.inner);
        if !guard.buffers.contains_key(&self.key) {
            return Err(format!("heap buffer {} is gone", self.key));
        }
        guard.locked.insert(self.key);

        Ok(Box::new(HeapWriteMapping {
            guard,
            key: self.key,
        }))
    }
}

pub struct HeapSurfaceImporter {
    inner: Arc<Mutex<HeapBuffers>>,
}

impl SurfaceImporter for HeapSurfaceImporter {
    fn import(
        &mut self,
        key: BufferKey,
        geometry: &BufferGeometry,
    ) -> Result<ImportedSurface, String> {
        let mut guard = lock_buffers(&self.inner);
        let size = match guard.buffers.get(&key) {
            Some(buffer) => buffer.len(),
            None => return Err(format!("no heap buffer with key {}", key)),
        };
        if size < geometry.buffer_size() {
            return Err(format!(
                "buffer {} is too small for {:?} ({} < {})",
                key,
                geometry,
                size,
                geometry.buffer_size()
            ));
        }

        let surface = SurfaceHandle(guard.next_surface);
        guard.next_surface += 1;
        log::debug!("imported heap buffer {} as surface {:?}", key, surface);

        Ok(ImportedSurface {
            surface,
            memory: Box::new(HeapSurfaceMemory {
                inner: Arc::clone(&self.inner),
                key,
                size,
            }),
        })
    }
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! External buffers and the collaborators giving access to them.
//!
//! The pipeline never allocates the buffers it delivers frames into. They are produced by a
//! [`NativeBufferAllocator`], written through a [`BufferMapper`] in copy mode, or imported as
//! hardware surfaces through a [`SurfaceImporter`] in surface mode.

use std::fmt::Debug;

use crate::image_processing::Yv12Layout;
use crate::utils::align_up;
use crate::BufferKey;
use crate::Resolution;

pub mod frame_pool;
pub mod heap_buffer;

pub const Y_PLANE: usize = 0;
pub const U_PLANE: usize = 1;
pub const V_PLANE: usize = 2;

// RAII wrappers for video memory mappings. The Drop method should implement any necessary
// unmapping or unlocking and cache flushing.
pub trait ReadMapping<'a> {
    fn get(&self) -> &[u8];
}

pub trait WriteMapping<'a> {
    fn get(&mut self) -> &mut [u8];
}

/// Geometry shared by all the external buffers of a session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferGeometry {
    pub width: u32,
    pub height: u32,
    /// Luma stride in bytes.
    pub stride: u32,
}

impl BufferGeometry {
    /// Returns the geometry a host should allocate its buffers with to receive frames of
    /// `resolution` decoded with a `border` of padding on each side.
    pub fn for_stream(resolution: Resolution, border: usize) -> Self {
        let width = resolution.width + 2 * border as u32;
        let height = align_up(resolution.height as usize + 2 * border, 32) as u32;

        Self {
            width,
            height,
            stride: align_up(width as usize, 32) as u32,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    /// Size in bytes of a buffer with this geometry, chroma padding included.
    pub fn buffer_size(&self) -> usize {
        Yv12Layout::new(self.stride as usize, self.height as usize, 0).size()
    }
}

/// CPU-accessible memory backing a pool slot.
pub trait SlotMemory: Send + Debug {
    fn size(&self) -> usize;

    fn map<'a>(&'a self) -> Result<Box<dyn ReadMapping<'a> + 'a>, String>;

    fn map_mut<'a>(&'a mut self) -> Result<Box<dyn WriteMapping<'a> + 'a>, String>;
}

struct SliceMapping<'a>(&'a [u8]);

impl<'a> ReadMapping<'a> for SliceMapping<'a> {
    fn get(&self) -> &[u8] {
        self.0
    }
}

struct SliceMappingMut<'a>(&'a mut [u8]);

impl<'a> WriteMapping<'a> for SliceMappingMut<'a> {
    fn get(&mut self) -> &mut [u8] {
        self.0
    }
}

/// Plain heap memory, used as decoder scratch space in copy mode.
impl SlotMemory for Vec<u8> {
    fn size(&self) -> usize {
        self.len()
    }

    fn map<'a>(&'a self) -> Result<Box<dyn ReadMapping<'a> + 'a>, String> {
        Ok(Box::new(SliceMapping(self.as_slice())))
    }

    fn map_mut<'a>(&'a mut self) -> Result<Box<dyn WriteMapping<'a> + 'a>, String> {
        Ok(Box::new(SliceMappingMut(self.as_mut_slice())))
    }
}

/// Handle of a hardware surface created from an external buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u32);

/// Result of importing an external buffer as a hardware surface.
#[derive(Debug)]
pub struct ImportedSurface {
    pub surface: SurfaceHandle,
    /// CPU view derived from the surface. Writes to it land in the external buffer.
    pub memory: Box<dyn SlotMemory>,
}

/// Imports external buffers as hardware surfaces the decoder can write into directly.
pub trait SurfaceImporter: Send {
    fn import(
        &mut self,
        key: BufferKey,
        geometry: &BufferGeometry,
    ) -> Result<ImportedSurface, String>;
}

/// Gives CPU write access to external buffers for the copy path.
pub trait BufferMapper: Send {
    /// Locks the `bounds` region of buffer `key` for writing. The buffer is unlocked when the
    /// returned mapping is dropped.
    fn lock<'a>(
        &'a mut self,
        key: BufferKey,
        bounds: Resolution,
    ) -> Result<Box<dyn WriteMapping<'a> + 'a>, String>;
}

/// Produces external native buffers.
pub trait NativeBufferAllocator {
    fn allocate(&mut self, geometry: &BufferGeometry) -> Result<BufferKey, String>;
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery of decoded images into the external buffers.
//!
//! In surface mode the codec has decoded straight into memory aliasing the external buffer, so
//! delivering a frame only means checking the slot is still bound to the expected buffer and
//! reporting the geometry. In copy mode the decoded planes are copied from the slot's scratch
//! memory into the external buffer, in the [`Yv12Layout`] consumers expect.

use thiserror::Error;

use crate::decoder::DecodedImage;
use crate::decoder::OutputFrame;
use crate::image_processing::chroma_dimensions;
use crate::image_processing::copy_plane;
use crate::image_processing::PlaneCopyError;
use crate::image_processing::Yv12Layout;
use crate::video_frame::frame_pool::FramePool;
use crate::video_frame::BufferGeometry;
use crate::video_frame::BufferMapper;
use crate::video_frame::SurfaceImporter;
use crate::video_frame::U_PLANE;
use crate::video_frame::V_PLANE;
use crate::video_frame::Y_PLANE;
use crate::BufferKey;
use crate::PlaneLayout;
use crate::Rect;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("slot {index} holds buffer {found} but buffer {expected} was expected")]
    PoolIntegrity {
        index: usize,
        expected: BufferKey,
        found: BufferKey,
    },
    #[error("no output buffer for slot {0}")]
    UnknownSlot(usize),
    #[error("frame in slot {index} was decoded with planes {found:?} but the buffer has {expected:?}")]
    LayoutMismatch {
        index: usize,
        expected: [PlaneLayout; 3],
        found: [PlaneLayout; 3],
    },
    #[error("failed to map output buffer {key}: {reason}")]
    MapFailed { key: BufferKey, reason: String },
    #[error("plane copy failed: {0}")]
    Plane(#[from] PlaneCopyError),
}

/// How decoded frames reach the external buffers. Chosen once per session.
pub enum OutputMode {
    /// The external buffers are imported as surfaces the codec decodes into.
    Surface(Box<dyn SurfaceImporter>),
    /// The codec decodes into scratch memory that is then copied into the external buffers.
    Copy(Box<dyn BufferMapper>),
}

/// Makes a decoded image visible in the external buffer bound to its slot.
pub trait FrameTransfer: Send {
    /// Delivers `image`. `keys` is the caller's table of external buffers, indexed by slot.
    ///
    /// The returned frame has its `draining` flag unset.
    fn transfer(
        &mut self,
        pool: &FramePool,
        keys: &[BufferKey],
        image: &DecodedImage,
    ) -> Result<OutputFrame, TransferError>;
}

/// Checks that slot `image.slot` is bound to the buffer the caller expects there.
fn check_slot(
    pool: &FramePool,
    keys: &[BufferKey],
    image: &DecodedImage,
) -> Result<(), TransferError> {
    let expected = *keys
        .get(image.slot)
        .ok_or(TransferError::UnknownSlot(image.slot))?;
    let found = pool
        .slot(image.slot)
        .map(|slot| slot.key())
        .ok_or(TransferError::UnknownSlot(image.slot))?;

    for found in [found, image.key] {
        if found != expected {
            return Err(TransferError::PoolIntegrity {
                index: image.slot,
                expected,
                found,
            });
        }
    }

    Ok(())
}

fn output_frame(layout: &Yv12Layout, image: &DecodedImage) -> OutputFrame {
    OutputFrame {
        slot: image.slot,
        key: image.key,
        filled_len: layout.size(),
        crop: Rect {
            left: layout.border as u32,
            top: layout.border as u32,
            width: image.resolution.width,
            height: image.resolution.height,
        },
        timestamp: image.timestamp,
        draining: false,
    }
}

pub struct SurfaceTransfer {
    layout: Yv12Layout,
}

impl SurfaceTransfer {
    pub fn new(geometry: &BufferGeometry, border: usize) -> Self {
        Self {
            layout: Yv12Layout::new(geometry.stride as usize, geometry.height as usize, border),
        }
    }
}

impl FrameTransfer for SurfaceTransfer {
    fn transfer(
        &mut self,
        pool: &FramePool,
        keys: &[BufferKey],
        image: &DecodedImage,
    ) -> Result<OutputFrame, TransferError> {
        check_slot(pool, keys, image)?;
        self.layout
            .check_visible_width(image.resolution.width as usize)?;
        self.layout
            .check_visible_height(image.resolution.height as usize)?;
        // The frame is read in place, so it must be where the consumer will look for it.
        let expected = self.layout.planes();
        if image.planes != expected {
            return Err(TransferError::LayoutMismatch {
                index: image.slot,
                expected,
                found: image.planes,
            });
        }

        Ok(output_frame(&self.layout, image))
    }
}

pub struct CopyTransfer {
    mapper: Box<dyn BufferMapper>,
    geometry: BufferGeometry,
    layout: Yv12Layout,
}

impl CopyTransfer {
    pub fn new(mapper: Box<dyn BufferMapper>, geometry: &BufferGeometry, border: usize) -> Self {
        Self {
            mapper,
            geometry: *geometry,
            layout: Yv12Layout::new(geometry.stride as usize, geometry.height as usize, border),
        }
    }
}

impl FrameTransfer for CopyTransfer {
    fn transfer(
        &mut self,
        pool: &FramePool,
        keys: &[BufferKey],
        image: &DecodedImage,
    ) -> Result<OutputFrame, TransferError> {
        check_slot(pool, keys, image)?;
        self.layout
            .check_visible_width(image.resolution.width as usize)?;
        self.layout
            .check_visible_height(image.resolution.height as usize)?;
        let slot = pool
            .slot(image.slot)
            .ok_or(TransferError::UnknownSlot(image.slot))?;

        let src = slot.memory().map().map_err(|reason| TransferError::MapFailed {
            key: image.key,
            reason,
        })?;
        let mut dst = self
            .mapper
            .lock(image.key, self.geometry.resolution())
            .map_err(|reason| TransferError::MapFailed {
                key: image.key,
                reason,
            })?;

        let width = image.resolution.width as usize;
        let height = image.resolution.height as usize;
        let (uv_width, uv_height) = chroma_dimensions(width, height);

        for (plane, plane_width, plane_height) in [
            (Y_PLANE, width, height),
            (U_PLANE, uv_width, uv_height),
            (V_PLANE, uv_width, uv_height),
        ] {
            copy_plane(
                src.get(),
                image.planes[plane],
                dst.get(),
                self.layout.plane(plane),
                self.layout.plane_region(plane).end,
                plane_width,
                plane_height,
            )?;
        }

        Ok(output_frame(&self.layout, image))
    }
}
